pub mod ids;
pub mod state;
pub mod record;
pub mod events;

pub use ids::{JobId, WorkerId};
pub use state::JobState;
pub use record::{ClaimOutcome, JobRecord};
pub use events::JobEvent;
