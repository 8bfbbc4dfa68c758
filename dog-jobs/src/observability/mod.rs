pub mod layer;
pub mod metrics;

pub use layer::ObservabilityLayer;
pub use metrics::{GlobalMetrics, JobTypeMetrics, LiveMetrics, MetricsSnapshot};
