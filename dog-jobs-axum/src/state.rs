use dog_jobs::QueueAdapter;

/// Shared state handed to every handler
#[derive(Clone)]
pub struct JobsState {
    pub adapter: QueueAdapter,
}

impl JobsState {
    pub fn new(adapter: QueueAdapter) -> Self {
        Self { adapter }
    }
}
