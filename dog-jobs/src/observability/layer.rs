use std::sync::Arc;

use futures::{Stream, StreamExt};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::debug;

use super::LiveMetrics;
use crate::JobEvent;

const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Fan-out point for lifecycle events
///
/// Every recorded event updates [`LiveMetrics`] and is broadcast to current
/// subscribers. Publishing never blocks: with no subscribers the event is
/// dropped, and slow subscribers skip ahead.
#[derive(Clone)]
pub struct ObservabilityLayer {
    events: broadcast::Sender<JobEvent>,
    metrics: Arc<LiveMetrics>,
}

impl ObservabilityLayer {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }

    /// Create a layer whose subscribers buffer up to `capacity` events
    pub fn with_capacity(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            events,
            metrics: Arc::new(LiveMetrics::new()),
        }
    }

    /// Publish an event for a job of `job_type`
    pub fn record(&self, job_type: &str, event: JobEvent) {
        self.metrics.observe(job_type, &event);
        debug!(
            event = event.event_name(),
            job_id = %event.job_id(),
            job_type,
            "job event"
        );
        let _ = self.events.send(event);
    }

    /// Receive events published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    /// Events published from now on as a stream; lagged gaps are skipped
    pub fn event_stream(&self) -> impl Stream<Item = JobEvent> + Send + 'static {
        BroadcastStream::new(self.events.subscribe()).filter_map(|item| async move { item.ok() })
    }

    pub fn metrics(&self) -> &LiveMetrics {
        &self.metrics
    }
}

impl Default for ObservabilityLayer {
    fn default() -> Self {
        Self::new()
    }
}
