use departure_common::departure::EnrichedRecord;
use departure_common::message::OutboundMessage;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::PollerError;
use crate::filter::{EventPolicy, InclusionPolicy, PredictionPolicy, RecencyFilter};
use crate::metrics_consts::MESSAGES_ENQUEUED;
use crate::serializer::{Arrangement, EventArrangement, PredictionArrangement, Serializer};

pub type EventPipeline = Pipeline<EventPolicy, EventArrangement>;
pub type PredictionPipeline = Pipeline<PredictionPolicy, PredictionArrangement>;

/// Filters enriched records, groups the survivors into per-stop messages and
/// hands them to the outbound queue.
pub struct Pipeline<P: InclusionPolicy, A: Arrangement> {
    filter: RecencyFilter<P>,
    serializer: Serializer<A>,
    queue: mpsc::Sender<OutboundMessage>,
}

impl<P: InclusionPolicy, A: Arrangement> Pipeline<P, A> {
    pub fn new(
        filter: RecencyFilter<P>,
        serializer: Serializer<A>,
        queue: mpsc::Sender<OutboundMessage>,
    ) -> Self {
        Self {
            filter,
            serializer,
            queue,
        }
    }

    pub fn name(&self) -> &'static str {
        self.filter.name()
    }

    /// Returns the number of messages enqueued. Waits while the queue is full.
    pub async fn process(
        &mut self,
        records: &[EnrichedRecord],
        message_timestamp: &str,
    ) -> Result<usize, PollerError> {
        let pipeline = self.name();
        let kept = self.filter.retain(records);
        let messages = self
            .serializer
            .serialize(&kept, message_timestamp)
            .map_err(|error| PollerError::SerializeError { pipeline, error })?;

        let enqueued = messages.len();
        for message in messages {
            self.queue
                .send(message)
                .await
                .map_err(|_| PollerError::QueueClosed)?;
        }

        metrics::counter!(MESSAGES_ENQUEUED, "pipeline" => pipeline).increment(enqueued as u64);
        debug!("{} enqueued {} messages", pipeline, enqueued);
        Ok(enqueued)
    }
}
