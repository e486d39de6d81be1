use std::time;

use chrono::{DateTime, Utc};
use departure_common::health::HealthHandle;
use departure_common::metrics::timing_guard;
use departure_common::timestamp::message_timestamp;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::error::PollerError;
use crate::feed::ChangeFeed;
use crate::matcher::Matcher;
use crate::metrics_consts::{
    POLL_CYCLES, POLL_CYCLE_TIME, POLL_FAILURES, ROWS_POLLED, WATERMARK_LAG,
};
use crate::pipeline::{EventPipeline, PredictionPipeline};

/// Polls the change feed and pushes what changed through both pipelines.
pub struct Poller<F: ChangeFeed> {
    feed: F,
    matcher: Matcher,
    events: EventPipeline,
    predictions: PredictionPipeline,
    /// Queries wait until this is true.
    connectivity: watch::Receiver<bool>,
    poll_interval: time::Duration,
    liveness: HealthHandle,
}

impl<F: ChangeFeed> Poller<F> {
    pub fn new(
        feed: F,
        matcher: Matcher,
        events: EventPipeline,
        predictions: PredictionPipeline,
        connectivity: watch::Receiver<bool>,
        poll_interval: time::Duration,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            feed,
            matcher,
            events,
            predictions,
            connectivity,
            poll_interval,
            liveness,
        }
    }

    /// Where polling starts on a fresh process.
    pub fn initial_watermark(&self) -> DateTime<Utc> {
        let interval = chrono::Duration::from_std(self.poll_interval)
            .unwrap_or_else(|_| chrono::Duration::zero());
        Utc::now() - interval
    }

    /// Run one cycle, returning the watermark for the next one.
    ///
    /// The watermark only moves once both pipelines have enqueued everything,
    /// and it moves past rows the matcher dropped.
    pub async fn poll_once(
        &mut self,
        watermark: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, PollerError> {
        self.connectivity
            .wait_for(|connected| *connected)
            .await
            .map_err(|_| PollerError::ConnectivityClosed)?;

        let batch = self.feed.departures_since(watermark).await?;
        let Some(latest_modification) = batch.latest_modification else {
            debug!("no departures modified since {}", watermark);
            return Ok(watermark);
        };
        let timestamp = message_timestamp(Utc::now());
        metrics::counter!(ROWS_POLLED).increment(batch.departures.len() as u64);

        let records = self.matcher.match_all(&batch.departures).await;
        let (events, predictions) = tokio::try_join!(
            self.events.process(&records, &timestamp),
            self.predictions.process(&records, &timestamp),
        )?;
        info!(
            "polled {} rows, {} matched, {} event and {} prediction messages enqueued",
            batch.departures.len(),
            records.len(),
            events,
            predictions
        );

        Ok(watermark.max(latest_modification))
    }

    /// Poll forever. Only returns on errors the loop cannot recover from.
    ///
    /// A cycle starts once the previous one finished and at least one poll
    /// interval after the previous one started.
    pub async fn run(mut self) -> Result<(), PollerError> {
        let mut watermark = self.initial_watermark();
        info!(
            "polling every {:?} starting from {}",
            self.poll_interval, watermark
        );

        loop {
            let timer = timing_guard(POLL_CYCLE_TIME);
            let interval = tokio::time::sleep(self.poll_interval);
            let (result, ()) = tokio::join!(self.poll_once(watermark), interval);
            timer.fin();
            metrics::counter!(POLL_CYCLES).increment(1);

            match result {
                Ok(next) => {
                    watermark = next;
                    let lag = (Utc::now() - watermark).num_milliseconds() as f64 / 1000.0;
                    metrics::gauge!(WATERMARK_LAG).set(lag);
                }
                Err(e) if e.is_fatal() => {
                    error!("polling cannot continue: {}", e);
                    return Err(e);
                }
                Err(e) => {
                    error!("poll cycle failed, retrying from {}: {}", watermark, e);
                    metrics::counter!(POLL_FAILURES).increment(1);
                }
            }
            self.liveness.report_healthy();
        }
    }
}
