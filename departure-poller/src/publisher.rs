use std::time;

use departure_common::health::HealthHandle;
use departure_common::message::OutboundMessage;
use departure_common::metrics::timing_guard;
use reqwest::header;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::PublisherConfig;
use crate::error::PublishError;
use crate::metrics_consts::{BROKER_CONNECTED, PUBLISH_FAILED, PUBLISH_SUCCEEDED, PUBLISH_TIME};

/// Drains the outbound queue into the broker's HTTP bridge and keeps the
/// connectivity signal up to date.
pub struct Publisher {
    client: reqwest::Client,
    publish_url: Url,
    probe_interval: time::Duration,
    connectivity: watch::Sender<bool>,
    liveness: HealthHandle,
}

impl Publisher {
    pub fn new(
        config: &PublisherConfig,
        connectivity: watch::Sender<bool>,
        liveness: HealthHandle,
    ) -> Result<Self, PublishError> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent("departure-poller")
            .timeout(config.publish_request_timeout.0)
            .build()?;

        Ok(Self {
            client,
            publish_url: config.publish_url.clone(),
            probe_interval: config.connectivity_probe_interval.0,
            connectivity,
            liveness,
        })
    }

    /// `{publish_url}/{topic_suffix}`
    pub fn topic_url(&self, topic_suffix: &str) -> Result<Url, PublishError> {
        let base = self.publish_url.as_str().trim_end_matches('/');
        format!("{}/{}", base, topic_suffix)
            .parse()
            .map_err(PublishError::ParseUrlError)
    }

    /// Deliver a single message. Failures are not retried.
    pub async fn publish(&self, message: OutboundMessage) -> Result<(), PublishError> {
        let url = self.topic_url(&message.topic_suffix)?;
        let timer = timing_guard(PUBLISH_TIME);

        self.client
            .post(url)
            .body(message.payload)
            .send()
            .await?
            .error_for_status()?;

        timer.fin();
        Ok(())
    }

    /// Whether the bridge answers at all.
    async fn probe(&self) -> bool {
        match self.client.get(self.publish_url.clone()).send().await {
            Ok(response) if !response.status().is_server_error() => true,
            Ok(response) => {
                warn!("broker bridge probe returned {}", response.status());
                false
            }
            Err(e) => {
                warn!("broker bridge probe failed: {}", e);
                false
            }
        }
    }

    fn set_connected(&self, connected: bool) {
        let changed = self.connectivity.send_if_modified(|current| {
            let changed = *current != connected;
            *current = connected;
            changed
        });
        if changed {
            match connected {
                true => info!("connected to broker bridge at {}", self.publish_url),
                false => error!("lost connection to broker bridge at {}", self.publish_url),
            }
        }
        metrics::gauge!(BROKER_CONNECTED).set(if connected { 1.0 } else { 0.0 });
    }

    /// Runs until every sender of `queue` is gone.
    pub async fn run(self, mut queue: mpsc::Receiver<OutboundMessage>) {
        let mut probe = tokio::time::interval(self.probe_interval);

        loop {
            tokio::select! {
                _ = probe.tick() => {
                    let connected = self.probe().await;
                    self.set_connected(connected);
                    self.liveness.report_healthy();
                }
                message = queue.recv() => {
                    let Some(message) = message else {
                        warn!("outbound queue closed, stopping publisher");
                        return;
                    };
                    let topic = message.topic_suffix.clone();
                    match self.publish(message).await {
                        Ok(()) => {
                            debug!("published message to {}", topic);
                            metrics::counter!(PUBLISH_SUCCEEDED).increment(1);
                        }
                        Err(e) => {
                            error!("failed to publish message to {}: {}", topic, e);
                            metrics::counter!(PUBLISH_FAILED).increment(1);
                            if matches!(e, PublishError::RequestError(ref inner) if inner.status().is_none()) {
                                self.set_connected(false);
                            }
                        }
                    }
                }
            }
        }
    }
}
