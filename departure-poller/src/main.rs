//! Poll the departure change feed and publish events and predictions per stop.
use std::sync::Arc;
use std::time::Duration;

use departure_common::health::HealthRegistry;
use departure_common::metrics::{serve, setup_metrics_routes};
use departure_poller::config::Config;
use departure_poller::feed::PgChangeFeed;
use departure_poller::filter::{EventPolicy, PredictionPolicy, RecencyFilter};
use departure_poller::handlers;
use departure_poller::matcher::Matcher;
use departure_poller::pipeline::Pipeline;
use departure_poller::poller::Poller;
use departure_poller::publisher::Publisher;
use departure_poller::reference::{
    JourneyResolver, PgJourneyLoader, PgStopLoader, PgUtcOffsetLoader, StopResolver,
    UtcOffsetResolver,
};
use departure_poller::serializer::{EventArrangement, PredictionArrangement, Serializer};
use envconfig::Envconfig;
use eyre::{eyre, Result, WrapErr};
use sqlx::postgres::PgPoolOptions;
use tokio::sync::{mpsc, watch};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

fn setup_tracing() {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(EnvFilter::from_default_env());
    tracing_subscriber::registry().with(log_layer).init();
}

/// Loops must report more often than this, and never less than every 30 seconds.
fn liveness_deadline(interval: Duration) -> time::Duration {
    time::Duration::seconds_f64((interval.as_secs_f64() * 4.0).max(30.0))
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_tracing();

    let config = Config::init_from_env().wrap_err("failed to load configuration from env")?;
    let poll_interval = config.poll_interval.0;
    let settings = config.filter_settings();

    let pool = PgPoolOptions::new()
        .max_connections(config.max_pg_connections)
        .connect_lazy(&config.database_url)
        .wrap_err("invalid database url")?;

    let liveness = HealthRegistry::new("liveness");
    let poller_liveness = liveness.register("poller", liveness_deadline(poll_interval));
    let publisher_liveness = liveness.register(
        "publisher",
        liveness_deadline(config.publisher.connectivity_probe_interval.0),
    );

    let matcher = Matcher::new(
        Arc::new(StopResolver::new(PgStopLoader::new(pool.clone()))),
        Arc::new(JourneyResolver::new(PgJourneyLoader::new(pool.clone()))),
        Arc::new(UtcOffsetResolver::new(PgUtcOffsetLoader::new(pool.clone()))),
        config.max_match_rounds(),
    );

    let (queue, outbound) = mpsc::channel(config.outbound_queue_capacity.get());
    let events = Pipeline::new(
        RecencyFilter::new(
            EventPolicy::new(settings.pre_journey_threshold),
            settings.event_cache_size,
        ),
        Serializer::new(&config.event_topic_prefix, EventArrangement),
        queue.clone(),
    );
    let predictions = Pipeline::new(
        RecencyFilter::new(
            PredictionPolicy::new(
                settings.pre_journey_threshold,
                settings.prediction_change_threshold,
            ),
            settings.prediction_cache_size,
        ),
        Serializer::new(&config.prediction_topic_prefix, PredictionArrangement),
        queue,
    );

    let (connected, connectivity) = watch::channel(false);
    let publisher = Publisher::new(&config.publisher, connected, publisher_liveness)
        .wrap_err("failed to create publisher")?;

    let poller = Poller::new(
        PgChangeFeed::new(pool),
        matcher,
        events,
        predictions,
        connectivity,
        poll_interval,
        poller_liveness,
    );

    let app = setup_metrics_routes(handlers::app(liveness))
        .wrap_err("failed to install metrics recorder")?;
    let bind = config.bind();
    info!("listening on {}", bind);
    let http_server = tokio::spawn(async move { serve(app, &bind).await });
    let publisher_loop = tokio::spawn(publisher.run(outbound));
    let poller_loop = tokio::spawn(poller.run());

    tokio::select! {
        res = poller_loop => {
            error!("departure polling ended unexpectedly");
            match res {
                Ok(Err(e)) => error!("poller failed with: {}", e),
                Err(e) => error!("poller task failed with: {}", e),
                Ok(Ok(())) => {}
            }
        }
        res = publisher_loop => {
            error!("publisher exited");
            if let Err(e) = res {
                error!("publisher task failed with: {}", e)
            }
        }
        res = http_server => {
            error!("http server exited");
            match res {
                Ok(Err(e)) => error!("server failed with: {}", e),
                Err(e) => error!("server task failed with: {}", e),
                Ok(Ok(())) => {}
            }
        }
    }

    Err(eyre!("departure polling ended unexpectedly"))
}
