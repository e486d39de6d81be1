use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use departure_common::departure::{JourneyId, RawDeparture, StopPointId};
use departure_common::health::HealthRegistry;
use departure_common::message::OutboundMessage;
use departure_poller::error::PollerError;
use departure_poller::feed::FeedBatch;
use departure_poller::filter::{EventPolicy, PredictionPolicy, RecencyFilter};
use departure_poller::pipeline::Pipeline;
use departure_poller::poller::Poller;
use departure_poller::serializer::{EventArrangement, PredictionArrangement, Serializer};
use departure_poller::test_utils::{departure, modified_at, InMemoryFeed, ReferenceData};
use tokio::sync::{mpsc, watch};

struct Harness {
    poller: Poller<Arc<InMemoryFeed>>,
    feed: Arc<InMemoryFeed>,
    outbound: mpsc::Receiver<OutboundMessage>,
}

fn harness(connectivity: watch::Receiver<bool>, poll_interval: Duration) -> Harness {
    harness_with_queue(connectivity, poll_interval, 100)
}

fn harness_with_queue(
    connectivity: watch::Receiver<bool>,
    poll_interval: Duration,
    queue_capacity: usize,
) -> Harness {
    let references = ReferenceData::default()
        .with_stop(StopPointId(10), "1130101")
        .with_stop(StopPointId(11), "1040101")
        .with_journey(JourneyId(20), "1055", 180);
    let (matcher, _, _, _) = references.matcher(None);

    let (queue, outbound) = mpsc::channel(queue_capacity);
    let events = Pipeline::new(
        RecencyFilter::new(
            EventPolicy::new(chrono::Duration::seconds(600)),
            NonZeroUsize::new(100).unwrap(),
        ),
        Serializer::new("events/", EventArrangement),
        queue.clone(),
    );
    let predictions = Pipeline::new(
        RecencyFilter::new(
            PredictionPolicy::new(
                chrono::Duration::seconds(600),
                chrono::Duration::seconds(30),
            ),
            NonZeroUsize::new(100).unwrap(),
        ),
        Serializer::new("predictions/", PredictionArrangement),
        queue,
    );

    let feed = Arc::new(InMemoryFeed::default());
    let liveness = HealthRegistry::new("liveness").register("poller", time::Duration::seconds(30));
    let poller = Poller::new(
        feed.clone(),
        matcher,
        events,
        predictions,
        connectivity,
        poll_interval,
        liveness,
    );

    Harness {
        poller,
        feed,
        outbound,
    }
}

fn modified(departure: RawDeparture, seconds: i64) -> RawDeparture {
    RawDeparture {
        last_modified: modified_at(seconds),
        ..departure
    }
}

fn drain(outbound: &mut mpsc::Receiver<OutboundMessage>) -> Vec<String> {
    let mut topics = Vec::new();
    while let Ok(message) = outbound.try_recv() {
        topics.push(message.topic_suffix);
    }
    topics.sort();
    topics
}

#[tokio::test]
async fn publishes_matched_rows_and_advances_past_unmatched_ones() {
    let (_connected, connectivity) = watch::channel(true);
    let mut h = harness(connectivity, Duration::from_secs(1));
    h.feed.queue_batch(vec![
        modified(departure(1, 20, 10), 5),
        // Journey 21 is unknown, this row is dropped.
        modified(departure(2, 21, 11), 30),
    ]);

    let watermark = h.poller.poll_once(modified_at(0)).await.unwrap();

    assert_eq!(watermark, modified_at(30));
    assert_eq!(h.feed.watermarks(), vec![modified_at(0)]);
    assert_eq!(
        drain(&mut h.outbound),
        vec!["events/1130101", "predictions/1130101"]
    );
}

#[tokio::test]
async fn empty_batch_is_a_no_op() {
    let (_connected, connectivity) = watch::channel(true);
    let mut h = harness(connectivity, Duration::from_secs(1));
    h.feed.queue_batch(vec![]);

    let watermark = h.poller.poll_once(modified_at(10)).await.unwrap();

    assert_eq!(watermark, modified_at(10));
    assert!(drain(&mut h.outbound).is_empty());
}

#[tokio::test]
async fn undecodable_rows_still_advance_the_watermark() {
    let (_connected, connectivity) = watch::channel(true);
    let mut h = harness(connectivity, Duration::from_secs(1));
    h.feed.queue_raw_batch(FeedBatch {
        departures: vec![],
        latest_modification: Some(modified_at(40)),
    });

    let watermark = h.poller.poll_once(modified_at(10)).await.unwrap();

    assert_eq!(watermark, modified_at(40));
    assert!(drain(&mut h.outbound).is_empty());
}

#[tokio::test]
async fn watermark_is_monotonic() {
    let (_connected, connectivity) = watch::channel(true);
    let mut h = harness(connectivity, Duration::from_secs(1));
    h.feed.queue_batch(vec![modified(departure(1, 20, 10), 50)]);
    // Older than the current watermark.
    h.feed.queue_batch(vec![modified(departure(2, 20, 10), 20)]);
    h.feed.queue_batch(vec![]);
    h.feed.queue_batch(vec![modified(departure(3, 20, 11), 60)]);

    let mut watermark = modified_at(0);
    for _ in 0..4 {
        watermark = h.poller.poll_once(watermark).await.unwrap();
    }

    let queried = h.feed.watermarks();
    assert_eq!(
        queried,
        vec![modified_at(0), modified_at(50), modified_at(50), modified_at(50)]
    );
    assert_eq!(watermark, modified_at(60));
}

#[tokio::test]
async fn repeated_rows_are_not_published_twice() {
    let (_connected, connectivity) = watch::channel(true);
    let mut h = harness(connectivity, Duration::from_secs(1));
    h.feed.queue_batch(vec![modified(departure(1, 20, 10), 5)]);
    h.feed.queue_batch(vec![modified(departure(1, 20, 10), 6)]);

    let watermark = h.poller.poll_once(modified_at(0)).await.unwrap();
    assert_eq!(drain(&mut h.outbound).len(), 2);

    h.poller.poll_once(watermark).await.unwrap();
    assert!(drain(&mut h.outbound).is_empty());
}

#[tokio::test(start_paused = true)]
async fn full_queue_holds_back_the_watermark() {
    let (_connected, connectivity) = watch::channel(true);
    let mut h = harness_with_queue(connectivity, Duration::from_secs(1), 1);
    h.feed.queue_batch(vec![
        modified(departure(1, 20, 10), 5),
        modified(departure(2, 20, 11), 30),
    ]);

    let poll = h.poller.poll_once(modified_at(0));
    tokio::pin!(poll);
    // Four messages, two stops per pipeline, and room for one.
    let blocked = tokio::time::timeout(Duration::from_secs(60), &mut poll).await;
    assert!(blocked.is_err());

    let outbound = &mut h.outbound;
    let (watermark, mut topics) = tokio::join!(poll, async move {
        let mut topics = Vec::new();
        for _ in 0..4 {
            topics.push(outbound.recv().await.unwrap().topic_suffix);
        }
        topics
    });
    topics.sort();

    assert_eq!(watermark.unwrap(), modified_at(30));
    assert_eq!(
        topics,
        vec![
            "events/1040101",
            "events/1130101",
            "predictions/1040101",
            "predictions/1130101"
        ]
    );
    assert!(h.outbound.try_recv().is_err());
    assert_eq!(h.feed.watermarks(), vec![modified_at(0)]);
}

#[tokio::test]
async fn feed_failure_is_not_fatal() {
    let (_connected, connectivity) = watch::channel(true);
    let mut h = harness(connectivity, Duration::from_secs(1));
    h.feed.queue_failure("connection reset");

    let err = h.poller.poll_once(modified_at(10)).await.unwrap_err();

    assert!(matches!(err, PollerError::FeedError(_)));
    assert!(!err.is_fatal());
}

#[tokio::test(start_paused = true)]
async fn queries_wait_for_connectivity() {
    let (connected, connectivity) = watch::channel(false);
    let mut h = harness(connectivity, Duration::from_secs(1));

    let waiting =
        tokio::time::timeout(Duration::from_secs(60), h.poller.poll_once(modified_at(0))).await;
    assert!(waiting.is_err());
    assert!(h.feed.watermarks().is_empty());

    connected.send(true).unwrap();
    h.poller.poll_once(modified_at(0)).await.unwrap();
    assert_eq!(h.feed.watermarks(), vec![modified_at(0)]);
}

#[tokio::test(start_paused = true)]
async fn dropped_connectivity_stops_the_loop() {
    let (connected, connectivity) = watch::channel(false);
    let h = harness(connectivity, Duration::from_secs(1));
    drop(connected);

    let err = h.poller.run().await.unwrap_err();

    assert!(matches!(err, PollerError::ConnectivityClosed));
    assert!(err.is_fatal());
}

#[tokio::test(start_paused = true)]
async fn cycles_start_after_processing_and_interval() {
    let (_connected, connectivity) = watch::channel(true);
    let h = harness(connectivity, Duration::from_secs(10));
    h.feed.queue_slow_batch(Duration::from_secs(15), vec![]);
    h.feed.queue_slow_batch(Duration::from_secs(2), vec![]);
    let feed = h.feed.clone();
    let _outbound = h.outbound;

    tokio::spawn(h.poller.run());
    tokio::time::sleep(Duration::from_secs(40)).await;

    let started = feed.query_instants();
    assert!(started.len() >= 4);
    let gaps: Vec<Duration> = started.windows(2).map(|w| w[1] - w[0]).collect();
    // A slow cycle is followed immediately.
    assert!(gaps[0] >= Duration::from_secs(15) && gaps[0] < Duration::from_secs(16));
    // A fast one waits out the rest of the interval.
    assert!(gaps[1] >= Duration::from_secs(10) && gaps[1] < Duration::from_secs(11));
    assert!(gaps[2] >= Duration::from_secs(10) && gaps[2] < Duration::from_secs(11));
}
