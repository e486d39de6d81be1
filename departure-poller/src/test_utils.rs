//! Builders and in-memory fakes for exercising the poller without a database.
use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use departure_common::departure::{
    DepartureId, DepartureState, EnrichedRecord, JourneyId, JourneyInfo, RawDeparture, StopInfo,
    StopPointId, UtcOffset,
};

use crate::error::{FeedError, ResolverError};
use crate::feed::{ChangeFeed, FeedBatch};
use crate::matcher::Matcher;
use crate::resolver::Resolver;

/// Local journey start used by every builder: 2023-05-01 08:00.
pub fn journey_start() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2023, 5, 1)
        .and_then(|day| day.and_hms_opt(8, 0, 0))
        .expect("valid fixed date")
}

/// Scheduled departure used by every builder, ten minutes into the journey.
pub fn timetabled() -> NaiveDateTime {
    journey_start() + Duration::minutes(10)
}

/// A timestamp `seconds` after 2023-05-01T05:00:00Z.
pub fn modified_at(seconds: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2023, 5, 1, 5, 0, 0)
        .single()
        .expect("valid fixed timestamp")
        + Duration::seconds(seconds)
}

/// A feed row on time and expected at its stop.
pub fn departure(departure_id: i64, journey_id: i64, stop_point_id: i64) -> RawDeparture {
    RawDeparture {
        departure_id: DepartureId(departure_id),
        journey_id: JourneyId(journey_id),
        stop_point_id: StopPointId(stop_point_id),
        timetabled_earliest: timetabled(),
        observed: None,
        target: timetabled(),
        sequence_number: 5,
        state: DepartureState::Expected,
        last_modified: modified_at(0),
    }
}

pub fn journey_info(jore_line_id: &str) -> JourneyInfo {
    JourneyInfo {
        jore_line_id: jore_line_id.to_owned(),
        jore_direction: "1".to_owned(),
        localized_start_time: journey_start(),
        operating_day: journey_start().date(),
        start_offset_seconds: 28800,
    }
}

/// Builds an `EnrichedRecord` relative to a fixed journey.
///
/// Times are given as offsets from the scheduled departure. By default the
/// record is an on-time EXPECTED bus departure modified a minute before the
/// journey starts.
pub struct RecordBuilder {
    departure_id: i64,
    journey_id: i64,
    jore_stop_id: String,
    jore_line_id: String,
    utc_offset_minutes: i32,
    sequence_number: i16,
    state: DepartureState,
    target_offset_seconds: i64,
    observed_offset_seconds: Option<i64>,
    modified_before_start_seconds: i64,
}

impl RecordBuilder {
    pub fn new(departure_id: i64) -> Self {
        Self {
            departure_id,
            journey_id: 100,
            jore_stop_id: "1130101".to_owned(),
            jore_line_id: "1055".to_owned(),
            utc_offset_minutes: 180,
            sequence_number: 5,
            state: DepartureState::Expected,
            target_offset_seconds: 0,
            observed_offset_seconds: None,
            modified_before_start_seconds: 60,
        }
    }

    pub fn journey(mut self, journey_id: i64) -> Self {
        self.journey_id = journey_id;
        self
    }

    pub fn stop(mut self, jore_stop_id: &str) -> Self {
        self.jore_stop_id = jore_stop_id.to_owned();
        self
    }

    pub fn line(mut self, jore_line_id: &str) -> Self {
        self.jore_line_id = jore_line_id.to_owned();
        self
    }

    pub fn utc_offset_minutes(mut self, minutes: i32) -> Self {
        self.utc_offset_minutes = minutes;
        self
    }

    pub fn sequence_number(mut self, sequence_number: i16) -> Self {
        self.sequence_number = sequence_number;
        self
    }

    pub fn state(mut self, state: DepartureState) -> Self {
        self.state = state;
        self
    }

    pub fn target_offset_seconds(mut self, seconds: i64) -> Self {
        self.target_offset_seconds = seconds;
        self
    }

    pub fn observed_offset_seconds(mut self, seconds: i64) -> Self {
        self.observed_offset_seconds = Some(seconds);
        self
    }

    pub fn modified_before_start_seconds(mut self, seconds: i64) -> Self {
        self.modified_before_start_seconds = seconds;
        self
    }

    pub fn build(self) -> EnrichedRecord {
        let start_utc = journey_start() - Duration::minutes(i64::from(self.utc_offset_minutes));
        let last_modified = Utc.from_utc_datetime(
            &(start_utc - Duration::seconds(self.modified_before_start_seconds)),
        );
        EnrichedRecord {
            departure: RawDeparture {
                departure_id: DepartureId(self.departure_id),
                journey_id: JourneyId(self.journey_id),
                stop_point_id: StopPointId(self.departure_id),
                timetabled_earliest: timetabled(),
                observed: self
                    .observed_offset_seconds
                    .map(|seconds| timetabled() + Duration::seconds(seconds)),
                target: timetabled() + Duration::seconds(self.target_offset_seconds),
                sequence_number: self.sequence_number,
                state: self.state,
                last_modified,
            },
            stop: StopInfo {
                jore_stop_id: self.jore_stop_id,
            },
            journey: journey_info(&self.jore_line_id),
            utc_offset: UtcOffset {
                minutes: self.utc_offset_minutes,
            },
        }
    }
}

/// A `Resolver` over an in-memory map whose refresh outcomes are scripted.
///
/// Each refresh pops the next queued outcome: an update merges its entries and
/// reports a change, a failure returns an error. With nothing queued a refresh
/// reports no change.
pub struct InMemoryResolver<K, V> {
    name: &'static str,
    entries: Mutex<HashMap<K, V>>,
    outcomes: Mutex<VecDeque<Result<Vec<(K, V)>, String>>>,
    refreshes: AtomicUsize,
}

impl<K: Eq + Hash, V> InMemoryResolver<K, V> {
    pub fn new(name: &'static str) -> Self {
        Self::with_entries(name, HashMap::new())
    }

    pub fn with_entries(name: &'static str, entries: HashMap<K, V>) -> Self {
        Self {
            name,
            entries: Mutex::new(entries),
            outcomes: Mutex::new(VecDeque::new()),
            refreshes: AtomicUsize::new(0),
        }
    }

    pub fn queue_update(&self, entries: Vec<(K, V)>) {
        self.outcomes.lock().unwrap().push_back(Ok(entries));
    }

    pub fn queue_failure(&self, reason: &str) {
        self.outcomes
            .lock()
            .unwrap()
            .push_back(Err(reason.to_owned()));
    }

    pub fn refresh_count(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<K, V> Resolver for InMemoryResolver<K, V>
where
    K: Eq + Hash + Send + Sync,
    V: Clone + Send + Sync,
{
    type Key = K;
    type Value = V;

    fn name(&self) -> &'static str {
        self.name
    }

    fn lookup(&self, key: &K) -> Option<V> {
        self.entries.lock().unwrap().get(key).cloned()
    }

    async fn refresh(&self) -> Result<bool, ResolverError> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        let outcome = self.outcomes.lock().unwrap().pop_front();
        match outcome {
            None => Ok(false),
            Some(Ok(update)) => {
                self.entries.lock().unwrap().extend(update);
                Ok(true)
            }
            Some(Err(reason)) => Err(ResolverError::RefreshFailed {
                resolver: self.name,
                reason,
            }),
        }
    }
}

pub type InMemoryStops = Arc<InMemoryResolver<StopPointId, StopInfo>>;
pub type InMemoryJourneys = Arc<InMemoryResolver<JourneyId, JourneyInfo>>;
pub type InMemoryUtcOffsets = Arc<InMemoryResolver<JourneyId, UtcOffset>>;

/// Reference data to seed in-memory resolvers with.
#[derive(Default, Clone)]
pub struct ReferenceData {
    stops: HashMap<StopPointId, StopInfo>,
    journeys: HashMap<JourneyId, JourneyInfo>,
    utc_offsets: HashMap<JourneyId, UtcOffset>,
}

impl ReferenceData {
    pub fn with_stop(mut self, stop_point_id: StopPointId, jore_stop_id: &str) -> Self {
        self.stops.insert(
            stop_point_id,
            StopInfo {
                jore_stop_id: jore_stop_id.to_owned(),
            },
        );
        self
    }

    /// Add a journey together with its UTC offset.
    pub fn with_journey(
        mut self,
        journey_id: JourneyId,
        jore_line_id: &str,
        utc_offset_minutes: i32,
    ) -> Self {
        self.journeys.insert(journey_id, journey_info(jore_line_id));
        self.utc_offsets.insert(
            journey_id,
            UtcOffset {
                minutes: utc_offset_minutes,
            },
        );
        self
    }

    pub fn matcher(
        self,
        max_rounds: Option<usize>,
    ) -> (Matcher, InMemoryStops, InMemoryJourneys, InMemoryUtcOffsets) {
        let stops = Arc::new(InMemoryResolver::with_entries("stop", self.stops.clone()));
        self.matcher_with_stops(stops, max_rounds)
    }

    /// Like `matcher`, with the stop resolver supplied by the caller.
    pub fn matcher_with_stops(
        self,
        stops: InMemoryStops,
        max_rounds: Option<usize>,
    ) -> (Matcher, InMemoryStops, InMemoryJourneys, InMemoryUtcOffsets) {
        let journeys = Arc::new(InMemoryResolver::with_entries("journey", self.journeys));
        let utc_offsets = Arc::new(InMemoryResolver::with_entries(
            "utc_offset",
            self.utc_offsets,
        ));
        let matcher = Matcher::new(
            stops.clone(),
            journeys.clone(),
            utc_offsets.clone(),
            max_rounds,
        );
        (matcher, stops, journeys, utc_offsets)
    }
}

/// A `ChangeFeed` replaying scripted batches.
///
/// Every query records its watermark and the (tokio) instant it was issued at,
/// then optionally sleeps to simulate a slow database. With nothing queued a
/// query returns an empty batch.
#[derive(Default)]
pub struct InMemoryFeed {
    responses: Mutex<VecDeque<(std::time::Duration, Result<FeedBatch, String>)>>,
    queries: Mutex<Vec<(tokio::time::Instant, DateTime<Utc>)>>,
}

impl InMemoryFeed {
    pub fn queue_batch(&self, departures: Vec<RawDeparture>) {
        self.queue_slow_batch(std::time::Duration::ZERO, departures);
    }

    pub fn queue_slow_batch(&self, delay: std::time::Duration, departures: Vec<RawDeparture>) {
        self.responses
            .lock()
            .unwrap()
            .push_back((delay, Ok(FeedBatch::from_departures(departures))));
    }

    /// Queue a batch whose latest modification is later than any decodable row.
    pub fn queue_raw_batch(&self, batch: FeedBatch) {
        self.responses
            .lock()
            .unwrap()
            .push_back((std::time::Duration::ZERO, Ok(batch)));
    }

    pub fn queue_failure(&self, reason: &str) {
        self.responses
            .lock()
            .unwrap()
            .push_back((std::time::Duration::ZERO, Err(reason.to_owned())));
    }

    pub fn watermarks(&self) -> Vec<DateTime<Utc>> {
        self.queries
            .lock()
            .unwrap()
            .iter()
            .map(|(_, watermark)| *watermark)
            .collect()
    }

    pub fn query_instants(&self) -> Vec<tokio::time::Instant> {
        self.queries
            .lock()
            .unwrap()
            .iter()
            .map(|(instant, _)| *instant)
            .collect()
    }
}

#[async_trait]
impl ChangeFeed for InMemoryFeed {
    async fn departures_since(&self, watermark: DateTime<Utc>) -> Result<FeedBatch, FeedError> {
        self.queries
            .lock()
            .unwrap()
            .push((tokio::time::Instant::now(), watermark));
        let response = self.responses.lock().unwrap().pop_front();
        let Some((delay, result)) = response else {
            return Ok(FeedBatch::default());
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        result.map_err(|reason| FeedError::QueryError(sqlx::Error::Protocol(reason)))
    }
}
