use std::num::NonZeroUsize;

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use departure_common::departure::{DepartureId, DepartureState, EnrichedRecord};
use lru::LruCache;
use tracing::debug;

use crate::metrics_consts::{FILTER_CACHE_USAGE, RECORDS_ACCEPTED, RECORDS_REJECTED};

/// Decides whether a record is worth forwarding given the last record accepted
/// for the same departure.
pub trait InclusionPolicy: Send {
    /// The fields a decision depends on, cached per departure on acceptance.
    type Snapshot: Send;

    fn name(&self) -> &'static str;

    fn extract(&self, record: &EnrichedRecord) -> (DepartureId, Self::Snapshot);

    fn decide(&self, current: &Self::Snapshot, cached: Option<&Self::Snapshot>) -> bool;
}

/// An `InclusionPolicy` backed by a bounded LRU cache of accepted snapshots.
///
/// Only accepted records are cached, replacing any previous entry for the
/// departure. An evicted departure is treated as never seen.
pub struct RecencyFilter<P: InclusionPolicy> {
    policy: P,
    cache: LruCache<DepartureId, P::Snapshot>,
}

impl<P: InclusionPolicy> RecencyFilter<P> {
    pub fn new(policy: P, capacity: NonZeroUsize) -> Self {
        Self {
            policy,
            cache: LruCache::new(capacity),
        }
    }

    pub fn name(&self) -> &'static str {
        self.policy.name()
    }

    /// Keep only interesting records, in their original order.
    pub fn retain<'r>(&mut self, records: &'r [EnrichedRecord]) -> Vec<&'r EnrichedRecord> {
        let kept: Vec<&EnrichedRecord> = records
            .iter()
            .filter(|record| self.admit(record))
            .collect();

        let labels = [("pipeline", self.name())];
        metrics::counter!(RECORDS_ACCEPTED, &labels).increment(kept.len() as u64);
        metrics::counter!(RECORDS_REJECTED, &labels).increment((records.len() - kept.len()) as u64);
        metrics::gauge!(FILTER_CACHE_USAGE, &labels)
            .set(self.cache.len() as f64 / self.cache.cap().get() as f64);
        debug!(
            "{} rows remain after filtering with {}",
            kept.len(),
            self.name()
        );
        kept
    }

    fn admit(&mut self, record: &EnrichedRecord) -> bool {
        let (departure_id, current) = self.policy.extract(record);
        let is_kept = self
            .policy
            .decide(&current, self.cache.get(&departure_id));
        if is_kept {
            self.cache.put(departure_id, current);
        }
        is_kept
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventSnapshot {
    pub state: DepartureState,
    pub is_train: bool,
    pub is_first_stop: bool,
    pub start_utc: NaiveDateTime,
    pub last_modified: DateTime<Utc>,
}

/// Forwards departure state transitions.
///
/// Rejects trains, whose events come from another source, and first-stop
/// events reported too long before the journey starts.
pub struct EventPolicy {
    pre_journey_threshold: Duration,
}

impl EventPolicy {
    pub fn new(pre_journey_threshold: Duration) -> Self {
        Self {
            pre_journey_threshold,
        }
    }
}

impl InclusionPolicy for EventPolicy {
    type Snapshot = EventSnapshot;

    fn name(&self) -> &'static str {
        "events"
    }

    fn extract(&self, record: &EnrichedRecord) -> (DepartureId, EventSnapshot) {
        let snapshot = EventSnapshot {
            state: record.departure.state,
            is_train: record.is_train(),
            is_first_stop: record.is_first_stop(),
            start_utc: record.start_utc(),
            last_modified: record.departure.last_modified,
        };
        (record.departure.departure_id, snapshot)
    }

    fn decide(&self, current: &EventSnapshot, cached: Option<&EventSnapshot>) -> bool {
        let is_given_early = is_given_early(
            current.start_utc,
            current.last_modified,
            self.pre_journey_threshold,
        );
        if (current.is_first_stop && is_given_early) || current.is_train {
            return false;
        }
        match cached {
            None => true,
            Some(cached) => current.state != cached.state,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PredictionSnapshot {
    /// Observed time when available, predicted time otherwise.
    pub target: NaiveDateTime,
    pub timetabled_earliest: NaiveDateTime,
    pub state: DepartureState,
    pub is_train: bool,
    pub start_utc: NaiveDateTime,
    pub last_modified: DateTime<Utc>,
}

/// Forwards arrival time estimates that moved enough since the last one sent.
///
/// Rejects trains, cancelled departures, and predictions that are both given
/// too early before the journey and earlier than the timetable.
pub struct PredictionPolicy {
    pre_journey_threshold: Duration,
    change_threshold: Duration,
}

impl PredictionPolicy {
    pub fn new(pre_journey_threshold: Duration, change_threshold: Duration) -> Self {
        Self {
            pre_journey_threshold,
            change_threshold,
        }
    }
}

impl InclusionPolicy for PredictionPolicy {
    type Snapshot = PredictionSnapshot;

    fn name(&self) -> &'static str {
        "predictions"
    }

    fn extract(&self, record: &EnrichedRecord) -> (DepartureId, PredictionSnapshot) {
        let snapshot = PredictionSnapshot {
            target: record.effective_target(),
            timetabled_earliest: record.departure.timetabled_earliest,
            state: record.departure.state,
            is_train: record.is_train(),
            start_utc: record.start_utc(),
            last_modified: record.departure.last_modified,
        };
        (record.departure.departure_id, snapshot)
    }

    fn decide(&self, current: &PredictionSnapshot, cached: Option<&PredictionSnapshot>) -> bool {
        let is_given_early = is_given_early(
            current.start_utc,
            current.last_modified,
            self.pre_journey_threshold,
        );
        let is_predicted_early = current.target < current.timetabled_earliest;
        if current.is_train
            || (is_given_early && is_predicted_early)
            || current.state == DepartureState::Cancelled
        {
            return false;
        }
        match cached {
            None => true,
            Some(cached) => (current.target - cached.target).abs() >= self.change_threshold,
        }
    }
}

/// Whether the row was last modified more than `threshold` before the journey started.
fn is_given_early(
    start_utc: NaiveDateTime,
    last_modified: DateTime<Utc>,
    threshold: Duration,
) -> bool {
    start_utc - last_modified.naive_utc() > threshold
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::RecordBuilder;

    fn event_filter(capacity: usize) -> RecencyFilter<EventPolicy> {
        RecencyFilter::new(
            EventPolicy::new(Duration::seconds(600)),
            NonZeroUsize::new(capacity).unwrap(),
        )
    }

    fn prediction_filter(capacity: usize) -> RecencyFilter<PredictionPolicy> {
        RecencyFilter::new(
            PredictionPolicy::new(Duration::seconds(600), Duration::seconds(30)),
            NonZeroUsize::new(capacity).unwrap(),
        )
    }

    fn ids(records: &[&EnrichedRecord]) -> Vec<i64> {
        records.iter().map(|r| r.departure.departure_id.0).collect()
    }

    #[test]
    fn test_given_early_is_strict() {
        let record = RecordBuilder::new(1).modified_before_start_seconds(600).build();
        let start_utc = record.start_utc();
        let last_modified = record.departure.last_modified;

        assert!(!is_given_early(start_utc, last_modified, Duration::seconds(600)));
        assert!(is_given_early(start_utc, last_modified, Duration::seconds(599)));
    }

    #[test]
    fn test_event_repeated_state_is_suppressed() {
        let mut filter = event_filter(10);
        let records = vec![
            RecordBuilder::new(1).state(DepartureState::Expected).build(),
            RecordBuilder::new(1).state(DepartureState::Expected).build(),
            RecordBuilder::new(1).state(DepartureState::AtStop).build(),
        ];

        let kept = filter.retain(&records);

        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].departure.state, DepartureState::Expected);
        assert_eq!(kept[1].departure.state, DepartureState::AtStop);
    }

    #[test]
    fn test_event_cache_spans_batches() {
        let mut filter = event_filter(10);
        let first = vec![RecordBuilder::new(1).state(DepartureState::Expected).build()];
        let second = vec![
            RecordBuilder::new(1).state(DepartureState::Expected).build(),
            RecordBuilder::new(2).state(DepartureState::Expected).build(),
        ];

        assert_eq!(filter.retain(&first).len(), 1);
        assert_eq!(ids(&filter.retain(&second)), vec![2]);
    }

    #[test]
    fn test_event_trains_are_rejected() {
        let mut filter = event_filter(10);
        let records = vec![
            RecordBuilder::new(1)
                .line("3001A")
                .state(DepartureState::Expected)
                .build(),
            RecordBuilder::new(1)
                .line("3001A")
                .state(DepartureState::AtStop)
                .build(),
        ];

        assert!(filter.retain(&records).is_empty());
    }

    #[test]
    fn test_event_early_first_stop_is_rejected() {
        let mut filter = event_filter(10);
        // Reported 20 minutes before the journey starts.
        let early_first = RecordBuilder::new(1)
            .sequence_number(1)
            .modified_before_start_seconds(1200)
            .build();
        let early_second = RecordBuilder::new(2)
            .sequence_number(2)
            .modified_before_start_seconds(1200)
            .build();
        let late_first = RecordBuilder::new(3)
            .sequence_number(1)
            .modified_before_start_seconds(600)
            .build();

        let records = vec![early_first, early_second, late_first];
        assert_eq!(ids(&filter.retain(&records)), vec![2, 3]);
    }

    #[test]
    fn test_event_rejections_are_not_cached() {
        let mut filter = event_filter(10);
        let records = vec![
            RecordBuilder::new(1)
                .sequence_number(1)
                .modified_before_start_seconds(1200)
                .state(DepartureState::Expected)
                .build(),
            RecordBuilder::new(1)
                .sequence_number(1)
                .modified_before_start_seconds(60)
                .state(DepartureState::Expected)
                .build(),
        ];

        let kept = filter.retain(&records);
        assert_eq!(kept.len(), 1);
        assert_eq!(
            kept[0].departure.last_modified,
            records[1].departure.last_modified
        );
    }

    #[test]
    fn test_eviction_only_readmits_the_evicted_departure() {
        let mut filter = event_filter(2);
        let expected = |id| RecordBuilder::new(id).state(DepartureState::Expected).build();

        assert_eq!(filter.retain(&[expected(1), expected(2)]).len(), 2);
        // Departure 3 evicts the least recently used entry, departure 1.
        assert_eq!(filter.retain(&[expected(3)]).len(), 1);
        assert_eq!(ids(&filter.retain(&[expected(2), expected(1)])), vec![1]);
    }

    #[test]
    fn test_lookup_refreshes_recency() {
        let mut filter = event_filter(2);
        let expected = |id| RecordBuilder::new(id).state(DepartureState::Expected).build();

        filter.retain(&[expected(1), expected(2)]);
        // Touching 1 makes 2 the eviction candidate.
        assert!(filter.retain(&[expected(1)]).is_empty());
        filter.retain(&[expected(3)]);
        assert_eq!(ids(&filter.retain(&[expected(1), expected(2)])), vec![2]);
    }

    #[test]
    fn test_prediction_small_changes_are_suppressed() {
        let mut filter = prediction_filter(10);
        let records = vec![
            RecordBuilder::new(1).target_offset_seconds(0).build(),
            RecordBuilder::new(1).target_offset_seconds(4).build(),
            RecordBuilder::new(1).target_offset_seconds(40).build(),
        ];

        let kept = filter.retain(&records);

        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].departure.target, records[0].departure.target);
        assert_eq!(kept[1].departure.target, records[2].departure.target);
    }

    #[test]
    fn test_prediction_change_is_measured_from_last_accepted() {
        let mut filter = prediction_filter(10);
        // Each step is below the threshold, but they add up.
        let records: Vec<EnrichedRecord> = [0, 20, 29, 35]
            .into_iter()
            .map(|offset| RecordBuilder::new(1).target_offset_seconds(offset).build())
            .collect();

        let kept = filter.retain(&records);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[1].departure.target, records[3].departure.target);
    }

    #[test]
    fn test_prediction_threshold_is_inclusive_and_symmetric() {
        let mut filter = prediction_filter(10);
        let records = vec![
            RecordBuilder::new(1).target_offset_seconds(60).build(),
            RecordBuilder::new(1).target_offset_seconds(30).build(),
        ];

        assert_eq!(filter.retain(&records).len(), 2);
    }

    #[test]
    fn test_prediction_trains_are_rejected() {
        let mut filter = prediction_filter(10);
        let records = vec![
            RecordBuilder::new(1).line("3001A").build(),
            RecordBuilder::new(2).line("3002U").target_offset_seconds(120).build(),
        ];

        assert!(filter.retain(&records).is_empty());
    }

    #[test]
    fn test_prediction_cancelled_is_rejected() {
        let mut filter = prediction_filter(10);
        let records = vec![RecordBuilder::new(1)
            .state(DepartureState::Cancelled)
            .build()];

        assert!(filter.retain(&records).is_empty());
    }

    #[test]
    fn test_prediction_early_and_ahead_of_timetable_is_rejected() {
        let mut filter = prediction_filter(10);
        let records = vec![
            // Given early and predicting an early arrival.
            RecordBuilder::new(1)
                .modified_before_start_seconds(1200)
                .target_offset_seconds(-10)
                .build(),
            // Given early but on time.
            RecordBuilder::new(2)
                .modified_before_start_seconds(1200)
                .target_offset_seconds(0)
                .build(),
            // Ahead of timetable but given close to the start.
            RecordBuilder::new(3)
                .modified_before_start_seconds(60)
                .target_offset_seconds(-10)
                .build(),
        ];

        assert_eq!(ids(&filter.retain(&records)), vec![2, 3]);
    }

    #[test]
    fn test_observation_supersedes_prediction() {
        let mut filter = prediction_filter(10);
        let observed = RecordBuilder::new(1)
            .modified_before_start_seconds(1200)
            .target_offset_seconds(0)
            .observed_offset_seconds(-5)
            .build();
        // The observation makes it early, so given early it is rejected.
        assert!(filter.retain(&[observed]).is_empty());

        let observed = RecordBuilder::new(2)
            .target_offset_seconds(0)
            .observed_offset_seconds(-5)
            .build();
        let (_, snapshot) = PredictionPolicy::new(Duration::seconds(600), Duration::seconds(30))
            .extract(&observed);
        assert_eq!(snapshot.target, observed.departure.observed.unwrap());
        assert_eq!(filter.retain(&[observed]).len(), 1);

        // Compared against the cached observation (32s), not the original target (27s).
        let later = RecordBuilder::new(2).target_offset_seconds(27).build();
        assert_eq!(filter.retain(&[later]).len(), 1);
    }
}
