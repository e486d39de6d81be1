use std::sync::Arc;

use departure_common::departure::{
    EnrichedRecord, JourneyId, JourneyInfo, RawDeparture, StopInfo, StopPointId, UtcOffset,
};
use tracing::{debug, error};

use crate::error::ResolverError;
use crate::metrics_consts::{
    MATCH_ROUNDS, MATCH_ROUNDS_EXHAUSTED, RESOLVER_REFRESH_FAILURES, ROWS_UNMATCHED,
};
use crate::resolver::Resolver;

pub type StopLookup = Arc<dyn Resolver<Key = StopPointId, Value = StopInfo>>;
pub type JourneyLookup = Arc<dyn Resolver<Key = JourneyId, Value = JourneyInfo>>;
pub type UtcOffsetLookup = Arc<dyn Resolver<Key = JourneyId, Value = UtcOffset>>;

/// Joins change feed rows with their stop, journey and UTC offset.
pub struct Matcher {
    stops: StopLookup,
    journeys: JourneyLookup,
    utc_offsets: UtcOffsetLookup,
    /// Give up refreshing after this many rounds. `None` refreshes until nothing changes.
    max_rounds: Option<usize>,
}

impl Matcher {
    pub fn new(
        stops: StopLookup,
        journeys: JourneyLookup,
        utc_offsets: UtcOffsetLookup,
        max_rounds: Option<usize>,
    ) -> Self {
        Self {
            stops,
            journeys,
            utc_offsets,
            max_rounds,
        }
    }

    /// Enrich every departure whose references all resolve.
    ///
    /// While some departure is missing a reference, all resolvers are refreshed
    /// and, if any of them changed, the whole batch is joined again. Departures
    /// still unresolved once the resolvers stop changing are dropped.
    pub async fn match_all(&self, departures: &[RawDeparture]) -> Vec<EnrichedRecord> {
        let mut rounds = 0;
        let matched = loop {
            let (matched, unmatched) = self.join(departures);
            if unmatched == 0 {
                break matched;
            }
            if self.max_rounds.is_some_and(|max| rounds >= max) {
                error!(
                    "reference data still changing after {} refresh rounds, dropping {} rows",
                    rounds, unmatched
                );
                metrics::counter!(MATCH_ROUNDS_EXHAUSTED).increment(1);
                break matched;
            }
            rounds += 1;
            if self.refresh_all().await {
                debug!("at least one resolver was updated so try matching again");
            } else {
                break matched;
            }
        };

        if rounds > 0 {
            metrics::histogram!(MATCH_ROUNDS).record(rounds as f64);
        }
        metrics::counter!(ROWS_UNMATCHED).increment((departures.len() - matched.len()) as u64);
        debug!(
            "{} of {} rows remain after matching to reference data",
            matched.len(),
            departures.len()
        );
        matched
    }

    fn join(&self, departures: &[RawDeparture]) -> (Vec<EnrichedRecord>, usize) {
        let mut matched = Vec::with_capacity(departures.len());
        for departure in departures {
            if let Some(record) = self.enrich(departure) {
                matched.push(record);
            }
        }
        let unmatched = departures.len() - matched.len();
        (matched, unmatched)
    }

    fn enrich(&self, departure: &RawDeparture) -> Option<EnrichedRecord> {
        let stop = self.stops.lookup(&departure.stop_point_id);
        if stop.is_none() {
            debug!(
                "stop point {} not found in stop reference data, row: {:?}",
                departure.stop_point_id, departure
            );
        }
        let journey = self.journeys.lookup(&departure.journey_id);
        if journey.is_none() {
            debug!(
                "journey {} not found in journey reference data, row: {:?}",
                departure.journey_id, departure
            );
        }
        let utc_offset = self.utc_offsets.lookup(&departure.journey_id);
        if utc_offset.is_none() {
            debug!(
                "journey {} not found in UTC offset reference data, row: {:?}",
                departure.journey_id, departure
            );
        }

        let (stop, journey, utc_offset) = (stop?, journey?, utc_offset?);
        Some(EnrichedRecord {
            departure: departure.clone(),
            stop,
            journey,
            utc_offset,
        })
    }

    /// Refresh all resolvers concurrently. A failed refresh counts as unchanged.
    async fn refresh_all(&self) -> bool {
        let (stops, journeys, utc_offsets) = futures::join!(
            self.stops.refresh(),
            self.journeys.refresh(),
            self.utc_offsets.refresh(),
        );

        [
            (self.stops.name(), stops),
            (self.journeys.name(), journeys),
            (self.utc_offsets.name(), utc_offsets),
        ]
        .into_iter()
        .map(|(name, result)| changed_or_log(name, result))
        .fold(false, |any, changed| any || changed)
    }
}

fn changed_or_log(resolver: &'static str, result: Result<bool, ResolverError>) -> bool {
    match result {
        Ok(changed) => changed,
        Err(e) => {
            error!("{} resolver refresh failed: {}", resolver, e);
            metrics::counter!(RESOLVER_REFRESH_FAILURES, "resolver" => resolver).increment(1);
            false
        }
    }
}
