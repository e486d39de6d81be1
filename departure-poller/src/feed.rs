use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use departure_common::departure::{
    DepartureId, DepartureState, JourneyId, RawDeparture, StopPointId,
};
use sqlx::postgres::PgPool;
use tracing::warn;

use crate::error::FeedError;
use crate::metrics_consts::ROWS_UNDECODABLE;

/// Everything the change feed returned for one watermark.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedBatch {
    pub departures: Vec<RawDeparture>,
    /// Latest modification over every fetched row, including rows that could not be decoded.
    pub latest_modification: Option<DateTime<Utc>>,
}

impl FeedBatch {
    pub fn from_departures(departures: Vec<RawDeparture>) -> Self {
        let latest_modification = departures.iter().map(|d| d.last_modified).max();
        Self {
            departures,
            latest_modification,
        }
    }

    /// True when the feed returned no rows at all.
    pub fn is_empty(&self) -> bool {
        self.latest_modification.is_none()
    }
}

#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Rows modified at or after `watermark`.
    async fn departures_since(&self, watermark: DateTime<Utc>) -> Result<FeedBatch, FeedError>;
}

#[async_trait]
impl<T: ChangeFeed + ?Sized> ChangeFeed for Arc<T> {
    async fn departures_since(&self, watermark: DateTime<Utc>) -> Result<FeedBatch, FeedError> {
        (**self).departures_since(watermark).await
    }
}

#[derive(sqlx::FromRow)]
struct DepartureRow {
    departure_id: DepartureId,
    journey_id: JourneyId,
    stop_point_id: StopPointId,
    timetabled_earliest: NaiveDateTime,
    observed: Option<NaiveDateTime>,
    target: NaiveDateTime,
    sequence_number: i16,
    state: i16,
    last_modified: DateTime<Utc>,
}

impl DepartureRow {
    fn into_departure(self) -> Option<RawDeparture> {
        let state = match DepartureState::try_from(self.state) {
            Ok(state) => state,
            Err(error) => {
                warn!(
                    "skipping departure {} of journey {}: {}",
                    self.departure_id, self.journey_id, error
                );
                return None;
            }
        };
        Some(RawDeparture {
            departure_id: self.departure_id,
            journey_id: self.journey_id,
            stop_point_id: self.stop_point_id,
            timetabled_earliest: self.timetabled_earliest,
            observed: self.observed,
            target: self.target,
            sequence_number: self.sequence_number,
            state,
            last_modified: self.last_modified,
        })
    }
}

/// Change feed over the `departure` table.
pub struct PgChangeFeed {
    pool: PgPool,
}

impl PgChangeFeed {
    // Stop point gids ending in 99000..99999 are via points, not stops.
    const POLLING_QUERY: &'static str = r#"
SELECT
    d.id AS departure_id,
    d.dated_journey_id AS journey_id,
    d.stop_point_gid AS stop_point_id,
    d.timetabled_earliest_time AS timetabled_earliest,
    d.observed_time AS observed,
    d.target_time AS target,
    d.journey_pattern_sequence_number AS sequence_number,
    d.state AS state,
    d.last_modified_utc AS last_modified
FROM
    departure AS d
WHERE
    d.last_modified_utc >= $1
    AND d.last_modified_utc IS NOT NULL
    AND d.stop_point_gid % 100000 < 99000
"#;

    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ChangeFeed for PgChangeFeed {
    async fn departures_since(&self, watermark: DateTime<Utc>) -> Result<FeedBatch, FeedError> {
        let rows: Vec<DepartureRow> = sqlx::query_as(Self::POLLING_QUERY)
            .bind(watermark)
            .fetch_all(&self.pool)
            .await?;

        let latest_modification = rows.iter().map(|row| row.last_modified).max();
        let fetched = rows.len();
        let departures: Vec<RawDeparture> = rows
            .into_iter()
            .filter_map(DepartureRow::into_departure)
            .collect();
        metrics::counter!(ROWS_UNDECODABLE).increment((fetched - departures.len()) as u64);

        Ok(FeedBatch {
            departures,
            latest_modification,
        })
    }
}
