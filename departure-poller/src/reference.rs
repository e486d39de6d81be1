//! Postgres loaders for the stop, journey and UTC offset reference data.
use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use departure_common::departure::{JourneyId, JourneyInfo, StopInfo, StopPointId, UtcOffset};
use sqlx::postgres::PgPool;

use crate::error::ResolverError;
use crate::resolver::{SnapshotLoader, SnapshotResolver};

pub type StopResolver = SnapshotResolver<PgStopLoader>;
pub type JourneyResolver = SnapshotResolver<PgJourneyLoader>;
pub type UtcOffsetResolver = SnapshotResolver<PgUtcOffsetLoader>;

pub struct PgStopLoader {
    pool: PgPool,
}

impl PgStopLoader {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SnapshotLoader for PgStopLoader {
    type Key = StopPointId;
    type Value = StopInfo;

    fn name(&self) -> &'static str {
        "stop"
    }

    async fn load(&self) -> Result<HashMap<StopPointId, StopInfo>, ResolverError> {
        let rows: Vec<(StopPointId, String)> = sqlx::query_as(
            r#"
SELECT
    sp.gid,
    sp.jore_stop_id
FROM
    stop_point AS sp
WHERE
    sp.jore_stop_id IS NOT NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|error| ResolverError::QueryError {
            resolver: self.name(),
            error,
        })?;

        Ok(rows
            .into_iter()
            .map(|(gid, jore_stop_id)| (gid, StopInfo { jore_stop_id }))
            .collect())
    }
}

#[derive(sqlx::FromRow)]
struct JourneyRow {
    id: JourneyId,
    jore_line_id: String,
    jore_direction: String,
    localized_start_time: NaiveDateTime,
    operating_day_date: NaiveDate,
    start_offset_seconds: i32,
}

pub struct PgJourneyLoader {
    pool: PgPool,
}

impl PgJourneyLoader {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SnapshotLoader for PgJourneyLoader {
    type Key = JourneyId;
    type Value = JourneyInfo;

    fn name(&self) -> &'static str {
        "journey"
    }

    async fn load(&self) -> Result<HashMap<JourneyId, JourneyInfo>, ResolverError> {
        // Journeys past midnight still belong to yesterday's operating day.
        let rows: Vec<JourneyRow> = sqlx::query_as(
            r#"
SELECT
    dj.id,
    dj.jore_line_id,
    dj.jore_direction,
    dj.localized_start_time,
    dj.operating_day_date,
    dj.start_offset_seconds
FROM
    dated_journey AS dj
WHERE
    dj.operating_day_date >= CURRENT_DATE - 1
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|error| ResolverError::QueryError {
            resolver: self.name(),
            error,
        })?;

        Ok(rows
            .into_iter()
            .map(|row| {
                (
                    row.id,
                    JourneyInfo {
                        jore_line_id: row.jore_line_id,
                        jore_direction: row.jore_direction,
                        localized_start_time: row.localized_start_time,
                        operating_day: row.operating_day_date,
                        start_offset_seconds: row.start_offset_seconds,
                    },
                )
            })
            .collect())
    }
}

pub struct PgUtcOffsetLoader {
    pool: PgPool,
}

impl PgUtcOffsetLoader {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SnapshotLoader for PgUtcOffsetLoader {
    type Key = JourneyId;
    type Value = UtcOffset;

    fn name(&self) -> &'static str {
        "utc_offset"
    }

    async fn load(&self) -> Result<HashMap<JourneyId, UtcOffset>, ResolverError> {
        let rows: Vec<(JourneyId, i32)> = sqlx::query_as(
            r#"
SELECT
    o.dated_journey_id,
    o.utc_offset_minutes
FROM
    dated_journey_utc_offset AS o
    JOIN dated_journey AS dj ON dj.id = o.dated_journey_id
WHERE
    dj.operating_day_date >= CURRENT_DATE - 1
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|error| ResolverError::QueryError {
            resolver: self.name(),
            error,
        })?;

        Ok(rows
            .into_iter()
            .map(|(journey, minutes)| (journey, UtcOffset { minutes }))
            .collect())
    }
}
