use std::fmt;

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};
use serde::Serialize;
use thiserror::Error;

/// Jore line identifiers of trains start with this prefix.
const TRAIN_LINE_PREFIX: &str = "300";

/// Identity of a single departure row in the change feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, sqlx::Type)]
#[sqlx(transparent)]
pub struct DepartureId(pub i64);

/// Identity of a dated vehicle journey.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, sqlx::Type)]
#[sqlx(transparent)]
pub struct JourneyId(pub i64);

/// Identity of the journey pattern point a departure is targeted at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, sqlx::Type)]
#[sqlx(transparent)]
pub struct StopPointId(pub i64);

macro_rules! display_inner {
    ($($id:ty),*) => {
        $(impl fmt::Display for $id {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        })*
    };
}

display_inner!(DepartureId, JourneyId, StopPointId);

#[derive(Error, Debug, PartialEq, Eq)]
#[error("{0} is not a valid departure state code")]
pub struct UnknownDepartureState(pub i16);

/// State of a departure as reported by the change feed. Code 5 is unused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DepartureState {
    NotExpected,
    NotCalled,
    Expected,
    Cancelled,
    Inhibited,
    AtStop,
    Boarding,
    BoardingClosed,
    Departed,
    Passed,
    Missed,
    Replaced,
    AssumedDeparted,
}

impl DepartureState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DepartureState::NotExpected => "NOTEXPECTED",
            DepartureState::NotCalled => "NOTCALLED",
            DepartureState::Expected => "EXPECTED",
            DepartureState::Cancelled => "CANCELLED",
            DepartureState::Inhibited => "INHIBITED",
            DepartureState::AtStop => "ATSTOP",
            DepartureState::Boarding => "BOARDING",
            DepartureState::BoardingClosed => "BOARDINGCLOSED",
            DepartureState::Departed => "DEPARTED",
            DepartureState::Passed => "PASSED",
            DepartureState::Missed => "MISSED",
            DepartureState::Replaced => "REPLACED",
            DepartureState::AssumedDeparted => "ASSUMEDDEPARTED",
        }
    }
}

impl TryFrom<i16> for DepartureState {
    type Error = UnknownDepartureState;

    fn try_from(code: i16) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(DepartureState::NotExpected),
            1 => Ok(DepartureState::NotCalled),
            2 => Ok(DepartureState::Expected),
            3 => Ok(DepartureState::Cancelled),
            4 => Ok(DepartureState::Inhibited),
            6 => Ok(DepartureState::AtStop),
            7 => Ok(DepartureState::Boarding),
            8 => Ok(DepartureState::BoardingClosed),
            9 => Ok(DepartureState::Departed),
            10 => Ok(DepartureState::Passed),
            11 => Ok(DepartureState::Missed),
            12 => Ok(DepartureState::Replaced),
            13 => Ok(DepartureState::AssumedDeparted),
            invalid => Err(UnknownDepartureState(invalid)),
        }
    }
}

impl fmt::Display for DepartureState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the departure change feed.
#[derive(Debug, Clone, PartialEq)]
pub struct RawDeparture {
    pub departure_id: DepartureId,
    pub journey_id: JourneyId,
    pub stop_point_id: StopPointId,
    /// Local time, same zone as `target` and `observed`.
    pub timetabled_earliest: NaiveDateTime,
    pub observed: Option<NaiveDateTime>,
    pub target: NaiveDateTime,
    /// 1 is the first stop of the journey.
    pub sequence_number: i16,
    pub state: DepartureState,
    pub last_modified: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopInfo {
    pub jore_stop_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JourneyInfo {
    pub jore_line_id: String,
    pub jore_direction: String,
    pub localized_start_time: NaiveDateTime,
    pub operating_day: NaiveDate,
    pub start_offset_seconds: i32,
}

/// Local time = UTC + minutes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UtcOffset {
    pub minutes: i32,
}

/// A departure joined with all of its reference data. Built fresh for every
/// poll and never mutated afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct EnrichedRecord {
    pub departure: RawDeparture,
    pub stop: StopInfo,
    pub journey: JourneyInfo,
    pub utc_offset: UtcOffset,
}

impl EnrichedRecord {
    /// Journey start time converted to naive UTC.
    pub fn start_utc(&self) -> NaiveDateTime {
        self.journey.localized_start_time - Duration::minutes(i64::from(self.utc_offset.minutes))
    }

    /// The observed time when present, the target time otherwise.
    pub fn effective_target(&self) -> NaiveDateTime {
        self.departure.observed.unwrap_or(self.departure.target)
    }

    pub fn is_first_stop(&self) -> bool {
        self.departure.sequence_number == 1
    }

    pub fn is_train(&self) -> bool {
        is_train_line(&self.journey.jore_line_id)
    }
}

pub fn is_train_line(jore_line_id: &str) -> bool {
    jore_line_id.starts_with(TRAIN_LINE_PREFIX)
}
