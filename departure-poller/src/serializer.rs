use std::collections::HashMap;

use departure_common::departure::{DepartureState, EnrichedRecord};
use departure_common::message::OutboundMessage;
use departure_common::timestamp::combine;
use serde::Serialize;

/// Fields shared by events and predictions.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StopVisit {
    pub jore_stop_id: String,
    pub jore_line_id: String,
    pub jore_line_direction: String,
    pub journey_start_time: String,
    pub stop_order_in_journey: i16,
    pub operating_day: String,
    pub journey_start_in_seconds_into_operating_day: i32,
    pub scheduled_departure_time: String,
}

impl StopVisit {
    fn from_record(record: &EnrichedRecord) -> Self {
        let offset = record.utc_offset.minutes;
        Self {
            jore_stop_id: record.stop.jore_stop_id.clone(),
            jore_line_id: record.journey.jore_line_id.clone(),
            jore_line_direction: record.journey.jore_direction.clone(),
            journey_start_time: combine(record.journey.localized_start_time, offset),
            stop_order_in_journey: record.departure.sequence_number,
            operating_day: record.journey.operating_day.format("%Y-%m-%d").to_string(),
            journey_start_in_seconds_into_operating_day: record.journey.start_offset_seconds,
            scheduled_departure_time: combine(record.departure.timetabled_earliest, offset),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    #[serde(flatten)]
    pub visit: StopVisit,
    pub event: DepartureState,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Prediction {
    #[serde(flatten)]
    pub visit: StopVisit,
    pub predicted_departure_time: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EventMessage<'a> {
    message_timestamp: &'a str,
    events: Vec<Event>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PredictionMessage<'a> {
    message_timestamp: &'a str,
    predictions: Vec<Prediction>,
}

/// Shapes accepted records into the entries and payload of one message kind.
pub trait Arrangement: Send {
    type Entry;

    fn entry(&self, record: &EnrichedRecord) -> Self::Entry;

    fn payload(
        &self,
        message_timestamp: &str,
        entries: Vec<Self::Entry>,
    ) -> Result<String, serde_json::Error>;
}

pub struct EventArrangement;

impl Arrangement for EventArrangement {
    type Entry = Event;

    fn entry(&self, record: &EnrichedRecord) -> Event {
        Event {
            visit: StopVisit::from_record(record),
            event: record.departure.state,
        }
    }

    fn payload(
        &self,
        message_timestamp: &str,
        events: Vec<Event>,
    ) -> Result<String, serde_json::Error> {
        serde_json::to_string(&EventMessage {
            message_timestamp,
            events,
        })
    }
}

pub struct PredictionArrangement;

impl Arrangement for PredictionArrangement {
    type Entry = Prediction;

    fn entry(&self, record: &EnrichedRecord) -> Prediction {
        Prediction {
            visit: StopVisit::from_record(record),
            predicted_departure_time: combine(
                record.effective_target(),
                record.utc_offset.minutes,
            ),
        }
    }

    fn payload(
        &self,
        message_timestamp: &str,
        predictions: Vec<Prediction>,
    ) -> Result<String, serde_json::Error> {
        serde_json::to_string(&PredictionMessage {
            message_timestamp,
            predictions,
        })
    }
}

/// Groups records by stop into one outbound message per stop.
pub struct Serializer<A: Arrangement> {
    topic_prefix: String,
    arrangement: A,
}

impl<A: Arrangement> Serializer<A> {
    pub fn new(topic_prefix: &str, arrangement: A) -> Self {
        Self {
            topic_prefix: topic_prefix.to_owned(),
            arrangement,
        }
    }

    /// Stops appear in the order they were first seen, entries keep record order.
    pub fn serialize(
        &self,
        records: &[&EnrichedRecord],
        message_timestamp: &str,
    ) -> Result<Vec<OutboundMessage>, serde_json::Error> {
        let mut stops: Vec<(&str, Vec<A::Entry>)> = Vec::new();
        let mut positions: HashMap<&str, usize> = HashMap::new();
        for record in records {
            let stop = record.stop.jore_stop_id.as_str();
            let position = *positions.entry(stop).or_insert_with(|| {
                stops.push((stop, Vec::new()));
                stops.len() - 1
            });
            stops[position].1.push(self.arrangement.entry(record));
        }

        stops
            .into_iter()
            .map(|(stop, entries)| {
                let payload = self.arrangement.payload(message_timestamp, entries)?;
                Ok(OutboundMessage::new(&self.topic_prefix, stop, payload))
            })
            .collect()
    }
}
