/// A payload bound for the broker, addressed by topic suffix
/// (pipeline prefix + Jore stop id).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub topic_suffix: String,
    pub payload: String,
}

impl OutboundMessage {
    pub fn new(topic_prefix: &str, jore_stop_id: &str, payload: String) -> Self {
        Self {
            topic_suffix: format!("{}{}", topic_prefix, jore_stop_id),
            payload,
        }
    }
}
