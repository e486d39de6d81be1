pub const POLL_CYCLES: &str = "departure_poller_cycles";
pub const POLL_CYCLE_TIME: &str = "departure_poller_cycle_seconds";
pub const POLL_FAILURES: &str = "departure_poller_cycle_failures";
pub const ROWS_POLLED: &str = "departure_poller_rows_polled";
pub const ROWS_UNDECODABLE: &str = "departure_poller_rows_undecodable";
pub const WATERMARK_LAG: &str = "departure_poller_watermark_lag_seconds";

pub const ROWS_UNMATCHED: &str = "departure_poller_rows_unmatched";
// Only cycles that had to refresh reference data are recorded.
pub const MATCH_ROUNDS: &str = "departure_poller_match_rounds";
pub const MATCH_ROUNDS_EXHAUSTED: &str = "departure_poller_match_rounds_exhausted";
pub const RESOLVER_REFRESH_FAILURES: &str = "departure_poller_resolver_refresh_failures";

// Labelled by pipeline.
pub const RECORDS_ACCEPTED: &str = "departure_poller_records_accepted";
pub const RECORDS_REJECTED: &str = "departure_poller_records_rejected";
pub const MESSAGES_ENQUEUED: &str = "departure_poller_messages_enqueued";
pub const FILTER_CACHE_USAGE: &str = "departure_poller_filter_cache_usage";

pub const PUBLISH_SUCCEEDED: &str = "departure_publisher_messages_published";
pub const PUBLISH_FAILED: &str = "departure_publisher_messages_failed";
pub const PUBLISH_TIME: &str = "departure_publisher_request_seconds";
pub const BROKER_CONNECTED: &str = "departure_publisher_connected";
