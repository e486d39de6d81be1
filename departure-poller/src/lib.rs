pub mod config;
pub mod error;
pub mod feed;
pub mod filter;
pub mod handlers;
pub mod matcher;
pub mod metrics_consts;
pub mod pipeline;
pub mod poller;
pub mod publisher;
pub mod reference;
pub mod resolver;
pub mod serializer;
pub mod test_utils;
