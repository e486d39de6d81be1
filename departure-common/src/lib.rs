pub mod departure;
pub mod health;
pub mod message;
pub mod metrics;
pub mod timestamp;
