pub mod api;
pub mod client;
pub mod config;
pub mod error;
pub mod judge;
pub mod metrics;
pub mod scheduler;
pub mod service;
pub mod shutdown;
pub mod worker;
