pub mod api;
pub mod config;
pub mod endpoints;
pub mod event;
pub mod pipeline;
pub mod processor;
pub mod prometheus;
pub mod router;
pub mod server;
pub mod stats;
pub mod store;
pub mod time;
