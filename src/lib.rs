pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod outbound;
pub mod security;
pub mod server;
pub mod telemetry;
