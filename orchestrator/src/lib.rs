pub mod config;
pub mod generation;
pub mod job;
pub mod jobs;
pub mod queue;
pub mod server;
pub mod skin;
pub mod state;
pub mod store;
pub mod streamer;
pub mod telemetry;
pub mod worker;
