pub mod app;
pub mod capabilities;
pub mod capability;
pub mod cli;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod events;
pub mod gate;
pub mod orchestrator;
pub mod plan;
pub mod render;
pub mod telemetry;

#[cfg(test)]
mod testing;
