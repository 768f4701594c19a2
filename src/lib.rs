pub mod agent;
pub mod config;
pub mod crew;
pub mod error;
pub mod gateway;
pub mod provider;
pub mod queue;
pub mod server;
pub mod shutdown;
pub mod workflow;

#[cfg(test)]
pub(crate) mod testing;
