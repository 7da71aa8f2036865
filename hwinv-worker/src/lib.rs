//! hwinv worker: reconciles registered hardware with the external services
//! that realise it (bare-metal provisioning, reservations, device fleet,
//! tunnel broker).
//!
//! The [`manager::WorkerManager`] discovers due tasks in the
//! [`store::Registry`] and hands each one to its [`worker::Worker`].

pub mod backoff;
pub mod client;
pub mod config;
pub mod error;
pub mod import;
pub mod manager;
pub mod model;
pub mod store;
pub mod worker;

#[cfg(test)]
pub mod test_util;
