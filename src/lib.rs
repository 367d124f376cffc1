//! Offline-resilient mutation sync for field inspection apps.
//!
//! Pages record mutations through [`gateway::MutationGateway`]. While
//! offline they land in the durable [`queue::QueueStore`]; once
//! connectivity returns, [`background_sync::SyncScheduler`] wakes the
//! [`coordinator::SyncCoordinator`], which asks an open page to flush the
//! queue with its [`executor::SyncExecutor`]. Reads go through
//! [`worker::Worker`], which serves the active version's caches.

pub mod api;
pub mod background_sync;
pub mod cache;
pub mod clients;
pub mod config;
pub mod connectivity;
pub mod coordinator;
pub mod db;
pub mod executor;
pub mod gateway;
pub mod logging;
pub mod net;
pub mod page;
pub mod protocol;
pub mod queue;
pub mod worker;
