//! Offline-first intercepting cache for a web application.
//!
//! Requests pass through a [`relay::Relay`], which classifies them, serves
//! them from versioned cache partitions or the network according to their
//! class, queues mutations made while offline and replays them in order once
//! connectivity returns.

pub mod cache;
pub mod classify;
pub mod config;
pub mod db;
pub mod error;
pub mod event;
pub mod http;
pub mod lifecycle;
pub mod logging;
pub mod messaging;
pub mod network;
pub mod outbox;
pub mod relay;
pub mod server;

#[cfg(test)]
mod testing;
