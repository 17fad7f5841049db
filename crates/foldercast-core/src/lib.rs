//! Core domain + orchestration logic for Foldercast.
//!
//! Foldercast links Telegram chat folders to dedicated aggregate channels and
//! forwards every new message from a folder's source chats into the bound
//! channel. The remote user-client and the persistence backend live behind
//! ports (traits), so the orchestrator can be driven and tested without a
//! wire protocol.

pub mod background;
pub mod binding;
pub mod breaker;
pub mod config;
pub mod dedup;
pub mod domain;
pub mod errors;
pub mod logging;
pub mod metrics;
pub mod queue;
pub mod registry;
pub mod remote;
pub mod session;
pub mod store;
pub mod watchdog;

#[cfg(test)]
pub(crate) mod testutil;

pub use errors::{Error, Result};
