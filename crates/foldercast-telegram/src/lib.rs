//! Telegram bot surface (teloxide).
//!
//! Users control the forwarding orchestrator in `foldercast-core` through
//! chat commands and an inline folder picker. This crate holds no
//! orchestration state of its own.

pub mod handlers;
pub mod router;
pub mod view;
