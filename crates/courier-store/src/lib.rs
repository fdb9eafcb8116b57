//! # courier-store
//!
//! Durable local ledger for the Courier sync engine, backed by SQLite.
//!
//! The crate exposes a synchronous `Database` handle that wraps a
//! `rusqlite::Connection` and provides typed helpers for messages,
//! conversations and sync checkpoints. Writes that touch more than one table
//! run inside a single transaction.

pub mod conversations;
pub mod database;
pub mod ledger;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod sync_state;

mod error;
mod sql;

pub use database::Database;
pub use error::StoreError;
pub use ledger::{BatchApplied, InboundApplied};
pub use models::*;
