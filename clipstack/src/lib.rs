//! ClipStack Core - clipboard history engine
//!
//! Captures clipboard changes, deduplicates them by content hash, keeps them
//! ordered newest first and persists everything in SQLite with large payloads
//! in per-format folders.
//!
//! # Architecture
//! - `native`: capture boundary with the platform clipboard monitor
//! - `codec`: raw clipboard buffers to `DataModel`s and payload files
//! - `history`: dedup, ordering and eviction (single mutation owner)
//! - `database` / `migrations`: SQLite store and its versioned schema
//! - `owners` / `tags` / `filters`: registries around clips
//! - `transfer`: zip archive export and import
//! - `store`: object exposed to host applications via UniFFI
//!
//! Types are exported via UniFFI proc-macros (#[derive(uniffi::Record/Enum)]).

use once_cell::sync::Lazy;

pub mod cleanup;
pub mod codec;
pub mod config;
pub mod content_detection;
pub mod database;
pub mod filters;
pub mod history;
pub mod interface;
pub mod link_metadata;
pub mod migrations;
pub mod models;
pub mod native;
pub mod owners;
pub mod search;
mod store;
pub mod tags;
pub mod transfer;

pub use interface::*;
pub use store::ClipStackStore;

/// Global fallback Tokio runtime for when async work starts outside any runtime context.
/// Used by UniFFI which doesn't provide a tokio runtime, and by the CLI.
static FALLBACK_RUNTIME: Lazy<tokio::runtime::Runtime> = Lazy::new(|| {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("clipstack-worker")
        .enable_all()
        .build()
        .expect("Failed to create fallback tokio runtime")
});

/// Current runtime if there is one, otherwise the fallback
pub(crate) fn runtime_handle() -> tokio::runtime::Handle {
    tokio::runtime::Handle::try_current().unwrap_or_else(|_| FALLBACK_RUNTIME.handle().clone())
}

uniffi::setup_scaffolding!("clipstack");
