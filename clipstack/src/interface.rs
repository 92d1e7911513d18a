//! ClipStack FFI Interface Definition
//!
//! This file defines the public interface exposed to host applications via UniFFI.
//! It acts as the source of truth for shared types.

use chrono::{Local, NaiveDateTime, TimeZone};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::history::HistoryEvent;
use crate::models::{Clip, Metadata, Owner, Tag};
use crate::native::{CaptureSnapshot, FormatRecord};
use crate::owners::OwnerEvent;

// ═══════════════════════════════════════════════════════════════════════════════
// ENUMS
// ═══════════════════════════════════════════════════════════════════════════════

/// Clipboard formats kept in the history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, uniffi::Enum)]
pub enum ClipboardFormat {
    /// Unicode text, stored inline
    Text,
    /// Device independent bitmap, stored as a `.bmp` file
    Bitmap,
    Rtf,
    Html,
    Png,
    /// Dropped file list, stored inline as `|`-joined paths
    Files,
}

/// What happened to the history
#[derive(Debug, Clone, Copy, PartialEq, Eq, uniffi::Enum)]
pub enum HistoryEventKind {
    NewClipAdded,
    ClipMovedToTop,
    FavoriteChanged,
    ClipDeleted,
    AllClipsDeleted,
    LinkMetadataLoaded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, uniffi::Enum)]
pub enum OwnerEventKind {
    Registered,
    Unregistered,
    AllUnregistered,
}

// ═══════════════════════════════════════════════════════════════════════════════
// RECORDS (Structs)
// ═══════════════════════════════════════════════════════════════════════════════

/// One stored format of a clip
#[derive(Debug, Clone, PartialEq, Eq, uniffi::Record)]
pub struct DataSummary {
    pub id: i64,
    pub format: ClipboardFormat,
    /// Inline text, file list, or absolute payload path
    pub data: String,
    pub link_title: Option<String>,
    pub link_description: Option<String>,
    pub is_color: bool,
}

/// Clip as shown in a history list
#[derive(Debug, Clone, PartialEq, Eq, uniffi::Record)]
pub struct ClipSummary {
    pub id: i64,
    pub timestamp_unix_ms: i64,
    pub is_favorite: bool,
    pub is_link: bool,
    /// Executable path of the source application; empty when unknown
    pub owner_path: String,
    pub tag_ids: Vec<i64>,
    pub formats: Vec<DataSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, uniffi::Record)]
pub struct OwnerSummary {
    pub path: String,
    pub name: Option<String>,
    pub icon: Option<Vec<u8>>,
    pub clips_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, uniffi::Record)]
pub struct TagSummary {
    pub id: i64,
    pub name: String,
    pub color_hex: String,
    pub is_cleaning_enabled: bool,
    pub clips_count: u64,
}

/// One format of a clipboard change captured by the host
#[derive(Debug, Clone, PartialEq, Eq, uniffi::Record)]
pub struct CapturedFormat {
    pub format: ClipboardFormat,
    /// Raw clipboard bytes (UTF-16LE for text and file lists)
    pub data: Vec<u8>,
    /// Content digest; computed with SHA-256 when empty
    pub hash: Vec<u8>,
}

/// A clipboard change captured by the host
#[derive(Debug, Clone, PartialEq, Eq, uniffi::Record)]
pub struct CapturedClipboard {
    pub owner_path: Option<String>,
    pub owner_icon: Option<Vec<u8>>,
    pub formats: Vec<CapturedFormat>,
}

/// Error type for ClipStack operations
#[derive(Debug, Error, uniffi::Error)]
pub enum ClipStackError {
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("Transfer error: {0}")]
    TransferError(String),
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Clip {0} not found")]
    NotFound(i64),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Operation cancelled")]
    Cancelled,
    #[error("Clipboard monitor error: {0}")]
    MonitorError(String),
}

// ═══════════════════════════════════════════════════════════════════════════════
// CALLBACKS
// ═══════════════════════════════════════════════════════════════════════════════

/// Implemented by the host to follow history changes.
/// Called on the thread that performed the mutation, after the store lock is
/// released, so callbacks may call back into the store.
#[uniffi::export(with_foreign)]
pub trait ClipboardEventListener: Send + Sync {
    /// `clips` is the ordered list (newest first) once the operation that
    /// raised the event has finished.
    fn on_history_event(&self, kind: HistoryEventKind, clip: Option<ClipSummary>, clips: Vec<ClipSummary>);

    fn on_owner_event(&self, kind: OwnerEventKind, owner: Option<OwnerSummary>, path: Option<String>);
}

// ═══════════════════════════════════════════════════════════════════════════════
// SERVICE INTERFACE
// ═══════════════════════════════════════════════════════════════════════════════

/// The primary interface for accessing the clipboard history.
/// This matches the functionality exposed by the `ClipStackStore` object.
#[uniffi::export(with_foreign)]
#[async_trait::async_trait]
pub trait ClipHistoryApi: Send + Sync {
    // ─────────────────────────────────────────────────────────────────────────────
    // Read Operations
    // ─────────────────────────────────────────────────────────────────────────────

    /// All clips, newest first
    fn clips(&self) -> Vec<ClipSummary>;

    fn clip(&self, clip_id: i64) -> Option<ClipSummary>;

    /// Clips whose text or file list contains `query`. Empty query returns everything.
    async fn search(&self, query: String) -> Result<Vec<ClipSummary>, ClipStackError>;

    fn owners(&self) -> Vec<OwnerSummary>;

    fn tags(&self) -> Vec<TagSummary>;

    /// Get the database size in bytes
    fn database_size(&self) -> i64;

    // ─────────────────────────────────────────────────────────────────────────────
    // Write Operations
    // ─────────────────────────────────────────────────────────────────────────────

    /// Ingest a clipboard change captured by the host. Returns whether it was kept.
    fn ingest_capture(&self, capture: CapturedClipboard) -> Result<bool, ClipStackError>;

    /// Ingest everything the native monitor queued since the last call.
    /// Returns how many captures were kept.
    fn drain_captures(&self) -> Result<u64, ClipStackError>;

    /// Put a clip back on the system clipboard through the native monitor.
    /// False when no monitor runs or no format could be restored.
    fn set_clipboard_data(&self, clip_id: i64) -> Result<bool, ClipStackError>;

    /// Stop the native monitor. Captures already queued can still be drained.
    fn stop_monitor(&self);

    /// Store edited text as a new capture. Returns false for empty text.
    fn save_edited_text(&self, text: String) -> Result<bool, ClipStackError>;

    fn move_clip_to_top(&self, clip_id: i64) -> Result<(), ClipStackError>;

    fn toggle_favorite(&self, clip_id: i64) -> Result<(), ClipStackError>;

    /// Persist link previews fetched since the last call. Returns how many were applied.
    fn apply_pending_enrichments(&self) -> Result<u64, ClipStackError>;

    /// Copy one stored format of a clip to `dest`
    fn save_data_to_file(&self, clip_id: i64, format: ClipboardFormat, dest: String) -> Result<(), ClipStackError>;

    // ─────────────────────────────────────────────────────────────────────────────
    // Tags
    // ─────────────────────────────────────────────────────────────────────────────

    fn register_tag(&self, name: String, color_hex: String, is_cleaning_enabled: bool) -> Result<i64, ClipStackError>;

    fn unregister_tag(&self, tag_id: i64) -> Result<bool, ClipStackError>;

    fn update_tag(&self, tag_id: i64, name: String, color_hex: String, is_cleaning_enabled: bool) -> Result<bool, ClipStackError>;

    fn add_clip_to_tag(&self, clip_id: i64, tag_id: i64) -> Result<bool, ClipStackError>;

    fn remove_clip_from_tag(&self, clip_id: i64, tag_id: i64) -> Result<bool, ClipStackError>;

    // ─────────────────────────────────────────────────────────────────────────────
    // Delete Operations
    // ─────────────────────────────────────────────────────────────────────────────

    fn delete_clip(&self, clip_id: i64) -> Result<(), ClipStackError>;

    /// Remove every clip, owner and payload file. Tags survive.
    fn delete_all_clips(&self) -> Result<(), ClipStackError>;

    /// Apply the retention policy now. Returns the number of deleted clips.
    fn run_cleanup(&self) -> u64;

    // ─────────────────────────────────────────────────────────────────────────────
    // Transfer
    // ─────────────────────────────────────────────────────────────────────────────

    /// Export the given clips (all when `None`) to a zip archive. Returns false on failure.
    async fn export_clips(&self, clip_ids: Option<Vec<i64>>, dest: String) -> bool;

    /// Import an archive. Returns the number of clips added.
    async fn import_clips(&self, path: String) -> Result<u64, ClipStackError>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// CONVERSIONS
// ═══════════════════════════════════════════════════════════════════════════════

/// Local wall-clock time as unix milliseconds
pub fn unix_millis(time: NaiveDateTime) -> i64 {
    Local
        .from_local_datetime(&time)
        .earliest()
        .map(|dt| dt.timestamp_millis())
        .unwrap_or_else(|| time.and_utc().timestamp_millis())
}

impl From<&Clip> for ClipSummary {
    fn from(clip: &Clip) -> Self {
        let formats = clip
            .data
            .values()
            .map(|data| {
                let link = match &data.metadata {
                    Some(Metadata::Link(link)) => Some(link),
                    _ => None,
                };
                DataSummary {
                    id: data.id,
                    format: data.format,
                    data: data.data.clone(),
                    link_title: link.and_then(|l| l.title.clone()),
                    link_description: link.and_then(|l| l.description.clone()),
                    is_color: matches!(data.metadata, Some(Metadata::Color)),
                }
            })
            .collect();
        ClipSummary {
            id: clip.id,
            timestamp_unix_ms: unix_millis(clip.clip_time),
            is_favorite: clip.is_favorite,
            is_link: clip.is_link,
            owner_path: clip.owner.clone().unwrap_or_default(),
            tag_ids: clip.tags.iter().copied().collect(),
            formats,
        }
    }
}

impl From<&Owner> for OwnerSummary {
    fn from(owner: &Owner) -> Self {
        OwnerSummary {
            path: owner.path.clone(),
            name: owner.name.clone(),
            icon: owner.icon.clone(),
            clips_count: owner.clips_count,
        }
    }
}

impl From<&Tag> for TagSummary {
    fn from(tag: &Tag) -> Self {
        TagSummary {
            id: tag.id,
            name: tag.name.clone(),
            color_hex: tag.color_hex.clone(),
            is_cleaning_enabled: tag.is_cleaning_enabled,
            clips_count: tag.clips.len() as u64,
        }
    }
}

impl From<&HistoryEvent> for HistoryEventKind {
    fn from(event: &HistoryEvent) -> Self {
        match event {
            HistoryEvent::NewClipAdded(_) => HistoryEventKind::NewClipAdded,
            HistoryEvent::ClipMovedToTop(_) => HistoryEventKind::ClipMovedToTop,
            HistoryEvent::FavoriteChanged(_) => HistoryEventKind::FavoriteChanged,
            HistoryEvent::ClipDeleted(_) => HistoryEventKind::ClipDeleted,
            HistoryEvent::AllClipsDeleted => HistoryEventKind::AllClipsDeleted,
            HistoryEvent::LinkMetadataLoaded(_) => HistoryEventKind::LinkMetadataLoaded,
        }
    }
}

impl From<CapturedClipboard> for CaptureSnapshot {
    fn from(capture: CapturedClipboard) -> Self {
        let records = capture
            .formats
            .into_iter()
            .map(|f| {
                let hash = if f.hash.is_empty() {
                    Sha256::digest(&f.data).to_vec()
                } else {
                    f.hash
                };
                FormatRecord::new(f.format, f.data, hash)
            })
            .collect();
        CaptureSnapshot {
            owner_path: capture.owner_path,
            owner_icon: capture.owner_icon,
            records,
        }
    }
}

/// A history or owner change converted for host listeners
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum HostEvent {
    History {
        kind: HistoryEventKind,
        clip: Option<ClipSummary>,
    },
    Owner {
        kind: OwnerEventKind,
        owner: Option<OwnerSummary>,
        path: Option<String>,
    },
}

impl HostEvent {
    pub(crate) fn is_history(&self) -> bool {
        matches!(self, HostEvent::History { .. })
    }

    pub(crate) fn deliver(&self, listener: &dyn ClipboardEventListener, clips: &[ClipSummary]) {
        match self {
            HostEvent::History { kind, clip } => {
                listener.on_history_event(*kind, clip.clone(), clips.to_vec())
            }
            HostEvent::Owner { kind, owner, path } => {
                listener.on_owner_event(*kind, owner.clone(), path.clone())
            }
        }
    }
}

impl From<&HistoryEvent> for HostEvent {
    fn from(event: &HistoryEvent) -> Self {
        HostEvent::History {
            kind: event.into(),
            clip: event.clip().map(ClipSummary::from),
        }
    }
}

impl From<&OwnerEvent> for HostEvent {
    fn from(event: &OwnerEvent) -> Self {
        match event {
            OwnerEvent::Registered(owner) => HostEvent::Owner {
                kind: OwnerEventKind::Registered,
                owner: Some(owner.into()),
                path: Some(owner.path.clone()),
            },
            OwnerEvent::Unregistered(path) => HostEvent::Owner {
                kind: OwnerEventKind::Unregistered,
                owner: None,
                path: Some(path.clone()),
            },
            OwnerEvent::AllUnregistered => HostEvent::Owner {
                kind: OwnerEventKind::AllUnregistered,
                owner: None,
                path: None,
            },
        }
    }
}

impl From<crate::database::DatabaseError> for ClipStackError {
    fn from(e: crate::database::DatabaseError) -> Self {
        ClipStackError::DatabaseError(e.to_string())
    }
}

impl From<crate::transfer::TransferError> for ClipStackError {
    fn from(e: crate::transfer::TransferError) -> Self {
        ClipStackError::TransferError(e.to_string())
    }
}

impl From<crate::config::ConfigError> for ClipStackError {
    fn from(e: crate::config::ConfigError) -> Self {
        ClipStackError::ConfigError(e.to_string())
    }
}

impl From<crate::native::NativeError> for ClipStackError {
    fn from(e: crate::native::NativeError) -> Self {
        ClipStackError::MonitorError(e.to_string())
    }
}

impl From<crate::codec::CodecError> for ClipStackError {
    fn from(e: crate::codec::CodecError) -> Self {
        ClipStackError::InvalidInput(e.to_string())
    }
}
