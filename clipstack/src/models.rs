//! Core data models for the clipboard history
//!
//! `Clip` is the unit of history; each clip carries at most one `DataModel`
//! per `ClipboardFormat`. Owners and tags are referenced by key and kept in
//! their registries.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{Local, NaiveDateTime, SubsecRound};

use crate::interface::ClipboardFormat;

/// Id of the synthetic owner used for captures without a source application.
pub const UNKNOWN_OWNER_ID: i64 = 0;

/// Owner key (executable path) of the unknown owner.
pub const UNKNOWN_OWNER_PATH: &str = "";

/// Storage format for clip timestamps. Microsecond precision, lexicographically sortable.
pub const DB_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// Formats compared by the content-equality rule, in priority order.
pub const EQUALITY_FORMATS: [ClipboardFormat; 3] = [
    ClipboardFormat::Text,
    ClipboardFormat::Bitmap,
    ClipboardFormat::Png,
];

/// Current local wall-clock time, truncated so it survives a store round trip unchanged.
pub fn now_local() -> NaiveDateTime {
    Local::now().naive_local().trunc_subsecs(6)
}

pub fn format_db_time(time: &NaiveDateTime) -> String {
    time.format(DB_TIME_FORMAT).to_string()
}

/// Parse a timestamp read from the store
pub fn parse_db_time(value: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f"))
        .ok()
}

// ─────────────────────────────────────────────────────────────────────────────
// FORMAT TABLE
// ─────────────────────────────────────────────────────────────────────────────

impl ClipboardFormat {
    pub const ALL: [ClipboardFormat; 6] = [
        ClipboardFormat::Text,
        ClipboardFormat::Bitmap,
        ClipboardFormat::Rtf,
        ClipboardFormat::Html,
        ClipboardFormat::Png,
        ClipboardFormat::Files,
    ];

    /// Identifier used on the native capture boundary
    pub fn native_id(self) -> u32 {
        match self {
            ClipboardFormat::Text => 1,
            ClipboardFormat::Bitmap => 2,
            ClipboardFormat::Rtf => 3,
            ClipboardFormat::Html => 4,
            ClipboardFormat::Png => 5,
            ClipboardFormat::Files => 6,
        }
    }

    pub fn from_native_id(id: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|format| format.native_id() == id)
    }

    /// Name persisted in the `Data.Format` column
    pub fn store_name(self) -> &'static str {
        match self {
            ClipboardFormat::Text => "CF_UNICODETEXT",
            ClipboardFormat::Bitmap => "CF_BITMAP",
            ClipboardFormat::Rtf => "Rich Text Format",
            ClipboardFormat::Html => "HTML Format",
            ClipboardFormat::Png => "PNG",
            ClipboardFormat::Files => "CF_HDROP",
        }
    }

    pub fn from_store_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|format| format.store_name() == name)
    }

    /// Payload folder under the history root. `None` for inline formats.
    pub fn folder(self) -> Option<&'static str> {
        match self {
            ClipboardFormat::Rtf => Some("RtfFormat"),
            ClipboardFormat::Html => Some("HtmlFormat"),
            ClipboardFormat::Png => Some("PngFormat"),
            ClipboardFormat::Bitmap => Some("BitmapFormat"),
            ClipboardFormat::Text | ClipboardFormat::Files => None,
        }
    }

    pub fn extension(self) -> Option<&'static str> {
        match self {
            ClipboardFormat::Rtf => Some("rtf"),
            ClipboardFormat::Html => Some("html"),
            ClipboardFormat::Png => Some("png"),
            ClipboardFormat::Bitmap => Some("bmp"),
            ClipboardFormat::Text | ClipboardFormat::Files => None,
        }
    }

    pub fn is_file_backed(self) -> bool {
        self.folder().is_some()
    }

    pub fn from_folder(folder: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|format| format.folder() == Some(folder))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// METADATA
// ─────────────────────────────────────────────────────────────────────────────

/// Open Graph details fetched for a link clip
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkMetadata {
    pub url: String,
    pub title: Option<String>,
    pub description: Option<String>,
    /// Absolute URL of the preview image
    pub image: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FilesMetadata {
    pub files_count: u32,
    pub folders_count: u32,
    pub paths: Vec<String>,
}

/// Enrichment attached to a single `DataModel`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Metadata {
    Link(LinkMetadata),
    Files(FilesMetadata),
    Color,
}

impl Metadata {
    /// Value of the `Data.MetadataFormat` column
    pub fn kind(&self) -> &'static str {
        match self {
            Metadata::Link(_) => "Link",
            Metadata::Files(_) => "Files",
            Metadata::Color => "Color",
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// CLIP
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataModel {
    pub id: i64,
    pub format: ClipboardFormat,
    /// Inline text for Text and Files, absolute payload path otherwise
    pub data: String,
    pub hash: Vec<u8>,
    pub metadata: Option<Metadata>,
}

impl DataModel {
    pub fn new(format: ClipboardFormat, data: String, hash: Vec<u8>) -> Self {
        Self {
            id: 0,
            format,
            data,
            hash,
            metadata: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Clip {
    pub id: i64,
    pub clip_time: NaiveDateTime,
    pub is_favorite: bool,
    /// Owner key; `Some("")` is the unknown owner, `None` means no registration is held
    pub owner: Option<String>,
    pub data: BTreeMap<ClipboardFormat, DataModel>,
    pub tags: BTreeSet<i64>,
    pub is_link: bool,
}

impl Clip {
    pub fn new(clip_time: NaiveDateTime) -> Self {
        Self {
            id: 0,
            clip_time,
            is_favorite: false,
            owner: None,
            data: BTreeMap::new(),
            tags: BTreeSet::new(),
            is_link: false,
        }
    }

    pub fn text(&self) -> Option<&str> {
        self.data
            .get(&ClipboardFormat::Text)
            .map(|data| data.data.as_str())
    }

    /// Non-empty hash stored for `format`
    pub fn hash_for(&self, format: ClipboardFormat) -> Option<&[u8]> {
        self.data
            .get(&format)
            .map(|data| data.hash.as_slice())
            .filter(|hash| !hash.is_empty())
    }

    /// Content equality: first format among Text, Bitmap, Png where both
    /// sides carry a matching non-empty hash.
    pub fn is_same_content(&self, other: &Clip) -> bool {
        EQUALITY_FORMATS.iter().any(|format| {
            matches!(
                (self.hash_for(*format), other.hash_for(*format)),
                (Some(a), Some(b)) if a == b
            )
        })
    }

    /// Text searched by substring queries
    pub fn searchable_text(&self) -> Option<&str> {
        self.data
            .get(&ClipboardFormat::Text)
            .or_else(|| self.data.get(&ClipboardFormat::Files))
            .map(|data| data.data.as_str())
    }

    /// Paths of payload files owned by this clip
    pub fn payload_files(&self) -> impl Iterator<Item = &str> {
        self.data
            .values()
            .filter(|data| data.format.is_file_backed())
            .map(|data| data.data.as_str())
    }
}

/// Index of the first clip holding the same content as `candidate`.
/// Linear from the front: re-copied content is almost always near the top.
pub fn find_duplicate(clips: &[Clip], candidate: &Clip) -> Option<usize> {
    clips.iter().position(|clip| clip.is_same_content(candidate))
}

// ─────────────────────────────────────────────────────────────────────────────
// OWNER / TAG
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Owner {
    pub id: i64,
    pub path: String,
    pub name: Option<String>,
    pub icon: Option<Vec<u8>>,
    pub clips_count: u32,
}

impl Owner {
    pub fn new(path: String, name: Option<String>, icon: Option<Vec<u8>>) -> Self {
        Self {
            id: 0,
            path,
            name,
            icon,
            clips_count: 0,
        }
    }

    pub fn unknown() -> Self {
        Self::new(UNKNOWN_OWNER_PATH.to_string(), None, None)
    }

    pub fn is_unknown(&self) -> bool {
        self.path.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub id: i64,
    pub name: String,
    pub color_hex: String,
    pub is_cleaning_enabled: bool,
    /// Ids of clips carrying this tag
    pub clips: BTreeSet<i64>,
}

impl Tag {
    pub fn new(name: String, color_hex: String, is_cleaning_enabled: bool) -> Self {
        Self {
            id: 0,
            name,
            color_hex,
            is_cleaning_enabled,
            clips: BTreeSet::new(),
        }
    }
}
