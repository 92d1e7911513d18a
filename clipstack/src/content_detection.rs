//! Content detection for captured clips
//!
//! Marks link clips, color clips and summarises file-list payloads.

use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::codec::FILES_SEPARATOR;
use crate::models::FilesMetadata;

/// #RGB, #RGBA, #RRGGBB or #RRGGBBAA
static HEX_COLOR_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^#?([a-fA-F0-9]{8}|[a-fA-F0-9]{6}|[a-fA-F0-9]{4}|[a-fA-F0-9]{3})$").unwrap()
});

/// Absolute http(s) URL
pub fn is_link(text: &str) -> bool {
    let trimmed = text.trim();
    if trimmed.is_empty() || trimmed.contains(char::is_whitespace) {
        return false;
    }
    url::Url::parse(trimmed)
        .map(|url| matches!(url.scheme(), "http" | "https") && url.has_host())
        .unwrap_or(false)
}

pub fn is_hex_color(text: &str, prefix_required: bool) -> bool {
    let trimmed = text.trim();
    if prefix_required && !trimmed.starts_with('#') {
        return false;
    }
    HEX_COLOR_REGEX.is_match(trimmed)
}

/// Count files and folders of a `|`-separated path list. Missing paths count as files.
pub fn files_metadata(data: &str) -> FilesMetadata {
    let paths: Vec<String> = data
        .split(FILES_SEPARATOR)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect();
    let folders_count = paths.iter().filter(|p| Path::new(p).is_dir()).count() as u32;
    FilesMetadata {
        files_count: paths.len() as u32 - folders_count,
        folders_count,
        paths,
    }
}
