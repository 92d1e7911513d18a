//! Export a history to an archive and import it into an empty one.

use std::collections::BTreeSet;
use std::path::Path;

use chrono::{NaiveDate, NaiveDateTime};
use clipstack::codec::encode_utf16;
use clipstack::config::HistoryConfig;
use clipstack::history::ClipboardHistory;
use clipstack::migrations::AbortOperator;
use clipstack::native::{CaptureSnapshot, FormatRecord};
use clipstack::owners::FileStemResolver;
use clipstack::transfer::{self, TransferError};
use clipstack::ClipboardFormat;
use sha2::{Digest, Sha256};
use tempfile::TempDir;

fn open(dir: &Path) -> ClipboardHistory {
    let mut config = HistoryConfig::with_root(dir);
    config.link_preview_enabled = false;
    ClipboardHistory::open(config, Box::new(AbortOperator), Box::new(FileStemResolver)).unwrap()
}

fn at(minute: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 2, 1)
        .unwrap()
        .and_hms_opt(12, minute, 0)
        .unwrap()
}

fn record(format: ClipboardFormat, bytes: Vec<u8>) -> FormatRecord {
    let hash = Sha256::digest(&bytes).to_vec();
    FormatRecord::new(format, bytes, hash)
}

fn capture(owner: &str, records: Vec<FormatRecord>) -> CaptureSnapshot {
    CaptureSnapshot {
        owner_path: Some(owner.to_string()),
        owner_icon: Some(vec![1, 2, 3]),
        records,
    }
}

/// (format, hash) pairs of every Text and Png data row
fn content_hashes(history: &ClipboardHistory) -> BTreeSet<(ClipboardFormat, Vec<u8>)> {
    history
        .clips()
        .iter()
        .flat_map(|clip| clip.data.values())
        .filter(|data| matches!(data.format, ClipboardFormat::Text | ClipboardFormat::Png))
        .map(|data| (data.format, data.hash.clone()))
        .collect()
}

fn populated(dir: &Path) -> ClipboardHistory {
    let mut history = open(dir);
    history
        .ingest(
            capture("/usr/bin/editor", vec![record(ClipboardFormat::Text, encode_utf16("notes"))]),
            at(0),
        )
        .unwrap();
    history
        .ingest(
            capture(
                "/usr/bin/browser",
                vec![
                    record(ClipboardFormat::Text, encode_utf16("<b>bold</b>")),
                    record(ClipboardFormat::Html, b"<b>bold</b>".to_vec()),
                ],
            ),
            at(1),
        )
        .unwrap();
    history
        .ingest(
            capture("/usr/bin/viewer", vec![record(ClipboardFormat::Png, b"\x89PNG fake".to_vec())]),
            at(2),
        )
        .unwrap();

    let tag = history.register_tag("work", "#336699", true).unwrap();
    let pinned = history.register_tag("pinned", "#FF0000", false).unwrap();
    history.register_tag("unused", "#000000", true).unwrap();
    let ids: Vec<i64> = history.clips().iter().map(|c| c.id).collect();
    history.add_clip_to_tag(ids[0], tag).unwrap();
    history.add_clip_to_tag(ids[1], tag).unwrap();
    history.add_clip_to_tag(ids[2], pinned).unwrap();
    history
}

#[test]
fn export_then_import_into_empty_history() {
    let source_dir = TempDir::new().unwrap();
    let target_dir = TempDir::new().unwrap();
    let archive = source_dir.path().join("backup.zip");

    let source = populated(source_dir.path());
    let exported = transfer::export_archive(&source.export_plan(None), &archive).unwrap();
    assert_eq!(exported, 3);

    let mut target = open(target_dir.path());
    let bundle = transfer::read_archive(&archive, target_dir.path()).unwrap();
    assert_eq!(target.apply_import(bundle).unwrap(), 3);

    assert_eq!(target.clips().len(), source.clips().len());
    assert_eq!(content_hashes(&target), content_hashes(&source));

    let tag_names: BTreeSet<String> = target.tags().tags().map(|t| t.name.clone()).collect();
    assert_eq!(tag_names, ["pinned", "work"].into_iter().map(String::from).collect());

    let times: Vec<_> = target.clips().iter().map(|c| c.clip_time).collect();
    assert_eq!(times, vec![at(2), at(1), at(0)]);

    let viewer = target.owners().get("/usr/bin/viewer").unwrap();
    assert_eq!(viewer.clips_count, 1);
    assert_eq!(viewer.icon.as_deref(), Some(&[1u8, 2, 3][..]));

    // Payloads point into the target root and exist there.
    for clip in target.clips() {
        for path in clip.payload_files() {
            assert!(path.starts_with(target_dir.path().to_str().unwrap()));
            assert!(Path::new(path).exists(), "missing payload {path}");
        }
    }
}

#[test]
fn importing_twice_adds_nothing_the_second_time() {
    let source_dir = TempDir::new().unwrap();
    let target_dir = TempDir::new().unwrap();
    let archive = source_dir.path().join("backup.zip");
    let source = populated(source_dir.path());
    transfer::export_archive(&source.export_plan(None), &archive).unwrap();

    let mut target = open(target_dir.path());
    let first = transfer::read_archive(&archive, target_dir.path()).unwrap();
    target.apply_import(first).unwrap();
    let tags_before = target.tags().tags().count();

    let second = transfer::read_archive(&archive, target_dir.path()).unwrap();
    assert_eq!(target.apply_import(second).unwrap(), 0);
    assert_eq!(target.clips().len(), 3);
    assert_eq!(target.tags().tags().count(), tags_before);
}

#[test]
fn selected_export_only_carries_referenced_rows() {
    let source_dir = TempDir::new().unwrap();
    let target_dir = TempDir::new().unwrap();
    let archive = source_dir.path().join("one.zip");
    let source = populated(source_dir.path());

    let newest = source.clips()[0].id;
    let plan = source.export_plan(Some(&[newest]));
    assert_eq!(plan.owners.len(), 1);
    assert_eq!(plan.tags.len(), 1);
    transfer::export_archive(&plan, &archive).unwrap();

    let bundle = transfer::read_archive(&archive, target_dir.path()).unwrap();
    assert_eq!(bundle.clips.len(), 1);
    assert_eq!(bundle.owners.len(), 1);
    assert_eq!(bundle.tags.len(), 1);
    assert_eq!(bundle.tags[0].name, "work");
}

#[test]
fn unreadable_archive_is_an_error() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("garbage.zip");
    std::fs::write(&path, b"not a zip").unwrap();
    assert!(matches!(
        transfer::read_archive(&path, dir.path()),
        Err(TransferError::Zip(_))
    ));
}

#[test]
fn mapped_tags_left_without_clips_are_removed() {
    let source_dir = TempDir::new().unwrap();
    let target_dir = TempDir::new().unwrap();
    let archive = source_dir.path().join("newest.zip");
    let source = populated(source_dir.path());
    let newest = source.clips()[0].id;
    transfer::export_archive(&source.export_plan(Some(&[newest])), &archive).unwrap();

    // The target already has a clip at the same time, so the archived one is skipped.
    let mut target = open(target_dir.path());
    target
        .ingest(
            capture("/usr/bin/other", vec![record(ClipboardFormat::Text, encode_utf16("already here"))]),
            at(2),
        )
        .unwrap();
    target.register_tag("work", "#336699", true).unwrap();
    target.register_tag("idle", "#FFFFFF", true).unwrap();

    let bundle = transfer::read_archive(&archive, target_dir.path()).unwrap();
    assert_eq!(target.apply_import(bundle).unwrap(), 0);

    let tag_names: BTreeSet<String> = target.tags().tags().map(|t| t.name.clone()).collect();
    assert_eq!(tag_names, ["idle"].into_iter().map(String::from).collect());
}
