//! End-to-end behavior of the history engine: dedup, ordering, owner
//! reference counts, payload file lifetime, capture filters and retention.

use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use chrono::{Duration, NaiveDate, NaiveDateTime};
use clipstack::cleanup::{CleanupTimeSpan, RetentionPolicy};
use clipstack::codec::encode_utf16;
use clipstack::config::{HistoryConfig, OwnerFilter};
use clipstack::history::ClipboardHistory;
use clipstack::migrations::AbortOperator;
use clipstack::native::{
    CaptureCallback, CaptureSnapshot, FormatRecord, MonitorBindings, RawCapture, RawFormatEntry,
    RawOutgoingEntry, CAPTURE_ABI_VERSION, HASH_LEN,
};
use clipstack::owners::FileStemResolver;
use clipstack::{ClipHistoryApi, ClipStackError, ClipStackStore, ClipboardFormat};
use sha2::{Digest, Sha256};
use tempfile::TempDir;

fn open_with(config: HistoryConfig) -> ClipboardHistory {
    ClipboardHistory::open(config, Box::new(AbortOperator), Box::new(FileStemResolver)).unwrap()
}

fn open(dir: &Path) -> ClipboardHistory {
    let mut config = HistoryConfig::with_root(dir);
    config.link_preview_enabled = false;
    open_with(config)
}

fn time(day: u32, hour: u32, minute: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 1, day)
        .unwrap()
        .and_hms_opt(hour, minute, 0)
        .unwrap()
}

fn text(value: &str, owner: Option<&str>) -> CaptureSnapshot {
    let bytes = encode_utf16(value);
    CaptureSnapshot {
        owner_path: owner.map(str::to_string),
        owner_icon: None,
        records: vec![FormatRecord::new(
            ClipboardFormat::Text,
            bytes.clone(),
            Sha256::digest(&bytes).to_vec(),
        )],
    }
}

fn png(bytes: &[u8]) -> CaptureSnapshot {
    CaptureSnapshot {
        owner_path: None,
        owner_icon: None,
        records: vec![FormatRecord::new(
            ClipboardFormat::Png,
            bytes.to_vec(),
            Sha256::digest(bytes).to_vec(),
        )],
    }
}

fn texts(history: &ClipboardHistory) -> Vec<String> {
    history
        .clips()
        .iter()
        .map(|c| c.text().unwrap_or_default().to_string())
        .collect()
}

fn assert_sorted(history: &ClipboardHistory) {
    let times: Vec<_> = history.clips().iter().map(|c| c.clip_time).collect();
    assert!(times.windows(2).all(|w| w[0] >= w[1]), "not newest first: {times:?}");
}

#[test]
fn hello_world_then_hello_again() {
    let dir = TempDir::new().unwrap();
    let mut history = open(dir.path());

    history.ingest(text("hello", None), time(1, 9, 0)).unwrap();
    let a = history.clips()[0].id;
    history.ingest(text("world", None), time(1, 9, 1)).unwrap();
    assert_eq!(texts(&history), vec!["world", "hello"]);

    history.ingest(text("hello", None), time(1, 9, 2)).unwrap();
    assert_eq!(texts(&history), vec!["hello", "world"]);
    assert_eq!(history.clips()[0].id, a);
    assert_eq!(history.clips()[0].clip_time, time(1, 9, 2));
    assert_sorted(&history);
}

#[test]
fn dedup_is_idempotent_and_persisted() {
    let dir = TempDir::new().unwrap();
    let mut history = open(dir.path());
    for i in 0..5 {
        history.ingest(text("same", None), time(1, 10, i)).unwrap();
    }
    assert_eq!(history.clips().len(), 1);
    assert_eq!(history.clips()[0].clip_time, time(1, 10, 4));
    drop(history);

    let reopened = open(dir.path());
    assert_eq!(reopened.clips().len(), 1);
    assert_eq!(reopened.clips()[0].clip_time, time(1, 10, 4));
}

#[test]
fn owner_refcount_follows_clips() {
    let dir = TempDir::new().unwrap();
    let mut history = open(dir.path());
    for (i, value) in ["a", "b", "c"].iter().enumerate() {
        history
            .ingest(text(value, Some(r"C:\Apps\app.exe")), time(2, 8, i as u32))
            .unwrap();
    }
    let key = r"C:\Apps\app.exe";
    assert_eq!(history.owners().get(key).unwrap().clips_count, 3);
    assert_eq!(history.owners().get(key).unwrap().name.as_deref(), Some("app"));

    let ids: Vec<i64> = history.clips().iter().map(|c| c.id).collect();
    history.delete_clip(ids[0]).unwrap();
    history.delete_clip(ids[1]).unwrap();
    assert_eq!(history.owners().get(key).unwrap().clips_count, 1);

    history.delete_clip(ids[2]).unwrap();
    assert!(history.owners().get(key).is_none());
    assert_eq!(history.database().find_owner_id(key).unwrap(), None);
    assert!(history.owners().get("").is_some(), "unknown owner is never removed");
}

#[test]
fn merge_moves_owner_reference_to_the_new_source() {
    let dir = TempDir::new().unwrap();
    let mut history = open(dir.path());
    history.ingest(text("shared", Some("/bin/first")), time(3, 8, 0)).unwrap();
    history.ingest(text("shared", Some("/bin/second")), time(3, 8, 1)).unwrap();

    assert_eq!(history.clips().len(), 1);
    assert_eq!(history.clips()[0].owner.as_deref(), Some("/bin/second"));
    assert!(history.owners().get("/bin/first").is_none());
    assert_eq!(history.owners().get("/bin/second").unwrap().clips_count, 1);

    // Same owner again: the count must not grow.
    history.ingest(text("shared", Some("/bin/second")), time(3, 8, 2)).unwrap();
    assert_eq!(history.owners().get("/bin/second").unwrap().clips_count, 1);
}

#[test]
fn payload_files_live_and_die_with_clips() {
    let dir = TempDir::new().unwrap();
    let mut history = open(dir.path());
    history.ingest(png(b"first image"), time(4, 8, 0)).unwrap();
    history.ingest(png(b"second image"), time(4, 8, 1)).unwrap();

    let first = history.clips()[1].clone();
    let first_file = first.data[&ClipboardFormat::Png].data.clone();
    assert!(Path::new(&first_file).exists());

    history.delete_clip(first.id).unwrap();
    assert!(!Path::new(&first_file).exists());

    // A duplicate capture does not leave a second file behind.
    history.ingest(png(b"second image"), time(4, 8, 2)).unwrap();
    let folder = dir.path().join(ClipboardFormat::Png.folder().unwrap());
    assert_eq!(std::fs::read_dir(&folder).unwrap().count(), 1);

    history.delete_all_clips().unwrap();
    assert!(!folder.exists());
    assert!(history.clips().is_empty());
    assert_eq!(history.database().count_clips().unwrap(), 0);
}

#[test]
fn filtered_owner_is_dropped_and_counted() {
    let dir = TempDir::new().unwrap();
    let mut config = HistoryConfig::with_root(dir.path());
    config.link_preview_enabled = false;
    config.owner_filters = vec![OwnerFilter::new("password manager", "*/keepass*")];
    let mut history = open_with(config);

    assert!(!history
        .ingest(text("secret", Some("/opt/KeePassXC/keepassxc")), time(5, 8, 0))
        .unwrap());
    assert!(history
        .ingest(text("public", Some("/usr/bin/gedit")), time(5, 8, 1))
        .unwrap());

    assert_eq!(texts(&history), vec!["public"]);
    assert_eq!(history.owner_filters()[0].filtered_count, 1);
    assert!(history.owners().get("/opt/KeePassXC/keepassxc").is_none());
}

#[test]
fn day_retention_uses_timestamp_verbatim() {
    let dir = TempDir::new().unwrap();
    let mut config = HistoryConfig::with_root(dir.path());
    config.link_preview_enabled = false;
    config.retention = RetentionPolicy::Period {
        span: CleanupTimeSpan::Day,
    };
    let mut history = open_with(config);

    history.ingest(text("stale", None), time(14, 14, 0)).unwrap();
    history.ingest(text("fresh", None), time(14, 15, 0)).unwrap();
    let favorite = {
        history.ingest(text("starred", None), time(10, 8, 0)).unwrap();
        history.clips()[0].id
    };
    history.toggle_favorite(favorite).unwrap();

    // Cutoff 2024-01-14 14:30.
    let deleted = history.run_cleanup(time(15, 14, 30));
    assert_eq!(deleted, 1);
    let mut remaining = texts(&history);
    remaining.sort();
    assert_eq!(remaining, vec!["fresh", "starred"]);

    // A second sweep within the same day does nothing.
    assert_eq!(history.run_cleanup(time(15, 20, 0)), 0);
    // Next day, cutoff 2024-01-15 15:00.
    assert_eq!(history.run_cleanup(time(16, 15, 0)), 1);
    assert_eq!(texts(&history), vec!["starred"]);
}

#[test]
fn quantity_retention_spares_favorites() {
    let dir = TempDir::new().unwrap();
    let mut config = HistoryConfig::with_root(dir.path());
    config.link_preview_enabled = false;
    config.retention = RetentionPolicy::Quantity { max_clips: 2 };
    let mut history = open_with(config);

    history.ingest(text("keep me", None), time(6, 8, 0)).unwrap();
    let keep = history.clips()[0].id;
    history.toggle_favorite(keep).unwrap();
    for (i, value) in ["one", "two", "three", "four"].iter().enumerate() {
        history.ingest(text(value, None), time(6, 9, i as u32)).unwrap();
    }

    assert_eq!(texts(&history), vec!["four", "three", "keep me"]);
    drop(history);
    let mut config = HistoryConfig::with_root(dir.path());
    config.link_preview_enabled = false;
    assert_eq!(open_with(config).clips().len(), 3);
}

#[test]
fn move_to_top_keeps_order_invariant() {
    let dir = TempDir::new().unwrap();
    let mut history = open(dir.path());
    let base = time(7, 8, 0);
    for i in 0..4 {
        history
            .ingest(text(&format!("item {i}"), None), base + Duration::minutes(i))
            .unwrap();
    }
    let oldest = history.clips()[3].id;
    history.move_clip_to_top(oldest).unwrap();
    assert_eq!(history.clips()[0].id, oldest);
    assert_sorted(&history);
}

/// Make every statement of `kind` (INSERT, UPDATE, DELETE) on clips fail
fn fail_clip_writes(history: &ClipboardHistory, kind: &str) {
    let conn = rusqlite::Connection::open(history.database().path()).unwrap();
    conn.execute_batch(&format!(
        "CREATE TRIGGER fail_{kind} BEFORE {kind} ON Clips BEGIN SELECT RAISE(ABORT, 'write refused'); END;"
    ))
    .unwrap();
}

fn allow_clip_writes(history: &ClipboardHistory) {
    let conn = rusqlite::Connection::open(history.database().path()).unwrap();
    conn.execute_batch(
        "DROP TRIGGER IF EXISTS fail_INSERT; DROP TRIGGER IF EXISTS fail_UPDATE; DROP TRIGGER IF EXISTS fail_DELETE;",
    )
    .unwrap();
}

#[test]
fn failed_writes_leave_list_and_owners_untouched() {
    let dir = TempDir::new().unwrap();
    let mut history = open(dir.path());
    history.ingest(text("a", Some("/bin/first")), time(8, 8, 0)).unwrap();
    history.ingest(text("b", Some("/bin/second")), time(8, 8, 1)).unwrap();
    let a = history.clips()[1].id;
    let b = history.clips()[0].id;

    fail_clip_writes(&history, "UPDATE");
    assert!(history.ingest(text("a", Some("/bin/third")), time(8, 8, 2)).is_err());
    assert!(history.toggle_favorite(a).is_err());
    assert!(history.move_clip_to_top(a).is_err());
    assert_eq!(texts(&history), vec!["b", "a"]);
    assert_eq!(history.clip(a).unwrap().clip_time, time(8, 8, 0));
    assert!(!history.clip(a).unwrap().is_favorite);
    assert!(history.owners().get("/bin/third").is_none());
    assert_eq!(history.database().find_owner_id("/bin/third").unwrap(), None);
    assert_eq!(history.owners().get("/bin/first").unwrap().clips_count, 1);

    fail_clip_writes(&history, "INSERT");
    assert!(history.ingest(text("c", Some("/bin/fourth")), time(8, 8, 3)).is_err());
    assert_eq!(history.clips().len(), 2);
    assert!(history.owners().get("/bin/fourth").is_none());

    fail_clip_writes(&history, "DELETE");
    assert!(history.delete_clip(b).is_err());
    assert!(history.delete_all_clips().is_err());
    assert_eq!(texts(&history), vec!["b", "a"]);
    assert_eq!(history.owners().get("/bin/second").unwrap().clips_count, 1);

    allow_clip_writes(&history);
    assert_eq!(history.database().count_clips().unwrap(), 2);
    history.ingest(text("a", Some("/bin/third")), time(8, 8, 4)).unwrap();
    assert_eq!(texts(&history), vec!["a", "b"]);
    assert!(history.owners().get("/bin/first").is_none());
    assert_eq!(history.owners().get("/bin/third").unwrap().clips_count, 1);
}

#[test]
fn filter_counters_are_written_back_to_settings() {
    let dir = TempDir::new().unwrap();
    let settings = dir.path().join("clipstack.toml");
    let mut config = HistoryConfig::with_root(dir.path().join("History"));
    config.link_preview_enabled = false;
    config.owner_filters = vec![OwnerFilter::new("vault", "*/vault")];
    config.save(&settings).unwrap();

    let mut history = open_with(HistoryConfig::load(&settings).unwrap());
    history.set_settings_path(&settings);
    history.ingest(text("secret", Some("/opt/vault")), time(9, 8, 0)).unwrap();
    history.ingest(text("secret", Some("/opt/vault")), time(9, 8, 1)).unwrap();

    let saved = HistoryConfig::load(&settings).unwrap();
    assert_eq!(saved.owner_filters[0].filtered_count, 2);
    assert_eq!(history.config().owner_filters[0].filtered_count, 2);
}

static MONITOR_STOPS: AtomicUsize = AtomicUsize::new(0);
static RESTORED_FORMAT: AtomicU32 = AtomicU32::new(0);
static RESTORED_ENTRIES: AtomicUsize = AtomicUsize::new(0);

extern "C" fn monitor_start(_window: isize, callback: CaptureCallback) -> bool {
    let bytes = encode_utf16("copied elsewhere");
    let hash = [9u8; HASH_LEN];
    let entries = [RawFormatEntry {
        format: ClipboardFormat::Text.native_id(),
        data: bytes.as_ptr(),
        size: bytes.len() as u64,
        hash: hash.as_ptr(),
    }];
    let owner: Vec<u16> = "/usr/bin/terminal".encode_utf16().chain(std::iter::once(0)).collect();
    let raw = RawCapture {
        abi_version: CAPTURE_ABI_VERSION,
        format_count: 1,
        formats: entries.as_ptr(),
        owner_path: owner.as_ptr(),
        owner_icon: std::ptr::null(),
        owner_icon_len: 0,
    };
    callback(&raw)
}

extern "C" fn monitor_stop(_window: isize) -> bool {
    MONITOR_STOPS.fetch_add(1, Ordering::SeqCst);
    true
}

extern "C" fn monitor_set_data(entries: *const RawOutgoingEntry, count: u32) -> bool {
    let entries = unsafe { std::slice::from_raw_parts(entries, count as usize) };
    RESTORED_ENTRIES.store(entries.len(), Ordering::SeqCst);
    RESTORED_FORMAT.store(entries[0].format, Ordering::SeqCst);
    true
}

#[test]
fn native_captures_reach_the_store_and_clips_go_back() {
    let dir = TempDir::new().unwrap();
    let store = ClipStackStore::new(dir.path().to_string_lossy().into_owned(), None).unwrap();
    assert!(matches!(
        store.set_clipboard_data(i64::MAX),
        Err(ClipStackError::NotFound(_))
    ));

    store
        .start_monitor(
            MonitorBindings {
                start: monitor_start,
                stop: monitor_stop,
                set_data: monitor_set_data,
            },
            7,
        )
        .unwrap();
    assert_eq!(store.drain_captures().unwrap(), 1);
    assert_eq!(store.drain_captures().unwrap(), 0);

    let clips = store.clips();
    assert_eq!(clips.len(), 1);
    assert_eq!(clips[0].formats[0].data, "copied elsewhere");
    assert_eq!(clips[0].owner_path, "/usr/bin/terminal");

    assert!(store.set_clipboard_data(clips[0].id).unwrap());
    assert_eq!(RESTORED_ENTRIES.load(Ordering::SeqCst), 1);
    assert_eq!(RESTORED_FORMAT.load(Ordering::SeqCst), ClipboardFormat::Text.native_id());

    store.stop_monitor();
    assert_eq!(MONITOR_STOPS.load(Ordering::SeqCst), 1);
    assert!(!store.set_clipboard_data(clips[0].id).unwrap());
}
