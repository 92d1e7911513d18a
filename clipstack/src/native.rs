//! Native clipboard boundary
//!
//! The platform module that hooks the OS clipboard talks to the core through
//! the `#[repr(C)]` structs below (capture ABI version 1). Ownership contract:
//!
//! - `RawCapture` and everything it points to is allocated and owned by the
//!   native side and is only valid for the duration of the capture callback.
//!   The core copies what it needs into a `CaptureSnapshot` before returning.
//! - `RawOutgoingEntry` buffers passed to `set_data` are owned by the core and
//!   valid only for the duration of that call; the native side must copy them.
//!
//! Nothing outside this module sees a raw pointer.

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{debug, warn};

use crate::interface::ClipboardFormat;

pub const CAPTURE_ABI_VERSION: u32 = 1;

/// Length of the content digest the native layer computes per format
pub const HASH_LEN: usize = 32;

/// Longest owner path accepted (UTF-16 units, excluding the terminator)
const MAX_OWNER_PATH_UNITS: usize = 32 * 1024;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawFormatEntry {
    /// `ClipboardFormat::native_id`
    pub format: u32,
    /// Native-owned, `size` bytes
    pub data: *const u8,
    pub size: u64,
    /// Native-owned, `HASH_LEN` bytes; may be null
    pub hash: *const u8,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawCapture {
    pub abi_version: u32,
    pub format_count: u32,
    /// Native-owned array of `format_count` entries
    pub formats: *const RawFormatEntry,
    /// Native-owned NUL-terminated UTF-16 path; null when the source is unknown
    pub owner_path: *const u16,
    /// Native-owned icon pixels; null when absent
    pub owner_icon: *const u8,
    pub owner_icon_len: u64,
}

/// Called by the native monitor on its own thread for every clipboard change.
pub type CaptureCallback = extern "C" fn(capture: *const RawCapture) -> bool;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawOutgoingEntry {
    pub format: u32,
    /// Core-owned, valid for the duration of `set_data`
    pub data: *const u8,
    pub size: u64,
}

/// Entry points exported by the native clipboard module
#[repr(C)]
#[derive(Clone, Copy)]
pub struct MonitorBindings {
    pub start: extern "C" fn(window: isize, callback: CaptureCallback) -> bool,
    pub stop: extern "C" fn(window: isize) -> bool,
    pub set_data: extern "C" fn(entries: *const RawOutgoingEntry, count: u32) -> bool,
}

#[derive(Error, Debug)]
pub enum NativeError {
    #[error("Clipboard monitor refused to start for window {0}")]
    StartFailed(isize),
}

// ─────────────────────────────────────────────────────────────────────────────
// SAFE SNAPSHOT
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatRecord {
    pub format: ClipboardFormat,
    pub bytes: Vec<u8>,
    pub hash: Vec<u8>,
}

impl FormatRecord {
    pub fn new(format: ClipboardFormat, bytes: Vec<u8>, hash: Vec<u8>) -> Self {
        Self { format, bytes, hash }
    }
}

/// Owned copy of one clipboard change
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureSnapshot {
    pub owner_path: Option<String>,
    pub owner_icon: Option<Vec<u8>>,
    pub records: Vec<FormatRecord>,
}

unsafe fn copy_bytes(ptr: *const u8, len: usize) -> Option<Vec<u8>> {
    if ptr.is_null() || len == 0 {
        return None;
    }
    Some(std::slice::from_raw_parts(ptr, len).to_vec())
}

unsafe fn copy_wide_string(ptr: *const u16) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    let mut len = 0;
    while len < MAX_OWNER_PATH_UNITS && *ptr.add(len) != 0 {
        len += 1;
    }
    let units = std::slice::from_raw_parts(ptr, len);
    Some(String::from_utf16_lossy(units))
}

impl CaptureSnapshot {
    /// Copy a native capture.
    ///
    /// # Safety
    /// `raw` must be null or point to a `RawCapture` whose pointers honour the
    /// ownership contract in the module docs for the duration of this call.
    pub unsafe fn from_raw(raw: *const RawCapture) -> Option<Self> {
        let raw = raw.as_ref()?;
        if raw.abi_version != CAPTURE_ABI_VERSION {
            warn!(version = raw.abi_version, "unsupported capture ABI version");
            return None;
        }

        let entries: &[RawFormatEntry] = if raw.formats.is_null() || raw.format_count == 0 {
            &[]
        } else {
            std::slice::from_raw_parts(raw.formats, raw.format_count as usize)
        };

        let mut records = Vec::with_capacity(entries.len());
        for entry in entries {
            let Some(format) = ClipboardFormat::from_native_id(entry.format) else {
                debug!(format = entry.format, "skipping unknown native format");
                continue;
            };
            let Some(bytes) = copy_bytes(entry.data, entry.size as usize) else {
                continue;
            };
            let hash = copy_bytes(entry.hash, HASH_LEN).unwrap_or_default();
            records.push(FormatRecord::new(format, bytes, hash));
        }

        Some(Self {
            owner_path: copy_wide_string(raw.owner_path).filter(|p| !p.is_empty()),
            owner_icon: copy_bytes(raw.owner_icon, raw.owner_icon_len as usize),
            records,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// CAPTURE QUEUE
// ─────────────────────────────────────────────────────────────────────────────

static CAPTURE_SINK: Lazy<Mutex<Option<UnboundedSender<CaptureSnapshot>>>> =
    Lazy::new(|| Mutex::new(None));

/// Captures waiting for the mutation thread
pub struct CaptureQueue {
    rx: UnboundedReceiver<CaptureSnapshot>,
}

impl CaptureQueue {
    /// Install a fresh sink for `capture_trampoline`, replacing any previous one.
    pub fn install() -> Self {
        let (tx, rx) = unbounded_channel();
        *CAPTURE_SINK.lock() = Some(tx);
        Self { rx }
    }

    pub fn drain(&mut self) -> Vec<CaptureSnapshot> {
        let mut snapshots = Vec::new();
        while let Ok(snapshot) = self.rx.try_recv() {
            snapshots.push(snapshot);
        }
        snapshots
    }

    /// Wait for the next capture; `None` once the sink is gone.
    pub async fn recv(&mut self) -> Option<CaptureSnapshot> {
        self.rx.recv().await
    }
}

fn uninstall_sink() {
    *CAPTURE_SINK.lock() = None;
}

/// Callback handed to the native monitor. Copies the capture and queues it for
/// the mutation thread; returns `false` if nothing is listening.
pub extern "C" fn capture_trampoline(capture: *const RawCapture) -> bool {
    // SAFETY: the native monitor upholds the contract documented on `RawCapture`.
    let Some(snapshot) = (unsafe { CaptureSnapshot::from_raw(capture) }) else {
        return false;
    };
    match CAPTURE_SINK.lock().as_ref() {
        Some(tx) => tx.send(snapshot).is_ok(),
        None => false,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// BACKEND
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingFormat {
    pub format: ClipboardFormat,
    pub bytes: Vec<u8>,
}

/// Puts formats back onto the system clipboard
pub trait ClipboardBackend {
    fn set_clipboard_data(&self, formats: &[OutgoingFormat]) -> bool;
}

/// Running native monitor. Dropping it stops monitoring and detaches the capture sink.
pub struct MonitorGuard {
    bindings: MonitorBindings,
    window: isize,
}

impl MonitorGuard {
    pub fn start(bindings: MonitorBindings, window: isize) -> Result<(Self, CaptureQueue), NativeError> {
        let queue = CaptureQueue::install();
        if !(bindings.start)(window, capture_trampoline) {
            uninstall_sink();
            return Err(NativeError::StartFailed(window));
        }
        Ok((Self { bindings, window }, queue))
    }
}

impl Drop for MonitorGuard {
    fn drop(&mut self) {
        if !(self.bindings.stop)(self.window) {
            warn!(window = self.window, "native monitor did not stop cleanly");
        }
        uninstall_sink();
    }
}

impl ClipboardBackend for MonitorGuard {
    fn set_clipboard_data(&self, formats: &[OutgoingFormat]) -> bool {
        if formats.is_empty() {
            return false;
        }
        // Points into `formats`, which outlives the call below.
        let entries: Vec<RawOutgoingEntry> = formats
            .iter()
            .map(|f| RawOutgoingEntry {
                format: f.format.native_id(),
                data: f.bytes.as_ptr(),
                size: f.bytes.len() as u64,
            })
            .collect();
        (self.bindings.set_data)(entries.as_ptr(), entries.len() as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn wide(s: &str) -> Vec<u16> {
        s.encode_utf16().chain(std::iter::once(0)).collect()
    }

    #[test]
    fn test_snapshot_copies_entries_and_owner() {
        let text: Vec<u8> = "hi".encode_utf16().flat_map(|u| u.to_le_bytes()).collect();
        let hash = [7u8; HASH_LEN];
        let png = vec![0x89, b'P', b'N', b'G'];
        let entries = [
            RawFormatEntry { format: 1, data: text.as_ptr(), size: text.len() as u64, hash: hash.as_ptr() },
            RawFormatEntry { format: 99, data: png.as_ptr(), size: 4, hash: std::ptr::null() },
            RawFormatEntry { format: 5, data: png.as_ptr(), size: 4, hash: std::ptr::null() },
        ];
        let path = wide(r"C:\Apps\editor.exe");
        let icon = [1u8, 2, 3];
        let raw = RawCapture {
            abi_version: CAPTURE_ABI_VERSION,
            format_count: entries.len() as u32,
            formats: entries.as_ptr(),
            owner_path: path.as_ptr(),
            owner_icon: icon.as_ptr(),
            owner_icon_len: icon.len() as u64,
        };

        let snapshot = unsafe { CaptureSnapshot::from_raw(&raw) }.unwrap();
        assert_eq!(snapshot.owner_path.as_deref(), Some(r"C:\Apps\editor.exe"));
        assert_eq!(snapshot.owner_icon, Some(vec![1, 2, 3]));
        assert_eq!(snapshot.records.len(), 2);
        assert_eq!(snapshot.records[0].format, ClipboardFormat::Text);
        assert_eq!(snapshot.records[0].hash, hash.to_vec());
        assert_eq!(snapshot.records[1].format, ClipboardFormat::Png);
        assert!(snapshot.records[1].hash.is_empty());
    }

    #[test]
    fn test_snapshot_rejects_null_and_wrong_version() {
        assert!(unsafe { CaptureSnapshot::from_raw(std::ptr::null()) }.is_none());
        let raw = RawCapture {
            abi_version: CAPTURE_ABI_VERSION + 1,
            format_count: 0,
            formats: std::ptr::null(),
            owner_path: std::ptr::null(),
            owner_icon: std::ptr::null(),
            owner_icon_len: 0,
        };
        assert!(unsafe { CaptureSnapshot::from_raw(&raw) }.is_none());
    }

    static STARTS: AtomicUsize = AtomicUsize::new(0);
    static STOPS: AtomicUsize = AtomicUsize::new(0);
    static SET_DATA_BYTES: AtomicUsize = AtomicUsize::new(0);

    extern "C" fn fake_start(_window: isize, callback: CaptureCallback) -> bool {
        STARTS.fetch_add(1, Ordering::SeqCst);
        let raw = RawCapture {
            abi_version: CAPTURE_ABI_VERSION,
            format_count: 0,
            formats: std::ptr::null(),
            owner_path: std::ptr::null(),
            owner_icon: std::ptr::null(),
            owner_icon_len: 0,
        };
        callback(&raw)
    }

    extern "C" fn fake_stop(_window: isize) -> bool {
        STOPS.fetch_add(1, Ordering::SeqCst);
        true
    }

    extern "C" fn fake_set_data(entries: *const RawOutgoingEntry, count: u32) -> bool {
        let entries = unsafe { std::slice::from_raw_parts(entries, count as usize) };
        let total: u64 = entries.iter().map(|e| e.size).sum();
        SET_DATA_BYTES.store(total as usize, Ordering::SeqCst);
        true
    }

    #[test]
    fn test_monitor_guard_queues_captures_and_stops_on_drop() {
        let bindings = MonitorBindings {
            start: fake_start,
            stop: fake_stop,
            set_data: fake_set_data,
        };
        let (guard, mut queue) = MonitorGuard::start(bindings, 42).unwrap();
        assert_eq!(STARTS.load(Ordering::SeqCst), 1);
        assert_eq!(queue.drain().len(), 1);

        let sent = guard.set_clipboard_data(&[OutgoingFormat {
            format: ClipboardFormat::Text,
            bytes: vec![0; 6],
        }]);
        assert!(sent);
        assert_eq!(SET_DATA_BYTES.load(Ordering::SeqCst), 6);

        drop(guard);
        assert_eq!(STOPS.load(Ordering::SeqCst), 1);
        assert!(queue.drain().is_empty());
    }
}
