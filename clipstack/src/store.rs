//! ClipStackStore - the object handed to host applications
//!
//! Concurrency model:
//! - `ClipboardHistory` is the single mutation owner; every call takes the mutex
//!   for the duration of one operation
//! - Events raised during an operation are queued and delivered to host
//!   listeners after the mutex is released
//! - Search and transfer work run off the lock on the tokio runtime
//! - The lock is never held across an `.await`

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::HistoryConfig;
use crate::history::{ClipboardHistory, HistoryEvent, HistoryListener};
use crate::interface::{
    CapturedClipboard, ClipHistoryApi, ClipStackError, ClipSummary, ClipboardEventListener,
    ClipboardFormat, HostEvent, OwnerSummary, TagSummary,
};
use crate::migrations::AbortOperator;
use crate::models::{now_local, Clip};
use crate::native::{CaptureQueue, ClipboardBackend, MonitorBindings, MonitorGuard};
use crate::owners::{FileStemResolver, OwnerEvent};
use crate::search::Searcher;
use crate::transfer;

/// Collects events while the history lock is held
#[derive(Clone, Default)]
struct EventQueue(Arc<Mutex<Vec<HostEvent>>>);

impl EventQueue {
    fn take(&self) -> Vec<HostEvent> {
        std::mem::take(&mut *self.0.lock())
    }
}

impl HistoryListener for EventQueue {
    fn on_event(&self, _clips: &[Clip], event: &HistoryEvent) {
        self.0.lock().push(event.into());
    }

    fn on_owner_event(&self, event: &OwnerEvent) {
        self.0.lock().push(event.into());
    }
}

/// Thread-safe clipboard history backed by SQLite and payload folders
#[derive(uniffi::Object)]
pub struct ClipStackStore {
    history: Mutex<ClipboardHistory>,
    searcher: Searcher,
    events: EventQueue,
    listeners: Mutex<Vec<Arc<dyn ClipboardEventListener>>>,
    monitor: Mutex<Option<MonitorGuard>>,
    captures: Mutex<Option<CaptureQueue>>,
}

// Internal implementation (not exported via FFI)
impl ClipStackStore {
    pub fn from_history(mut history: ClipboardHistory) -> Self {
        let events = EventQueue::default();
        history.subscribe(Box::new(events.clone()));
        Self {
            history: Mutex::new(history),
            searcher: Searcher::new(),
            events,
            listeners: Mutex::new(Vec::new()),
            monitor: Mutex::new(None),
            captures: Mutex::new(None),
        }
    }

    /// Run `f` against the history under the lock, then deliver the events it
    /// raised with the resulting clip list.
    pub fn with_history<R>(&self, f: impl FnOnce(&mut ClipboardHistory) -> R) -> R {
        let (result, events, clips) = {
            let mut history = self.history.lock();
            let result = f(&mut history);
            let events = self.events.take();
            let clips = if events.iter().any(HostEvent::is_history) {
                history.clips().iter().map(ClipSummary::from).collect()
            } else {
                Vec::new()
            };
            (result, events, clips)
        };
        self.deliver(&events, &clips);
        result
    }

    fn deliver(&self, events: &[HostEvent], clips: &[ClipSummary]) {
        if events.is_empty() {
            return;
        }
        let listeners = self.listeners.lock().clone();
        for event in events {
            for listener in &listeners {
                event.deliver(listener.as_ref(), clips);
            }
        }
    }

    fn history_root(&self) -> PathBuf {
        self.history.lock().config().history_root.clone()
    }

    /// Start the native clipboard monitor, replacing a running one. Captures
    /// are queued until `drain_captures` ingests them.
    pub fn start_monitor(&self, bindings: MonitorBindings, window: isize) -> Result<(), ClipStackError> {
        let mut monitor = self.monitor.lock();
        // The old guard detaches the capture sink, so it goes first.
        monitor.take();
        let (guard, queue) = MonitorGuard::start(bindings, window)?;
        *self.captures.lock() = Some(queue);
        *monitor = Some(guard);
        debug!(window, "clipboard monitor started");
        Ok(())
    }
}

#[uniffi::export]
impl ClipStackStore {
    /// Open the history at `history_root`. Settings come from `config_path`
    /// when given (defaults when the file does not exist yet).
    #[uniffi::constructor]
    pub fn new(history_root: String, config_path: Option<String>) -> Result<Self, ClipStackError> {
        let mut config = match &config_path {
            Some(path) => HistoryConfig::load_or_default(PathBuf::from(path).as_path())?,
            None => HistoryConfig::default(),
        };
        config.history_root = PathBuf::from(history_root);
        let mut history = ClipboardHistory::open(config, Box::new(AbortOperator), Box::new(FileStemResolver))?;
        if let Some(path) = config_path {
            history.set_settings_path(path);
        }
        Ok(Self::from_history(history))
    }

    /// Register a host listener for history and owner events
    pub fn subscribe(&self, listener: Arc<dyn ClipboardEventListener>) {
        self.listeners.lock().push(listener);
    }
}

#[uniffi::export]
#[async_trait::async_trait]
impl ClipHistoryApi for ClipStackStore {
    // ─────────────────────────────────────────────────────────────────────────────
    // Read Operations
    // ─────────────────────────────────────────────────────────────────────────────

    fn clips(&self) -> Vec<ClipSummary> {
        self.history.lock().clips().iter().map(ClipSummary::from).collect()
    }

    fn clip(&self, clip_id: i64) -> Option<ClipSummary> {
        self.history.lock().clip(clip_id).map(ClipSummary::from)
    }

    /// Debounced, cancellable substring search. A newer call or the host
    /// dropping the future cancels this one.
    async fn search(&self, query: String) -> Result<Vec<ClipSummary>, ClipStackError> {
        let entries = self.history.lock().search_entries();
        let ids = self.searcher.search(entries, query).await?;

        let history = self.history.lock();
        Ok(ids
            .into_iter()
            .filter_map(|id| history.clip(id))
            .map(ClipSummary::from)
            .collect())
    }

    fn owners(&self) -> Vec<OwnerSummary> {
        let history = self.history.lock();
        let mut owners: Vec<OwnerSummary> = history
            .owners()
            .owners()
            .filter(|owner| !owner.is_unknown())
            .map(OwnerSummary::from)
            .collect();
        owners.sort_by(|a, b| a.path.cmp(&b.path));
        owners
    }

    fn tags(&self) -> Vec<TagSummary> {
        self.history.lock().tags().tags().map(TagSummary::from).collect()
    }

    /// Get the database size in bytes
    fn database_size(&self) -> i64 {
        self.history.lock().database().database_size().unwrap_or(0)
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Write Operations
    // ─────────────────────────────────────────────────────────────────────────────

    fn ingest_capture(&self, capture: CapturedClipboard) -> Result<bool, ClipStackError> {
        if capture.formats.is_empty() {
            return Err(ClipStackError::InvalidInput("capture has no formats".into()));
        }
        Ok(self.with_history(|history| history.handle_capture(capture.into()))?)
    }

    fn drain_captures(&self) -> Result<u64, ClipStackError> {
        // Taken out first so listeners may drain again from their callbacks.
        let snapshots = match self.captures.lock().as_mut() {
            Some(queue) => queue.drain(),
            None => return Ok(0),
        };
        if snapshots.is_empty() {
            return Ok(0);
        }
        Ok(self.with_history(|history| history.handle_captures(snapshots))? as u64)
    }

    fn set_clipboard_data(&self, clip_id: i64) -> Result<bool, ClipStackError> {
        let formats = self
            .history
            .lock()
            .outgoing_formats(clip_id)
            .ok_or(ClipStackError::NotFound(clip_id))?;
        if formats.is_empty() {
            warn!(clip_id, "no format of the clip could be restored");
            return Ok(false);
        }
        let monitor = self.monitor.lock();
        Ok(monitor
            .as_ref()
            .is_some_and(|guard| guard.set_clipboard_data(&formats)))
    }

    fn stop_monitor(&self) {
        if self.monitor.lock().take().is_some() {
            debug!("clipboard monitor stopped");
        }
    }

    fn save_edited_text(&self, text: String) -> Result<bool, ClipStackError> {
        Ok(self.with_history(|history| history.save_edited_text(&text))?)
    }

    fn move_clip_to_top(&self, clip_id: i64) -> Result<(), ClipStackError> {
        if self.with_history(|history| history.move_clip_to_top(clip_id))? {
            Ok(())
        } else {
            Err(ClipStackError::NotFound(clip_id))
        }
    }

    fn toggle_favorite(&self, clip_id: i64) -> Result<(), ClipStackError> {
        if self.with_history(|history| history.toggle_favorite(clip_id))? {
            Ok(())
        } else {
            Err(ClipStackError::NotFound(clip_id))
        }
    }

    fn apply_pending_enrichments(&self) -> Result<u64, ClipStackError> {
        Ok(self.with_history(|history| history.apply_pending_enrichments())? as u64)
    }

    fn save_data_to_file(&self, clip_id: i64, format: ClipboardFormat, dest: String) -> Result<(), ClipStackError> {
        let history = self.history.lock();
        let clip = history.clip(clip_id).ok_or(ClipStackError::NotFound(clip_id))?;
        let data = clip
            .data
            .get(&format)
            .ok_or_else(|| ClipStackError::InvalidInput(format!("clip {clip_id} has no {format:?} data")))?;
        history.codec().save_data_to_file(data, PathBuf::from(dest).as_path())?;
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Tags
    // ─────────────────────────────────────────────────────────────────────────────

    fn register_tag(&self, name: String, color_hex: String, is_cleaning_enabled: bool) -> Result<i64, ClipStackError> {
        if name.trim().is_empty() {
            return Err(ClipStackError::InvalidInput("tag name is empty".into()));
        }
        Ok(self.with_history(|history| history.register_tag(&name, &color_hex, is_cleaning_enabled))?)
    }

    fn unregister_tag(&self, tag_id: i64) -> Result<bool, ClipStackError> {
        Ok(self.with_history(|history| history.unregister_tag(tag_id))?)
    }

    fn update_tag(&self, tag_id: i64, name: String, color_hex: String, is_cleaning_enabled: bool) -> Result<bool, ClipStackError> {
        Ok(self.with_history(|history| history.update_tag(tag_id, &name, &color_hex, is_cleaning_enabled))?)
    }

    fn add_clip_to_tag(&self, clip_id: i64, tag_id: i64) -> Result<bool, ClipStackError> {
        Ok(self.with_history(|history| history.add_clip_to_tag(clip_id, tag_id))?)
    }

    fn remove_clip_from_tag(&self, clip_id: i64, tag_id: i64) -> Result<bool, ClipStackError> {
        Ok(self.with_history(|history| history.remove_clip_from_tag(clip_id, tag_id))?)
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Delete Operations
    // ─────────────────────────────────────────────────────────────────────────────

    fn delete_clip(&self, clip_id: i64) -> Result<(), ClipStackError> {
        if self.with_history(|history| history.delete_clip(clip_id))? {
            Ok(())
        } else {
            Err(ClipStackError::NotFound(clip_id))
        }
    }

    fn delete_all_clips(&self) -> Result<(), ClipStackError> {
        self.searcher.cancel();
        Ok(self.with_history(|history| history.delete_all_clips())?)
    }

    fn run_cleanup(&self) -> u64 {
        self.with_history(|history| history.run_cleanup(now_local())) as u64
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Transfer
    // ─────────────────────────────────────────────────────────────────────────────

    async fn export_clips(&self, clip_ids: Option<Vec<i64>>, dest: String) -> bool {
        let plan = self.history.lock().export_plan(clip_ids.as_deref());
        transfer::export_archive_async(plan, PathBuf::from(dest)).await
    }

    async fn import_clips(&self, path: String) -> Result<u64, ClipStackError> {
        let root = self.history_root();
        let Some(bundle) = transfer::read_archive_async(PathBuf::from(&path), root).await else {
            warn!(path, "archive could not be read");
            return Err(ClipStackError::TransferError(format!("cannot read archive {path}")));
        };
        Ok(self.with_history(|history| history.apply_import(bundle))? as u64)
    }
}
