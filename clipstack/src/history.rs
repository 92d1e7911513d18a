//! Deduplication & Ordering Engine
//!
//! `ClipboardHistory` owns the in-memory clip list, the owner and tag
//! registries and the store. It is driven from a single mutation thread
//! (`&mut self` everywhere); background work only hands results back
//! through channels that this thread drains.
//!
//! Invariants kept here:
//! - at most one clip per distinct content (see `Clip::is_same_content`)
//! - the list is ordered by `clip_time`, newest first
//! - every store write precedes the event that reports it

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use chrono::NaiveDateTime;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::cleanup::{CleanupScheduler, RetentionPolicy};
use crate::codec::{encode_utf16, FormatCodec, PayloadGuard};
use crate::config::{HistoryConfig, OwnerFilter};
use crate::content_detection::{files_metadata, is_hex_color, is_link};
use crate::database::{Database, DatabaseResult};
use crate::filters::OwnerFilters;
use crate::interface::ClipboardFormat;
use crate::link_metadata::LinkEnricher;
use crate::migrations::Operator;
use crate::models::{find_duplicate, now_local, Clip, Metadata};
use crate::native::{CaptureQueue, CaptureSnapshot, ClipboardBackend, FormatRecord, OutgoingFormat};
use crate::owners::{OwnerEvent, OwnerNameResolver, OwnerRegistry};
use crate::search::SearchEntry;
use crate::tags::TagRegistry;
use crate::transfer::{ExportPlan, ImportBundle};

/// Change notification; carries the affected clip where there is one
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryEvent {
    NewClipAdded(Clip),
    ClipMovedToTop(Clip),
    FavoriteChanged(Clip),
    ClipDeleted(Clip),
    AllClipsDeleted,
    LinkMetadataLoaded(Clip),
}

impl HistoryEvent {
    pub fn clip(&self) -> Option<&Clip> {
        match self {
            HistoryEvent::NewClipAdded(clip)
            | HistoryEvent::ClipMovedToTop(clip)
            | HistoryEvent::FavoriteChanged(clip)
            | HistoryEvent::ClipDeleted(clip)
            | HistoryEvent::LinkMetadataLoaded(clip) => Some(clip),
            HistoryEvent::AllClipsDeleted => None,
        }
    }
}

/// Receives history changes on the mutation thread, together with the full ordered list
pub trait HistoryListener: Send {
    fn on_event(&self, clips: &[Clip], event: &HistoryEvent);

    fn on_owner_event(&self, _event: &OwnerEvent) {}
}

pub struct ClipboardHistory {
    config: HistoryConfig,
    db: Database,
    codec: FormatCodec,
    clips: Vec<Clip>,
    owners: OwnerRegistry,
    tags: TagRegistry,
    filters: OwnerFilters,
    enricher: LinkEnricher,
    scheduler: CleanupScheduler,
    operator: Box<dyn Operator>,
    listeners: Vec<Box<dyn HistoryListener>>,
    /// Where `config` is written back when filter counters change
    settings_path: Option<PathBuf>,
}

impl ClipboardHistory {
    /// Open the store under `config.history_root`, migrate it and load the history.
    pub fn open(
        config: HistoryConfig,
        operator: Box<dyn Operator>,
        resolver: Box<dyn OwnerNameResolver>,
    ) -> DatabaseResult<Self> {
        let db = Database::open(
            config.database_path(),
            &config.history_root,
            resolver.as_ref(),
            operator.as_ref(),
        )?;

        let mut owners = OwnerRegistry::new(resolver);
        let owner_keys = owners.load(&db)?;
        let clips = db.get_clips(&owner_keys)?;
        owners.rebuild_counts(&clips);
        let tags = TagRegistry::load(&db)?;

        info!(
            clips = clips.len(),
            owners = owner_keys.len(),
            root = %config.history_root.display(),
            "clipboard history loaded"
        );

        Ok(Self {
            codec: FormatCodec::new(&config.history_root),
            filters: OwnerFilters::new(config.owner_filters.clone()),
            db,
            clips,
            owners,
            tags,
            enricher: LinkEnricher::new(),
            scheduler: CleanupScheduler::new(),
            operator,
            listeners: Vec::new(),
            settings_path: None,
            config,
        })
    }

    /// Persist settings changes (filter counters) to `path` from now on
    pub fn set_settings_path(&mut self, path: impl Into<PathBuf>) {
        self.settings_path = Some(path.into());
    }

    fn save_settings(&mut self) {
        self.config.owner_filters = self.filters.filters().to_vec();
        if let Some(path) = &self.settings_path {
            if let Err(e) = self.config.save(path) {
                warn!(path = %path.display(), error = %e, "filter counters not saved");
            }
        }
    }

    pub fn subscribe(&mut self, listener: Box<dyn HistoryListener>) {
        self.listeners.push(listener);
    }

    pub fn clips(&self) -> &[Clip] {
        &self.clips
    }

    pub fn clip(&self, id: i64) -> Option<&Clip> {
        self.clips.iter().find(|clip| clip.id == id)
    }

    pub fn config(&self) -> &HistoryConfig {
        &self.config
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn codec(&self) -> &FormatCodec {
        &self.codec
    }

    pub fn owners(&self) -> &OwnerRegistry {
        &self.owners
    }

    pub fn tags(&self) -> &TagRegistry {
        &self.tags
    }

    /// Filters with their current hit counters
    pub fn owner_filters(&self) -> &[OwnerFilter] {
        self.filters.filters()
    }

    pub fn link_enricher(&self) -> &LinkEnricher {
        &self.enricher
    }

    fn position(&self, id: i64) -> Option<usize> {
        self.clips.iter().position(|clip| clip.id == id)
    }

    fn owner_id_of(&self, clip: &Clip) -> Option<i64> {
        self.owners.owner_id(clip.owner.as_deref())
    }

    fn notify(&mut self, event: Option<HistoryEvent>) {
        let owner_events = self.owners.take_events();
        for listener in &self.listeners {
            for owner_event in &owner_events {
                listener.on_owner_event(owner_event);
            }
            if let Some(event) = &event {
                listener.on_event(&self.clips, event);
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Ingestion
    // ─────────────────────────────────────────────────────────────────────────

    /// Ingest a capture stamped with the current time
    pub fn handle_capture(&mut self, snapshot: CaptureSnapshot) -> DatabaseResult<bool> {
        self.ingest(snapshot, now_local())
    }

    /// Process everything queued by the native trampoline
    pub fn drain_captures(&mut self, queue: &mut CaptureQueue) -> DatabaseResult<usize> {
        self.handle_captures(queue.drain())
    }

    /// Ingest snapshots in arrival order. Returns how many were kept.
    pub fn handle_captures(&mut self, snapshots: Vec<CaptureSnapshot>) -> DatabaseResult<usize> {
        let mut accepted = 0;
        for snapshot in snapshots {
            if self.handle_capture(snapshot)? {
                accepted += 1;
            }
        }
        Ok(accepted)
    }

    /// Filter, convert, then merge or insert. Returns whether the capture was kept.
    pub fn ingest(&mut self, snapshot: CaptureSnapshot, time: NaiveDateTime) -> DatabaseResult<bool> {
        let owner_path = snapshot.owner_path.as_deref().filter(|p| !p.is_empty());
        if let Some(path) = owner_path {
            if self.filters.check(path).is_some() {
                self.save_settings();
                return Ok(false);
            }
        }

        let mut clip = Clip::new(time);
        let mut guard = PayloadGuard::default();
        for record in &snapshot.records {
            if clip.data.contains_key(&record.format) {
                continue;
            }
            match self.codec.to_data_model(record, time, &mut guard) {
                Some(data) => {
                    clip.data.insert(record.format, data);
                }
                None => {
                    debug!(format = ?record.format, "capture dropped, format conversion failed");
                    return Ok(false);
                }
            }
        }
        if clip.data.is_empty() {
            return Ok(false);
        }

        self.owners
            .register_clip_owner(&self.db, &mut clip, owner_path, snapshot.owner_icon)?;

        let stored = match find_duplicate(&self.clips, &clip) {
            // Dropping the guard discards the duplicate's payload files.
            Some(index) => self.merge_duplicate(index, &mut clip),
            None => self.add_clip(&mut clip).map(|()| guard.keep()),
        };
        if let Err(e) = stored {
            // `clip.owner` still holds the reference taken above unless it moved.
            if let Err(release) = self.owners.unregister_clip_owner(&self.db, &mut clip) {
                warn!(error = %release, "owner reference not released");
            }
            return Err(e);
        }

        if let RetentionPolicy::Quantity { max_clips } = self.config.retention {
            self.delete_old_clips_by_quantity(max_clips, self.config.include_favorites)?;
        }
        Ok(true)
    }

    fn merge_duplicate(&mut self, index: usize, new_clip: &mut Clip) -> DatabaseResult<()> {
        let mut merged = self.clips[index].clone();
        merged.clip_time = new_clip.clip_time;
        let owner_changed = merged.owner != new_clip.owner;
        if owner_changed {
            merged.owner = new_clip.owner.clone();
        }
        let owner_id = self.owner_id_of(&merged);
        self.db.update_clip(&merged, owner_id)?;
        debug!(id = merged.id, from = index, "duplicate moved to top");

        let mut previous = self.clips.remove(index);
        self.clips.insert(0, merged.clone());
        if owner_changed {
            // The new capture's reference now belongs to the merged clip.
            new_clip.owner = None;
            self.owners.unregister_clip_owner(&self.db, &mut previous)?;
        } else {
            self.owners.unregister_clip_owner(&self.db, new_clip)?;
        }

        self.notify(Some(HistoryEvent::ClipMovedToTop(merged)));
        Ok(())
    }

    fn add_clip(&mut self, clip: &mut Clip) -> DatabaseResult<()> {
        let prefix_required = self.config.hex_color_prefix_required;
        let mut link_url = None;
        if let Some(text) = clip.data.get_mut(&ClipboardFormat::Text) {
            if is_hex_color(&text.data, prefix_required) {
                text.metadata = Some(Metadata::Color);
            } else if is_link(&text.data) {
                clip.is_link = true;
                link_url = Some(text.data.trim().to_string());
            }
        }
        if let Some(files) = clip.data.get_mut(&ClipboardFormat::Files) {
            files.metadata = Some(Metadata::Files(files_metadata(&files.data)));
        }

        let owner_id = self.owner_id_of(clip);
        self.db.add_clip(clip, owner_id)?;
        debug!(id = clip.id, formats = clip.data.len(), "new clip");

        if let Some(url) = link_url.filter(|_| self.config.link_preview_enabled) {
            if let Some(text) = clip.data.get(&ClipboardFormat::Text) {
                self.enricher.schedule(clip.id, text.id, url);
            }
        }

        self.clips.insert(0, clip.clone());
        self.notify(Some(HistoryEvent::NewClipAdded(clip.clone())));
        Ok(())
    }

    /// Store the editor's text as a new capture without an owner
    pub fn save_edited_text(&mut self, text: &str) -> DatabaseResult<bool> {
        if text.is_empty() {
            return Ok(false);
        }
        let mut bytes = encode_utf16(text);
        bytes.truncate(bytes.len().saturating_sub(2));
        let hash = Sha256::digest(&bytes).to_vec();
        let snapshot = CaptureSnapshot {
            owner_path: None,
            owner_icon: None,
            records: vec![FormatRecord::new(ClipboardFormat::Text, bytes, hash)],
        };
        self.handle_capture(snapshot)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Single clip operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Re-stamp to now and move first. Emits only when the position changes.
    pub fn move_clip_to_top(&mut self, id: i64) -> DatabaseResult<bool> {
        let Some(index) = self.position(id) else {
            return Ok(false);
        };
        let mut restamped = self.clips[index].clone();
        restamped.clip_time = now_local();
        let owner_id = self.owner_id_of(&restamped);
        self.db.update_clip(&restamped, owner_id)?;
        self.clips[index] = restamped;

        if index != 0 {
            let clip = self.clips.remove(index);
            self.clips.insert(0, clip.clone());
            self.notify(Some(HistoryEvent::ClipMovedToTop(clip)));
        }
        Ok(true)
    }

    pub fn toggle_favorite(&mut self, id: i64) -> DatabaseResult<bool> {
        let Some(index) = self.position(id) else {
            return Ok(false);
        };
        let mut clip = self.clips[index].clone();
        clip.is_favorite = !clip.is_favorite;
        let owner_id = self.owner_id_of(&clip);
        self.db.update_clip(&clip, owner_id)?;

        self.clips[index] = clip.clone();
        self.notify(Some(HistoryEvent::FavoriteChanged(clip)));
        Ok(true)
    }

    pub fn delete_clip(&mut self, id: i64) -> DatabaseResult<bool> {
        match self.position(id) {
            Some(index) => {
                self.delete_clip_at(index, true)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Remove the clip at `index` with its files, tag links and owner reference.
    /// `delete_from_db` is false when a bulk statement already removed the row.
    fn delete_clip_at(&mut self, index: usize, delete_from_db: bool) -> DatabaseResult<Clip> {
        if delete_from_db {
            self.db.delete_clip(self.clips[index].id)?;
        }
        let mut clip = self.clips.remove(index);
        self.tags.forget_clip(&clip);
        clip.tags.clear();
        self.codec.clear_external_files(&clip);
        self.owners.unregister_clip_owner(&self.db, &mut clip)?;

        self.notify(Some(HistoryEvent::ClipDeleted(clip.clone())));
        Ok(clip)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Bulk operations
    // ─────────────────────────────────────────────────────────────────────────

    fn is_evictable(&self, clip: &Clip, include_favorites: bool) -> bool {
        (include_favorites || !clip.is_favorite) && !self.tags.protects(clip)
    }

    fn delete_listed(&mut self, ids: &[i64]) -> DatabaseResult<()> {
        for id in ids {
            if let Some(index) = self.position(*id) {
                self.delete_clip_at(index, false)?;
            }
        }
        Ok(())
    }

    /// Delete clips older than `cutoff`
    pub fn delete_old_clips_by_time(
        &mut self,
        cutoff: NaiveDateTime,
        include_favorites: bool,
    ) -> DatabaseResult<usize> {
        let doomed: Vec<i64> = self
            .clips
            .iter()
            .filter(|clip| clip.clip_time < cutoff && self.is_evictable(clip, include_favorites))
            .map(|clip| clip.id)
            .collect();

        self.db.delete_old_clips_by_time(cutoff, include_favorites)?;
        self.delete_listed(&doomed)?;
        Ok(doomed.len())
    }

    /// Keep only the newest `quantity` evictable clips
    pub fn delete_old_clips_by_quantity(
        &mut self,
        quantity: u32,
        include_favorites: bool,
    ) -> DatabaseResult<usize> {
        let mut eligible: Vec<&Clip> = self
            .clips
            .iter()
            .filter(|clip| self.is_evictable(clip, include_favorites))
            .collect();
        if eligible.len() <= quantity as usize {
            return Ok(0);
        }
        eligible.sort_by(|a, b| (b.clip_time, b.id).cmp(&(a.clip_time, a.id)));
        let doomed: Vec<i64> = eligible[quantity as usize..].iter().map(|c| c.id).collect();

        self.db.delete_old_clips_by_quantity(quantity, include_favorites)?;
        self.delete_listed(&doomed)?;
        Ok(doomed.len())
    }

    pub fn delete_all_clips(&mut self) -> DatabaseResult<()> {
        self.db.delete_all_clips()?;
        self.tags.clear_clip_references();
        self.clips.clear();
        self.owners.unregister_all_owners();
        self.codec.clear_all_external_data();

        info!("all clips deleted");
        self.notify(Some(HistoryEvent::AllClipsDeleted));
        Ok(())
    }

    /// Apply the configured retention policy. Store errors here are fatal.
    pub fn run_cleanup(&mut self, now: NaiveDateTime) -> usize {
        let include_favorites = self.config.include_favorites;
        let result = match self.config.retention {
            RetentionPolicy::None => Ok(0),
            RetentionPolicy::Quantity { max_clips } => {
                self.delete_old_clips_by_quantity(max_clips, include_favorites)
            }
            policy @ RetentionPolicy::Period { .. } => match self.scheduler.due_cutoff(&policy, now) {
                Some(cutoff) => self.delete_old_clips_by_time(cutoff, include_favorites),
                None => Ok(0),
            },
        };

        match result {
            Ok(deleted) => {
                if deleted > 0 {
                    info!(deleted, "retention cleanup");
                }
                deleted
            }
            Err(e) => self.operator.fatal(&format!(
                "The clipboard history could not be cleaned up and may be corrupted: {e}"
            )),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Enrichment, clipboard and search
    // ─────────────────────────────────────────────────────────────────────────

    /// Persist fetched link metadata and report it
    pub fn apply_pending_enrichments(&mut self) -> DatabaseResult<usize> {
        let mut applied = 0;
        for enrichment in self.enricher.drain() {
            let Some(index) = self.position(enrichment.clip_id) else {
                continue;
            };
            let Some(text) = self.clips[index]
                .data
                .get_mut(&ClipboardFormat::Text)
                .filter(|text| text.id == enrichment.data_id)
            else {
                continue;
            };
            self.db.add_link_metadata(enrichment.data_id, &enrichment.metadata)?;
            text.metadata = Some(Metadata::Link(enrichment.metadata));
            applied += 1;

            let clip = self.clips[index].clone();
            self.notify(Some(HistoryEvent::LinkMetadataLoaded(clip)));
        }
        Ok(applied)
    }

    /// Formats of a stored clip ready for the system clipboard. Formats whose
    /// payload cannot be read are skipped; `None` when the clip does not exist.
    pub fn outgoing_formats(&self, id: i64) -> Option<Vec<OutgoingFormat>> {
        let clip = self.clip(id)?;
        Some(
            clip.data
                .values()
                .filter_map(|data| self.codec.to_outgoing(data))
                .collect(),
        )
    }

    /// Put a stored clip back on the system clipboard
    pub fn set_clipboard_data(&self, id: i64, backend: &dyn ClipboardBackend) -> bool {
        let Some(formats) = self.outgoing_formats(id) else {
            return false;
        };
        if formats.is_empty() {
            warn!(id, "no format of the clip could be restored");
            return false;
        }
        backend.set_clipboard_data(&formats)
    }

    pub fn search_entries(&self) -> Vec<SearchEntry> {
        SearchEntry::from_clips(&self.clips)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Tags
    // ─────────────────────────────────────────────────────────────────────────

    pub fn register_tag(&mut self, name: &str, color_hex: &str, is_cleaning_enabled: bool) -> DatabaseResult<i64> {
        self.tags.register_tag(&self.db, name, color_hex, is_cleaning_enabled)
    }

    pub fn unregister_tag(&mut self, id: i64) -> DatabaseResult<bool> {
        self.tags.unregister_tag(&self.db, id, &mut self.clips)
    }

    pub fn update_tag(
        &mut self,
        id: i64,
        name: &str,
        color_hex: &str,
        is_cleaning_enabled: bool,
    ) -> DatabaseResult<bool> {
        self.tags.update_tag(&self.db, id, name, color_hex, is_cleaning_enabled)
    }

    pub fn add_clip_to_tag(&mut self, clip_id: i64, tag_id: i64) -> DatabaseResult<bool> {
        let Some(clip) = self.clips.iter_mut().find(|c| c.id == clip_id) else {
            return Ok(false);
        };
        self.tags.add_clip_to_tag(&self.db, clip, tag_id)
    }

    pub fn remove_clip_from_tag(&mut self, clip_id: i64, tag_id: i64) -> DatabaseResult<bool> {
        let Some(clip) = self.clips.iter_mut().find(|c| c.id == clip_id) else {
            return Ok(false);
        };
        self.tags.remove_clip_from_tag(&self.db, clip, tag_id)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Transfer
    // ─────────────────────────────────────────────────────────────────────────

    /// Snapshot of the given clips (all when `ids` is `None`) with the owners
    /// and tags they reference
    pub fn export_plan(&self, ids: Option<&[i64]>) -> ExportPlan {
        let clips: Vec<Clip> = match ids {
            Some(ids) => {
                let wanted: HashSet<i64> = ids.iter().copied().collect();
                self.clips.iter().filter(|c| wanted.contains(&c.id)).cloned().collect()
            }
            None => self.clips.clone(),
        };
        let owner_keys: HashSet<&str> = clips.iter().filter_map(|c| c.owner.as_deref()).collect();
        let owners = self
            .owners
            .owners()
            .filter(|o| !o.is_unknown() && owner_keys.contains(o.path.as_str()))
            .cloned()
            .collect();
        let tag_ids: HashSet<i64> = clips.iter().flat_map(|c| c.tags.iter().copied()).collect();
        let tags = self
            .tags
            .tags()
            .filter(|t| tag_ids.contains(&t.id))
            .cloned()
            .collect();
        ExportPlan { clips, owners, tags }
    }

    /// Merge already persisted clips into the list, keeping time order
    pub fn insert_clips(&mut self, clips: Vec<Clip>) {
        for clip in clips {
            let index = self
                .clips
                .iter()
                .position(|c| c.clip_time < clip.clip_time)
                .unwrap_or(self.clips.len());
            self.clips.insert(index, clip.clone());
            self.notify(Some(HistoryEvent::NewClipAdded(clip)));
        }
    }

    /// Bring the clips of an archive into the live history. Clips whose
    /// exact `clip_time` already exists are skipped.
    pub fn apply_import(&mut self, bundle: ImportBundle) -> DatabaseResult<usize> {
        let existing_times: HashSet<NaiveDateTime> = self.clips.iter().map(|c| c.clip_time).collect();
        let imported_owners: HashMap<&str, _> = bundle
            .owners
            .iter()
            .map(|owner| (owner.path.as_str(), owner))
            .collect();

        let mut tag_ids = HashMap::new();
        for tag in &bundle.tags {
            let id = match self.tags.find(&tag.name, &tag.color_hex) {
                Some(existing) => existing.id,
                None => self
                    .tags
                    .register_tag(&self.db, &tag.name, &tag.color_hex, tag.is_cleaning_enabled)?,
            };
            tag_ids.insert(tag.id, id);
        }

        let mut imported = Vec::new();
        let mut skipped = 0usize;
        for source in &bundle.clips {
            if existing_times.contains(&source.clip_time) {
                skipped += 1;
                continue;
            }
            let mut clip = Clip::new(source.clip_time);
            clip.is_favorite = source.is_favorite;
            clip.is_link = source.is_link;
            clip.data = source.data.clone();

            match source.owner.as_deref().and_then(|path| imported_owners.get(path)) {
                Some(owner) if !owner.is_unknown() => {
                    self.owners.register_imported_owner(&self.db, &mut clip, owner)?;
                }
                _ => {
                    self.owners.register_clip_owner(&self.db, &mut clip, None, None)?;
                }
            }
            let owner_id = self.owner_id_of(&clip);
            self.db.add_clip(&mut clip, owner_id)?;

            let links: Vec<(i64, i64)> = source
                .tags
                .iter()
                .filter_map(|old| tag_ids.get(old))
                .map(|new| (clip.id, *new))
                .collect();
            self.db.add_clip_tags(&links)?;
            for (_, tag_id) in links {
                self.tags.link_persisted(&mut clip, tag_id);
            }
            imported.push(clip);
        }

        // Every tag the archive mapped onto must end up holding clips.
        let mapped: HashSet<i64> = tag_ids.into_values().collect();
        for id in mapped {
            if self.tags.get(id).is_some_and(|tag| tag.clips.is_empty()) {
                self.tags.unregister_tag(&self.db, id, &mut [])?;
            }
        }

        let count = imported.len();
        info!(imported = count, skipped, "archive imported");
        self.insert_clips(imported);
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrations::AbortOperator;
    use crate::owners::FileStemResolver;
    use chrono::{Duration, NaiveDate};
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn open(dir: &std::path::Path) -> ClipboardHistory {
        let mut config = HistoryConfig::with_root(dir);
        config.link_preview_enabled = false;
        ClipboardHistory::open(config, Box::new(AbortOperator), Box::new(FileStemResolver)).unwrap()
    }

    fn at(minute: i64) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(8, 0, 0)
            .unwrap()
            + Duration::minutes(minute)
    }

    fn text_capture(text: &str, owner: Option<&str>) -> CaptureSnapshot {
        let mut bytes = encode_utf16(text);
        bytes.truncate(bytes.len() - 2);
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

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<String>>>);

    impl HistoryListener for Recorder {
        fn on_event(&self, clips: &[Clip], event: &HistoryEvent) {
            let name = match event {
                HistoryEvent::NewClipAdded(_) => "added",
                HistoryEvent::ClipMovedToTop(_) => "moved",
                HistoryEvent::FavoriteChanged(_) => "favorite",
                HistoryEvent::ClipDeleted(_) => "deleted",
                HistoryEvent::AllClipsDeleted => "all-deleted",
                HistoryEvent::LinkMetadataLoaded(_) => "link",
            };
            self.0.lock().push(format!("{name}:{}", clips.len()));
        }
    }

    #[test]
    fn test_color_and_link_detection_on_insert() {
        let dir = tempfile::tempdir().unwrap();
        let mut history = open(dir.path());
        history.ingest(text_capture("#A1B2C3", None), at(0)).unwrap();
        history.ingest(text_capture("https://example.com", None), at(1)).unwrap();

        let link = &history.clips()[0];
        assert!(link.is_link);
        let color = &history.clips()[1];
        assert_eq!(
            color.data[&ClipboardFormat::Text].metadata,
            Some(Metadata::Color)
        );
    }

    #[test]
    fn test_move_to_top_emits_only_when_moved() {
        let dir = tempfile::tempdir().unwrap();
        let mut history = open(dir.path());
        let recorder = Recorder::default();
        history.subscribe(Box::new(recorder.clone()));
        history.ingest(text_capture("a", None), at(0)).unwrap();
        history.ingest(text_capture("b", None), at(1)).unwrap();
        let a = history.clips()[1].id;
        let b = history.clips()[0].id;

        assert!(history.move_clip_to_top(b).unwrap());
        assert!(history.move_clip_to_top(a).unwrap());
        assert_eq!(history.clips()[0].id, a);
        assert!(!history.move_clip_to_top(9999).unwrap());
        assert_eq!(*recorder.0.lock(), vec!["added:1", "added:2", "moved:2"]);
    }

    #[test]
    fn test_toggle_favorite_persists() {
        let dir = tempfile::tempdir().unwrap();
        let mut history = open(dir.path());
        history.ingest(text_capture("fav", None), at(0)).unwrap();
        let id = history.clips()[0].id;
        assert!(history.toggle_favorite(id).unwrap());
        drop(history);

        let reopened = open(dir.path());
        assert!(reopened.clip(id).unwrap().is_favorite);
    }

    #[test]
    fn test_quantity_policy_applies_after_insert() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = HistoryConfig::with_root(dir.path());
        config.retention = RetentionPolicy::Quantity { max_clips: 2 };
        let mut history =
            ClipboardHistory::open(config, Box::new(AbortOperator), Box::new(FileStemResolver)).unwrap();
        for (i, text) in ["one", "two", "three"].iter().enumerate() {
            history.ingest(text_capture(text, None), at(i as i64)).unwrap();
        }
        let texts: Vec<_> = history.clips().iter().filter_map(Clip::text).collect();
        assert_eq!(texts, vec!["three", "two"]);
        assert_eq!(history.database().count_clips().unwrap(), 2);
    }

    #[test]
    fn test_protected_tag_survives_time_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let mut history = open(dir.path());
        history.ingest(text_capture("old", None), at(0)).unwrap();
        history.ingest(text_capture("kept", None), at(1)).unwrap();
        let kept = history.clips()[0].id;
        let tag = history.register_tag("pinned", "#FFFFFF", false).unwrap();
        assert!(history.add_clip_to_tag(kept, tag).unwrap());

        let deleted = history.delete_old_clips_by_time(at(60), true).unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(history.clips().len(), 1);
        assert_eq!(history.clips()[0].id, kept);
        assert_eq!(history.database().count_clips().unwrap(), 1);
    }

    #[test]
    fn test_edited_text_dedups_against_captures() {
        let dir = tempfile::tempdir().unwrap();
        let mut history = open(dir.path());
        history.ingest(text_capture("draft", Some("/usr/bin/editor")), at(0)).unwrap();
        history.ingest(text_capture("other", None), at(1)).unwrap();

        assert!(history.save_edited_text("draft").unwrap());
        assert_eq!(history.clips().len(), 2);
        assert_eq!(history.clips()[0].text(), Some("draft"));
        assert_eq!(history.clips()[0].owner.as_deref(), Some(""));
        assert!(history.owners().get("/usr/bin/editor").is_none());
    }

    struct FakeBackend(Mutex<Vec<ClipboardFormat>>);

    impl ClipboardBackend for FakeBackend {
        fn set_clipboard_data(&self, formats: &[crate::native::OutgoingFormat]) -> bool {
            self.0.lock().extend(formats.iter().map(|f| f.format));
            true
        }
    }

    #[test]
    fn test_set_clipboard_data_skips_missing_payloads() {
        let dir = tempfile::tempdir().unwrap();
        let mut history = open(dir.path());
        let mut capture = text_capture("<b>x</b>", None);
        capture
            .records
            .push(FormatRecord::new(ClipboardFormat::Html, b"<b>x</b>".to_vec(), vec![4; 32]));
        history.ingest(capture, at(0)).unwrap();
        let clip = history.clips()[0].clone();
        std::fs::remove_file(&clip.data[&ClipboardFormat::Html].data).unwrap();

        let backend = FakeBackend(Mutex::new(Vec::new()));
        assert!(history.set_clipboard_data(clip.id, &backend));
        assert_eq!(*backend.0.lock(), vec![ClipboardFormat::Text]);
    }

    #[test]
    fn test_enrichment_result_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let mut history = open(dir.path());
        history.ingest(text_capture("https://example.com", None), at(0)).unwrap();
        let clip = history.clips()[0].clone();
        let data_id = clip.data[&ClipboardFormat::Text].id;

        history.link_enricher().submit(crate::link_metadata::Enrichment {
            clip_id: clip.id,
            data_id,
            metadata: crate::models::LinkMetadata {
                url: "https://example.com".into(),
                title: Some("Example".into()),
                description: None,
                image: None,
            },
        });
        assert_eq!(history.apply_pending_enrichments().unwrap(), 1);
        drop(history);

        let reopened = open(dir.path());
        match &reopened.clips()[0].data[&ClipboardFormat::Text].metadata {
            Some(Metadata::Link(link)) => assert_eq!(link.title.as_deref(), Some("Example")),
            other => panic!("expected link metadata, got {other:?}"),
        }
    }
}
