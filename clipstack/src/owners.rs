//! Owner Registry
//!
//! Reference-counted map of source applications keyed by executable path.
//! Every clip holding `Some(key)` in `Clip::owner` accounts for one reference.
//! The unknown owner (empty path) is never persisted and never evicted.

use std::collections::HashMap;
use std::path::Path;

use tracing::debug;

use crate::database::{Database, DatabaseResult};
use crate::models::{Clip, Owner, UNKNOWN_OWNER_ID, UNKNOWN_OWNER_PATH};

/// Resolves a display name for an executable path
pub trait OwnerNameResolver: Send + Sync {
    fn resolve(&self, path: &str) -> Option<String>;
}

/// Uses the executable's file stem (`/usr/bin/gedit` → `gedit`)
#[derive(Debug, Clone, Copy, Default)]
pub struct FileStemResolver;

impl OwnerNameResolver for FileStemResolver {
    fn resolve(&self, path: &str) -> Option<String> {
        // Paths captured on Windows keep their backslashes.
        let normalized = path.replace('\\', "/");
        Path::new(&normalized)
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .filter(|stem| !stem.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OwnerEvent {
    /// First clip of this owner appeared
    Registered(Owner),
    /// Last clip of the owner at this path is gone
    Unregistered(String),
    AllUnregistered,
}

pub struct OwnerRegistry {
    owners: HashMap<String, Owner>,
    resolver: Box<dyn OwnerNameResolver>,
    events: Vec<OwnerEvent>,
}

impl OwnerRegistry {
    pub fn new(resolver: Box<dyn OwnerNameResolver>) -> Self {
        let mut owners = HashMap::new();
        owners.insert(UNKNOWN_OWNER_PATH.to_string(), Owner::unknown());
        Self {
            owners,
            resolver,
            events: Vec::new(),
        }
    }

    pub fn resolver(&self) -> &dyn OwnerNameResolver {
        self.resolver.as_ref()
    }

    /// Replace the map with the persisted owners. Returns the id → key map
    /// needed to rebuild clips.
    pub fn load(&mut self, db: &Database) -> DatabaseResult<HashMap<i64, String>> {
        self.owners.clear();
        self.owners
            .insert(UNKNOWN_OWNER_PATH.to_string(), Owner::unknown());
        let mut keys = HashMap::new();
        for owner in db.get_owners()? {
            keys.insert(owner.id, owner.path.clone());
            self.owners.insert(owner.path.clone(), owner);
        }
        Ok(keys)
    }

    /// Recount references from the loaded clips
    pub fn rebuild_counts(&mut self, clips: &[Clip]) {
        for owner in self.owners.values_mut() {
            owner.clips_count = 0;
        }
        for key in clips.iter().filter_map(|clip| clip.owner.as_deref()) {
            if let Some(owner) = self.owners.get_mut(key) {
                owner.clips_count += 1;
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&Owner> {
        self.owners.get(key)
    }

    pub fn owners(&self) -> impl Iterator<Item = &Owner> {
        self.owners.values()
    }

    /// Store id for `key`; `None` for the unknown owner or unknown keys
    pub fn owner_id(&self, key: Option<&str>) -> Option<i64> {
        key.and_then(|k| self.owners.get(k))
            .map(|owner| owner.id)
            .filter(|id| *id != UNKNOWN_OWNER_ID)
    }

    pub fn take_events(&mut self) -> Vec<OwnerEvent> {
        std::mem::take(&mut self.events)
    }

    /// Attach `clip` to the owner at `path`, creating the owner when needed.
    pub fn register_clip_owner(
        &mut self,
        db: &Database,
        clip: &mut Clip,
        path: Option<&str>,
        icon: Option<Vec<u8>>,
    ) -> DatabaseResult<String> {
        self.register(db, clip, path, icon, None)
    }

    /// Like `register_clip_owner`, using `name` when the resolver finds none
    pub fn register_imported_owner(
        &mut self,
        db: &Database,
        clip: &mut Clip,
        imported: &Owner,
    ) -> DatabaseResult<String> {
        self.register(
            db,
            clip,
            Some(imported.path.as_str()),
            imported.icon.clone(),
            imported.name.clone(),
        )
    }

    fn register(
        &mut self,
        db: &Database,
        clip: &mut Clip,
        path: Option<&str>,
        icon: Option<Vec<u8>>,
        fallback_name: Option<String>,
    ) -> DatabaseResult<String> {
        let key = path.unwrap_or(UNKNOWN_OWNER_PATH).to_string();

        if !self.owners.contains_key(&key) {
            let name = self.resolver.resolve(&key).or(fallback_name);
            let mut owner = Owner::new(key.clone(), name, icon);
            owner.id = db.add_owner(&owner)?;
            debug!(path = %key, id = owner.id, "new owner");
            self.owners.insert(key.clone(), owner);
        } else if !key.is_empty() {
            let resolved = self.resolver.resolve(&key);
            if let Some(owner) = self.owners.get_mut(&key) {
                // An imported name only fills a gap.
                let name = match resolved {
                    Some(name) => Some(name),
                    None if owner.name.is_none() => fallback_name,
                    None => None,
                };
                let mut changed = false;
                if name.is_some() && name != owner.name {
                    owner.name = name;
                    changed = true;
                }
                if icon.is_some() && icon != owner.icon {
                    owner.icon = icon;
                    changed = true;
                }
                if changed {
                    db.update_owner(owner)?;
                }
            }
        }

        let Some(owner) = self.owners.get_mut(&key) else {
            return Ok(key);
        };
        owner.clips_count += 1;
        if owner.clips_count == 1 {
            self.events.push(OwnerEvent::Registered(owner.clone()));
        }
        clip.owner = Some(key.clone());
        Ok(key)
    }

    /// Release the reference `clip` holds. Always clears `clip.owner`.
    pub fn unregister_clip_owner(&mut self, db: &Database, clip: &mut Clip) -> DatabaseResult<()> {
        let Some(key) = clip.owner.take() else {
            return Ok(());
        };
        let Some(owner) = self.owners.get_mut(&key) else {
            return Ok(());
        };
        owner.clips_count = owner.clips_count.saturating_sub(1);
        if owner.clips_count > 0 || owner.is_unknown() {
            return Ok(());
        }

        if let Some(owner) = self.owners.remove(&key) {
            db.delete_owner(owner.id)?;
            debug!(path = %key, "owner evicted");
            self.events.push(OwnerEvent::Unregistered(key));
        }
        Ok(())
    }

    /// Forget every owner except the unknown one. The store is cleared by the caller.
    pub fn unregister_all_owners(&mut self) {
        self.owners.retain(|_, owner| owner.is_unknown());
        if let Some(unknown) = self.owners.get_mut(UNKNOWN_OWNER_PATH) {
            unknown.clips_count = 0;
        }
        self.events.push(OwnerEvent::AllUnregistered);
    }
}
