//! Tag Registry
//!
//! Tags live here keyed by id; clips hold the tag ids and each tag keeps
//! the ids of its clips. Both sides are updated together with the store.

use std::collections::BTreeMap;

use tracing::debug;

use crate::database::{Database, DatabaseResult};
use crate::models::{Clip, Tag};

#[derive(Debug, Default)]
pub struct TagRegistry {
    tags: BTreeMap<i64, Tag>,
}

impl TagRegistry {
    pub fn load(db: &Database) -> DatabaseResult<Self> {
        let tags = db.get_tags()?.into_iter().map(|t| (t.id, t)).collect();
        Ok(Self { tags })
    }

    pub fn tags(&self) -> impl Iterator<Item = &Tag> {
        self.tags.values()
    }

    pub fn get(&self, id: i64) -> Option<&Tag> {
        self.tags.get(&id)
    }

    /// Tag with exactly this name and color
    pub fn find(&self, name: &str, color_hex: &str) -> Option<&Tag> {
        self.tags
            .values()
            .find(|t| t.name == name && t.color_hex.eq_ignore_ascii_case(color_hex))
    }

    /// Whether any tag on `clip` exempts it from retention
    pub fn protects(&self, clip: &Clip) -> bool {
        clip.tags
            .iter()
            .filter_map(|id| self.tags.get(id))
            .any(|tag| !tag.is_cleaning_enabled)
    }

    pub fn register_tag(
        &mut self,
        db: &Database,
        name: &str,
        color_hex: &str,
        is_cleaning_enabled: bool,
    ) -> DatabaseResult<i64> {
        let mut tag = Tag::new(name.to_string(), color_hex.to_string(), is_cleaning_enabled);
        tag.id = db.add_tag(&tag)?;
        debug!(id = tag.id, name, "tag registered");
        let id = tag.id;
        self.tags.insert(id, tag);
        Ok(id)
    }

    /// Remove a tag and its links from every clip in `clips`
    pub fn unregister_tag(&mut self, db: &Database, id: i64, clips: &mut [Clip]) -> DatabaseResult<bool> {
        let Some(tag) = self.tags.remove(&id) else {
            return Ok(false);
        };
        db.delete_tag(id)?;
        for clip in clips.iter_mut().filter(|c| tag.clips.contains(&c.id)) {
            clip.tags.remove(&id);
        }
        Ok(true)
    }

    /// Rename, recolor or toggle cleaning; clip links are untouched.
    pub fn update_tag(
        &mut self,
        db: &Database,
        id: i64,
        name: &str,
        color_hex: &str,
        is_cleaning_enabled: bool,
    ) -> DatabaseResult<bool> {
        let Some(tag) = self.tags.get_mut(&id) else {
            return Ok(false);
        };
        tag.name = name.to_string();
        tag.color_hex = color_hex.to_string();
        tag.is_cleaning_enabled = is_cleaning_enabled;
        db.update_tag(tag)?;
        Ok(true)
    }

    pub fn add_clip_to_tag(&mut self, db: &Database, clip: &mut Clip, tag_id: i64) -> DatabaseResult<bool> {
        let Some(tag) = self.tags.get_mut(&tag_id) else {
            return Ok(false);
        };
        if !tag.clips.insert(clip.id) {
            return Ok(false);
        }
        db.add_clip_tag(clip.id, tag_id)?;
        clip.tags.insert(tag_id);
        Ok(true)
    }

    pub fn remove_clip_from_tag(
        &mut self,
        db: &Database,
        clip: &mut Clip,
        tag_id: i64,
    ) -> DatabaseResult<bool> {
        let Some(tag) = self.tags.get_mut(&tag_id) else {
            return Ok(false);
        };
        if !tag.clips.remove(&clip.id) {
            return Ok(false);
        }
        db.delete_clip_tag(clip.id, tag_id)?;
        clip.tags.remove(&tag_id);
        Ok(true)
    }

    /// Drop back references to a deleted clip. Store links go with the clip row.
    pub fn forget_clip(&mut self, clip: &Clip) {
        for id in &clip.tags {
            if let Some(tag) = self.tags.get_mut(id) {
                tag.clips.remove(&clip.id);
            }
        }
    }

    /// Record links already persisted (archive import)
    pub fn link_persisted(&mut self, clip: &mut Clip, tag_id: i64) {
        if let Some(tag) = self.tags.get_mut(&tag_id) {
            tag.clips.insert(clip.id);
            clip.tags.insert(tag_id);
        }
    }

    pub fn clear_clip_references(&mut self) {
        for tag in self.tags.values_mut() {
            tag.clips.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::tests::open_temp;
    use crate::interface::ClipboardFormat;
    use crate::models::{now_local, DataModel};

    fn stored_clip(db: &Database) -> Clip {
        let mut clip = Clip::new(now_local());
        clip.data.insert(
            ClipboardFormat::Text,
            DataModel::new(ClipboardFormat::Text, "t".into(), vec![1]),
        );
        db.add_clip(&mut clip, None).unwrap();
        clip
    }

    #[test]
    fn test_links_are_kept_on_both_sides() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_temp(dir.path());
        let mut tags = TagRegistry::load(&db).unwrap();
        let mut clip = stored_clip(&db);
        let id = tags.register_tag(&db, "work", "#FF0000", true).unwrap();

        assert!(tags.add_clip_to_tag(&db, &mut clip, id).unwrap());
        assert!(!tags.add_clip_to_tag(&db, &mut clip, id).unwrap());
        assert!(clip.tags.contains(&id));
        assert!(tags.get(id).unwrap().clips.contains(&clip.id));

        let reloaded = TagRegistry::load(&db).unwrap();
        assert!(reloaded.get(id).unwrap().clips.contains(&clip.id));

        assert!(tags.remove_clip_from_tag(&db, &mut clip, id).unwrap());
        assert!(clip.tags.is_empty());
        assert!(TagRegistry::load(&db).unwrap().get(id).unwrap().clips.is_empty());
    }

    #[test]
    fn test_unregister_tag_unlinks_clips() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_temp(dir.path());
        let mut tags = TagRegistry::load(&db).unwrap();
        let mut clips = vec![stored_clip(&db), stored_clip(&db)];
        let id = tags.register_tag(&db, "keep", "#00FF00", false).unwrap();
        for clip in &mut clips {
            tags.add_clip_to_tag(&db, clip, id).unwrap();
        }
        assert!(tags.protects(&clips[0]));

        assert!(tags.unregister_tag(&db, id, &mut clips).unwrap());
        assert!(clips.iter().all(|c| c.tags.is_empty()));
        assert!(db.get_tags().unwrap().is_empty());
        assert!(!tags.unregister_tag(&db, id, &mut clips).unwrap());
    }

    #[test]
    fn test_update_and_find() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_temp(dir.path());
        let mut tags = TagRegistry::load(&db).unwrap();
        let id = tags.register_tag(&db, "a", "#111111", true).unwrap();
        assert!(tags.update_tag(&db, id, "b", "#222222", false).unwrap());
        assert_eq!(tags.find("b", "#222222").map(|t| t.id), Some(id));
        assert!(tags.find("a", "#111111").is_none());
        let stored = &db.get_tags().unwrap()[0];
        assert_eq!(stored.name, "b");
        assert!(!stored.is_cleaning_enabled);
    }
}
