//! SQLite persistence for the clipboard history
//!
//! Normalized schema: `Owners`, `Clips`, `Data` with per-format payloads, and
//! `LinkMetadata`/`FilesMetadata`/`Tags`/`ClipTags` hanging off them. Schema
//! changes go through the migration chain in `migrations`.
//!
//! Uses an r2d2 pool; every public method checks a connection out for the
//! duration of one logical operation.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension};
use thiserror::Error;
use tracing::{info, warn};

use crate::codec::{FormatCodec, FILES_SEPARATOR};
use crate::interface::ClipboardFormat;
use crate::migrations::{self, MigrationContext, Operator};
use crate::models::{
    format_db_time, now_local, parse_db_time, Clip, DataModel, FilesMetadata, LinkMetadata,
    Metadata, Owner, Tag, UNKNOWN_OWNER_PATH,
};
use crate::owners::OwnerNameResolver;

/// File name of the database inside the history root and inside archives
pub const DATABASE_FILE_NAME: &str = "ClipboardManager.db";

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Database schema version {found} is newer than supported version {supported}")]
    UnsupportedVersion { found: u32, supported: u32 },
    #[error("Migration to version {version} aborted: {reason}")]
    MigrationAborted { version: u32, reason: String },
    #[error("Unknown schema version {0}")]
    UnknownVersion(u32),
}

pub type DatabaseResult<T> = Result<T, DatabaseError>;

fn read_time(value: &str) -> NaiveDateTime {
    parse_db_time(value).unwrap_or_else(now_local)
}

/// Journal mode per database role. Satellite databases are zipped right after
/// writing, so they keep everything in the main file.
#[derive(Debug, Clone, Copy)]
enum Journal {
    Wal,
    Delete,
}

/// Thread-safe database wrapper using connection pooling
pub struct Database {
    pool: Pool<SqliteConnectionManager>,
    codec: FormatCodec,
    path: PathBuf,
}

impl Database {
    /// Open or create the history database and bring its schema up to date.
    ///
    /// `history_root` is where payload files live; stored file names resolve against it.
    pub fn open(
        path: impl AsRef<Path>,
        history_root: impl Into<PathBuf>,
        resolver: &dyn OwnerNameResolver,
        operator: &dyn Operator,
    ) -> DatabaseResult<Self> {
        Self::open_with(path.as_ref(), history_root.into(), resolver, operator, Journal::Wal)
    }

    /// Open a standalone database used inside transfer archives
    pub fn open_satellite(
        path: impl AsRef<Path>,
        history_root: impl Into<PathBuf>,
        resolver: &dyn OwnerNameResolver,
        operator: &dyn Operator,
    ) -> DatabaseResult<Self> {
        Self::open_with(path.as_ref(), history_root.into(), resolver, operator, Journal::Delete)
    }

    fn open_with(
        path: &Path,
        history_root: PathBuf,
        resolver: &dyn OwnerNameResolver,
        operator: &dyn Operator,
        journal: Journal,
    ) -> DatabaseResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let manager = SqliteConnectionManager::file(path).with_init(move |conn| {
            let mode = match journal {
                Journal::Wal => "WAL",
                Journal::Delete => "DELETE",
            };
            conn.execute_batch(&format!(
                "PRAGMA journal_mode={mode};
                 PRAGMA synchronous=NORMAL;
                 PRAGMA foreign_keys=ON;"
            ))?;
            Ok(())
        });

        let pool = Pool::builder().max_size(4).build(manager)?;

        let db = Self {
            pool,
            codec: FormatCodec::new(history_root),
            path: path.to_path_buf(),
        };
        db.run_migrations(resolver, operator)?;
        Ok(db)
    }

    /// Get a connection from the pool
    fn get_conn(&self) -> DatabaseResult<PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn context<'a>(&'a self, resolver: &'a dyn OwnerNameResolver) -> MigrationContext<'a> {
        MigrationContext {
            codec: &self.codec,
            resolver,
        }
    }

    fn run_migrations(
        &self,
        resolver: &dyn OwnerNameResolver,
        operator: &dyn Operator,
    ) -> DatabaseResult<()> {
        let mut conn = self.get_conn()?;
        let before = migrations::schema_version(&conn)?;
        let after = migrations::run_pending(&mut conn, &self.context(resolver), operator)?;
        if after != before {
            info!(from = before, to = after, path = %self.path.display(), "database migrated");
        }
        Ok(())
    }

    /// Move the schema up or down to `target`
    pub fn migrate_to(&self, target: u32, resolver: &dyn OwnerNameResolver) -> DatabaseResult<u32> {
        let mut conn = self.get_conn()?;
        migrations::migrate_to(&mut conn, target, &self.context(resolver))
    }

    pub fn schema_version(&self) -> DatabaseResult<u32> {
        let conn = self.get_conn()?;
        migrations::schema_version(&conn)
    }

    /// Get the database size in bytes
    pub fn database_size(&self) -> DatabaseResult<i64> {
        let conn = self.get_conn()?;
        let page_count: i64 = conn.query_row("PRAGMA page_count", [], |row| row.get(0))?;
        let page_size: i64 = conn.query_row("PRAGMA page_size", [], |row| row.get(0))?;
        Ok(page_count * page_size)
    }

    pub fn count_clips(&self) -> DatabaseResult<u64> {
        let conn = self.get_conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM Clips", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    fn vacuum(&self) {
        let result = self.get_conn().and_then(|conn| Ok(conn.execute_batch("VACUUM")?));
        if let Err(e) = result {
            warn!(error = %e, "VACUUM failed");
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Owners
    // ─────────────────────────────────────────────────────────────────────────

    pub fn get_owners(&self) -> DatabaseResult<Vec<Owner>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare("SELECT Id, Path, Name, Icon FROM Owners")?;
        let owners = stmt
            .query_map([], |row| {
                Ok(Owner {
                    id: row.get(0)?,
                    path: row.get(1)?,
                    name: row.get(2)?,
                    icon: row.get(3)?,
                    clips_count: 0,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(owners)
    }

    /// Insert an owner and return its id
    pub fn add_owner(&self, owner: &Owner) -> DatabaseResult<i64> {
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO Owners (Path, Name, Icon) VALUES (?1, ?2, ?3)",
            params![owner.path, owner.name, owner.icon],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn update_owner(&self, owner: &Owner) -> DatabaseResult<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "UPDATE Owners SET Path = ?1, Name = ?2, Icon = ?3 WHERE Id = ?4",
            params![owner.path, owner.name, owner.icon, owner.id],
        )?;
        Ok(())
    }

    pub fn delete_owner(&self, id: i64) -> DatabaseResult<()> {
        let conn = self.get_conn()?;
        conn.execute("DELETE FROM Owners WHERE Id = ?1", [id])?;
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Tags
    // ─────────────────────────────────────────────────────────────────────────

    /// Tags with their clip back references
    pub fn get_tags(&self) -> DatabaseResult<Vec<Tag>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare("SELECT Id, Name, Color, IsCleaningEnabled FROM Tags")?;
        let mut tags = stmt
            .query_map([], |row| {
                Ok(Tag {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    color_hex: row.get(2)?,
                    is_cleaning_enabled: row.get(3)?,
                    clips: BTreeSet::new(),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let index: HashMap<i64, usize> = tags.iter().enumerate().map(|(i, t)| (t.id, i)).collect();
        let mut stmt = conn.prepare("SELECT ClipId, TagId FROM ClipTags")?;
        let links = stmt
            .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        for (clip_id, tag_id) in links {
            if let Some(&i) = index.get(&tag_id) {
                tags[i].clips.insert(clip_id);
            }
        }
        Ok(tags)
    }

    pub fn add_tag(&self, tag: &Tag) -> DatabaseResult<i64> {
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO Tags (Name, Color, IsCleaningEnabled) VALUES (?1, ?2, ?3)",
            params![tag.name, tag.color_hex, tag.is_cleaning_enabled],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn update_tag(&self, tag: &Tag) -> DatabaseResult<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "UPDATE Tags SET Name = ?1, Color = ?2, IsCleaningEnabled = ?3 WHERE Id = ?4",
            params![tag.name, tag.color_hex, tag.is_cleaning_enabled, tag.id],
        )?;
        Ok(())
    }

    pub fn delete_tag(&self, id: i64) -> DatabaseResult<()> {
        let conn = self.get_conn()?;
        conn.execute("DELETE FROM Tags WHERE Id = ?1", [id])?;
        Ok(())
    }

    pub fn add_clip_tag(&self, clip_id: i64, tag_id: i64) -> DatabaseResult<()> {
        self.add_clip_tags(&[(clip_id, tag_id)])
    }

    /// Insert `(clip_id, tag_id)` links in one transaction
    pub fn add_clip_tags(&self, links: &[(i64, i64)]) -> DatabaseResult<()> {
        let conn = self.get_conn()?;
        let tx = conn.unchecked_transaction()?;
        {
            let mut stmt =
                tx.prepare("INSERT OR IGNORE INTO ClipTags (ClipId, TagId) VALUES (?1, ?2)")?;
            for (clip_id, tag_id) in links {
                stmt.execute(params![clip_id, tag_id])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn delete_clip_tag(&self, clip_id: i64, tag_id: i64) -> DatabaseResult<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "DELETE FROM ClipTags WHERE ClipId = ?1 AND TagId = ?2",
            params![clip_id, tag_id],
        )?;
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Clips
    // ─────────────────────────────────────────────────────────────────────────

    /// Insert a clip with its data rows and metadata. Assigns `clip.id` and
    /// every `DataModel::id`. `owner_id` is `None` for the unknown owner.
    pub fn add_clip(&self, clip: &mut Clip, owner_id: Option<i64>) -> DatabaseResult<()> {
        let conn = self.get_conn()?;
        let tx = conn.unchecked_transaction()?;

        tx.execute(
            "INSERT INTO Clips (ClipTime, IsFavorite, OwnerId) VALUES (?1, ?2, ?3)",
            params![format_db_time(&clip.clip_time), clip.is_favorite, owner_id],
        )?;
        clip.id = tx.last_insert_rowid();

        for data in clip.data.values_mut() {
            tx.execute(
                "INSERT INTO Data (ClipId, Format, Data, Hash, MetadataFormat) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    clip.id,
                    data.format.store_name(),
                    FormatCodec::stored_value(data),
                    data.hash,
                    data.metadata.as_ref().map(Metadata::kind),
                ],
            )?;
            data.id = tx.last_insert_rowid();
            if let Some(metadata) = &data.metadata {
                Self::insert_metadata_rows(&tx, data.id, metadata)?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    fn insert_metadata_rows(
        conn: &rusqlite::Connection,
        data_id: i64,
        metadata: &Metadata,
    ) -> DatabaseResult<()> {
        match metadata {
            Metadata::Link(link) => {
                conn.execute(
                    "INSERT OR REPLACE INTO LinkMetadata (Id, Url, Title, Description, Image) VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![data_id, link.url, link.title, link.description, link.image],
                )?;
            }
            Metadata::Files(files) => {
                conn.execute(
                    "INSERT OR REPLACE INTO FilesMetadata (Id, FilesCount, FoldersCount) VALUES (?1, ?2, ?3)",
                    params![data_id, files.files_count, files.folders_count],
                )?;
            }
            Metadata::Color => {}
        }
        Ok(())
    }

    fn set_metadata(&self, data_id: i64, metadata: &Metadata) -> DatabaseResult<()> {
        let conn = self.get_conn()?;
        let tx = conn.unchecked_transaction()?;
        tx.execute(
            "UPDATE Data SET MetadataFormat = ?1 WHERE Id = ?2",
            params![metadata.kind(), data_id],
        )?;
        Self::insert_metadata_rows(&tx, data_id, metadata)?;
        tx.commit()?;
        Ok(())
    }

    pub fn add_link_metadata(&self, data_id: i64, link: &LinkMetadata) -> DatabaseResult<()> {
        self.set_metadata(data_id, &Metadata::Link(link.clone()))
    }

    pub fn add_files_metadata(&self, data_id: i64, files: &FilesMetadata) -> DatabaseResult<()> {
        self.set_metadata(data_id, &Metadata::Files(files.clone()))
    }

    pub fn add_color_metadata(&self, data_id: i64) -> DatabaseResult<()> {
        self.set_metadata(data_id, &Metadata::Color)
    }

    /// Persist time, favorite flag and owner of an existing clip
    pub fn update_clip(&self, clip: &Clip, owner_id: Option<i64>) -> DatabaseResult<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "UPDATE Clips SET ClipTime = ?1, IsFavorite = ?2, OwnerId = ?3 WHERE Id = ?4",
            params![format_db_time(&clip.clip_time), clip.is_favorite, owner_id, clip.id],
        )?;
        Ok(())
    }

    /// Delete a clip; data rows, metadata and tag links cascade
    pub fn delete_clip(&self, id: i64) -> DatabaseResult<()> {
        let conn = self.get_conn()?;
        conn.execute("DELETE FROM Clips WHERE Id = ?1", [id])?;
        Ok(())
    }

    /// Delete clips older than `cutoff`. Favorites survive unless included;
    /// clips carrying a tag with cleaning disabled always survive.
    pub fn delete_old_clips_by_time(
        &self,
        cutoff: NaiveDateTime,
        include_favorites: bool,
    ) -> DatabaseResult<usize> {
        let deleted = {
            let conn = self.get_conn()?;
            conn.execute(
                r#"DELETE FROM Clips
                   WHERE ClipTime < ?1
                     AND (?2 OR NOT IsFavorite)
                     AND Id NOT IN (
                       SELECT ct.ClipId FROM ClipTags ct
                       JOIN Tags t ON t.Id = ct.TagId
                       WHERE NOT t.IsCleaningEnabled
                     )"#,
                params![format_db_time(&cutoff), include_favorites],
            )?
        };
        self.vacuum();
        Ok(deleted)
    }

    /// Delete eligible clips outside the newest `quantity` clips
    pub fn delete_old_clips_by_quantity(
        &self,
        quantity: u32,
        include_favorites: bool,
    ) -> DatabaseResult<usize> {
        let deleted = {
            let conn = self.get_conn()?;
            conn.execute(
                r#"DELETE FROM Clips WHERE Id IN (
                     SELECT Id FROM Clips
                     WHERE (?2 OR NOT IsFavorite)
                       AND Id NOT IN (
                         SELECT ct.ClipId FROM ClipTags ct
                         JOIN Tags t ON t.Id = ct.TagId
                         WHERE NOT t.IsCleaningEnabled
                       )
                     ORDER BY ClipTime DESC, Id DESC
                     LIMIT -1 OFFSET ?1
                   )"#,
                params![quantity, include_favorites],
            )?
        };
        self.vacuum();
        Ok(deleted)
    }

    /// Remove every clip and owner. Tags are kept.
    pub fn delete_all_clips(&self) -> DatabaseResult<()> {
        {
            let conn = self.get_conn()?;
            let tx = conn.unchecked_transaction()?;
            tx.execute_batch("DELETE FROM Clips; DELETE FROM Owners;")?;
            tx.commit()?;
        }
        self.vacuum();
        Ok(())
    }

    /// Rebuild every clip with its data, metadata and tag ids, newest first.
    ///
    /// `owners` maps owner ids to owner keys; clips without a known owner get
    /// the unknown owner.
    pub fn get_clips(&self, owners: &HashMap<i64, String>) -> DatabaseResult<Vec<Clip>> {
        let conn = self.get_conn()?;
        let tx = conn.unchecked_transaction()?;

        let mut clips = {
            let mut stmt = tx.prepare(
                "SELECT Id, ClipTime, IsFavorite, OwnerId FROM Clips ORDER BY ClipTime DESC, Id DESC",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    let owner_id: Option<i64> = row.get(3)?;
                    let time: String = row.get(1)?;
                    let mut clip = Clip::new(read_time(&time));
                    clip.id = row.get(0)?;
                    clip.is_favorite = row.get(2)?;
                    clip.owner = Some(
                        owner_id
                            .and_then(|id| owners.get(&id).cloned())
                            .unwrap_or_else(|| UNKNOWN_OWNER_PATH.to_string()),
                    );
                    Ok(clip)
                })?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };
        let index: HashMap<i64, usize> = clips.iter().enumerate().map(|(i, c)| (c.id, i)).collect();

        {
            let mut stmt = tx.prepare(
                r#"SELECT d.Id, d.ClipId, d.Format, d.Data, d.Hash, d.MetadataFormat,
                          l.Url, l.Title, l.Description, l.Image,
                          f.FilesCount, f.FoldersCount
                   FROM Data d
                   LEFT JOIN LinkMetadata l ON l.Id = d.Id
                   LEFT JOIN FilesMetadata f ON f.Id = d.Id"#,
            )?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let clip_id: i64 = row.get(1)?;
                let format_name: String = row.get(2)?;
                let (Some(&i), Some(format)) =
                    (index.get(&clip_id), ClipboardFormat::from_store_name(&format_name))
                else {
                    continue;
                };
                let stored: String = row.get(3)?;
                let mut data = DataModel::new(format, self.codec.full_path(format, &stored), row.get(4)?);
                data.id = row.get(0)?;

                let metadata_kind: Option<String> = row.get(5)?;
                data.metadata = match metadata_kind.as_deref() {
                    Some("Link") => match row.get::<_, Option<String>>(6)? {
                        Some(url) => Some(Metadata::Link(LinkMetadata {
                            url,
                            title: row.get(7)?,
                            description: row.get(8)?,
                            image: row.get(9)?,
                        })),
                        None => None,
                    },
                    Some("Files") => Some(Metadata::Files(FilesMetadata {
                        files_count: row.get::<_, Option<u32>>(10)?.unwrap_or(0),
                        folders_count: row.get::<_, Option<u32>>(11)?.unwrap_or(0),
                        paths: stored
                            .split(FILES_SEPARATOR)
                            .filter(|p| !p.is_empty())
                            .map(str::to_string)
                            .collect(),
                    })),
                    Some("Color") => Some(Metadata::Color),
                    _ => None,
                };

                let clip = &mut clips[i];
                if format == ClipboardFormat::Text {
                    clip.is_link = crate::content_detection::is_link(&data.data);
                }
                clip.data.insert(format, data);
            }
        }

        {
            let mut stmt = tx.prepare("SELECT ClipId, TagId FROM ClipTags")?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let clip_id: i64 = row.get(0)?;
                if let Some(&i) = index.get(&clip_id) {
                    clips[i].tags.insert(row.get(1)?);
                }
            }
        }

        tx.commit()?;
        Ok(clips)
    }

    /// Id of the owner row for `path`, if persisted
    pub fn find_owner_id(&self, path: &str) -> DatabaseResult<Option<i64>> {
        let conn = self.get_conn()?;
        Ok(conn
            .query_row("SELECT Id FROM Owners WHERE Path = ?1", [path], |row| row.get(0))
            .optional()?)
    }
}
