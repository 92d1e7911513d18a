//! Versioned schema migrations
//!
//! The chain is a static array of `Migration` units, sorted once by version.
//! `PRAGMA user_version` holds the applied version. Every unit runs in its own
//! transaction together with the version bump, so a failed step leaves the
//! database at the previous version.

use std::collections::{BTreeMap, HashMap};

use base64::Engine;
use once_cell::sync::Lazy;
use rusqlite::{params, Connection, Transaction};
use sha2::{Digest, Sha256};
use tracing::{error, info, warn};

use crate::codec::FormatCodec;
use crate::content_detection::{files_metadata, is_link};
use crate::database::{DatabaseError, DatabaseResult};
use crate::interface::ClipboardFormat;
use crate::models::{format_db_time, now_local, parse_db_time};
use crate::owners::OwnerNameResolver;

/// What a migration step may need besides the connection
pub struct MigrationContext<'a> {
    pub codec: &'a FormatCodec,
    pub resolver: &'a dyn OwnerNameResolver,
}

pub type MigrationFn = fn(&Transaction<'_>, &MigrationContext<'_>) -> DatabaseResult<()>;

pub struct Migration {
    pub version: u32,
    pub name: &'static str,
    pub up: MigrationFn,
    pub down: MigrationFn,
}

pub static MIGRATIONS: &[Migration] = &[
    Migration { version: 1, name: "InitialCreate", up: initial_create_up, down: initial_create_down },
    Migration { version: 2, name: "NormalizeClips", up: normalize_up, down: normalize_down },
    Migration { version: 3, name: "Tags", up: tags_up, down: tags_down },
    Migration { version: 4, name: "FilesMetadata", up: files_metadata_up, down: files_metadata_down },
    Migration { version: 5, name: "TagCleaning", up: tag_cleaning_up, down: tag_cleaning_down },
];

static ORDERED: Lazy<Vec<&'static Migration>> = Lazy::new(|| {
    let mut ordered: Vec<_> = MIGRATIONS.iter().collect();
    ordered.sort_by_key(|m| m.version);
    ordered
});

pub fn latest_version() -> u32 {
    ORDERED.last().map_or(0, |m| m.version)
}

pub fn schema_version(conn: &Connection) -> DatabaseResult<u32> {
    let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    Ok(version as u32)
}

// ═══════════════════════════════════════════════════════════════════════════════
// OPERATOR
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationDecision {
    Retry,
    Abort,
}

/// Whoever supervises the process: answers migration failures and handles
/// unrecoverable store errors.
pub trait Operator: Send + Sync {
    fn migration_failed(&self, version: u32, error: &DatabaseError) -> MigrationDecision;

    /// Report an unrecoverable error and terminate.
    fn fatal(&self, message: &str) -> !;
}

/// Non-interactive operator: never retries, exits the process on fatal errors
pub struct AbortOperator;

impl Operator for AbortOperator {
    fn migration_failed(&self, version: u32, error: &DatabaseError) -> MigrationDecision {
        error!(version, error = %error, "migration failed, aborting");
        MigrationDecision::Abort
    }

    fn fatal(&self, message: &str) -> ! {
        error!(message, "unrecoverable store error");
        std::process::exit(1)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RUNNER
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Clone, Copy)]
enum Direction {
    Up,
    Down,
}

fn apply_step(
    conn: &mut Connection,
    migration: &Migration,
    direction: Direction,
    ctx: &MigrationContext<'_>,
) -> DatabaseResult<()> {
    let tx = conn.transaction()?;
    let new_version = match direction {
        Direction::Up => {
            (migration.up)(&tx, ctx)?;
            migration.version
        }
        Direction::Down => {
            (migration.down)(&tx, ctx)?;
            previous_version(migration.version)
        }
    };
    tx.pragma_update(None, "user_version", new_version)?;
    tx.commit()?;
    info!(
        name = migration.name,
        version = new_version,
        down = matches!(direction, Direction::Down),
        "applied migration"
    );
    Ok(())
}

fn previous_version(version: u32) -> u32 {
    ORDERED
        .iter()
        .map(|m| m.version)
        .filter(|v| *v < version)
        .max()
        .unwrap_or(0)
}

fn apply_up(
    conn: &mut Connection,
    from: u32,
    to: u32,
    ctx: &MigrationContext<'_>,
) -> Result<u32, (u32, DatabaseError)> {
    let mut version = from;
    for migration in ORDERED.iter().filter(|m| m.version > from && m.version <= to) {
        apply_step(conn, migration, Direction::Up, ctx).map_err(|e| (migration.version, e))?;
        version = migration.version;
    }
    Ok(version)
}

/// Apply every pending migration. On failure the operator decides between
/// another full pass and giving up.
pub fn run_pending(
    conn: &mut Connection,
    ctx: &MigrationContext<'_>,
    operator: &dyn Operator,
) -> DatabaseResult<u32> {
    let latest = latest_version();
    loop {
        let current = schema_version(conn)?;
        if current > latest {
            return Err(DatabaseError::UnsupportedVersion { found: current, supported: latest });
        }
        match apply_up(conn, current, latest, ctx) {
            Ok(version) => return Ok(version),
            Err((version, error)) => {
                warn!(version, error = %error, "migration rolled back");
                match operator.migration_failed(version, &error) {
                    MigrationDecision::Retry => continue,
                    MigrationDecision::Abort => {
                        return Err(DatabaseError::MigrationAborted {
                            version,
                            reason: error.to_string(),
                        })
                    }
                }
            }
        }
    }
}

/// Move the schema to exactly `target`, running `down` units when going back.
pub fn migrate_to(
    conn: &mut Connection,
    target: u32,
    ctx: &MigrationContext<'_>,
) -> DatabaseResult<u32> {
    if target != 0 && !ORDERED.iter().any(|m| m.version == target) {
        return Err(DatabaseError::UnknownVersion(target));
    }
    let current = schema_version(conn)?;
    if target >= current {
        return apply_up(conn, current, target, ctx).map_err(|(_, e)| e);
    }
    for migration in ORDERED
        .iter()
        .rev()
        .filter(|m| m.version <= current && m.version > target)
    {
        apply_step(conn, migration, Direction::Down, ctx)?;
    }
    schema_version(conn)
}

// ═══════════════════════════════════════════════════════════════════════════════
// V1: flat ClipboardItems table
// ═══════════════════════════════════════════════════════════════════════════════

const LEGACY_SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS ClipboardItems (
        Id              INTEGER PRIMARY KEY AUTOINCREMENT,
        IsFavorite      INTEGER NOT NULL,
        Time            TEXT    NOT NULL,
        OwnerPath       TEXT,
        OwnerIconBitmap BLOB,
        DataMap         TEXT    NOT NULL,
        HashMap         TEXT    NOT NULL
    );
    CREATE TABLE IF NOT EXISTS LinksPreviewInfo (
        Id          INTEGER PRIMARY KEY,
        Title       TEXT,
        Description TEXT,
        ImageUrl    TEXT
    );
"#;

fn initial_create_up(tx: &Transaction<'_>, _ctx: &MigrationContext<'_>) -> DatabaseResult<()> {
    tx.execute_batch(LEGACY_SCHEMA)?;
    Ok(())
}

fn initial_create_down(tx: &Transaction<'_>, _ctx: &MigrationContext<'_>) -> DatabaseResult<()> {
    tx.execute_batch(
        "DROP TABLE IF EXISTS ClipboardItems;
         DROP TABLE IF EXISTS LinksPreviewInfo;",
    )?;
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════════
// V2: normalized Owners / Clips / Data / LinkMetadata
// ═══════════════════════════════════════════════════════════════════════════════

const NORMALIZED_SCHEMA: &str = r#"
    CREATE TABLE Owners (
        Id   INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
        Path TEXT NOT NULL UNIQUE,
        Name TEXT,
        Icon BLOB
    );
    CREATE TABLE Clips (
        Id         INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
        ClipTime   TEXT    NOT NULL,
        IsFavorite INTEGER NOT NULL DEFAULT 0,
        OwnerId    INTEGER,
        FOREIGN KEY (OwnerId) REFERENCES Owners (Id) ON DELETE SET NULL
    );
    CREATE TABLE Data (
        Id             INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
        ClipId         INTEGER NOT NULL,
        Format         TEXT    NOT NULL,
        Data           TEXT    NOT NULL,
        Hash           BLOB    NOT NULL,
        MetadataFormat TEXT,
        FOREIGN KEY (ClipId) REFERENCES Clips (Id) ON DELETE CASCADE
    );
    CREATE TABLE LinkMetadata (
        Id          INTEGER PRIMARY KEY NOT NULL,
        Url         TEXT NOT NULL,
        Title       TEXT,
        Description TEXT,
        Image       TEXT,
        FOREIGN KEY (Id) REFERENCES Data (Id) ON DELETE CASCADE
    );
    CREATE INDEX idx_clips_time ON Clips (ClipTime);
    CREATE INDEX idx_data_clip ON Data (ClipId);
"#;

/// Key used for a format in the legacy JSON maps
fn legacy_name(format: ClipboardFormat) -> &'static str {
    match format {
        ClipboardFormat::Text => "Text",
        ClipboardFormat::Bitmap => "Bitmap",
        ClipboardFormat::Rtf => "Rtf",
        ClipboardFormat::Html => "Html",
        ClipboardFormat::Png => "Png",
        ClipboardFormat::Files => "Files",
    }
}

fn legacy_format(name: &str) -> Option<ClipboardFormat> {
    ClipboardFormat::ALL
        .into_iter()
        .find(|f| legacy_name(*f).eq_ignore_ascii_case(name))
}

fn file_name_of(path: &str) -> String {
    std::path::Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}

struct LegacyItem {
    id: i64,
    is_favorite: bool,
    time: String,
    owner_path: Option<String>,
    owner_icon: Option<Vec<u8>>,
    data_map: String,
    hash_map: String,
}

type Preview = (Option<String>, Option<String>, Option<String>);

fn normalize_up(tx: &Transaction<'_>, ctx: &MigrationContext<'_>) -> DatabaseResult<()> {
    tx.execute_batch(NORMALIZED_SCHEMA)?;

    let items = {
        let mut stmt = tx.prepare(
            "SELECT Id, IsFavorite, Time, OwnerPath, OwnerIconBitmap, DataMap, HashMap FROM ClipboardItems ORDER BY Id",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(LegacyItem {
                    id: row.get(0)?,
                    is_favorite: row.get(1)?,
                    time: row.get(2)?,
                    owner_path: row.get(3)?,
                    owner_icon: row.get(4)?,
                    data_map: row.get(5)?,
                    hash_map: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };
    let previews: HashMap<i64, Preview> = {
        let mut stmt = tx.prepare("SELECT Id, Title, Description, ImageUrl FROM LinksPreviewInfo")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, (row.get(1)?, row.get(2)?, row.get(3)?))))?
            .collect::<Result<HashMap<_, _>, _>>()?;
        rows
    };

    let mut owner_ids: HashMap<String, i64> = HashMap::new();
    for item in &items {
        let owner_id = match item.owner_path.as_deref().filter(|p| !p.is_empty()) {
            Some(path) => Some(match owner_ids.get(path) {
                Some(id) => *id,
                None => {
                    // Display names were not stored in the flat schema.
                    tx.execute(
                        "INSERT INTO Owners (Path, Name, Icon) VALUES (?1, ?2, ?3)",
                        params![path, ctx.resolver.resolve(path), item.owner_icon],
                    )?;
                    let id = tx.last_insert_rowid();
                    owner_ids.insert(path.to_string(), id);
                    id
                }
            }),
            None => None,
        };

        let clip_time = parse_db_time(&item.time).unwrap_or_else(now_local);
        tx.execute(
            "INSERT INTO Clips (Id, ClipTime, IsFavorite, OwnerId) VALUES (?1, ?2, ?3, ?4)",
            params![item.id, format_db_time(&clip_time), item.is_favorite, owner_id],
        )?;

        let data_map: BTreeMap<String, String> = serde_json::from_str(&item.data_map)?;
        let hash_map: BTreeMap<String, String> =
            serde_json::from_str(&item.hash_map).unwrap_or_default();

        for (key, value) in &data_map {
            let Some(format) = legacy_format(key) else {
                warn!(clip = item.id, format = %key, "dropping unknown legacy format");
                continue;
            };
            let hash = hash_map
                .get(key)
                .and_then(|h| base64::engine::general_purpose::STANDARD.decode(h).ok())
                .filter(|h| !h.is_empty())
                .unwrap_or_else(|| Sha256::digest(value.as_bytes()).to_vec());
            let stored = if format.is_file_backed() {
                file_name_of(value)
            } else {
                value.clone()
            };
            let preview = (format == ClipboardFormat::Text && is_link(value))
                .then(|| previews.get(&item.id))
                .flatten();

            tx.execute(
                "INSERT INTO Data (ClipId, Format, Data, Hash, MetadataFormat) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![item.id, format.store_name(), stored, hash, preview.map(|_| "Link")],
            )?;
            if let Some((title, description, image)) = preview {
                tx.execute(
                    "INSERT INTO LinkMetadata (Id, Url, Title, Description, Image) VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![tx.last_insert_rowid(), value, title, description, image],
                )?;
            }
        }
    }

    tx.execute_batch(
        "DROP TABLE ClipboardItems;
         DROP TABLE LinksPreviewInfo;",
    )?;
    info!(clips = items.len(), owners = owner_ids.len(), "normalized legacy clipboard items");
    Ok(())
}

fn normalize_down(tx: &Transaction<'_>, ctx: &MigrationContext<'_>) -> DatabaseResult<()> {
    tx.execute_batch(LEGACY_SCHEMA)?;

    let owners: HashMap<i64, (String, Option<Vec<u8>>)> = {
        let mut stmt = tx.prepare("SELECT Id, Path, Icon FROM Owners")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, (row.get(1)?, row.get(2)?))))?
            .collect::<Result<HashMap<_, _>, _>>()?;
        rows
    };

    struct Row {
        clip_id: i64,
        format: String,
        data: String,
        hash: Vec<u8>,
        preview: Option<Preview>,
    }
    let mut data_by_clip: HashMap<i64, Vec<Row>> = HashMap::new();
    {
        let mut stmt = tx.prepare(
            r#"SELECT d.ClipId, d.Format, d.Data, d.Hash, l.Id, l.Title, l.Description, l.Image
               FROM Data d LEFT JOIN LinkMetadata l ON l.Id = d.Id"#,
        )?;
        let rows = stmt.query_map([], |row| {
            let link_id: Option<i64> = row.get(4)?;
            Ok(Row {
                clip_id: row.get(0)?,
                format: row.get(1)?,
                data: row.get(2)?,
                hash: row.get(3)?,
                preview: match link_id {
                    Some(_) => Some((row.get(5)?, row.get(6)?, row.get(7)?)),
                    None => None,
                },
            })
        })?;
        for row in rows {
            let row = row?;
            data_by_clip.entry(row.clip_id).or_default().push(row);
        }
    }

    let clips = {
        let mut stmt = tx.prepare("SELECT Id, ClipTime, IsFavorite, OwnerId FROM Clips ORDER BY Id")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, bool>(2)?,
                    row.get::<_, Option<i64>>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };

    for (clip_id, time, is_favorite, owner_id) in clips {
        let mut data_map = BTreeMap::new();
        let mut hash_map = BTreeMap::new();
        let mut preview = None;
        for row in data_by_clip.remove(&clip_id).unwrap_or_default() {
            let Some(format) = ClipboardFormat::from_store_name(&row.format) else {
                continue;
            };
            let name = legacy_name(format);
            data_map.insert(name, ctx.codec.full_path(format, &row.data));
            hash_map.insert(name, base64::engine::general_purpose::STANDARD.encode(&row.hash));
            preview = preview.or(row.preview);
        }
        let owner = owner_id.and_then(|id| owners.get(&id));
        tx.execute(
            "INSERT INTO ClipboardItems (Id, IsFavorite, Time, OwnerPath, OwnerIconBitmap, DataMap, HashMap) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                clip_id,
                is_favorite,
                time,
                owner.map(|o| o.0.as_str()),
                owner.and_then(|o| o.1.as_deref()),
                serde_json::to_string(&data_map)?,
                serde_json::to_string(&hash_map)?,
            ],
        )?;
        if let Some((title, description, image)) = preview {
            tx.execute(
                "INSERT INTO LinksPreviewInfo (Id, Title, Description, ImageUrl) VALUES (?1, ?2, ?3, ?4)",
                params![clip_id, title, description, image],
            )?;
        }
    }

    tx.execute_batch(
        "DROP TABLE LinkMetadata;
         DROP TABLE Data;
         DROP TABLE Clips;
         DROP TABLE Owners;",
    )?;
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════════
// V3: tags
// ═══════════════════════════════════════════════════════════════════════════════

fn tags_up(tx: &Transaction<'_>, _ctx: &MigrationContext<'_>) -> DatabaseResult<()> {
    tx.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS Tags (
            Id    INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
            Name  TEXT NOT NULL,
            Color TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS ClipTags (
            ClipId INTEGER NOT NULL,
            TagId  INTEGER NOT NULL,
            PRIMARY KEY (ClipId, TagId),
            FOREIGN KEY (ClipId) REFERENCES Clips (Id) ON DELETE CASCADE,
            FOREIGN KEY (TagId) REFERENCES Tags (Id) ON DELETE CASCADE
        );
        "#,
    )?;
    Ok(())
}

fn tags_down(tx: &Transaction<'_>, _ctx: &MigrationContext<'_>) -> DatabaseResult<()> {
    tx.execute_batch(
        "DROP TABLE ClipTags;
         DROP TABLE Tags;",
    )?;
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════════
// V4: files metadata
// ═══════════════════════════════════════════════════════════════════════════════

fn files_metadata_up(tx: &Transaction<'_>, _ctx: &MigrationContext<'_>) -> DatabaseResult<()> {
    tx.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS FilesMetadata (
            Id           INTEGER PRIMARY KEY NOT NULL,
            FilesCount   INTEGER NOT NULL,
            FoldersCount INTEGER NOT NULL,
            FOREIGN KEY (Id) REFERENCES Data (Id) ON DELETE CASCADE
        );
        "#,
    )?;

    // Existing file lists get their counts now.
    let rows = {
        let mut stmt = tx.prepare("SELECT Id, Data FROM Data WHERE Format = ?1")?;
        let rows = stmt
            .query_map([ClipboardFormat::Files.store_name()], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };
    for (data_id, paths) in rows {
        let meta = files_metadata(&paths);
        tx.execute(
            "INSERT INTO FilesMetadata (Id, FilesCount, FoldersCount) VALUES (?1, ?2, ?3)",
            params![data_id, meta.files_count, meta.folders_count],
        )?;
        tx.execute("UPDATE Data SET MetadataFormat = 'Files' WHERE Id = ?1", [data_id])?;
    }
    Ok(())
}

fn files_metadata_down(tx: &Transaction<'_>, _ctx: &MigrationContext<'_>) -> DatabaseResult<()> {
    tx.execute_batch(
        "UPDATE Data SET MetadataFormat = NULL WHERE MetadataFormat = 'Files';
         DROP TABLE FilesMetadata;",
    )?;
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════════
// V5: per-tag cleaning flag
// ═══════════════════════════════════════════════════════════════════════════════

fn tag_cleaning_up(tx: &Transaction<'_>, _ctx: &MigrationContext<'_>) -> DatabaseResult<()> {
    tx.execute_batch("ALTER TABLE Tags ADD COLUMN IsCleaningEnabled INTEGER NOT NULL DEFAULT 1;")?;
    Ok(())
}

fn tag_cleaning_down(tx: &Transaction<'_>, _ctx: &MigrationContext<'_>) -> DatabaseResult<()> {
    tx.execute_batch("ALTER TABLE Tags DROP COLUMN IsCleaningEnabled;")?;
    Ok(())
}
