//! Export / import of clip archives
//!
//! An archive is a zip holding a standalone database (`ClipboardManager.db`)
//! plus one `<Folder>/<file>` entry per payload file. The database stores
//! payload file names only, so the same rows resolve against whichever
//! history root opens them.

use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::database::{Database, DatabaseError, DATABASE_FILE_NAME};
use crate::interface::ClipboardFormat;
use crate::migrations::AbortOperator;
use crate::models::{Clip, Owner, Tag};
use crate::owners::FileStemResolver;

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("Archive error: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
    #[error("Archive contains no database")]
    MissingDatabase,
    #[error("Nothing to export")]
    Empty,
}

/// Clips to export with the owners and tags they reference
#[derive(Debug, Clone, Default)]
pub struct ExportPlan {
    pub clips: Vec<Clip>,
    pub owners: Vec<Owner>,
    pub tags: Vec<Tag>,
}

/// Contents read back from an archive. Ids are those of the archive database.
#[derive(Debug, Clone, Default)]
pub struct ImportBundle {
    pub owners: Vec<Owner>,
    pub tags: Vec<Tag>,
    pub clips: Vec<Clip>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// EXPORT
// ═══════════════════════════════════════════════════════════════════════════════

/// Write `plan` to a zip at `dest`. Returns the number of exported clips.
/// On failure nothing is left at `dest`.
pub fn export_archive(plan: &ExportPlan, dest: &Path) -> Result<usize, TransferError> {
    if plan.clips.is_empty() {
        return Err(TransferError::Empty);
    }
    match write_archive(plan, dest) {
        Ok(count) => {
            info!(clips = count, dest = %dest.display(), "archive exported");
            Ok(count)
        }
        Err(e) => {
            if dest.exists() {
                if let Err(rm) = fs::remove_file(dest) {
                    warn!(dest = %dest.display(), error = %rm, "could not remove partial archive");
                }
            }
            Err(e)
        }
    }
}

fn write_archive(plan: &ExportPlan, dest: &Path) -> Result<usize, TransferError> {
    let workdir = tempfile::tempdir()?;
    let db_path = workdir.path().join(DATABASE_FILE_NAME);
    let count = fill_satellite(plan, &db_path, workdir.path())?;

    let mut zip = zip::ZipWriter::new(File::create(dest)?);
    let options = zip::write::SimpleFileOptions::default();

    zip.start_file(DATABASE_FILE_NAME, options)?;
    io::copy(&mut File::open(&db_path)?, &mut zip)?;

    let mut written = HashSet::new();
    for data in plan.clips.iter().flat_map(|clip| clip.data.values()) {
        let Some(folder) = data.format.folder() else {
            continue;
        };
        let source = Path::new(&data.data);
        let Some(file_name) = source.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let entry = format!("{folder}/{file_name}");
        if !written.insert(entry.clone()) {
            continue;
        }
        let mut file = match File::open(source) {
            Ok(file) => file,
            Err(e) => {
                warn!(path = %source.display(), error = %e, "payload missing from export");
                continue;
            }
        };
        zip.start_file(entry, options)?;
        io::copy(&mut file, &mut zip)?;
    }

    zip.finish()?.flush()?;
    Ok(count)
}

/// Copy the plan into a fresh database at `db_path`
fn fill_satellite(plan: &ExportPlan, db_path: &Path, root: &Path) -> Result<usize, TransferError> {
    let db = Database::open_satellite(db_path, root, &FileStemResolver, &AbortOperator)?;

    let mut owner_ids: HashMap<&str, i64> = HashMap::new();
    for owner in plan.owners.iter().filter(|o| !o.is_unknown()) {
        owner_ids.insert(owner.path.as_str(), db.add_owner(owner)?);
    }
    let mut tag_ids = HashMap::new();
    for tag in &plan.tags {
        tag_ids.insert(tag.id, db.add_tag(tag)?);
    }

    let mut links = Vec::new();
    for source in &plan.clips {
        let mut clip = source.clone();
        let owner_id = clip.owner.as_deref().and_then(|key| owner_ids.get(key).copied());
        db.add_clip(&mut clip, owner_id)?;
        links.extend(
            source
                .tags
                .iter()
                .filter_map(|old| tag_ids.get(old))
                .map(|new| (clip.id, *new)),
        );
    }
    db.add_clip_tags(&links)?;
    debug!(clips = plan.clips.len(), tags = tag_ids.len(), links = links.len(), "satellite written");
    Ok(plan.clips.len())
}

// ═══════════════════════════════════════════════════════════════════════════════
// IMPORT
// ═══════════════════════════════════════════════════════════════════════════════

/// Read an archive. Payload files missing under `history_root` are extracted
/// there; existing files are left untouched.
pub fn read_archive(path: &Path, history_root: &Path) -> Result<ImportBundle, TransferError> {
    let mut archive = zip::ZipArchive::new(File::open(path)?)?;
    let workdir = tempfile::tempdir()?;
    let db_path = workdir.path().join(DATABASE_FILE_NAME);
    let mut found_db = false;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        if entry.is_dir() {
            continue;
        }
        // Rejects absolute paths and `..` components.
        let Some(name) = entry.enclosed_name() else {
            warn!(entry = entry.name(), "skipping unsafe archive entry");
            continue;
        };

        if !found_db && name.extension().is_some_and(|ext| ext == "db") {
            io::copy(&mut entry, &mut File::create(&db_path)?)?;
            found_db = true;
            continue;
        }

        let Some(dest) = payload_destination(&name, history_root) else {
            continue;
        };
        if dest.exists() {
            continue;
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        io::copy(&mut entry, &mut File::create(&dest)?)?;
    }

    if !found_db {
        return Err(TransferError::MissingDatabase);
    }

    let db = Database::open_satellite(&db_path, history_root, &FileStemResolver, &AbortOperator)?;
    let owners = db.get_owners()?;
    let keys: HashMap<i64, String> = owners.iter().map(|o| (o.id, o.path.clone())).collect();
    let bundle = ImportBundle {
        clips: db.get_clips(&keys)?,
        tags: db.get_tags()?,
        owners,
    };
    info!(clips = bundle.clips.len(), source = %path.display(), "archive read");
    Ok(bundle)
}

/// `<Folder>/<file>` under a known payload folder, mapped into `history_root`
fn payload_destination(name: &Path, history_root: &Path) -> Option<PathBuf> {
    let mut components = name.components();
    let (Some(Component::Normal(folder)), Some(Component::Normal(file)), None) =
        (components.next(), components.next(), components.next())
    else {
        return None;
    };
    let folder = ClipboardFormat::from_folder(folder.to_str()?)?.folder()?;
    Some(history_root.join(folder).join(file))
}

// ═══════════════════════════════════════════════════════════════════════════════
// ASYNC WRAPPERS
// ═══════════════════════════════════════════════════════════════════════════════

/// `export_archive` on the blocking pool. Failures are logged and reported as `false`.
pub async fn export_archive_async(plan: ExportPlan, dest: PathBuf) -> bool {
    let result = crate::runtime_handle()
        .spawn_blocking(move || export_archive(&plan, &dest))
        .await;
    match result {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            warn!(error = %e, "export failed");
            false
        }
        Err(e) => {
            warn!(error = %e, "export task failed");
            false
        }
    }
}

/// `read_archive` on the blocking pool. Failures are logged and reported as `None`.
pub async fn read_archive_async(path: PathBuf, history_root: PathBuf) -> Option<ImportBundle> {
    let result = crate::runtime_handle()
        .spawn_blocking(move || read_archive(&path, &history_root))
        .await;
    match result {
        Ok(Ok(bundle)) => Some(bundle),
        Ok(Err(e)) => {
            warn!(error = %e, "import failed");
            None
        }
        Err(e) => {
            warn!(error = %e, "import task failed");
            None
        }
    }
}
