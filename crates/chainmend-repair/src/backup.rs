use crate::RepairError;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions, Permissions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

pub const BACKUP_EXTENSION: &str = "bak";
const STAMP_FORMAT: &str = "%Y%m%dT%H%M%S%3fZ";
const MAX_NAME_ATTEMPTS: usize = 100;

/// `<name>.<utc stamp>.bak` in `backup_dir`, or next to the transcript when
/// no directory is given. Stamps sort chronologically.
pub fn backup_path_for(path: &Path, backup_dir: Option<&Path>, now: DateTime<Utc>) -> PathBuf {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "transcript".to_string());
    backup_directory(path, backup_dir).join(format!(
        "{name}.{}.{BACKUP_EXTENSION}",
        now.format(STAMP_FORMAT)
    ))
}

/// Writes `original` to a fresh backup file carrying the transcript's
/// permissions and checks the copy's digest before returning its path.
/// Never overwrites an existing file.
pub fn create_backup(
    path: &Path,
    backup_dir: Option<&Path>,
    original: &[u8],
) -> Result<PathBuf, RepairError> {
    let base = backup_path_for(path, backup_dir, Utc::now());
    let failed = |reason: String| RepairError::BackupFailed {
        path: base.clone(),
        reason,
    };

    let permissions = fs::metadata(path)
        .map(|metadata| metadata.permissions())
        .map_err(|err| failed(err.to_string()))?;
    if let Some(dir) = backup_dir {
        fs::create_dir_all(dir).map_err(|err| failed(err.to_string()))?;
    }

    let mut attempt = 0usize;
    let (backup_path, mut file) = loop {
        let candidate = if attempt == 0 {
            base.clone()
        } else {
            let mut name = base.as_os_str().to_owned();
            name.push(format!("-{attempt}"));
            PathBuf::from(name)
        };
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&candidate)
        {
            Ok(file) => break (candidate, file),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                attempt += 1;
                if attempt >= MAX_NAME_ATTEMPTS {
                    return Err(failed("no free backup file name".to_string()));
                }
            }
            Err(err) => return Err(failed(err.to_string())),
        }
    };

    let written = file
        .set_permissions(permissions)
        .and_then(|_| file.write_all(original))
        .and_then(|_| file.sync_all());
    drop(file);
    if let Err(err) = written {
        let _ = fs::remove_file(&backup_path);
        return Err(failed(err.to_string()));
    }

    let copied = fs::read(&backup_path).map_err(|err| failed(err.to_string()))?;
    if sha256_hex(&copied) != sha256_hex(original) {
        return Err(RepairError::BackupFailed {
            path: backup_path,
            reason: "backup digest does not match the original".to_string(),
        });
    }

    Ok(backup_path)
}

fn backup_directory(path: &Path, backup_dir: Option<&Path>) -> PathBuf {
    if let Some(dir) = backup_dir {
        return dir.to_path_buf();
    }
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Most recent backup of `path`, by stamp order.
pub fn latest_backup(path: &Path, backup_dir: Option<&Path>) -> io::Result<Option<PathBuf>> {
    let Some(name) = path.file_name().map(|name| name.to_string_lossy().into_owned()) else {
        return Ok(None);
    };
    let directory = backup_directory(path, backup_dir);
    if !directory.is_dir() {
        return Ok(None);
    }
    let prefix = format!("{name}.");

    let mut candidates = Vec::new();
    for entry in fs::read_dir(&directory)? {
        let entry = entry?;
        let file_name = entry.file_name().to_string_lossy().into_owned();
        let Some(rest) = file_name.strip_prefix(&prefix) else {
            continue;
        };
        if is_backup_suffix(rest) {
            candidates.push(file_name);
        }
    }

    candidates.sort();
    Ok(candidates.pop().map(|file_name| directory.join(file_name)))
}

fn is_backup_suffix(rest: &str) -> bool {
    let Some((stamp, extension)) = rest.split_once('.') else {
        return false;
    };
    let extension_ok = extension == BACKUP_EXTENSION
        || extension
            .strip_prefix(BACKUP_EXTENSION)
            .and_then(|tail| tail.strip_prefix('-'))
            .is_some_and(|counter| counter.chars().all(|ch| ch.is_ascii_digit()));
    extension_ok
        && stamp.len() == 19
        && stamp.ends_with('Z')
        && stamp.chars().nth(8) == Some('T')
}

/// Temp file then rename, so readers see either the old or the new file. An
/// existing target's permissions carry over to the replacement.
pub fn write_atomic(path: &Path, payload: &str) -> Result<(), RepairError> {
    let failed = |reason: String| RepairError::WriteFailed {
        path: path.to_path_buf(),
        reason,
    };

    let temp_path = match path.file_name() {
        Some(name) => path.with_file_name(format!("{}.tmp", name.to_string_lossy())),
        None => path.with_extension("tmp"),
    };
    let permissions = fs::metadata(path).ok().map(|metadata| metadata.permissions());

    let result = write_temp(&temp_path, payload.as_bytes(), permissions)
        .and_then(|_| fs::rename(&temp_path, path));
    if let Err(err) = result {
        if temp_path.is_file() {
            let _ = fs::remove_file(&temp_path);
        }
        return Err(failed(err.to_string()));
    }
    Ok(())
}

fn write_temp(
    temp_path: &Path,
    payload: &[u8],
    permissions: Option<Permissions>,
) -> io::Result<()> {
    let mut file = File::create(temp_path)?;
    if let Some(permissions) = permissions {
        file.set_permissions(permissions)?;
    }
    file.write_all(payload)?;
    file.sync_all()
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    let mut output = String::with_capacity(digest.len() * 2);
    for byte in digest {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}
