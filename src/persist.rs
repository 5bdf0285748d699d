//! Feed state on disk: pretty-printed JSON, timestamps as epoch
//! milliseconds, written through a temp file + rename.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crate::feed::FeedData;

/// Largest state file we are willing to read back.
pub const MAX_STATE_FILE_BYTES: u64 = 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("{} is empty", .path.display())]
    Empty { path: PathBuf },
    #[error("{} is larger than {} bytes", .path.display(), MAX_STATE_FILE_BYTES)]
    TooLarge { path: PathBuf },
    #[error("invalid feed state in {}: {source}", .path.display())]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> PersistError + '_ {
    move |source| PersistError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Reads a previously saved feed. Callers treat any error as "start fresh".
pub fn load(path: &Path) -> Result<FeedData, PersistError> {
    let file = File::open(path).map_err(io_err(path))?;

    let mut contents = String::new();
    file.take(MAX_STATE_FILE_BYTES + 1)
        .read_to_string(&mut contents)
        .map_err(io_err(path))?;

    if contents.is_empty() {
        return Err(PersistError::Empty {
            path: path.to_path_buf(),
        });
    }
    if contents.len() as u64 > MAX_STATE_FILE_BYTES {
        return Err(PersistError::TooLarge {
            path: path.to_path_buf(),
        });
    }

    serde_json::from_str(&contents).map_err(|source| PersistError::Json {
        path: path.to_path_buf(),
        source,
    })
}

/// Writes `data` to `path` atomically. The destination either keeps its
/// previous content or gets the complete new document.
pub fn save(path: &Path, data: &FeedData) -> Result<(), PersistError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_err(parent))?;
    }

    let mut json = serde_json::to_string_pretty(data).map_err(|source| PersistError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    json.push('\n');

    let tmp_path = temp_path(path);
    let mut file = File::create(&tmp_path).map_err(io_err(&tmp_path))?;
    file.write_all(json.as_bytes()).map_err(io_err(&tmp_path))?;
    file.sync_all().map_err(io_err(&tmp_path))?;
    drop(file);

    fs::rename(&tmp_path, path).map_err(|e| {
        let _ = fs::remove_file(&tmp_path);
        io_err(path)(e)
    })
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".temp");
    path.with_file_name(name)
}
