use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use actix_web::web::Bytes;

const MAX_STATIC_FILE_BYTES: u64 = 20 * 1024;

pub const HTML_MIME_TYPE: &str = "text/html";
pub const CSS_MIME_TYPE: &str = "text/css";
pub const SVG_MIME_TYPE: &str = "image/svg+xml";

/// Request path, MIME type and file name of every static asset.
const STATIC_TABLE: [(&str, &str, &str); 3] = [
    ("/", HTML_MIME_TYPE, "index.html"),
    ("/style.css", CSS_MIME_TYPE, "style.css"),
    ("/favicon.svg", SVG_MIME_TYPE, "favicon.svg"),
];

#[derive(Debug, thiserror::Error)]
pub enum StaticFileError {
    #[error("cannot read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("{} is empty", .path.display())]
    Empty { path: PathBuf },
    #[error("{} is larger than {} bytes", .path.display(), MAX_STATIC_FILE_BYTES)]
    TooLarge { path: PathBuf },
}

#[derive(Debug, Clone)]
pub struct StaticResource {
    pub request_path: String,
    pub mime_type: &'static str,
    pub body: Bytes,
}

/// Assets loaded once at startup and never modified afterwards.
#[derive(Debug, Clone, Default)]
pub struct StaticFiles {
    resources: Vec<StaticResource>,
}

impl StaticFiles {
    pub fn load(resources_dir: &Path) -> Result<Self, StaticFileError> {
        let mut resources = Vec::with_capacity(STATIC_TABLE.len());
        for (request_path, mime_type, file_name) in STATIC_TABLE {
            resources.push(StaticResource {
                request_path: request_path.to_string(),
                mime_type,
                body: read_capped(&resources_dir.join(file_name))?,
            });
        }
        Ok(Self { resources })
    }

    pub fn from_resources(resources: Vec<StaticResource>) -> Self {
        Self { resources }
    }

    pub fn into_resources(self) -> Vec<StaticResource> {
        self.resources
    }
}

fn read_capped(path: &Path) -> Result<Bytes, StaticFileError> {
    let read_err = |source| StaticFileError::Read {
        path: path.to_path_buf(),
        source,
    };

    let file = File::open(path).map_err(read_err)?;
    let mut contents = Vec::new();
    file.take(MAX_STATIC_FILE_BYTES + 1)
        .read_to_end(&mut contents)
        .map_err(read_err)?;

    if contents.is_empty() {
        return Err(StaticFileError::Empty {
            path: path.to_path_buf(),
        });
    }
    if contents.len() as u64 > MAX_STATIC_FILE_BYTES {
        return Err(StaticFileError::TooLarge {
            path: path.to_path_buf(),
        });
    }
    Ok(Bytes::from(contents))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_bundled_resources() {
        let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("resources");
        let files = StaticFiles::load(&dir).unwrap();

        let resources = files.into_resources();
        let paths: Vec<&str> = resources.iter().map(|r| r.request_path.as_str()).collect();
        assert_eq!(paths, vec!["/", "/style.css", "/favicon.svg"]);
        assert_eq!(resources[1].mime_type, CSS_MIME_TYPE);
        assert!(!resources[0].body.is_empty());
    }

    #[test]
    fn missing_resource_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "<html></html>").unwrap();

        assert!(matches!(
            StaticFiles::load(dir.path()),
            Err(StaticFileError::Read { .. })
        ));
    }

    #[test]
    fn oversized_resource_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "<html></html>").unwrap();
        std::fs::write(dir.path().join("style.css"), vec![b'a'; 21 * 1024]).unwrap();
        std::fs::write(dir.path().join("favicon.svg"), "<svg/>").unwrap();

        assert!(matches!(
            StaticFiles::load(dir.path()),
            Err(StaticFileError::TooLarge { .. })
        ));
    }
}
