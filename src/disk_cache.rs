//! Whole-file text storage in the app-local storage directory.
use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

/// Reads and writes small UTF-8 files by name inside one directory.
///
/// Files are always read and written whole. Nothing here locks files; a single writer per file
/// is assumed.
#[derive(Debug, Clone)]
pub struct DiskCache {
    dir: PathBuf,
}

impl DiskCache {
    /// Create a cache rooted at `dir`. The directory is created lazily on first save.
    pub fn new(dir: impl Into<PathBuf>) -> DiskCache {
        DiskCache { dir: dir.into() }
    }

    /// Directory holding the cached files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Read file `name`. Returns `None` if it does not exist or cannot be read.
    pub fn load(&self, name: &str) -> Option<String> {
        match std::fs::read_to_string(self.dir.join(name)) {
            Ok(text) => Some(text),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                log::debug!(target: "datafile_sync", "no cached file {}", name);
                None
            }
            Err(err) => {
                log::warn!(target: "datafile_sync", "failed to read cached file {}: {:?}", name, err);
                None
            }
        }
    }

    /// Write `text` to file `name`, replacing any previous content.
    pub fn save(&self, name: &str, text: &str) -> bool {
        let result = std::fs::create_dir_all(&self.dir)
            .and_then(|()| std::fs::write(self.dir.join(name), text));
        match result {
            Ok(()) => true,
            Err(err) => {
                log::warn!(target: "datafile_sync", "failed to write cached file {}: {:?}", name, err);
                false
            }
        }
    }

    /// Whether file `name` exists.
    pub fn exists(&self, name: &str) -> bool {
        self.dir.join(name).is_file()
    }

    /// Remove file `name`. Returns `false` if there was nothing to remove or removal failed.
    pub fn delete(&self, name: &str) -> bool {
        match std::fs::remove_file(self.dir.join(name)) {
            Ok(()) => true,
            Err(err) if err.kind() == ErrorKind::NotFound => false,
            Err(err) => {
                log::warn!(target: "datafile_sync", "failed to delete cached file {}: {:?}", name, err);
                false
            }
        }
    }
}
