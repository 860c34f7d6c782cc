use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{SimError, StorageError};
use crate::memory::{Memory, Word};

/// Slot used when no name is given: the implicit autosave.
pub const DEFAULT_SLOT: &str = "autosave";

/// Current on-disk image format.
pub const IMAGE_VERSION: u32 = 1;

/// A persisted machine: always the full 100-cell image.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryImage {
    pub version: u32,
    pub cells: Vec<Word>,
}

impl From<&Memory> for MemoryImage {
    fn from(memory: &Memory) -> Self {
        Self {
            version: IMAGE_VERSION,
            cells: memory.cells().to_vec(),
        }
    }
}

impl TryFrom<&MemoryImage> for Memory {
    type Error = SimError;

    fn try_from(image: &MemoryImage) -> Result<Self, SimError> {
        if image.version != IMAGE_VERSION {
            return Err(StorageError::UnsupportedVersion(image.version).into());
        }
        Memory::from_cells(&image.cells)
    }
}

/// Load/save named memory images.
///
/// `None` as a name addresses the autosave slot, which is not reported by
/// [`StoragePort::list_names`]. A missing image is `Ok(None)`, not an error.
pub trait StoragePort {
    fn save(&mut self, name: Option<&str>, image: &MemoryImage) -> Result<(), StorageError>;

    fn load(&self, name: Option<&str>) -> Result<Option<MemoryImage>, StorageError>;

    /// Names of all explicitly saved images, sorted.
    fn list_names(&self) -> Result<Vec<String>, StorageError>;

    /// Remove a saved image. Deleting a name that does not exist is not an
    /// error.
    fn delete(&mut self, name: &str) -> Result<(), StorageError>;
}

/// Image names are used as file stems, so keep them to a safe alphabet.
pub fn validate_name(name: &str) -> Result<(), StorageError> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidName(name.to_string()))
    }
}

fn slot_name(name: Option<&str>) -> Result<&str, StorageError> {
    let name = name.unwrap_or(DEFAULT_SLOT);
    validate_name(name)?;
    Ok(name)
}

/// Images held in process memory; nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    images: BTreeMap<String, MemoryImage>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StoragePort for MemoryStorage {
    fn save(&mut self, name: Option<&str>, image: &MemoryImage) -> Result<(), StorageError> {
        let name = slot_name(name)?;
        self.images.insert(name.to_string(), image.clone());
        Ok(())
    }

    fn load(&self, name: Option<&str>) -> Result<Option<MemoryImage>, StorageError> {
        let name = slot_name(name)?;
        Ok(self.images.get(name).cloned())
    }

    fn list_names(&self) -> Result<Vec<String>, StorageError> {
        Ok(self
            .images
            .keys()
            .filter(|name| name.as_str() != DEFAULT_SLOT)
            .cloned()
            .collect())
    }

    fn delete(&mut self, name: &str) -> Result<(), StorageError> {
        validate_name(name)?;
        self.images.remove(name);
        Ok(())
    }
}

/// One pretty-printed JSON file per image, `<dir>/<name>.json`.
#[derive(Debug)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    /// The directory is created lazily on the first save.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }
}

impl StoragePort for FileStorage {
    fn save(&mut self, name: Option<&str>, image: &MemoryImage) -> Result<(), StorageError> {
        let name = slot_name(name)?;
        fs::create_dir_all(&self.dir)?;
        let json = serde_json::to_string_pretty(image)?;
        // Write then rename so a crash never leaves a truncated image behind.
        let tmp = self.dir.join(format!(".{name}.json.tmp"));
        fs::write(&tmp, json)?;
        fs::rename(&tmp, self.path(name))?;
        Ok(())
    }

    fn load(&self, name: Option<&str>) -> Result<Option<MemoryImage>, StorageError> {
        let name = slot_name(name)?;
        let json = match fs::read_to_string(self.path(name)) {
            Ok(json) => json,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_str(&json)?))
    }

    fn list_names(&self) -> Result<Vec<String>, StorageError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if stem != DEFAULT_SLOT && validate_name(stem).is_ok() {
                names.push(stem.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    fn delete(&mut self, name: &str) -> Result<(), StorageError> {
        validate_name(name)?;
        match fs::remove_file(self.path(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
