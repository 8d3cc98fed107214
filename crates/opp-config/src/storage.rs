//! Versioned JSON files under `<config dir>/.storage`
//!
//! Every file wraps its payload with the key and the version it was
//! written with:
//!
//! ```json
//! { "version": 1, "minor_version": 1, "key": "core.config", "data": { } }
//! ```
//!
//! A [`Store`] is the typed handle for one [`Storable`] type.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, warn};

/// Directory holding the storage files, relative to the config dir
pub const STORAGE_DIR: &str = ".storage";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{key} was written with version {found}, expected {expected}")]
    VersionMismatch {
        key: String,
        found: u32,
        expected: u32,
    },
}

pub type StorageResult<T> = Result<T, StorageError>;

/// On-disk envelope of a storage file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageFile<T> {
    pub version: u32,
    #[serde(default = "StorageFile::<T>::first_minor")]
    pub minor_version: u32,
    pub key: String,
    pub data: T,
}

impl<T> StorageFile<T> {
    fn first_minor() -> u32 {
        1
    }
}

/// A type persisted as a single storage file
pub trait Storable: Serialize + DeserializeOwned {
    /// File name under `.storage`
    const KEY: &'static str;
    /// Bumped on incompatible changes; other versions are refused
    const VERSION: u32;
    const MINOR_VERSION: u32 = 1;
}

/// Typed access to the storage file of `T`
pub struct Store<T> {
    path: PathBuf,
    _data: PhantomData<fn() -> T>,
}

impl<T: Storable> Store<T> {
    pub fn new(config_dir: impl AsRef<Path>) -> Self {
        Self {
            path: config_dir.as_ref().join(STORAGE_DIR).join(T::KEY),
            _data: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the stored value; `None` when nothing was saved yet
    ///
    /// Files from an older minor version load with a warning, files from
    /// another major version are refused.
    pub async fn load(&self) -> StorageResult<Option<T>> {
        let raw = match fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let file: StorageFile<serde_json::Value> = serde_json::from_slice(&raw)?;
        if file.version != T::VERSION {
            return Err(StorageError::VersionMismatch {
                key: T::KEY.to_string(),
                found: file.version,
                expected: T::VERSION,
            });
        }
        if file.minor_version < T::MINOR_VERSION {
            warn!(
                key = T::KEY,
                "Loading data written by minor version {}, current is {}",
                file.minor_version,
                T::MINOR_VERSION
            );
        }

        debug!(key = T::KEY, "Loaded storage file");
        Ok(Some(serde_json::from_value(file.data)?))
    }

    /// Write `data`, replacing the previous file atomically
    pub async fn save(&self, data: &T) -> StorageResult<()> {
        let envelope = StorageFile {
            version: T::VERSION,
            minor_version: T::MINOR_VERSION,
            key: T::KEY.to_string(),
            data,
        };
        let json = serde_json::to_vec_pretty(&envelope)?;

        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).await?;
        }
        // Readers never see a half-written file
        let partial = self.path.with_extension("partial");
        fs::write(&partial, json).await?;
        fs::rename(&partial, &self.path).await?;

        debug!(key = T::KEY, path = %self.path.display(), "Saved storage file");
        Ok(())
    }

    /// Delete the file; a missing file is not an error
    pub async fn remove(&self) -> StorageResult<()> {
        match fs::remove_file(&self.path).await {
            Err(err) if err.kind() != ErrorKind::NotFound => Err(err.into()),
            _ => Ok(()),
        }
    }
}

impl<T> std::fmt::Debug for Store<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").field("path", &self.path).finish()
    }
}
