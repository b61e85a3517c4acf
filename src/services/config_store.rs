//! Key-path configuration store
//!
//! The persisted document is plain JSON addressed by dot paths such as
//! `image_processing.jpg_export.quality`. Stored documents are deep-merged over the
//! defaults on load, so files written by older versions keep working when new keys
//! appear.

use crate::config::{AppConfig, ConfigSnapshot};
use crate::error::{PipelineError, Result};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Directory name under the platform config dir
pub const CONFIG_DIR_NAME: &str = "cutout-pipeline";

/// Config file name
pub const CONFIG_FILE_NAME: &str = "config.json";

/// Key-path access to the application configuration
pub trait ConfigStore: Send + Sync {
    /// Value at `key_path`, `None` when any segment is missing
    fn get(&self, key_path: &str) -> Option<Value>;

    /// Set `key_path`, creating intermediate objects; false when the write failed
    fn set(&self, key_path: &str, value: Value) -> bool;

    /// The full current document
    fn document(&self) -> Value;

    /// Typed, validated snapshot of the current document
    ///
    /// # Errors
    /// - The document does not match the [`AppConfig`] layout
    /// - A value is out of range (for example a malformed colour)
    fn snapshot(&self) -> Result<ConfigSnapshot> {
        let config: AppConfig = serde_json::from_value(self.document())
            .map_err(|e| PipelineError::invalid_config(format!("config document: {e}")))?;
        ConfigSnapshot::from_app_config(&config)
    }
}

/// Platform default config location
#[must_use]
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(CONFIG_DIR_NAME)
        .join(CONFIG_FILE_NAME)
}

/// Default document as JSON
#[must_use]
pub fn default_document() -> Value {
    serde_json::to_value(AppConfig::default()).unwrap_or_else(|_| Value::Object(Map::new()))
}

/// Recursively merge `source` into `target`; objects merge, everything else replaces
pub fn deep_merge(target: &mut Value, source: Value) {
    match (target, source) {
        (Value::Object(target), Value::Object(source)) => {
            for (key, value) in source {
                match target.get_mut(&key) {
                    Some(existing) if existing.is_object() && value.is_object() => {
                        deep_merge(existing, value);
                    },
                    _ => {
                        target.insert(key, value);
                    },
                }
            }
        },
        (target, source) => *target = source,
    }
}

/// Look up a dot path
#[must_use]
pub fn get_path<'a>(document: &'a Value, key_path: &str) -> Option<&'a Value> {
    key_path
        .split('.')
        .try_fold(document, |node, key| node.as_object()?.get(key))
}

/// Set a dot path, replacing non-object intermediates with objects
///
/// Returns false for an empty key path.
pub fn set_path(document: &mut Value, key_path: &str, value: Value) -> bool {
    let keys: Vec<&str> = key_path.split('.').collect();
    if keys.iter().any(|k| k.is_empty()) {
        return false;
    }
    let Some((last, parents)) = keys.split_last() else {
        return false;
    };

    let mut node = document;
    for key in parents {
        if !node.is_object() {
            *node = Value::Object(Map::new());
        }
        let Value::Object(map) = node else {
            return false;
        };
        node = map
            .entry((*key).to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    match node {
        Value::Object(map) => {
            map.insert((*last).to_string(), value);
            true
        },
        _ => false,
    }
}

/// In-memory store with the same semantics as [`JsonConfigStore`]
#[derive(Debug)]
pub struct MemoryConfigStore {
    document: Mutex<Value>,
}

impl Default for MemoryConfigStore {
    fn default() -> Self {
        Self {
            document: Mutex::new(default_document()),
        }
    }
}

impl MemoryConfigStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store seeded with `overrides` merged over the defaults
    #[must_use]
    pub fn with_overrides(overrides: Value) -> Self {
        let mut document = default_document();
        deep_merge(&mut document, overrides);
        Self {
            document: Mutex::new(document),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Value> {
        self.document.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ConfigStore for MemoryConfigStore {
    fn get(&self, key_path: &str) -> Option<Value> {
        get_path(&self.lock(), key_path).cloned()
    }

    fn set(&self, key_path: &str, value: Value) -> bool {
        set_path(&mut self.lock(), key_path, value)
    }

    fn document(&self) -> Value {
        self.lock().clone()
    }
}

/// File-backed store; every successful `set` is written through
#[derive(Debug)]
pub struct JsonConfigStore {
    path: PathBuf,
    document: Mutex<Value>,
}

impl JsonConfigStore {
    /// Open the store at the platform default path
    ///
    /// # Errors
    /// - See [`JsonConfigStore::open`]
    pub fn open_default() -> Result<Self> {
        Self::open(default_config_path())
    }

    /// Load `path`, merging it over the defaults
    ///
    /// A missing file is created with the defaults. A file that is not valid JSON
    /// is logged and replaced in memory by the defaults; it is not overwritten
    /// until the next `set`.
    ///
    /// # Errors
    /// - The file exists but cannot be read
    /// - The default file cannot be written
    pub fn open<P: Into<PathBuf>>(path: P) -> Result<Self> {
        let path = path.into();
        let mut document = default_document();

        if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| PipelineError::file_io_error("read config", &path, &e))?;
            match serde_json::from_str::<Value>(&text) {
                Ok(stored) => deep_merge(&mut document, stored),
                Err(e) => {
                    tracing::error!(
                        path = %path.display(),
                        error = %e,
                        "config file is not valid JSON, using defaults"
                    );
                },
            }
        } else {
            write_document(&path, &document)?;
            tracing::info!(path = %path.display(), "created default configuration");
        }

        Ok(Self {
            path,
            document: Mutex::new(document),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, Value> {
        self.document.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ConfigStore for JsonConfigStore {
    fn get(&self, key_path: &str) -> Option<Value> {
        get_path(&self.lock(), key_path).cloned()
    }

    fn set(&self, key_path: &str, value: Value) -> bool {
        let mut document = self.lock();
        let mut updated = document.clone();
        if !set_path(&mut updated, key_path, value) {
            return false;
        }
        match write_document(&self.path, &updated) {
            Ok(()) => {
                *document = updated;
                true
            },
            Err(e) => {
                tracing::error!(key = key_path, error = %e, "failed to persist config value");
                false
            },
        }
    }

    fn document(&self) -> Value {
        self.lock().clone()
    }
}

fn write_document(path: &Path, document: &Value) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .map_err(|e| PipelineError::file_io_error("create config directory", parent, &e))?;
    }
    let text = serde_json::to_string_pretty(document)
        .map_err(|e| PipelineError::internal(format!("serialize config: {e}")))?;
    std::fs::write(path, text).map_err(|e| PipelineError::file_io_error("write config", path, &e))
}
