//! User settings persisted as a small JSON document.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default)]
    pub directory_path: String,
    #[serde(default = "default_files_loaded")]
    pub nbr_of_files_loaded: u32,
}

fn default_files_loaded() -> u32 {
    10
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            directory_path: String::new(),
            nbr_of_files_loaded: default_files_loaded(),
        }
    }
}

pub struct SettingsStore {
    path: PathBuf,
    current: RwLock<Settings>,
}

impl SettingsStore {
    /// Load settings from `path`; a missing file reads as defaults.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let current = if path.exists() {
            let raw = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read settings {:?}", path))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("Invalid settings file {:?}", path))?
        } else {
            Settings::default()
        };

        Ok(Self {
            path,
            current: RwLock::new(current),
        })
    }

    /// Store kept only in memory, for hosts without a settings file.
    pub fn in_memory(settings: Settings) -> Self {
        Self {
            path: PathBuf::new(),
            current: RwLock::new(settings),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self) -> Settings {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Configured root directory, `None` when unset or blank.
    pub fn directory_path(&self) -> Option<PathBuf> {
        let settings = self.current.read().unwrap_or_else(PoisonError::into_inner);
        let raw = settings.directory_path.trim();
        if raw.is_empty() {
            None
        } else {
            Some(PathBuf::from(raw))
        }
    }

    pub fn set_directory_path(&self, directory: &Path) -> Result<()> {
        self.update(|s| s.directory_path = directory.to_string_lossy().to_string())
    }

    pub fn update(&self, f: impl FnOnce(&mut Settings)) -> Result<()> {
        let snapshot = {
            let mut settings = self.current.write().unwrap_or_else(PoisonError::into_inner);
            f(&mut settings);
            settings.clone()
        };
        self.persist(&snapshot)
    }

    fn persist(&self, settings: &Settings) -> Result<()> {
        if self.path.as_os_str().is_empty() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).context("Failed to create settings directory")?;
            }
        }
        let json = serde_json::to_string_pretty(settings)?;
        fs::write(&self.path, json).with_context(|| format!("Failed to write {:?}", self.path))
    }
}
