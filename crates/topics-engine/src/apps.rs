//! Installed application registry.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::RwLock;

use crate::error::EngineError;

/// Source of the currently installed app set.
pub trait InstalledAppLister: Send + Sync {
    fn list_installed(&self) -> Result<BTreeSet<String>, EngineError>;
}

/// In-memory app set.
#[derive(Debug, Default)]
pub struct StaticAppLister {
    apps: RwLock<BTreeSet<String>>,
}

impl StaticAppLister {
    pub fn new<I, S>(apps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            apps: RwLock::new(apps.into_iter().map(Into::into).collect()),
        }
    }

    pub fn install(&self, app: &str) -> Result<(), EngineError> {
        self.apps
            .write()
            .map_err(|e| EngineError::Lock(e.to_string()))?
            .insert(app.to_string());
        Ok(())
    }

    pub fn uninstall(&self, app: &str) -> Result<(), EngineError> {
        self.apps
            .write()
            .map_err(|e| EngineError::Lock(e.to_string()))?
            .remove(app);
        Ok(())
    }
}

impl InstalledAppLister for StaticAppLister {
    fn list_installed(&self) -> Result<BTreeSet<String>, EngineError> {
        Ok(self
            .apps
            .read()
            .map_err(|e| EngineError::Lock(e.to_string()))?
            .clone())
    }
}

/// Reads a newline-separated package list on every call.
///
/// Blank lines and lines starting with `#` are skipped. A missing file
/// is an error rather than "nothing installed", which would erase every
/// app's data.
#[derive(Debug, Clone)]
pub struct FileAppLister {
    path: PathBuf,
}

impl FileAppLister {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl InstalledAppLister for FileAppLister {
    fn list_installed(&self) -> Result<BTreeSet<String>, EngineError> {
        let contents = std::fs::read_to_string(&self.path)?;
        Ok(contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_string)
            .collect())
    }
}
