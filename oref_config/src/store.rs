//! File-backed blob store: one `<name>.json` file per blob under a directory.

use std::fs;
use std::path::{Path, PathBuf};

use oref_traits::{BlobStore, BoxError};

use crate::Settings;

/// Name of the blob holding the settings JSON.
pub const SETTINGS_BLOB: &str = "settings";

#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, name: &str) -> Result<PathBuf, BoxError> {
        if name.is_empty()
            || name.contains(['/', '\\'])
            || name.starts_with('.')
            || name.contains("..")
        {
            return Err(format!("invalid blob name {name:?}").into());
        }
        Ok(self.dir.join(format!("{name}.json")))
    }
}

impl BlobStore for FileStore {
    fn get(&self, name: &str) -> Result<Option<String>, BoxError> {
        let path = self.path_for(name)?;
        match fs::read_to_string(&path) {
            Ok(s) => Ok(Some(s)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Box::new(e)),
        }
    }

    fn set(&mut self, name: &str, json: &str) -> Result<(), BoxError> {
        let path = self.path_for(name)?;
        fs::create_dir_all(&self.dir)?;
        // Write-then-rename so readers never see a torn blob.
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

/// Load and validate the settings blob from any store.
pub fn load_settings(store: &impl BlobStore) -> eyre::Result<Settings> {
    let raw = store
        .get(SETTINGS_BLOB)
        .map_err(|e| eyre::eyre!("read settings blob: {e}"))?
        .ok_or_else(|| eyre::eyre!("settings blob {SETTINGS_BLOB:?} not found in store"))?;
    let settings =
        crate::load_json(&raw).map_err(|e| eyre::eyre!("parse settings blob: {e}"))?;
    settings.validate()?;
    Ok(settings)
}

/// Serialize and store settings under the settings blob name.
pub fn save_settings(store: &mut impl BlobStore, settings: &Settings) -> eyre::Result<()> {
    let json = serde_json::to_string_pretty(settings)?;
    store
        .set(SETTINGS_BLOB, &json)
        .map_err(|e| eyre::eyre!("write settings blob: {e}"))
}
