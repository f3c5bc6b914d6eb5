use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::processing::mode::ProcessingMode;
use crate::settings::types::{AppSettings, SettingsError};

const SAVE_DEBOUNCE: Duration = Duration::from_millis(500);

/// Persistent settings store with debounced saving.
pub struct SettingsStore {
    path: PathBuf,
    data: Mutex<AppSettings>,
    save_notify: Notify,
    is_dirty: AtomicBool,
}

impl SettingsStore {
    /// Create a store, loading from disk if the file exists. A malformed
    /// file is reported and replaced by defaults in memory.
    pub fn new(path: PathBuf) -> Self {
        let data = match Self::load(&path) {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!(path = %path.display(), "{e}; using defaults");
                AppSettings::default()
            }
        };
        Self {
            path,
            data: Mutex::new(data),
            save_notify: Notify::new(),
            is_dirty: AtomicBool::new(false),
        }
    }

    /// Load settings from a JSON file, returning defaults on a missing file.
    pub fn load(path: &Path) -> Result<AppSettings, SettingsError> {
        if !path.exists() {
            return Ok(AppSettings::default());
        }
        let contents =
            std::fs::read_to_string(path).map_err(|e| SettingsError::Io(e.to_string()))?;
        serde_json::from_str(&contents).map_err(|e| SettingsError::Parse(e.to_string()))
    }

    /// Save current settings to disk atomically (write .tmp then rename).
    pub fn save(&self) -> Result<(), SettingsError> {
        let data = self.data.lock().clone();
        let json =
            serde_json::to_string_pretty(&data).map_err(|e| SettingsError::Parse(e.to_string()))?;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| SettingsError::Io(e.to_string()))?;
        }

        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &json).map_err(|e| SettingsError::Io(e.to_string()))?;
        std::fs::rename(&tmp_path, &self.path).map_err(|e| SettingsError::Io(e.to_string()))?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current settings.
    pub fn settings(&self) -> AppSettings {
        self.data.lock().clone()
    }

    /// Replace the in-memory settings without scheduling a save.
    pub fn replace(&self, settings: AppSettings) {
        *self.data.lock() = settings;
    }

    /// Remember the processing mode. Triggers a debounced save.
    pub fn set_mode(&self, mode: ProcessingMode) {
        {
            let mut data = self.data.lock();
            if data.mode == mode {
                return;
            }
            data.mode = mode;
        }
        self.is_dirty.store(true, Ordering::Release);
        self.save_notify.notify_one();
    }

    /// Save immediately if a debounced save is still pending.
    pub fn flush(&self) -> Result<(), SettingsError> {
        if self.is_dirty.swap(false, Ordering::AcqRel) {
            self.save()?;
        }
        Ok(())
    }

    /// Start the debounce task: waits for a dirty notification, sleeps
    /// 500ms, then saves. Must be called from within a tokio runtime.
    ///
    /// The `AtomicBool` dirty flag keeps notifications that arrive between
    /// `save()` completing and `notified().await` re-registering.
    pub fn start_debounce_task(self: &Arc<Self>) {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                store.save_notify.notified().await;
                tokio::time::sleep(SAVE_DEBOUNCE).await;
                if store.is_dirty.swap(false, Ordering::AcqRel) {
                    if let Err(e) = store.save() {
                        tracing::warn!("Failed to save settings: {e}");
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Helper: create a store backed by a temp directory.
    fn temp_store() -> (Arc<SettingsStore>, TempDir) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("edgecam.json");
        (Arc::new(SettingsStore::new(path)), dir)
    }

    #[test]
    fn load_returns_default_when_file_missing() {
        let dir = TempDir::new().unwrap();
        let result = SettingsStore::load(&dir.path().join("nonexistent.json")).unwrap();
        assert_eq!(result, AppSettings::default());
    }

    #[test]
    fn load_parses_valid_json_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("edgecam.json");
        std::fs::write(&path, r#"{"stream_port": 9100, "mode": "raw"}"#).unwrap();

        let result = SettingsStore::load(&path).unwrap();
        assert_eq!(result.stream_port, 9100);
        assert_eq!(result.mode, ProcessingMode::Raw);
    }

    #[test]
    fn load_returns_error_for_invalid_json() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("edgecam.json");
        std::fs::write(&path, "not valid json!!!").unwrap();
        assert!(matches!(
            SettingsStore::load(&path),
            Err(SettingsError::Parse(_))
        ));
    }

    #[test]
    fn new_falls_back_to_defaults_on_malformed_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("edgecam.json");
        std::fs::write(&path, "{{{").unwrap();
        let store = SettingsStore::new(path);
        assert_eq!(store.settings(), AppSettings::default());
    }

    #[test]
    fn save_round_trips_through_load() {
        let (store, dir) = temp_store();
        store.set_mode(ProcessingMode::Raw);
        store.save().unwrap();

        let loaded = SettingsStore::load(&dir.path().join("edgecam.json")).unwrap();
        assert_eq!(loaded.mode, ProcessingMode::Raw);
    }

    #[test]
    fn save_creates_parent_directories() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("deep").join("edgecam.json");
        let store = SettingsStore::new(path.clone());
        store.save().unwrap();
        assert!(path.exists());
    }

    #[test]
    fn save_is_atomic() {
        let (store, dir) = temp_store();
        store.save().unwrap();
        assert!(
            !dir.path().join("edgecam.json.tmp").exists(),
            ".tmp file should be cleaned up after rename"
        );
    }

    #[test]
    fn set_mode_to_current_value_is_not_dirty() {
        let (store, dir) = temp_store();
        store.set_mode(ProcessingMode::EdgeDetect);
        store.flush().unwrap();
        assert!(!dir.path().join("edgecam.json").exists());
    }

    #[test]
    fn flush_writes_pending_change() {
        let (store, dir) = temp_store();
        store.set_mode(ProcessingMode::Raw);
        store.flush().unwrap();
        let loaded = SettingsStore::load(&dir.path().join("edgecam.json")).unwrap();
        assert_eq!(loaded.mode, ProcessingMode::Raw);
    }

    #[tokio::test]
    async fn debounce_task_persists_mode_change() {
        let (store, dir) = temp_store();
        store.start_debounce_task();
        store.set_mode(ProcessingMode::Raw);
        store.set_mode(ProcessingMode::EdgeDetect);
        store.set_mode(ProcessingMode::Raw);

        let path = dir.path().join("edgecam.json");
        tokio::time::sleep(Duration::from_millis(900)).await;
        let loaded = SettingsStore::load(&path).unwrap();
        assert_eq!(loaded.mode, ProcessingMode::Raw);
    }
}
