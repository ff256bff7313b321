use std::fs;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use log::{debug, info};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::secret_store::ApiKeyMaterial;

/// Which backend serves OCR requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "camelCase")]
pub enum BackendKind {
    /// `latex_ocr_server` spawned from the configured Python interpreter
    Local,
    /// Hosted inference API
    Remote,
}

/// How recognized LaTeX is wrapped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelimiterPreset {
    FormulaOnly,
    Inline,
    Block,
}

impl DelimiterPreset {
    pub fn delimiter(self) -> &'static str {
        match self {
            DelimiterPreset::FormulaOnly => "",
            DelimiterPreset::Inline => "$",
            DelimiterPreset::Block => "$$",
        }
    }
}

/// Type-safe configuration key that associates a key name with its value type
#[derive(Debug, Clone, Copy)]
pub struct ConfigKey<T> {
    name: &'static str,
    _phantom: PhantomData<T>,
}

impl<T> ConfigKey<T> {
    const fn new(name: &'static str) -> Self {
        Self {
            name,
            _phantom: PhantomData,
        }
    }

    pub fn key_name(&self) -> &'static str {
        self.name
    }
}

// ===== Settings =====

/// Settings snapshot read by the backends on load, start and status checks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    /// Interpreter that has the `latex_ocr_server` package installed
    pub python_path: String,
    /// Model cache directory passed to the server; empty until the host resolves it
    pub cache_dir: PathBuf,
    /// Wrapping around the generated LaTeX: `""`, `"$"` or `"$$"`
    pub delimiters: String,
    pub port: u16,
    pub start_server_on_load: bool,
    pub show_status_bar: bool,
    pub use_local_model: bool,
    /// Inference API key, sealed when a credential store is available
    pub api_key: ApiKeyMaterial,
    /// Shown in the settings instead of the key itself
    pub obfuscated_key: String,
    /// Verbose per-request logging
    pub debug: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            python_path: "python3".to_string(),
            cache_dir: PathBuf::new(),
            delimiters: DelimiterPreset::Block.delimiter().to_string(),
            port: 50051,
            start_server_on_load: true,
            show_status_bar: true,
            use_local_model: false,
            api_key: ApiKeyMaterial::default(),
            obfuscated_key: String::new(),
            debug: false,
        }
    }
}

impl Settings {
    pub fn backend_kind(&self) -> BackendKind {
        if self.use_local_model {
            BackendKind::Local
        } else {
            BackendKind::Remote
        }
    }

    /// Fill in the model cache directory under `data_dir` when none is set.
    /// Returns true if the settings changed.
    pub fn resolve_cache_dir(&mut self, data_dir: &Path) -> bool {
        if !self.cache_dir.as_os_str().is_empty() {
            return false;
        }
        self.cache_dir = data_dir.join("model_cache");
        info!("Model cache directory: {:?}", self.cache_dir);
        true
    }
}

impl ConfigKey<Settings> {
    pub const SETTINGS: Self = Self::new("latexOcrSettings");
}

// ===== Type-Safe Config Store =====

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to access config file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Invalid config file: {0}")]
    Json(#[from] serde_json::Error),
}

pub trait ConfigStore {
    fn get<T: DeserializeOwned>(&self, key: &ConfigKey<T>) -> Option<T>;
    fn set<T: Serialize>(&self, key: &ConfigKey<T>, value: T) -> Result<(), ConfigError>;
    fn delete<T>(&self, key: &ConfigKey<T>) -> Result<(), ConfigError>;
}

/// Config store backed by a single JSON document on disk.
pub struct JsonFileStore {
    path: PathBuf,
    data: Mutex<serde_json::Map<String, serde_json::Value>>,
}

impl JsonFileStore {
    /// Open the store at `path`; a missing file is an empty store.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let data = match fs::read_to_string(&path) {
            Ok(text) if text.trim().is_empty() => serde_json::Map::new(),
            Ok(text) => serde_json::from_str(&text)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No config file at {:?}, starting empty", path);
                serde_json::Map::new()
            }
            Err(source) => return Err(ConfigError::Io { path, source }),
        };
        Ok(Self {
            path,
            data: Mutex::new(data),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save(&self, data: &serde_json::Map<String, serde_json::Value>) -> Result<(), ConfigError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let text = serde_json::to_string_pretty(data)?;
        fs::write(&self.path, text).map_err(|source| ConfigError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

impl ConfigStore for JsonFileStore {
    fn get<T: DeserializeOwned>(&self, key: &ConfigKey<T>) -> Option<T> {
        let data = self.data.lock().unwrap_or_else(|e| e.into_inner());
        data.get(key.key_name())
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    fn set<T: Serialize>(&self, key: &ConfigKey<T>, value: T) -> Result<(), ConfigError> {
        let val = serde_json::to_value(value)?;
        let mut data = self.data.lock().unwrap_or_else(|e| e.into_inner());
        data.insert(key.key_name().to_string(), val);
        self.save(&data)
    }

    fn delete<T>(&self, key: &ConfigKey<T>) -> Result<(), ConfigError> {
        let mut data = self.data.lock().unwrap_or_else(|e| e.into_inner());
        data.remove(key.key_name());
        self.save(&data)
    }
}

/// Load settings, falling back to defaults for a missing key or missing fields.
pub fn load_settings(store: &impl ConfigStore) -> Settings {
    store.get(&ConfigKey::SETTINGS).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;

    // Simple in-memory mock store for testing
    struct MockConfigStore {
        data: RefCell<HashMap<String, serde_json::Value>>,
    }

    impl MockConfigStore {
        fn new() -> Self {
            Self {
                data: RefCell::new(HashMap::new()),
            }
        }
    }

    impl ConfigStore for MockConfigStore {
        fn get<T: DeserializeOwned>(&self, key: &ConfigKey<T>) -> Option<T> {
            self.data
                .borrow()
                .get(key.key_name())
                .and_then(|v| serde_json::from_value(v.clone()).ok())
        }

        fn set<T: Serialize>(&self, key: &ConfigKey<T>, value: T) -> Result<(), ConfigError> {
            let val = serde_json::to_value(value)?;
            self.data
                .borrow_mut()
                .insert(key.key_name().to_string(), val);
            Ok(())
        }

        fn delete<T>(&self, key: &ConfigKey<T>) -> Result<(), ConfigError> {
            self.data.borrow_mut().remove(key.key_name());
            Ok(())
        }
    }

    #[test]
    fn test_settings_store() {
        let test_cases = vec![
            ("Settings with defaults", Settings::default()),
            (
                "Settings for a local server",
                Settings {
                    python_path: "/usr/bin/python3.11".to_string(),
                    cache_dir: PathBuf::from("/tmp/model_cache"),
                    port: 50052,
                    use_local_model: true,
                    debug: true,
                    ..Settings::default()
                },
            ),
            (
                "Settings with a sealed API key",
                Settings {
                    delimiters: "$".to_string(),
                    api_key: ApiKeyMaterial::Sealed(b"account".to_vec()),
                    obfuscated_key: "hf_****1234".to_string(),
                    show_status_bar: false,
                    ..Settings::default()
                },
            ),
        ];

        for (description, settings) in test_cases {
            let store = MockConfigStore::new();
            test_config_lifecycle(&store, &ConfigKey::SETTINGS, settings, description);
        }
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.python_path, "python3");
        assert_eq!(settings.delimiters, "$$");
        assert_eq!(settings.port, 50051);
        assert!(settings.start_server_on_load);
        assert!(settings.show_status_bar);
        assert_eq!(settings.backend_kind(), BackendKind::Remote);
    }

    #[test]
    fn test_partial_settings_fill_defaults() {
        let settings: Settings =
            serde_json::from_str(r#"{"useLocalModel": true, "port": 6000}"#).unwrap();
        assert_eq!(settings.backend_kind(), BackendKind::Local);
        assert_eq!(settings.port, 6000);
        assert_eq!(settings.python_path, "python3");
    }

    #[test]
    fn test_resolve_cache_dir_only_when_unset() {
        let mut settings = Settings::default();
        assert!(settings.resolve_cache_dir(Path::new("/data")));
        assert_eq!(settings.cache_dir, PathBuf::from("/data/model_cache"));
        assert!(!settings.resolve_cache_dir(Path::new("/other")));
        assert_eq!(settings.cache_dir, PathBuf::from("/data/model_cache"));
    }

    #[test]
    fn test_json_file_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        let store = JsonFileStore::open(&path).unwrap();
        assert!(store.get(&ConfigKey::SETTINGS).is_none());

        let settings = Settings {
            use_local_model: true,
            ..Settings::default()
        };
        store.set(&ConfigKey::SETTINGS, settings.clone()).unwrap();

        let reopened = JsonFileStore::open(&path).unwrap();
        assert_eq!(load_settings(&reopened), settings);
    }

    #[test]
    fn test_delimiter_presets() {
        assert_eq!(DelimiterPreset::FormulaOnly.delimiter(), "");
        assert_eq!(DelimiterPreset::Inline.delimiter(), "$");
        assert_eq!(DelimiterPreset::Block.delimiter(), "$$");
    }

    // Helper function to check if a string is in camelCase format
    fn is_camel_case(s: &str) -> bool {
        let mut chars = s.chars();
        match chars.next() {
            Some(first) if first.is_ascii_lowercase() => chars.all(|c| c.is_alphanumeric()),
            _ => false,
        }
    }

    // Helper function to verify camelCase format dynamically
    fn verify_camel_case<T>(store: &MockConfigStore, key: &ConfigKey<T>) {
        assert!(
            is_camel_case(key.key_name()),
            "Config key '{}' should be camelCase",
            key.key_name()
        );

        let stored_json = store.data.borrow().get(key.key_name()).cloned();
        if let Some(obj) = stored_json.as_ref().and_then(|v| v.as_object()) {
            for field_key in obj.keys() {
                assert!(
                    is_camel_case(field_key),
                    "Field '{}' in {} should be camelCase",
                    field_key,
                    key.key_name()
                );
            }
        }
    }

    // Helper function to test the full lifecycle of a config
    fn test_config_lifecycle<T>(
        store: &MockConfigStore,
        key: &ConfigKey<T>,
        test_config: T,
        description: &str,
    ) where
        T: Serialize + DeserializeOwned + PartialEq + std::fmt::Debug + Clone,
    {
        let result: Option<T> = store.get(key);
        assert!(
            result.is_none(),
            "{}: Get should return None before set",
            description
        );

        store
            .set(key, test_config.clone())
            .unwrap_or_else(|e| panic!("{}: Set should succeed: {}", description, e));

        let retrieved_config: Option<T> = store.get(key);
        assert_eq!(
            retrieved_config,
            Some(test_config),
            "{}: Retrieved config should match",
            description
        );

        verify_camel_case(store, key);

        store
            .delete(key)
            .unwrap_or_else(|_| panic!("{}: Delete should succeed", description));

        let result: Option<T> = store.get(key);
        assert!(
            result.is_none(),
            "{}: Get should return None after delete",
            description
        );
    }
}
