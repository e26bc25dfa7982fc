//! On-disk persistence for [`BrokerConfig`].

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use tempfile::NamedTempFile;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use super::BrokerConfig;
use crate::error::{ConfigError, ConfigResult};

const APP_DIR: &str = "kafka-msg-publisher";
const FILE_NAME: &str = "config.json";

/// Serializes every load and save in the process, whichever store handle runs it.
fn store_lock() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

/// Loads and atomically persists the broker configuration file.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    /// Store backed by an explicit file path.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store at `<config dir>/kafka-msg-publisher/config.json`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NoConfigDir`] when the platform has no config directory.
    pub fn default_location() -> ConfigResult<Self> {
        let dir = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?;
        Ok(Self::open(dir.join(APP_DIR).join(FILE_NAME)))
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the last saved configuration.
    ///
    /// A missing file yields the default configuration. A file that cannot be
    /// read or parsed is logged and also yields the default; it is left on disk
    /// untouched.
    #[instrument(skip(self), fields(path = %self.path.display()))]
    pub async fn load(&self) -> BrokerConfig {
        let _guard = store_lock().lock().await;

        match tokio::fs::read(&self.path).await {
            Ok(bytes) => match serde_json::from_slice::<BrokerConfig>(&bytes) {
                Ok(config) => {
                    debug!("Loaded configuration");
                    config
                }
                Err(e) => {
                    warn!(error = %e, "Configuration file is corrupt, using defaults");
                    BrokerConfig::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No configuration file yet, using defaults");
                BrokerConfig::default()
            }
            Err(e) => {
                warn!(error = %e, "Cannot read configuration file, using defaults");
                BrokerConfig::default()
            }
        }
    }

    /// Validate and persist `config`.
    ///
    /// Validation happens before anything is written. The file is replaced by
    /// writing a sibling temporary file and renaming it over the target, so a
    /// reader sees either the old or the new document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for a config that fails validation and
    /// [`ConfigError::Io`] when the file cannot be written.
    #[instrument(skip(self, config), fields(path = %self.path.display()))]
    pub async fn save(&self, config: &BrokerConfig) -> ConfigResult<()> {
        let _guard = store_lock().lock().await;

        let path = self.path.clone();
        let config = config.clone();
        tokio::task::spawn_blocking(move || {
            config.validate()?;
            write_atomic(&path, &config)
        })
        .await
        .map_err(|e| ConfigError::Io {
            path: self.path.display().to_string(),
            source: std::io::Error::other(e),
        })??;

        info!("Configuration saved");
        Ok(())
    }
}

fn write_atomic(path: &Path, config: &BrokerConfig) -> ConfigResult<()> {
    let io_err = |source: std::io::Error| ConfigError::Io {
        path: path.display().to_string(),
        source,
    };

    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir).map_err(io_err)?;

    let json = serde_json::to_vec_pretty(config)?;

    let mut tmp = NamedTempFile::new_in(&dir).map_err(io_err)?;
    tmp.write_all(&json).map_err(io_err)?;
    tmp.as_file().sync_all().map_err(io_err)?;
    tmp.persist(path).map_err(|e| io_err(e.error))?;

    Ok(())
}
