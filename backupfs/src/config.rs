//! Runtime configuration, immutable once the filesystem is mounted.

use std::path::PathBuf;

use crate::error::{BackupFsError, Result};

pub const DEFAULT_DEVICE_NAME: &str = "dev";
pub const DEFAULT_MAX_SESSIONS: usize = 1024;

#[derive(Clone, Debug)]
pub struct Config {
    /// Template the backing file path of every session is expanded from.
    pub pattern: String,
    /// Name of the single write-only entry under the mount root.
    pub device_name: String,
    pub uid: u32,
    pub gid: u32,
    /// File read for `%u` bytes; the OS random generator when unset.
    pub random_source: Option<PathBuf>,
    /// Upper bound on concurrently open sessions.
    pub max_sessions: usize,
    /// Create missing parent directories of an expanded path.
    pub create_dirs: bool,
}

impl Config {
    pub fn new(pattern: impl Into<String>) -> Result<Self> {
        let config = Config {
            pattern: pattern.into(),
            device_name: DEFAULT_DEVICE_NAME.to_string(),
            uid: 0,
            gid: 0,
            random_source: None,
            max_sessions: DEFAULT_MAX_SESSIONS,
            create_dirs: false,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.pattern.is_empty() {
            return Err(BackupFsError::Config("a backup pattern is required".into()));
        }
        if self.device_name.is_empty() || self.device_name.contains('/') {
            return Err(BackupFsError::Config(format!(
                "invalid device name {:?}",
                self.device_name
            )));
        }
        if matches!(self.device_name.as_str(), "." | "..") {
            return Err(BackupFsError::Config(format!(
                "device name {:?} is reserved",
                self.device_name
            )));
        }
        if self.max_sessions == 0 {
            return Err(BackupFsError::Config(
                "max sessions must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Absolute path of the device entry inside the mount, e.g. `/dev`.
    pub fn device_path(&self) -> String {
        format!("/{}", self.device_name)
    }
}
