//! Session manager: turns open/write/flush/release on the device entry into
//! I/O on per-session backing files.

use std::fs::{self, File};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use crate::config::Config;
use crate::error::{BackupFsError, Result};
use crate::handle::{HandleId, HandleTable};
use crate::pattern::{self, CalendarFields, DeviceEntropy, EntropySource, OsEntropy};

pub const ROOT_PATH: &str = "/";

/// Mode bits of newly created backing files.
const BACKING_FILE_MODE: u32 = 0o644;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryKind {
    Directory,
    RegularFile,
}

/// Static metadata of the root directory and the device entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EntryAttr {
    pub kind: EntryKind,
    pub perm: u16,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
}

pub struct SessionManager {
    config: Config,
    table: HandleTable,
    entropy: Box<dyn EntropySource>,
}

impl SessionManager {
    /// Build a manager whose `%u` bytes come from `config.random_source`,
    /// or from the OS generator when none is configured.
    pub fn new(config: Config) -> Result<Self> {
        let entropy: Box<dyn EntropySource> = match &config.random_source {
            Some(path) => Box::new(DeviceEntropy::open(path).map_err(|e| {
                BackupFsError::Config(format!(
                    "cannot open random source {}: {e}",
                    path.display()
                ))
            })?),
            None => Box::new(OsEntropy),
        };
        Self::with_entropy(config, entropy)
    }

    pub fn with_entropy(config: Config, entropy: Box<dyn EntropySource>) -> Result<Self> {
        config.validate()?;
        let table = HandleTable::new(config.max_sessions);
        Ok(SessionManager {
            config,
            table,
            entropy,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn live_sessions(&self) -> usize {
        self.table.live()
    }

    fn is_device(&self, path: &str) -> bool {
        path.strip_prefix('/') == Some(self.config.device_name.as_str())
    }

    pub fn get_attributes(&self, path: &str) -> Result<EntryAttr> {
        if path == ROOT_PATH {
            return Ok(EntryAttr {
                kind: EntryKind::Directory,
                perm: 0o770,
                nlink: 2,
                uid: self.config.uid,
                gid: self.config.gid,
                size: 0,
            });
        }
        if self.is_device(path) {
            return Ok(EntryAttr {
                kind: EntryKind::RegularFile,
                perm: 0o220,
                nlink: 1,
                uid: self.config.uid,
                gid: self.config.gid,
                size: 0,
            });
        }
        Err(BackupFsError::NotFound(path.to_string()))
    }

    pub fn list_directory(&self, path: &str) -> Result<Vec<String>> {
        if path != ROOT_PATH {
            warn!("readdir(): {path} is not the root");
            return Err(BackupFsError::NotFound(path.to_string()));
        }
        Ok(vec![
            ".".to_string(),
            "..".to_string(),
            self.config.device_name.clone(),
        ])
    }

    /// Start a session: expand the pattern, create the backing file and
    /// return its handle.
    pub fn open(&self, path: &str, flags: u32) -> Result<HandleId> {
        if !self.is_device(path) {
            warn!("open(): {path} is not the device");
            return Err(BackupFsError::NotFound(path.to_string()));
        }
        if flags as libc::c_int & libc::O_ACCMODE != libc::O_WRONLY {
            warn!("open(): {path} rejected, flags {flags:#o} are not write-only");
            return Err(BackupFsError::AccessDenied);
        }

        let backing = pattern::expand(
            &self.config.pattern,
            &CalendarFields::now(),
            self.entropy.as_ref(),
        )?;
        info!("Opening {backing}");
        let file = self.create_backing(&backing).inspect_err(|e| {
            error!("open(): cannot create {backing}: {e}");
        })?;

        match self.table.allocate(file) {
            Ok(fh) => {
                debug!("open(): {backing} is fh {fh}");
                Ok(fh)
            }
            Err(e) => {
                error!("open(): no handle for {backing}: {e}");
                if let Err(rm) = fs::remove_file(&backing) {
                    warn!("open(): cannot remove unused {backing}: {rm}");
                }
                Err(e)
            }
        }
    }

    fn create_backing(&self, path: &str) -> Result<File> {
        if self.config.create_dirs {
            if let Some(parent) = Path::new(path).parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }
        }
        let file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(BACKING_FILE_MODE)
            .open(path)?;
        Ok(file)
    }

    /// Append `data` to the session's backing file.
    ///
    /// `offset` is not honored: writes land at the backing file's own
    /// position, in the order they arrive.
    pub fn write(&self, fh: HandleId, data: &[u8], offset: u64) -> Result<usize> {
        let file = self.table.lookup(fh).inspect_err(|e| warn!("write(): {e}"))?;
        let written = (&*file)
            .write(data)
            .inspect_err(|e| error!("write(): fh {fh}: {e}"))?;
        trace!("write(): fh {fh} offset {offset} len {} wrote {written}", data.len());
        Ok(written)
    }

    /// Sync the session's backing file to stable storage.
    pub fn flush(&self, fh: HandleId) -> Result<()> {
        let file = self.table.lookup(fh).inspect_err(|e| warn!("flush(): {e}"))?;
        file.sync_all()
            .inspect_err(|e| error!("flush(): fh {fh}: {e}"))?;
        Ok(())
    }

    /// End the session, closing its backing file.
    pub fn release(&self, fh: HandleId) -> Result<()> {
        self.table.release(fh).inspect_err(|e| match e {
            BackupFsError::InvalidHandle(_) => warn!("release(): {e}"),
            _ => error!("release(): fh {fh}: {e}"),
        })?;
        debug!("release(): fh {fh} closed");
        Ok(())
    }

    /// Truncation has no meaning for the device; always succeeds.
    pub fn truncate(&self, path: &str, size: u64) {
        debug!("truncate(): {path} to {size} ignored");
    }

    /// Close every session still open.
    pub fn shutdown(&self) -> Result<()> {
        let live = self.table.live();
        if live > 0 {
            warn!("shutting down with {live} open sessions");
        }
        self.table.close_all().inspect_err(|e| error!("shutdown: {e}"))
    }
}
