//! backupfs: a FUSE filesystem with a single write-only device entry.
//!
//! Every open/write/close session on the device is redirected to a new
//! backing file whose name is expanded from a configurable pattern, so a
//! client writing to one stable path leaves a series of distinct archives.
#[macro_use]
extern crate log;

pub mod config;
pub mod error;
pub mod fuse;
pub mod handle;
pub mod pattern;
pub mod session;
mod util;

pub use config::Config;
pub use error::{BackupFsError, Result};
pub use fuse::BackupFs;
pub use session::SessionManager;
