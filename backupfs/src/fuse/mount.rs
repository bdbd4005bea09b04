//! Mount helpers for starting/stopping the backup device.
//!
//! Notes:
//! - Only supported on Linux. Unprivileged mounts go through fusermount3.
//! - These helpers are thin wrappers over rfuse3 raw Session APIs.

use std::path::Path;

use rfuse3::MountOptions;
use rfuse3::raw::MountHandle;

use crate::fuse::BackupFs;

/// Mount options for backupfs, owned by the calling user.
pub fn default_mount_options(allow_other: bool) -> MountOptions {
    let uid = nix::unistd::getuid().as_raw();
    let gid = nix::unistd::getgid().as_raw();

    let mut mo = MountOptions::default();
    mo.fs_name("backupfs").uid(uid).gid(gid);
    // Backup agents often run as a different user than the daemon.
    if allow_other {
        mo.allow_other(true);
    }
    mo
}

/// Mount `fs` on the given empty directory.
#[cfg(target_os = "linux")]
pub async fn mount_backupfs(
    fs: BackupFs,
    mount_point: impl AsRef<Path>,
    options: MountOptions,
    unprivileged: bool,
) -> std::io::Result<MountHandle> {
    let mount_point = mount_point.as_ref();
    let session = rfuse3::raw::Session::new(options);
    if unprivileged {
        info!("mounting backupfs at {} (unprivileged)", mount_point.display());
        session.mount_with_unprivileged(fs, mount_point).await
    } else {
        info!("mounting backupfs at {} (privileged)", mount_point.display());
        session.mount(fs, mount_point).await
    }
}

/// Fallback stub for non-Linux targets.
#[cfg(not(target_os = "linux"))]
pub async fn mount_backupfs(
    _fs: BackupFs,
    _mount_point: impl AsRef<Path>,
    _options: MountOptions,
    _unprivileged: bool,
) -> std::io::Result<MountHandle> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "FUSE mount is only supported on Linux in this build",
    ))
}
