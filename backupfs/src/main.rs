use std::path::PathBuf;

use anyhow::Context;
use backupfs::config::{DEFAULT_DEVICE_NAME, DEFAULT_MAX_SESSIONS};
use backupfs::fuse::mount::{default_mount_options, mount_backupfs};
use backupfs::{BackupFs, Config, SessionManager};
use clap::Parser;
use log::info;
use tokio::signal;

const PATTERN_HELP: &str = "\
The pattern specifies the path that backups get stored in. Everything is
copied verbatim except for these directives:
    %Y - the current year padded to 4 digits
    %M - the current month padded to 2 digits
    %D - the current day padded to 2 digits
    %h - the current hour padded to 2 digits
    %m - the current minute padded to 2 digits
    %s - the current second padded to 2 digits
    %u - a random identifier
    %% - a literal %";

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Expose a write-only device that stores every write session as a new backup file",
    after_help = PATTERN_HELP
)]
struct Args {
    /// Empty directory to mount the device on
    mountpoint: PathBuf,
    /// Backing file path pattern, e.g. /srv/backups/%Y-%M-%D_%u.img
    #[arg(long, env = "BACKUPFS_PATTERN")]
    pattern: String,
    /// Name of the device entry inside the mount
    #[arg(long, default_value = DEFAULT_DEVICE_NAME)]
    devname: String,
    /// Owner uid reported for the root and the device
    #[arg(long, default_value_t = 0)]
    uid: u32,
    /// Owner gid reported for the root and the device
    #[arg(long, default_value_t = 0)]
    gid: u32,
    /// Read %u bytes from this file (e.g. /dev/random) instead of the OS generator
    #[arg(long)]
    random_source: Option<PathBuf>,
    /// Maximum number of concurrently open sessions
    #[arg(long, default_value_t = DEFAULT_MAX_SESSIONS)]
    max_sessions: usize,
    /// Create missing parent directories of expanded paths
    #[arg(long)]
    create_dirs: bool,
    /// Let users other than the mounting one access the device
    #[arg(long)]
    allow_other: bool,
    /// Mount directly instead of through fusermount3
    #[arg(long)]
    privileged: bool,
}

impl Args {
    fn config(&self) -> backupfs::Result<Config> {
        let config = Config {
            pattern: self.pattern.clone(),
            device_name: self.devname.clone(),
            uid: self.uid,
            gid: self.gid,
            random_source: self.random_source.clone(),
            max_sessions: self.max_sessions,
            create_dirs: self.create_dirs,
        };
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let config = args.config().context("invalid configuration")?;
    let sessions = SessionManager::new(config).context("failed to prepare sessions")?;
    let fs = BackupFs::new(sessions);

    std::fs::create_dir_all(&args.mountpoint)
        .with_context(|| format!("create mount point {}", args.mountpoint.display()))?;

    let mut mount_handle = mount_backupfs(
        fs,
        &args.mountpoint,
        default_mount_options(args.allow_other),
        !args.privileged,
    )
    .await
    .with_context(|| format!("mount backupfs at {}", args.mountpoint.display()))?;

    let handle = &mut mount_handle;
    tokio::select! {
        res = handle => res.context("fuse session ended with error")?,
        _ = signal::ctrl_c() => {
            info!("unmounting {}", args.mountpoint.display());
            mount_handle.unmount().await.context("unmount")?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults() {
        let args = Args::try_parse_from(["backupfs", "/mnt/backup", "--pattern", "/b/%u"]).unwrap();
        let config = args.config().unwrap();
        assert_eq!(config.device_name, "dev");
        assert_eq!((config.uid, config.gid), (0, 0));
        assert_eq!(config.max_sessions, DEFAULT_MAX_SESSIONS);
        assert!(!args.privileged);
    }

    #[test]
    fn empty_pattern_rejected() {
        let args = Args::try_parse_from(["backupfs", "/mnt/backup", "--pattern", ""]).unwrap();
        assert!(args.config().is_err());
    }

    #[test]
    fn cli_overrides() {
        let args = Args::try_parse_from([
            "backupfs",
            "/mnt/backup",
            "--pattern=/b/%Y",
            "--devname=tape",
            "--uid=34",
            "--gid=34",
            "--create-dirs",
        ])
        .unwrap();
        let config = args.config().unwrap();
        assert_eq!(config.device_path(), "/tape");
        assert_eq!((config.uid, config.gid), (34, 34));
        assert!(config.create_dirs);
    }
}
