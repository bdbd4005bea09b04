//! FUSE adapter
//!
//! Exposes a [`SessionManager`] through the rfuse3 raw API. The mount holds
//! exactly two inodes: the root directory and the write-only device entry.
//! Attribute and listing requests are answered from static metadata; open,
//! write, flush, fsync and release are forwarded by file handle.
pub mod mount;

use std::ffi::{OsStr, OsString};
use std::num::NonZeroU32;
use std::pin::Pin;
use std::time::{Duration, SystemTime};

use futures_util::stream::{self, Stream};
use rfuse3::Result as FuseResult;
use rfuse3::raw::reply::{
    DirectoryEntry, DirectoryEntryPlus, FileAttr, ReplyAttr, ReplyDirectory, ReplyDirectoryPlus,
    ReplyEntry, ReplyInit, ReplyOpen, ReplyStatFs, ReplyWrite,
};
use rfuse3::raw::{Filesystem, Request};
use rfuse3::{FileType, SetAttr, Timestamp};

use crate::session::{EntryAttr, EntryKind, ROOT_PATH, SessionManager};
use crate::util::open_options::FopenFlags;

pub const ROOT_INO: u64 = 1;
pub const DEVICE_INO: u64 = 2;

const TTL: Duration = Duration::from_secs(1);
const MAX_WRITE: NonZeroU32 = NonZeroU32::new(1024 * 1024).unwrap();

pub struct BackupFs {
    sessions: SessionManager,
    mounted_at: SystemTime,
}

impl BackupFs {
    pub fn new(sessions: SessionManager) -> Self {
        BackupFs {
            sessions,
            mounted_at: SystemTime::now(),
        }
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    fn path_of(&self, ino: u64) -> Option<String> {
        match ino {
            ROOT_INO => Some(ROOT_PATH.to_string()),
            DEVICE_INO => Some(self.sessions.config().device_path()),
            _ => None,
        }
    }

    fn attr_of(&self, ino: u64) -> FuseResult<FileAttr> {
        let Some(path) = self.path_of(ino) else {
            return Err(libc::ENOENT.into());
        };
        let attr = self.sessions.get_attributes(&path)?;
        Ok(to_fuse_attr(ino, &attr, self.mounted_at))
    }

    /// Root listing as `(inode, kind, name)`, `.` and `..` first.
    fn root_entries(&self) -> FuseResult<Vec<(u64, FileType, OsString)>> {
        let names = self.sessions.list_directory(ROOT_PATH)?;
        Ok(names
            .into_iter()
            .map(|name| match name.as_str() {
                "." | ".." => (ROOT_INO, FileType::Directory, OsString::from(name)),
                _ => (DEVICE_INO, FileType::RegularFile, OsString::from(name)),
            })
            .collect())
    }

    fn check_dir(&self, ino: u64) -> FuseResult<()> {
        match ino {
            ROOT_INO => Ok(()),
            DEVICE_INO => Err(libc::ENOTDIR.into()),
            _ => Err(libc::ENOENT.into()),
        }
    }
}

impl Filesystem for BackupFs {
    type DirEntryStream<'a>
        = Pin<Box<dyn Stream<Item = FuseResult<DirectoryEntry>> + Send + 'a>>
    where
        Self: 'a;

    type DirEntryPlusStream<'a>
        = Pin<Box<dyn Stream<Item = FuseResult<DirectoryEntryPlus>> + Send + 'a>>
    where
        Self: 'a;

    async fn init(&self, _req: Request) -> FuseResult<ReplyInit> {
        info!(
            "backupfs ready: device {} -> {}",
            self.sessions.config().device_path(),
            self.sessions.config().pattern
        );
        Ok(ReplyInit {
            max_write: MAX_WRITE,
        })
    }

    async fn destroy(&self, _req: Request) {
        debug!("destroy()");
        if let Err(e) = self.sessions.shutdown() {
            error!("destroy(): {e}");
        }
    }

    async fn lookup(&self, _req: Request, parent: u64, name: &OsStr) -> FuseResult<ReplyEntry> {
        debug!("lookup(): parent {parent} name {}", name.to_string_lossy());
        self.check_dir(parent)?;
        if name != OsStr::new(&self.sessions.config().device_name) {
            return Err(libc::ENOENT.into());
        }
        Ok(ReplyEntry {
            ttl: TTL,
            attr: self.attr_of(DEVICE_INO)?,
            generation: 0,
        })
    }

    async fn getattr(
        &self,
        _req: Request,
        ino: u64,
        _fh: Option<u64>,
        _flags: u32,
    ) -> FuseResult<ReplyAttr> {
        debug!("getattr(): ino {ino}");
        Ok(ReplyAttr {
            ttl: TTL,
            attr: self.attr_of(ino)?,
        })
    }

    // Only size changes are meaningful and they are ignored; the device
    // always reports its static attributes.
    async fn setattr(
        &self,
        _req: Request,
        ino: u64,
        _fh: Option<u64>,
        set_attr: SetAttr,
    ) -> FuseResult<ReplyAttr> {
        debug!("setattr(): ino {ino}");
        let Some(path) = self.path_of(ino) else {
            return Err(libc::ENOENT.into());
        };
        if let Some(size) = set_attr.size {
            self.sessions.truncate(&path, size);
        }
        Ok(ReplyAttr {
            ttl: TTL,
            attr: self.attr_of(ino)?,
        })
    }

    async fn open(&self, _req: Request, ino: u64, flags: u32) -> FuseResult<ReplyOpen> {
        debug!("open(): ino {ino} flags {flags:#o}");
        let Some(path) = self.path_of(ino) else {
            return Err(libc::ENOENT.into());
        };
        let fh = self.sessions.open(&path, flags)?;
        Ok(ReplyOpen {
            fh,
            flags: FopenFlags::DIRECT_IO.bits(),
        })
    }

    async fn write(
        &self,
        _req: Request,
        ino: u64,
        fh: u64,
        offset: u64,
        data: &[u8],
        _write_flags: u32,
        _flags: u32,
    ) -> FuseResult<ReplyWrite> {
        debug!("write(): ino {ino} fh {fh} len {}", data.len());
        let written = self.sessions.write(fh, data, offset)?;
        Ok(ReplyWrite {
            written: written as u32,
        })
    }

    async fn flush(&self, _req: Request, ino: u64, fh: u64, _lock_owner: u64) -> FuseResult<()> {
        debug!("flush(): ino {ino} fh {fh}");
        Ok(self.sessions.flush(fh)?)
    }

    async fn fsync(&self, _req: Request, ino: u64, fh: u64, _datasync: bool) -> FuseResult<()> {
        debug!("fsync(): ino {ino} fh {fh}");
        Ok(self.sessions.flush(fh)?)
    }

    async fn release(
        &self,
        _req: Request,
        ino: u64,
        fh: u64,
        _flags: u32,
        _lock_owner: u64,
        _flush: bool,
    ) -> FuseResult<()> {
        debug!("release(): ino {ino} fh {fh}");
        Ok(self.sessions.release(fh)?)
    }

    async fn opendir(&self, _req: Request, ino: u64, _flags: u32) -> FuseResult<ReplyOpen> {
        debug!("opendir(): ino {ino}");
        self.check_dir(ino)?;
        Ok(ReplyOpen { fh: 0, flags: 0 })
    }

    async fn releasedir(&self, _req: Request, _ino: u64, _fh: u64, _flags: u32) -> FuseResult<()> {
        Ok(())
    }

    async fn readdir<'a>(
        &'a self,
        _req: Request,
        ino: u64,
        _fh: u64,
        offset: i64,
    ) -> FuseResult<ReplyDirectory<Self::DirEntryStream<'a>>> {
        debug!("readdir(): ino {ino} offset {offset}");
        self.check_dir(ino)?;
        let entries: Vec<FuseResult<DirectoryEntry>> = self
            .root_entries()?
            .into_iter()
            .enumerate()
            .map(|(i, (inode, kind, name))| DirectoryEntry {
                inode,
                kind,
                name,
                offset: i as i64 + 1,
            })
            .skip(offset.max(0) as usize)
            .map(Ok)
            .collect();
        let boxed: Self::DirEntryStream<'a> = Box::pin(stream::iter(entries));
        Ok(ReplyDirectory { entries: boxed })
    }

    async fn readdirplus<'a>(
        &'a self,
        _req: Request,
        ino: u64,
        _fh: u64,
        offset: u64,
        _lock_owner: u64,
    ) -> FuseResult<ReplyDirectoryPlus<Self::DirEntryPlusStream<'a>>> {
        debug!("readdirplus(): ino {ino} offset {offset}");
        self.check_dir(ino)?;
        let mut entries: Vec<FuseResult<DirectoryEntryPlus>> = Vec::new();
        for (i, (inode, kind, name)) in self.root_entries()?.into_iter().enumerate() {
            if (i as u64) < offset {
                continue;
            }
            entries.push(Ok(DirectoryEntryPlus {
                inode,
                generation: 0,
                kind,
                name,
                offset: i as i64 + 1,
                attr: self.attr_of(inode)?,
                entry_ttl: TTL,
                attr_ttl: TTL,
            }));
        }
        let boxed: Self::DirEntryPlusStream<'a> = Box::pin(stream::iter(entries));
        Ok(ReplyDirectoryPlus { entries: boxed })
    }

    async fn statfs(&self, _req: Request, _ino: u64) -> FuseResult<ReplyStatFs> {
        Ok(ReplyStatFs {
            blocks: 0,
            bfree: 0,
            bavail: 0,
            files: 2,
            ffree: 0,
            bsize: 4096,
            namelen: 255,
            frsize: 4096,
        })
    }

    async fn forget(&self, _req: Request, _inode: u64, _nlookup: u64) {}

    async fn batch_forget(&self, _req: Request, _inodes: &[(u64, u64)]) {}

    async fn interrupt(&self, _req: Request, _unique: u64) -> FuseResult<()> {
        Ok(())
    }
}

fn to_fuse_attr(ino: u64, attr: &EntryAttr, mtime: SystemTime) -> FileAttr {
    let ts = Timestamp::from(mtime);
    FileAttr {
        ino,
        size: attr.size,
        blocks: 0,
        atime: ts,
        mtime: ts,
        ctime: ts,
        #[cfg(target_os = "macos")]
        crtime: ts,
        kind: match attr.kind {
            EntryKind::Directory => FileType::Directory,
            EntryKind::RegularFile => FileType::RegularFile,
        },
        perm: attr.perm,
        nlink: attr.nlink,
        uid: attr.uid,
        gid: attr.gid,
        rdev: 0,
        #[cfg(target_os = "macos")]
        flags: 0,
        blksize: 4096,
    }
}


#[cfg(all(test, target_os = "linux"))]
mod mount_tests {
    use super::*;
    use crate::config::Config;
    use crate::fuse::mount::{default_mount_options, mount_backupfs};
    use std::fs;
    use std::io::Write;
    use std::time::Duration as StdDuration;

    // Real mount smoke test, opt-in with BACKUPFS_FUSE_TEST=1.
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn smoke_mount_and_write_sessions() {
        if std::env::var("BACKUPFS_FUSE_TEST").ok().as_deref() != Some("1") {
            eprintln!("skip fuse mount test: set BACKUPFS_FUSE_TEST=1 to enable");
            return;
        }

        let backups = tempfile::tempdir().expect("tmp backups");
        let mnt = tempfile::tempdir().expect("tmp mount");
        let mnt_path = mnt.path().to_path_buf();

        let config = Config::new(format!("{}/%Y%M%D-%u.img", backups.path().display())).unwrap();
        let fs = BackupFs::new(SessionManager::new(config).unwrap());
        let handle = match mount_backupfs(fs, &mnt_path, default_mount_options(false), true).await
        {
            Ok(h) => h,
            Err(e) => {
                eprintln!("skip fuse test: mount failed: {e}");
                return;
            }
        };

        tokio::time::sleep(StdDuration::from_millis(1000)).await;

        let device = mnt_path.join("dev");
        tokio::task::spawn_blocking(move || {
            for payload in [&b"first backup"[..], &b"second backup"[..]] {
                let mut f = fs::OpenOptions::new()
                    .write(true)
                    .open(&device)
                    .expect("open device");
                f.write_all(payload).expect("write");
                f.flush().expect("flush");
            }
            let err = fs::File::open(&device).expect_err("read open must fail");
            assert_eq!(err.kind(), std::io::ErrorKind::PermissionDenied);

            let names: Vec<_> = fs::read_dir(device.parent().unwrap())
                .expect("readdir")
                .filter_map(|e| e.ok())
                .map(|e| e.file_name())
                .collect();
            assert_eq!(names, vec![OsString::from("dev")]);
        })
        .await
        .expect("client thread");

        if let Err(e) = handle.unmount().await {
            eprintln!("unmount error: {e}");
        }

        let mut contents: Vec<_> = fs::read_dir(backups.path())
            .unwrap()
            .map(|e| fs::read(e.unwrap().path()).unwrap())
            .collect();
        contents.sort();
        assert_eq!(
            contents,
            vec![b"first backup".to_vec(), b"second backup".to_vec()]
        );
    }
}
