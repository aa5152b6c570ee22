use anyhow::{anyhow, bail, Context, Result};
use log::{debug, warn};
use std::fs::{self, OpenOptions};
use std::io::Read;
use std::path::Path;

use crate::config::Config;
use crate::entry::EntryKind;
use crate::spec::Link;

/// Default mode for parent directories created on demand for entries
/// whose own directory record is missing or arrives out of order.
const IMPLICIT_DIR_MODE: u32 = 0o755;

/// Materializes decoded entries as filesystem objects.
///
/// All operations are fatal on failure; nothing is retried and partial
/// trees are left in place for the caller to deal with.
pub struct FsWriter {
    config: Config,
}

impl FsWriter {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Recursive, idempotent directory creation.
    pub fn create_dir(&self, path: &Path, mode: u32) -> Result<()> {
        fs::create_dir_all(path)
            .with_context(|| format!("Failed to create directory: {}", path.display()))?;

        // Keep the directory at least traversable by the owner so the
        // rest of the extraction can write into it.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let safe_mode = (mode & 0o7777) | 0o700;
            fs::set_permissions(path, fs::Permissions::from_mode(safe_mode)).with_context(
                || format!("Failed to set permissions on: {}", path.display()),
            )?;
        }
        #[cfg(not(unix))]
        let _ = mode;

        Ok(())
    }

    fn ensure_parent(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.is_dir() {
                self.create_dir(parent, IMPLICIT_DIR_MODE)?;
            }
        }
        Ok(())
    }

    /// Streams exactly `size` bytes from the entry cursor into a
    /// truncated destination file. A byte-count mismatch means the
    /// stream is corrupt or truncated and aborts the task.
    pub fn create_file(
        &self,
        path: &Path,
        mode: u32,
        size: u64,
        reader: &mut dyn Read,
    ) -> Result<()> {
        self.ensure_parent(path)?;
        self.remove_existing(path);

        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(mode & 0o7777);
        }
        #[cfg(not(unix))]
        let _ = mode;

        let mut file = options
            .open(path)
            .with_context(|| format!("Failed to open file for writing: {}", path.display()))?;

        let written = std::io::copy(reader, &mut file)
            .with_context(|| format!("Failed to write file: {}", path.display()))?;

        if written != size {
            bail!(
                "Short write for {}: {} bytes written, {} declared",
                path.display(),
                written,
                size
            );
        }

        // The open mode is subject to the umask; reassert the header
        // bits so extraction preserves permissions exactly.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777))
                .with_context(|| format!("Failed to set permissions on: {}", path.display()))?;
        }

        if self.config.debug {
            debug!("Written {} bytes to {}", written, path.display());
        }

        Ok(())
    }

    /// Creates a symbolic or hard link described by `link`. Symlinks
    /// point at the recorded target verbatim; hardlink targets must
    /// already exist in the destination tree.
    pub fn create_link(&self, link: &Link) -> Result<()> {
        self.ensure_parent(&link.name)?;
        self.remove_existing(&link.name);

        if link.symbolic {
            #[cfg(unix)]
            std::os::unix::fs::symlink(&link.path, &link.name).with_context(|| {
                format!(
                    "Failed to create symlink {} -> {}",
                    link.name.display(),
                    link.path.display()
                )
            })?;
            #[cfg(not(unix))]
            bail!(
                "Symlinks are not supported on this platform: {}",
                link.name.display()
            );
        } else {
            // Hardlinks that precede their target in the stream fail
            // here; the engine does not defer or retry them.
            fs::hard_link(&link.path, &link.name).with_context(|| {
                format!(
                    "Failed to create hardlink {} -> {} (target must already exist)",
                    link.name.display(),
                    link.path.display()
                )
            })?;
        }

        Ok(())
    }

    /// Creates a block device, character device or fifo node from the
    /// declared major/minor pair. Missing privilege surfaces as an
    /// error for the entry, never a retry.
    pub fn create_block_char_fifo(
        &self,
        path: &Path,
        kind: EntryKind,
        mode: u32,
        major: u32,
        minor: u32,
    ) -> Result<()> {
        self.ensure_parent(path)?;

        #[cfg(unix)]
        {
            use rustix::fs::{makedev, mknodat, FileType, Mode, CWD};

            let file_type = match kind {
                EntryKind::BlockDevice => FileType::BlockDevice,
                EntryKind::CharDevice => FileType::CharacterDevice,
                EntryKind::Fifo => FileType::Fifo,
                other => {
                    return Err(anyhow!(
                        "Entry kind {:?} is not a device or fifo: {}",
                        other,
                        path.display()
                    ))
                }
            };

            let dev = match kind {
                EntryKind::Fifo => 0,
                _ => makedev(major, minor),
            };

            mknodat(CWD, path, file_type, Mode::from_raw_mode(mode & 0o7777), dev).with_context(
                || {
                    format!(
                        "Failed to create {:?} node {} (major {}, minor {})",
                        kind,
                        path.display(),
                        major,
                        minor
                    )
                },
            )?;

            Ok(())
        }

        #[cfg(not(unix))]
        {
            let _ = (kind, mode, major, minor);
            bail!(
                "Device and fifo nodes are not supported on this platform: {}",
                path.display()
            );
        }
    }

    /// Applies exact permission bits to an existing object.
    pub fn set_mode(&self, path: &Path, mode: u32) -> Result<()> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777))
                .with_context(|| format!("Failed to set permissions on: {}", path.display()))?;
        }
        #[cfg(not(unix))]
        let _ = (path, mode);
        Ok(())
    }

    /// Applies ownership and timestamps after the object exists, so
    /// content writes cannot clobber a just-set mtime.
    pub fn apply_metadata(
        &self,
        path: &Path,
        uid: u64,
        gid: u64,
        mtime: i64,
        symlink: bool,
    ) -> Result<()> {
        #[cfg(unix)]
        if self.config.same_owner {
            use rustix::fs::{chownat, AtFlags, Gid, Uid, CWD};

            let flags = if symlink {
                AtFlags::SYMLINK_NOFOLLOW
            } else {
                AtFlags::empty()
            };
            let uid = Uid::from_raw(uid as u32);
            let gid = Gid::from_raw(gid as u32);
            chownat(CWD, path, Some(uid), Some(gid), flags)
                .with_context(|| format!("Failed to set ownership on: {}", path.display()))?;
        }
        #[cfg(not(unix))]
        if self.config.same_owner {
            let _ = (uid, gid);
            warn!(
                "Ownership preservation is not supported on this platform: {}",
                path.display()
            );
        }

        if self.config.same_chtimes && !symlink {
            let time = filetime::FileTime::from_unix_time(mtime, 0);
            filetime::set_file_times(path, time, time)
                .with_context(|| format!("Failed to set times on: {}", path.display()))?;
        }

        Ok(())
    }

    // Overwriting an existing object follows last-entry-wins stream
    // semantics. Removal errors are deferred to the creation call.
    fn remove_existing(&self, path: &Path) {
        if let Ok(metadata) = fs::symlink_metadata(path) {
            if metadata.is_dir() && !metadata.is_symlink() {
                return;
            }
            if fs::remove_file(path).is_err() {
                warn!("Failed to remove existing entry at: {}", path.display());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn writer() -> FsWriter {
        FsWriter::new(Config::new())
    }

    #[test]
    fn test_create_dir_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("a/b/c");
        writer().create_dir(&target, 0o755).unwrap();
        writer().create_dir(&target, 0o755).unwrap();
        assert!(target.is_dir());
    }

    #[test]
    fn test_create_file_writes_declared_size() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("sub/file.txt");
        let content = b"hello tarflow";
        writer()
            .create_file(
                &target,
                0o644,
                content.len() as u64,
                &mut Cursor::new(content),
            )
            .unwrap();
        assert_eq!(fs::read(&target).unwrap(), content);
    }

    #[test]
    fn test_create_file_short_content_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("file.txt");
        // Declared size exceeds what the cursor can provide.
        let err = writer()
            .create_file(&target, 0o644, 64, &mut Cursor::new(b"short"))
            .unwrap_err();
        assert!(err.to_string().contains("Short write"));
    }

    #[cfg(unix)]
    #[test]
    fn test_create_symlink_keeps_recorded_target() {
        let dir = tempfile::tempdir().unwrap();
        let link = Link {
            name: dir.path().join("link"),
            path: "../missing/target".into(),
            mode: 0o777,
            symbolic: true,
        };
        writer().create_link(&link).unwrap();
        assert_eq!(
            fs::read_link(&link.name).unwrap(),
            std::path::PathBuf::from("../missing/target")
        );
    }

    #[test]
    fn test_hardlink_target_missing_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let link = Link {
            name: dir.path().join("link"),
            path: dir.path().join("no-such-target"),
            mode: 0o644,
            symbolic: false,
        };
        assert!(writer().create_link(&link).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_create_fifo() {
        use std::os::unix::fs::FileTypeExt;

        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("queue");
        writer()
            .create_block_char_fifo(&target, EntryKind::Fifo, 0o644, 0, 0)
            .unwrap();
        let metadata = fs::symlink_metadata(&target).unwrap();
        assert!(metadata.file_type().is_fifo());
    }

    #[cfg(unix)]
    #[test]
    fn test_device_number_encoding() {
        use rustix::fs::{major, makedev, minor};

        // A block device declared (8, 0) must combine into a device
        // number that decodes back to the same pair.
        let dev = makedev(8, 0);
        assert_eq!(major(dev), 8);
        assert_eq!(minor(dev), 0);
    }
}
