//! Task engine driving the per-entry pipeline.
//!
//! A [`TarEngine`] owns at most one input stream and one output stream
//! and exposes three task modes:
//! - [`TarEngine::run_task`] — extract the input stream to a directory,
//! - [`TarEngine::run_task_writer`] — archive configured directories to
//!   the output stream,
//! - [`TarEngine::run_task_bridge`] — filter and re-encode the input
//!   stream onto the output stream without touching the filesystem.
//!
//! Entries are processed strictly in stream order; there is no
//! look-ahead and no reordering. Failures abort the task immediately
//! and partial side effects are left in place for the caller.

use anyhow::{anyhow, Context, Result};
use log::{debug, warn};
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tar_rs as tar;
use walkdir::WalkDir;

use crate::compression::CompressionMode;
use crate::config::Config;
use crate::entry::{normalize_entry_path, EntryKind};
use crate::fs_writer::FsWriter;
use crate::spec::{Link, SpecFile};

/// Per-entry decision returned by a [`WriteHandler`]. Created fresh for
/// every walked object and discarded once the entry is encoded.
#[derive(Debug, Clone, Default)]
pub struct FileOperation {
    pub skip: bool,
    pub rename: bool,
    pub new_name: PathBuf,
}

/// Snapshot of one walked filesystem object handed to a write handler.
pub struct WriteContext<'a> {
    /// Path as walked on disk.
    pub original_path: &'a Path,
    /// Path after the spec's rename rules were applied.
    pub computed_path: &'a Path,
    /// Header about to be encoded.
    pub header: &'a tar::Header,
}

/// Hook invoked for every object encoded in write mode. The returned
/// [`FileOperation`] may skip the entry or override its stream path;
/// there is no other shared state between hook invocations.
pub trait WriteHandler {
    fn decide(&self, ctx: &WriteContext<'_>) -> Result<FileOperation>;
}

impl<F> WriteHandler for F
where
    F: Fn(&WriteContext<'_>) -> Result<FileOperation>,
{
    fn decide(&self, ctx: &WriteContext<'_>) -> Result<FileOperation> {
        self(ctx)
    }
}

/// The stream-transformation engine. One active reader and one active
/// writer at most; they are consumed by the task that uses them and
/// never reassigned mid-task.
pub struct TarEngine {
    config: Config,
    fs: FsWriter,
    reader: Option<Box<dyn Read>>,
    writer: Option<Box<dyn Write>>,
    compression: CompressionMode,
    handler: Option<Box<dyn WriteHandler>>,
}

impl TarEngine {
    pub fn new(config: Config) -> Self {
        let fs = FsWriter::new(config.clone());
        Self {
            config,
            fs,
            reader: None,
            writer: None,
            compression: CompressionMode::None,
            handler: None,
        }
    }

    /// Attaches the input byte stream for the next read-consuming task.
    /// Compressed input must be wrapped by the caller (see
    /// [`CompressionMode::wrap_reader`]); read-side codecs need no
    /// finalize step so the engine does not own them.
    pub fn set_reader(&mut self, reader: impl Read + 'static) {
        self.reader = Some(Box::new(reader));
    }

    /// Attaches the raw output byte sink for the next write-producing
    /// task. The engine wraps it with the configured compression mode
    /// and guarantees the codec trailer is flushed, error path included.
    pub fn set_writer(&mut self, writer: impl Write + 'static) {
        self.writer = Some(Box::new(writer));
    }

    /// Selects the compression applied to the output stream.
    pub fn set_compression(&mut self, mode: CompressionMode) {
        self.compression = mode;
    }

    /// Installs the per-entry hook consulted in write mode.
    pub fn set_file_writer_handler(&mut self, handler: Box<dyn WriteHandler>) {
        self.handler = Some(handler);
    }

    fn take_reader(&mut self) -> Result<Box<dyn Read>> {
        self.reader
            .take()
            .ok_or_else(|| anyhow!("No input stream assigned; call set_reader first"))
    }

    fn take_writer(&mut self) -> Result<Box<dyn Write>> {
        self.writer
            .take()
            .ok_or_else(|| anyhow!("No output stream assigned; call set_writer first"))
    }

    /// Extract mode: decode the input stream and materialize surviving
    /// entries under `dest_dir`.
    pub fn run_task(&mut self, spec: &SpecFile, dest_dir: &Path) -> Result<()> {
        let reader = self.take_reader()?;
        let mut archive = tar::Archive::new(reader);

        // Directories stay owner-writable while the tree is being
        // populated; their exact modes are restored once the stream
        // is exhausted.
        let mut dir_modes: Vec<(PathBuf, u32)> = Vec::new();

        for entry in archive.entries().context("Failed to read tar stream")? {
            let mut entry = entry.context("Failed to decode tar entry")?;
            let header = entry.header().clone();

            let stream_path = entry
                .path()
                .context("Failed to decode entry path")?
                .into_owned();
            let path_str = stream_path.to_string_lossy().into_owned();

            if spec.ignored(&path_str) {
                debug!("Ignoring entry: {}", path_str);
                continue;
            }

            let (renamed, changed) = spec.renamed(&path_str);
            if changed {
                debug!("Renaming entry: {} -> {}", path_str, renamed);
            }

            let rel_path = normalize_entry_path(Path::new(&renamed));
            if rel_path.as_os_str().is_empty() {
                // Root records ("/", "./") have nothing to materialize.
                continue;
            }
            let dest = dest_dir.join(&rel_path);

            let Some(kind) = EntryKind::from_tar(header.entry_type()) else {
                warn!(
                    "Skipping unsupported entry type {:?}: {}",
                    header.entry_type(),
                    path_str
                );
                continue;
            };

            let mode = header
                .mode()
                .with_context(|| format!("Invalid mode in header: {}", path_str))?;

            match kind {
                EntryKind::Regular => {
                    let size = entry.size();
                    self.fs.create_file(&dest, mode, size, &mut entry)?;
                }
                EntryKind::Directory => {
                    self.fs.create_dir(&dest, mode)?;
                    dir_modes.push((dest.clone(), mode));
                }
                EntryKind::Symlink | EntryKind::Hardlink => {
                    let target = entry
                        .link_name()
                        .with_context(|| format!("Invalid link target: {}", path_str))?
                        .ok_or_else(|| anyhow!("Link entry without target: {}", path_str))?;
                    let link = if kind == EntryKind::Symlink {
                        Link {
                            name: dest.clone(),
                            path: target.into_owned(),
                            mode,
                            symbolic: true,
                        }
                    } else {
                        // Hardlink targets live inside the destination
                        // tree and must already be materialized.
                        Link {
                            name: dest.clone(),
                            path: dest_dir.join(normalize_entry_path(&target)),
                            mode,
                            symbolic: false,
                        }
                    };
                    self.fs.create_link(&link)?;
                }
                EntryKind::BlockDevice | EntryKind::CharDevice | EntryKind::Fifo => {
                    let major = header
                        .device_major()
                        .with_context(|| format!("Invalid device major: {}", path_str))?
                        .unwrap_or(0);
                    let minor = header
                        .device_minor()
                        .with_context(|| format!("Invalid device minor: {}", path_str))?
                        .unwrap_or(0);
                    self.fs
                        .create_block_char_fifo(&dest, kind, mode, major, minor)?;
                }
            }

            let uid = header.uid().unwrap_or(0);
            let gid = header.gid().unwrap_or(0);
            let mtime = header.mtime().unwrap_or(0) as i64;
            self.fs
                .apply_metadata(&dest, uid, gid, mtime, kind == EntryKind::Symlink)?;
        }

        // Deepest first, so a write-protected parent cannot block the
        // chmod of a child directory.
        dir_modes.sort_by_key(|(path, _)| std::cmp::Reverse(path.components().count()));
        for (path, mode) in dir_modes {
            self.fs.set_mode(&path, mode)?;
        }

        Ok(())
    }

    /// Write mode: walk the directories from the spec's writer
    /// configuration and encode them onto the output stream.
    pub fn run_task_writer(&mut self, spec: &SpecFile) -> Result<()> {
        let writer_spec = spec
            .writer
            .clone()
            .ok_or_else(|| anyhow!("Spec has no writer configuration"))?;

        let writer = self.take_writer()?;
        let compressed = self.compression.wrap_writer(writer)?;
        let mut builder = tar::Builder::new(compressed);
        builder.follow_symlinks(false);

        let mut result = Ok(());
        for dir in &writer_spec.archive_dirs {
            result = self.append_dir(&mut builder, dir, spec);
            if result.is_err() {
                break;
            }
        }

        // The trailer flush runs on the error path too; the data is
        // already known-invalid but the codec must not leak.
        let finish = builder
            .into_inner()
            .context("Failed to finish tar stream")
            .and_then(|w| w.finish());

        result.and(finish)
    }

    /// Bridge mode: filter the input stream through both specs and
    /// re-encode surviving entries onto the output stream. Content is
    /// copied entry by entry from the decode cursor, so memory stays
    /// bounded regardless of entry size. The filesystem is never
    /// touched.
    pub fn run_task_bridge(
        &mut self,
        reader_spec: &SpecFile,
        writer_spec: &SpecFile,
    ) -> Result<()> {
        let reader = self.take_reader()?;
        let writer = self.take_writer()?;
        let compressed = self.compression.wrap_writer(writer)?;
        let mut builder = tar::Builder::new(compressed);

        let result = self.bridge_entries(reader, reader_spec, writer_spec, &mut builder);

        let finish = builder
            .into_inner()
            .context("Failed to finish tar stream")
            .and_then(|w| w.finish());

        result.and(finish)
    }

    fn bridge_entries<W: Write>(
        &self,
        reader: Box<dyn Read>,
        reader_spec: &SpecFile,
        writer_spec: &SpecFile,
        builder: &mut tar::Builder<W>,
    ) -> Result<()> {
        let mut archive = tar::Archive::new(reader);

        for entry in archive.entries().context("Failed to read tar stream")? {
            let mut entry = entry.context("Failed to decode tar entry")?;
            let mut header = entry.header().clone();

            let path_str = entry
                .path()
                .context("Failed to decode entry path")?
                .to_string_lossy()
                .into_owned();

            if reader_spec.ignored(&path_str) {
                debug!("Ignoring entry on ingress: {}", path_str);
                continue;
            }
            let (path_in, _) = reader_spec.renamed(&path_str);

            // Egress rules see the already-renamed path.
            if writer_spec.ignored(&path_in) {
                debug!("Ignoring entry on egress: {}", path_in);
                continue;
            }
            let (path_out, _) = writer_spec.renamed(&path_in);
            if path_out.is_empty() {
                // Root records ("/", "./") have no path left to encode.
                debug!("Skipping root record: {}", path_str);
                continue;
            }

            if writer_spec.same_chtimes {
                header.set_mtime(unix_now()?);
            }

            match EntryKind::from_tar(header.entry_type()) {
                Some(EntryKind::Symlink) | Some(EntryKind::Hardlink) => {
                    let target = entry
                        .link_name()
                        .with_context(|| format!("Invalid link target: {}", path_str))?
                        .ok_or_else(|| anyhow!("Link entry without target: {}", path_str))?
                        .into_owned();
                    builder
                        .append_link(&mut header, &path_out, &target)
                        .with_context(|| format!("Failed to re-encode link: {}", path_out))?;
                }
                _ => {
                    builder
                        .append_data(&mut header, &path_out, &mut entry)
                        .with_context(|| format!("Failed to re-encode entry: {}", path_out))?;
                }
            }
        }

        Ok(())
    }

    /// Walks one directory and encodes it onto an already-open encoder.
    /// Used for multi-directory archive assembly without a full spec.
    pub fn inject_dir_to_writer<W: Write>(
        &self,
        builder: &mut tar::Builder<W>,
        dir: &Path,
    ) -> Result<()> {
        self.append_dir(builder, dir, &SpecFile::new())
    }

    fn append_dir<W: Write>(
        &self,
        builder: &mut tar::Builder<W>,
        dir: &Path,
        spec: &SpecFile,
    ) -> Result<()> {
        for walked in WalkDir::new(dir).follow_links(false).sort_by_file_name() {
            let walked =
                walked.with_context(|| format!("Failed to walk directory: {}", dir.display()))?;
            let path = walked.path();
            let metadata = std::fs::symlink_metadata(path)
                .with_context(|| format!("Failed to read metadata: {}", path.display()))?;

            let path_str = path.to_string_lossy();
            if spec.ignored(&path_str) {
                debug!("Ignoring walked path: {}", path_str);
                continue;
            }
            let (computed, _) = spec.renamed(&path_str);

            let mut header = tar::Header::new_gnu();
            header.set_metadata(&metadata);
            if spec.same_chtimes {
                header.set_mtime(unix_now()?);
            }

            let mut operation = FileOperation::default();
            if let Some(handler) = &self.handler {
                let ctx = WriteContext {
                    original_path: path,
                    computed_path: Path::new(&computed),
                    header: &header,
                };
                operation = handler.decide(&ctx)?;
            }
            if operation.skip {
                debug!("Handler skipped entry: {}", path_str);
                continue;
            }
            let out_path = if operation.rename {
                operation.new_name
            } else {
                PathBuf::from(&computed)
            };
            if out_path.as_os_str().is_empty() {
                continue;
            }

            if self.config.debug {
                debug!("Appending {} as {}", path.display(), out_path.display());
            }

            let file_type = metadata.file_type();
            if file_type.is_dir() {
                builder
                    .append_data(&mut header, &out_path, std::io::empty())
                    .with_context(|| format!("Failed to append directory: {}", path_str))?;
            } else if file_type.is_symlink() {
                let target = std::fs::read_link(path)
                    .with_context(|| format!("Failed to read symlink: {}", path_str))?;
                builder
                    .append_link(&mut header, &out_path, &target)
                    .with_context(|| format!("Failed to append symlink: {}", path_str))?;
            } else if file_type.is_file() {
                let mut file = File::open(path)
                    .with_context(|| format!("Failed to open file: {}", path_str))?;
                builder
                    .append_data(&mut header, &out_path, &mut file)
                    .with_context(|| format!("Failed to append file: {}", path_str))?;
            } else {
                self.append_special(builder, &mut header, path, &out_path, &metadata)?;
            }
        }

        Ok(())
    }

    #[cfg(unix)]
    fn append_special<W: Write>(
        &self,
        builder: &mut tar::Builder<W>,
        header: &mut tar::Header,
        path: &Path,
        out_path: &Path,
        metadata: &std::fs::Metadata,
    ) -> Result<()> {
        use std::os::unix::fs::{FileTypeExt, MetadataExt};

        let file_type = metadata.file_type();
        if file_type.is_block_device() || file_type.is_char_device() {
            let rdev = metadata.rdev();
            header
                .set_device_major(rustix::fs::major(rdev))
                .with_context(|| format!("Failed to set device major: {}", path.display()))?;
            header
                .set_device_minor(rustix::fs::minor(rdev))
                .with_context(|| format!("Failed to set device minor: {}", path.display()))?;
        } else if !file_type.is_fifo() {
            // Sockets and anything else have no tar representation.
            warn!("Skipping unsupported file type: {}", path.display());
            return Ok(());
        }

        builder
            .append_data(header, out_path, std::io::empty())
            .with_context(|| format!("Failed to append node: {}", path.display()))
    }

    #[cfg(not(unix))]
    fn append_special<W: Write>(
        &self,
        _builder: &mut tar::Builder<W>,
        _header: &mut tar::Header,
        path: &Path,
        _out_path: &Path,
        _metadata: &std::fs::Metadata,
    ) -> Result<()> {
        warn!("Skipping unsupported file type: {}", path.display());
        Ok(())
    }
}

fn unix_now() -> Result<u64> {
    Ok(SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("System clock before unix epoch")?
        .as_secs())
}
