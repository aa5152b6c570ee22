use anyhow::{bail, Context, Result};
use std::io::{Read, Write};
use std::path::Path;

/// Named compression filter applied around a tar stream.
///
/// Selection order: an explicit mode name always wins; otherwise the
/// mode is inferred from the file extension of the source/destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionMode {
    #[default]
    None,
    Gzip,
    Zstd,
    Xz,
    Bzip2,
}

impl CompressionMode {
    /// Parses a mode name. Unrecognized names are a configuration error.
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "gz" | "gzip" => Ok(CompressionMode::Gzip),
            "zstd" => Ok(CompressionMode::Zstd),
            "xz" => Ok(CompressionMode::Xz),
            "bz2" | "bzip2" => Ok(CompressionMode::Bzip2),
            "none" | "" => Ok(CompressionMode::None),
            other => bail!(
                "Invalid compression mode '{}'. Possible values: gz|gzip|zstd|xz|bz2|bzip2|none",
                other
            ),
        }
    }

    /// Infers the mode from a file name; unknown extensions mean no
    /// compression.
    pub fn from_extension(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("gz") | Some("tgz") => CompressionMode::Gzip,
            Some("zst") | Some("tzst") => CompressionMode::Zstd,
            Some("xz") | Some("txz") => CompressionMode::Xz,
            Some("bz2") | Some("tbz2") => CompressionMode::Bzip2,
            _ => CompressionMode::None,
        }
    }

    /// Wraps a byte source in the matching codec reader. Decompression
    /// errors surface later as entry-decode failures.
    pub fn wrap_reader(self, inner: Box<dyn Read>) -> Result<Box<dyn Read>> {
        Ok(match self {
            CompressionMode::None => inner,
            CompressionMode::Gzip => Box::new(flate2::read::GzDecoder::new(inner)),
            CompressionMode::Zstd => Box::new(
                zstd::stream::read::Decoder::new(inner)
                    .context("Failed to create zstd decoder")?,
            ),
            CompressionMode::Xz => Box::new(xz2::read::XzDecoder::new(inner)),
            CompressionMode::Bzip2 => Box::new(bzip2::read::BzDecoder::new(inner)),
        })
    }

    /// Wraps a byte sink in the matching codec writer. The returned
    /// writer must be finished with [`CompressedWriter::finish`] or the
    /// produced archive is truncated.
    pub fn wrap_writer(self, inner: Box<dyn Write>) -> Result<CompressedWriter> {
        Ok(match self {
            CompressionMode::None => CompressedWriter::Plain(inner),
            CompressionMode::Gzip => CompressedWriter::Gzip(flate2::write::GzEncoder::new(
                inner,
                flate2::Compression::default(),
            )),
            CompressionMode::Zstd => CompressedWriter::Zstd(
                zstd::stream::write::Encoder::new(inner, 0)
                    .context("Failed to create zstd encoder")?,
            ),
            CompressionMode::Xz => CompressedWriter::Xz(xz2::write::XzEncoder::new(inner, 6)),
            CompressionMode::Bzip2 => CompressedWriter::Bzip2(bzip2::write::BzEncoder::new(
                inner,
                bzip2::Compression::default(),
            )),
        })
    }
}

/// Codec writer with an explicit finalize step that flushes trailers.
pub enum CompressedWriter {
    Plain(Box<dyn Write>),
    Gzip(flate2::write::GzEncoder<Box<dyn Write>>),
    Zstd(zstd::stream::write::Encoder<'static, Box<dyn Write>>),
    Xz(xz2::write::XzEncoder<Box<dyn Write>>),
    Bzip2(bzip2::write::BzEncoder<Box<dyn Write>>),
}

impl Write for CompressedWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            CompressedWriter::Plain(w) => w.write(buf),
            CompressedWriter::Gzip(w) => w.write(buf),
            CompressedWriter::Zstd(w) => w.write(buf),
            CompressedWriter::Xz(w) => w.write(buf),
            CompressedWriter::Bzip2(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            CompressedWriter::Plain(w) => w.flush(),
            CompressedWriter::Gzip(w) => w.flush(),
            CompressedWriter::Zstd(w) => w.flush(),
            CompressedWriter::Xz(w) => w.flush(),
            CompressedWriter::Bzip2(w) => w.flush(),
        }
    }
}

impl CompressedWriter {
    /// Flushes the codec trailer and the underlying sink. Must run even
    /// on error paths; skipping it leaves an unreadable archive.
    pub fn finish(self) -> Result<()> {
        match self {
            CompressedWriter::Plain(mut w) => {
                w.flush().context("Failed to flush output stream")?;
            }
            CompressedWriter::Gzip(w) => {
                let mut inner = w.finish().context("Failed to finish gzip stream")?;
                inner.flush().context("Failed to flush output stream")?;
            }
            CompressedWriter::Zstd(w) => {
                let mut inner = w.finish().context("Failed to finish zstd stream")?;
                inner.flush().context("Failed to flush output stream")?;
            }
            CompressedWriter::Xz(w) => {
                let mut inner = w.finish().context("Failed to finish xz stream")?;
                inner.flush().context("Failed to flush output stream")?;
            }
            CompressedWriter::Bzip2(w) => {
                let mut inner = w.finish().context("Failed to finish bzip2 stream")?;
                inner.flush().context("Failed to flush output stream")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mode_names() {
        assert_eq!(
            CompressionMode::parse("gz").unwrap(),
            CompressionMode::Gzip
        );
        assert_eq!(
            CompressionMode::parse("gzip").unwrap(),
            CompressionMode::Gzip
        );
        assert_eq!(
            CompressionMode::parse("zstd").unwrap(),
            CompressionMode::Zstd
        );
        assert_eq!(CompressionMode::parse("xz").unwrap(), CompressionMode::Xz);
        assert_eq!(
            CompressionMode::parse("bz2").unwrap(),
            CompressionMode::Bzip2
        );
        assert_eq!(
            CompressionMode::parse("bzip2").unwrap(),
            CompressionMode::Bzip2
        );
        assert_eq!(
            CompressionMode::parse("none").unwrap(),
            CompressionMode::None
        );
        assert!(CompressionMode::parse("lz4").is_err());
    }

    #[test]
    fn test_from_extension() {
        assert_eq!(
            CompressionMode::from_extension(Path::new("rootfs.tar.gz")),
            CompressionMode::Gzip
        );
        assert_eq!(
            CompressionMode::from_extension(Path::new("rootfs.tzst")),
            CompressionMode::Zstd
        );
        assert_eq!(
            CompressionMode::from_extension(Path::new("rootfs.tar.xz")),
            CompressionMode::Xz
        );
        assert_eq!(
            CompressionMode::from_extension(Path::new("rootfs.tar.bz2")),
            CompressionMode::Bzip2
        );
        assert_eq!(
            CompressionMode::from_extension(Path::new("rootfs.tar")),
            CompressionMode::None
        );
    }

    fn roundtrip(mode: CompressionMode) {
        let payload = b"tarflow codec roundtrip payload".repeat(64);

        let buffer: Vec<u8> = Vec::new();
        let shared = std::rc::Rc::new(std::cell::RefCell::new(buffer));

        struct SharedSink(std::rc::Rc<std::cell::RefCell<Vec<u8>>>);
        impl Write for SharedSink {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.0.borrow_mut().extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let mut writer = mode
            .wrap_writer(Box::new(SharedSink(shared.clone())))
            .unwrap();
        writer.write_all(&payload).unwrap();
        writer.finish().unwrap();

        let compressed = shared.borrow().clone();
        let mut reader = mode
            .wrap_reader(Box::new(std::io::Cursor::new(compressed)))
            .unwrap();
        let mut decoded = Vec::new();
        reader.read_to_end(&mut decoded).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn test_gzip_roundtrip() {
        roundtrip(CompressionMode::Gzip);
    }

    #[test]
    fn test_zstd_roundtrip() {
        roundtrip(CompressionMode::Zstd);
    }

    #[test]
    fn test_xz_roundtrip() {
        roundtrip(CompressionMode::Xz);
    }

    #[test]
    fn test_bzip2_roundtrip() {
        roundtrip(CompressionMode::Bzip2);
    }

    #[test]
    fn test_truncated_gzip_reader_errors() {
        // A stream flushed but never finished has no trailer; decoding
        // it must fail, not return silently short data.
        let truncated = {
            let mut enc =
                flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
            enc.write_all(b"some payload that needs a trailer").unwrap();
            enc.flush().unwrap();
            enc.get_ref().clone()
        };
        let mut reader = CompressionMode::Gzip
            .wrap_reader(Box::new(std::io::Cursor::new(truncated)))
            .unwrap();
        let mut out = Vec::new();
        assert!(reader.read_to_end(&mut out).is_err());
    }
}
