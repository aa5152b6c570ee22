pub mod compression;
pub mod config;
pub mod engine;
pub mod entry;
pub mod fs_writer;
pub mod pipe;
pub mod spec;

// Re-exports for easy access
pub use compression::{CompressedWriter, CompressionMode};
pub use config::Config;
pub use engine::{FileOperation, TarEngine, WriteContext, WriteHandler};
pub use entry::EntryKind;
pub use fs_writer::FsWriter;
pub use pipe::PipeBridge;
pub use spec::{Link, RenameRule, SpecFile, WriterSpec};
