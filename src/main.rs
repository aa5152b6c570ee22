use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use env_logger::Env;
use log::{debug, info, LevelFilter};
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};

use tarflow::{CompressionMode, Config, SpecFile, TarEngine, WriterSpec};

#[derive(Parser)]
#[command(author, version, about = "Filter, rename and re-route tar streams", long_about = None)]
struct Cli {
    #[arg(short, long, help = "Engine configuration file (JSON)")]
    config: Option<PathBuf>,

    #[arg(
        short,
        long,
        action = clap::ArgAction::Count,
        help = "Verbose mode (-v for info, -vv for debug, -vvv for trace)"
    )]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Extract a stdin flow or a tar file to a specified directory.
    Extract {
        #[arg(long, help = "Directory where the entries are materialized")]
        to: PathBuf,

        #[arg(long, help = "Spec file with the rules to follow")]
        specs: Option<PathBuf>,

        #[arg(long, help = "Read the tar flow from stdin")]
        stdin: bool,

        #[arg(long, help = "Read the tar flow from the specified file")]
        file: Option<PathBuf>,

        #[arg(
            long,
            help = "Input compression, ignoring the file extension. Possible values: gz|gzip|zstd|xz|bz2|bzip2|none"
        )]
        compression: Option<String>,
    },

    /// Archive one or more directories to a tarball.
    Archive {
        #[arg(help = "Tarball to create")]
        tarball: PathBuf,

        #[arg(help = "Directories to archive", required = true)]
        dirs: Vec<PathBuf>,

        #[arg(long, help = "Spec file with the rules to follow")]
        specs: Option<PathBuf>,

        #[arg(
            long,
            help = "Output compression, ignoring the file extension. Possible values: gz|gzip|zstd|xz|bz2|bzip2|none"
        )]
        compression: Option<String>,
    },

    /// Filter an input tar stream and bridge it to an output stream or file.
    Bridge {
        #[arg(long, help = "File where the tar flow is written. Use - for stdout")]
        to: String,

        #[arg(long = "in", help = "Spec file with the rules for the reader")]
        spec_in: Option<PathBuf>,

        #[arg(long = "out", help = "Spec file with the rules for the writer")]
        spec_out: Option<PathBuf>,

        #[arg(long, help = "Read the tar flow from stdin")]
        stdin: bool,

        #[arg(long, help = "Read the tar flow from the specified file")]
        file: Option<PathBuf>,

        #[arg(
            long,
            help = "Output compression, ignoring the file extension. Possible values: gz|gzip|zstd|xz|bz2|bzip2|none"
        )]
        compression: Option<String>,
    },
}

/// Builds the input stream from --stdin/--file, decompressing by
/// explicit mode or by the input file's extension.
fn open_input(
    use_stdin: bool,
    file: Option<&Path>,
    compression: Option<&str>,
) -> Result<Box<dyn Read>> {
    let (raw, inferred): (Box<dyn Read>, CompressionMode) = match (use_stdin, file) {
        (true, Some(_)) => return Err(anyhow!("You can use --stdin or --file. Not both.")),
        (false, None) => {
            return Err(anyhow!("You need the --file option or the --stdin option."))
        }
        (true, None) => (Box::new(std::io::stdin()), CompressionMode::None),
        (false, Some(path)) => {
            let file = File::open(path)
                .map_err(|e| anyhow!("Error on open file {}: {}", path.display(), e))?;
            (
                Box::new(BufReader::new(file)),
                CompressionMode::from_extension(path),
            )
        }
    };

    let mode = match compression {
        Some(name) => CompressionMode::parse(name)?,
        None => inferred,
    };
    debug!("Input compression: {:?}", mode);
    mode.wrap_reader(raw)
}

fn run_extract(
    engine: &mut TarEngine,
    to: &Path,
    specs: Option<&Path>,
    use_stdin: bool,
    file: Option<&Path>,
    compression: Option<&str>,
) -> Result<()> {
    let spec = match specs {
        Some(path) => SpecFile::from_file(path)?,
        None => {
            let mut spec = SpecFile::new();
            spec.ignore.push("/.dockerenv".to_string());
            spec
        }
    };

    engine.set_reader(open_input(use_stdin, file, compression)?);
    engine.run_task(&spec, to)?;

    info!("Extraction completed: {}", to.display());
    Ok(())
}

fn run_archive(
    engine: &mut TarEngine,
    tarball: &Path,
    dirs: &[PathBuf],
    specs: Option<&Path>,
    compression: Option<&str>,
) -> Result<()> {
    let spec = match specs {
        Some(path) => SpecFile::from_file(path)?,
        None => {
            let mut spec = SpecFile::new();
            spec.same_chtimes = true;
            spec
        }
    };
    let spec = SpecFile {
        writer: Some(WriterSpec {
            archive_dirs: dirs.to_vec(),
        }),
        ..spec
    };

    let mode = match compression {
        Some(name) => CompressionMode::parse(name)?,
        None => CompressionMode::from_extension(tarball),
    };

    let out = File::create(tarball)
        .map_err(|e| anyhow!("Error on create file {}: {}", tarball.display(), e))?;
    engine.set_writer(out);
    engine.set_compression(mode);
    engine.run_task_writer(&spec)?;

    info!("Archive completed: {}", tarball.display());
    Ok(())
}

fn run_bridge(
    engine: &mut TarEngine,
    to: &str,
    spec_in: Option<&Path>,
    spec_out: Option<&Path>,
    use_stdin: bool,
    file: Option<&Path>,
    compression: Option<&str>,
) -> Result<()> {
    let reader_spec = match spec_in {
        Some(path) => SpecFile::from_file(path)?,
        None => {
            let mut spec = SpecFile::new();
            spec.ignore.push("/.dockerenv".to_string());
            spec
        }
    };
    let writer_spec = match spec_out {
        Some(path) => SpecFile::from_file(path)?,
        None => {
            let mut spec = SpecFile::new();
            spec.same_chtimes = true;
            spec
        }
    };

    // The --compression flag governs the output side; input
    // decompression is inferred from the file extension only.
    engine.set_reader(open_input(use_stdin, file, None)?);

    let (writer, mode): (Box<dyn Write>, CompressionMode) = if to == "-" {
        (Box::new(std::io::stdout()), CompressionMode::None)
    } else {
        let out = File::create(to).map_err(|e| anyhow!("Error on create file {}: {}", to, e))?;
        (Box::new(out), CompressionMode::from_extension(Path::new(to)))
    };
    let mode = match compression {
        Some(name) => CompressionMode::parse(name)?,
        None => mode,
    };
    engine.set_writer(writer);
    engine.set_compression(mode);

    engine.run_task_bridge(&reader_spec, &writer_spec)?;

    if to != "-" {
        info!("Bridge completed: {}", to);
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    env_logger::Builder::from_env(Env::default())
        .filter_level(log_level)
        .init();

    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::new(),
    };
    if cli.verbose >= 2 {
        config.debug = true;
    }

    let mut engine = TarEngine::new(config);

    match &cli.command {
        Command::Extract {
            to,
            specs,
            stdin,
            file,
            compression,
        } => run_extract(
            &mut engine,
            to,
            specs.as_deref(),
            *stdin,
            file.as_deref(),
            compression.as_deref(),
        ),
        Command::Archive {
            tarball,
            dirs,
            specs,
            compression,
        } => run_archive(
            &mut engine,
            tarball,
            dirs,
            specs.as_deref(),
            compression.as_deref(),
        ),
        Command::Bridge {
            to,
            spec_in,
            spec_out,
            stdin,
            file,
            compression,
        } => run_bridge(
            &mut engine,
            to,
            spec_in.as_deref(),
            spec_out.as_deref(),
            *stdin,
            file.as_deref(),
            compression.as_deref(),
        ),
    }
}
