use anyhow::{anyhow, bail, Context, Result};
use log::debug;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

/// Duplex byte-stream collaborator backed by an external process.
///
/// The child's stdin/stdout are taken as ordinary streams and handed to
/// the engine. Shutdown contract, in order:
/// 1. drop every handle to the child's stdin ([`PipeBridge::close_stdin`]
///    plus any stream taken with [`PipeBridge::take_stdin`]),
/// 2. [`PipeBridge::wait`].
///
/// Waiting first starves the child: once the OS pipe buffer fills, the
/// child blocks on a read that never completes while this process
/// blocks in `wait`.
pub struct PipeBridge {
    child: Child,
    command: String,
}

impl PipeBridge {
    /// Spawns `program` with piped stdin and stdout; stderr is
    /// inherited so diagnostics stay visible.
    pub fn spawn(program: &str, args: &[&str]) -> Result<Self> {
        let command = if args.is_empty() {
            program.to_string()
        } else {
            format!("{} {}", program, args.join(" "))
        };
        debug!("Spawning subprocess: {}", command);

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("Failed to spawn subprocess: {}", command))?;

        Ok(Self { child, command })
    }

    /// Takes the write end feeding the child's stdin. Dropping the
    /// returned stream is the end-of-input signal.
    pub fn take_stdin(&mut self) -> Result<ChildStdin> {
        self.child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("Subprocess stdin already taken: {}", self.command))
    }

    /// Takes the read end of the child's stdout.
    pub fn take_stdout(&mut self) -> Result<ChildStdout> {
        self.child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("Subprocess stdout already taken: {}", self.command))
    }

    /// Signals end-of-input by dropping the retained stdin handle.
    /// Distinct from [`PipeBridge::wait`]; call it (or drop the stream
    /// taken with [`PipeBridge::take_stdin`]) first.
    pub fn close_stdin(&mut self) {
        if self.child.stdin.take().is_some() {
            debug!("Closed stdin of subprocess: {}", self.command);
        }
    }

    /// Waits for the child to terminate. A non-zero exit is an error
    /// carrying the exit code, distinct from stream-processing errors.
    pub fn wait(mut self) -> Result<()> {
        self.close_stdin();
        let status = self
            .child
            .wait()
            .with_context(|| format!("Failed to wait for subprocess: {}", self.command))?;

        if !status.success() {
            bail!(
                "Subprocess '{}' exited with code {}",
                self.command,
                status.code().unwrap_or(-1)
            );
        }

        debug!("Subprocess completed: {}", self.command);
        Ok(())
    }
}
