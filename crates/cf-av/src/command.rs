//! Builder for executing external tool commands with timeout support.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::Command;

/// Default command timeout: 10 minutes.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);

/// Output captured from a tool execution.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    /// Process exit status.
    pub status: ExitStatus,
    /// Captured standard output (lossy UTF-8).
    pub stdout: String,
    /// Captured standard error (lossy UTF-8).
    pub stderr: String,
}

/// A builder for constructing and executing external tool invocations.
///
/// # Example
///
/// ```no_run
/// use cf_av::ToolCommand;
/// use std::path::PathBuf;
///
/// # async fn example() -> cf_core::Result<()> {
/// let output = ToolCommand::new(PathBuf::from("ffprobe"))
///     .args(["-v", "error", "-show_entries", "format=duration"])
///     .arg("/path/to/video.mp4")
///     .execute()
///     .await?;
/// println!("{}", output.stdout);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ToolCommand {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
}

impl ToolCommand {
    /// Create a new command for the given program path.
    pub fn new(program: PathBuf) -> Self {
        Self {
            program,
            args: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Append a single argument.
    pub fn arg(&mut self, s: impl Into<String>) -> &mut Self {
        self.args.push(s.into());
        self
    }

    /// Append multiple arguments.
    pub fn args(&mut self, iter: impl IntoIterator<Item = impl Into<String>>) -> &mut Self {
        self.args.extend(iter.into_iter().map(Into::into));
        self
    }

    /// Set the maximum execution time.
    pub fn timeout(&mut self, d: Duration) -> &mut Self {
        self.timeout = d;
        self
    }

    /// Execute the command, capturing stdout and stderr.
    ///
    /// # Errors
    ///
    /// Returns [`cf_core::Error::Transcode`] if spawning fails, if the process
    /// times out, or if it exits with a non-zero status (message includes
    /// stderr).
    pub async fn execute(&self) -> cf_core::Result<ToolOutput> {
        let program_name = self
            .program
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.program.to_string_lossy().to_string());

        tracing::debug!(tool = %program_name, args = ?self.args, "Running tool");

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd
            .spawn()
            .map_err(|e| cf_core::Error::transcode(&program_name, format!("failed to spawn: {e}")))?;

        match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                let tool_output = ToolOutput {
                    status: output.status,
                    stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                    stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                };

                if !output.status.success() {
                    return Err(cf_core::Error::transcode(
                        program_name,
                        format!(
                            "exited with status {}: {}",
                            output.status,
                            tail(tool_output.stderr.trim(), 800)
                        ),
                    ));
                }

                Ok(tool_output)
            }
            Ok(Err(e)) => Err(cf_core::Error::transcode(
                program_name,
                format!("I/O error waiting for process: {e}"),
            )),
            // The child is killed when the cancelled future drops it.
            Err(_elapsed) => Err(cf_core::Error::transcode(
                program_name,
                format!("timed out after {:?}", self.timeout),
            )),
        }
    }
}

/// Keep the last `max` bytes of `s` (ffmpeg prints the real error last).
fn tail(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}
