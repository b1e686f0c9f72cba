//! Small ffprobe queries used to build filter graphs.

use std::path::Path;

use crate::tools::ToolRegistry;

/// Container duration of `path` in seconds.
pub async fn probe_duration(tools: &ToolRegistry, path: &Path) -> cf_core::Result<f64> {
    let mut cmd = tools.command("ffprobe")?;
    cmd.args([
        "-v",
        "error",
        "-show_entries",
        "format=duration",
        "-of",
        "default=noprint_wrappers=1:nokey=1",
    ]);
    cmd.arg(path.to_string_lossy().as_ref());

    let output = cmd.execute().await?;
    parse_duration(&output.stdout).ok_or_else(|| {
        cf_core::Error::transcode(
            "ffprobe",
            format!("no duration reported for {}", path.display()),
        )
    })
}

/// Whether `path` carries at least one audio stream.
pub async fn probe_has_audio(tools: &ToolRegistry, path: &Path) -> cf_core::Result<bool> {
    let mut cmd = tools.command("ffprobe")?;
    cmd.args([
        "-v",
        "error",
        "-select_streams",
        "a",
        "-show_entries",
        "stream=index",
        "-of",
        "csv=p=0",
    ]);
    cmd.arg(path.to_string_lossy().as_ref());

    let output = cmd.execute().await?;
    Ok(!output.stdout.trim().is_empty())
}

fn parse_duration(stdout: &str) -> Option<f64> {
    stdout
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .and_then(|l| l.parse::<f64>().ok())
        .filter(|d| d.is_finite() && *d >= 0.0)
}
