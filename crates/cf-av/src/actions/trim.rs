//! Cut a video down to a maximum length.

use std::path::Path;

use super::secs;
use crate::tools::ToolRegistry;

/// Write the first `max_secs` seconds of `input` to `output`.
///
/// The video is re-encoded so the cut lands on the requested time rather than
/// the next keyframe.
pub async fn trim(
    tools: &ToolRegistry,
    input: &Path,
    output: &Path,
    max_secs: f64,
) -> cf_core::Result<()> {
    if max_secs <= 0.0 {
        return Err(cf_core::Error::Validation(format!(
            "trim length must be positive, got {max_secs}"
        )));
    }

    tracing::info!("trim {:?} to {max_secs}s", input);

    let mut cmd = tools.command("ffmpeg")?;
    cmd.args(["-y", "-i"]);
    cmd.arg(input.to_string_lossy().as_ref());
    cmd.args(["-t", &secs(max_secs)]);
    cmd.args(["-map", "0:v:0", "-map", "0:a?"]);
    cmd.args(["-c:v", "libx264", "-preset", "veryfast", "-crf", "20"]);
    cmd.args(["-c:a", "aac", "-b:a", "192k"]);
    cmd.args(["-movflags", "+faststart"]);
    cmd.arg(output.to_string_lossy().as_ref());
    cmd.execute().await?;

    Ok(())
}
