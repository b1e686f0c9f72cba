//! Remove every audio stream from a video.

use std::path::Path;

use crate::tools::ToolRegistry;

/// Copy the video stream of `input` to `output` without any audio.
pub async fn strip_audio(tools: &ToolRegistry, input: &Path, output: &Path) -> cf_core::Result<()> {
    tracing::info!("strip audio from {:?}", input);

    let mut cmd = tools.command("ffmpeg")?;
    cmd.args(["-y", "-i"]);
    cmd.arg(input.to_string_lossy().as_ref());
    cmd.args(["-map", "0:v", "-c:v", "copy", "-an"]);
    cmd.arg(output.to_string_lossy().as_ref());
    cmd.execute().await?;

    Ok(())
}
