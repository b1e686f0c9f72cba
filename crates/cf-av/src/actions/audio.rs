//! Combine a music track with a video's audio.

use std::path::Path;

use cf_core::AudioMode;

use super::{probe_duration, probe_has_audio, secs};
use crate::tools::ToolRegistry;
use crate::transcoder::AudioMix;

/// Lay `track` under (or in place of) the audio of `video`, writing `output`.
///
/// The result always has the video's duration. In [`AudioMode::Mix`] a video
/// without any audio stream falls back to replacement.
pub async fn mix_audio(
    tools: &ToolRegistry,
    video: &Path,
    track: &Path,
    output: &Path,
    mix: &AudioMix,
) -> cf_core::Result<()> {
    let duration = probe_duration(tools, video).await?;
    let has_audio = probe_has_audio(tools, video).await?;

    tracing::info!(
        mode = ?mix.mode,
        duration,
        has_audio,
        "mix audio into {:?}",
        video
    );

    let filter = mix_filter(mix, duration, has_audio);
    let mut cmd = tools.command("ffmpeg")?;
    cmd.args(["-y", "-i"]);
    cmd.arg(video.to_string_lossy().as_ref());
    cmd.arg("-i");
    cmd.arg(track.to_string_lossy().as_ref());
    cmd.args(["-filter_complex", &filter]);
    cmd.args(["-map", "0:v:0", "-map", "[aout]"]);
    cmd.args(["-c:v", "copy", "-c:a", "aac", "-b:a", "192k"]);
    cmd.args(["-t", &secs(duration)]);
    cmd.arg(output.to_string_lossy().as_ref());
    cmd.execute().await?;

    Ok(())
}

/// Build the `-filter_complex` graph; the final audio is labelled `[aout]`.
pub(crate) fn mix_filter(mix: &AudioMix, video_duration: f64, video_has_audio: bool) -> String {
    let mut music = format!("[1:a]volume={:.3}", mix.volume.max(0.0));
    if mix.fade_in_secs > 0.0 {
        music.push_str(&format!(",afade=t=in:st=0:d={}", secs(mix.fade_in_secs)));
    }
    if mix.fade_out_secs > 0.0 && video_duration > mix.fade_out_secs {
        music.push_str(&format!(
            ",afade=t=out:st={}:d={}",
            secs(video_duration - mix.fade_out_secs),
            secs(mix.fade_out_secs)
        ));
    }

    if mix.mode == AudioMode::Mix && video_has_audio {
        format!("{music}[music];[0:a][music]amix=inputs=2:duration=first:dropout_transition=0[aout]")
    } else {
        format!("{music}[aout]")
    }
}
