//! Join two videos end to end.

use std::path::Path;

use super::{probe_duration, probe_has_audio, secs};
use crate::tools::ToolRegistry;

/// Output frame rate of concatenated videos.
const CONCAT_FPS: u32 = 30;

/// Concatenate `first` then `second` into `output`.
///
/// `second` is scaled to the frame size of `first`. A clip without audio
/// contributes silence of its own length so the audio track stays aligned.
pub async fn concat(
    tools: &ToolRegistry,
    first: &Path,
    second: &Path,
    output: &Path,
) -> cf_core::Result<()> {
    let mut silent = [None, None];
    for (slot, path) in silent.iter_mut().zip([first, second]) {
        if !probe_has_audio(tools, path).await? {
            *slot = Some(probe_duration(tools, path).await?);
        }
    }

    tracing::info!("concat {:?} + {:?}", first, second);

    let filter = concat_filter(silent);
    let mut cmd = tools.command("ffmpeg")?;
    cmd.args(["-y", "-i"]);
    cmd.arg(first.to_string_lossy().as_ref());
    cmd.arg("-i");
    cmd.arg(second.to_string_lossy().as_ref());
    cmd.args(["-filter_complex", &filter]);
    cmd.args(["-map", "[vout]", "-map", "[aout]"]);
    cmd.args(["-c:v", "libx264", "-preset", "veryfast", "-crf", "20"]);
    cmd.args(["-c:a", "aac", "-b:a", "192k"]);
    cmd.args(["-movflags", "+faststart"]);
    cmd.arg(output.to_string_lossy().as_ref());
    cmd.execute().await?;

    Ok(())
}

/// Build the concat graph. `silent[i]` holds the duration of input `i` when
/// it has no audio stream.
pub(crate) fn concat_filter(silent: [Option<f64>; 2]) -> String {
    let mut parts = vec![
        "[1:v][0:v]scale2ref=w=iw:h=ih[v1s][v0s]".to_string(),
        format!("[v0s]fps={CONCAT_FPS},format=yuv420p,setsar=1[v0]"),
        format!("[v1s]fps={CONCAT_FPS},format=yuv420p,setsar=1[v1]"),
    ];

    for (i, duration) in silent.iter().enumerate() {
        parts.push(match duration {
            Some(d) => format!("anullsrc=r=44100:cl=stereo,atrim=duration={}[a{i}]", secs(*d)),
            None => format!(
                "[{i}:a]aresample=44100,aformat=sample_fmts=fltp:channel_layouts=stereo[a{i}]"
            ),
        });
    }

    parts.push("[v0][a0][v1][a1]concat=n=2:v=1:a=1[vout][aout]".to_string());
    parts.join(";")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_with_audio() {
        let f = concat_filter([None, None]);
        assert!(f.contains("[0:a]aresample=44100"));
        assert!(f.contains("[1:a]aresample=44100"));
        assert!(!f.contains("anullsrc"));
        assert!(f.ends_with("concat=n=2:v=1:a=1[vout][aout]"));
    }

    #[test]
    fn silent_clip_gets_generated_silence() {
        let f = concat_filter([None, Some(4.25)]);
        assert!(f.contains("anullsrc=r=44100:cl=stereo,atrim=duration=4.250[a1]"));
        assert!(!f.contains("[1:a]"));
    }
}
