//! Media processing actions: text overlay, audio mixing, concatenation,
//! audio stripping, trimming, and the ffprobe queries they depend on.

mod audio;
mod concat;
mod overlay;
mod probe;
mod strip;
mod trim;

pub use audio::mix_audio;
pub use concat::concat;
pub use overlay::{drawtext_filter, escape_filter_value, overlay_text};
pub use probe::{probe_duration, probe_has_audio};
pub use strip::strip_audio;
pub use trim::trim;

/// Format seconds the way ffmpeg filter arguments expect them.
pub(crate) fn secs(value: f64) -> String {
    format!("{:.3}", value.max(0.0))
}
