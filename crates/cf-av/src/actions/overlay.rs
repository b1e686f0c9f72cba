//! Burn text into a video with ffmpeg's drawtext filter.

use std::path::Path;

use cf_core::{TextOverlay, TextPosition};

use super::secs;
use crate::tools::ToolRegistry;

/// Distance of top/bottom text from the frame edge, as a fraction of height.
const EDGE_MARGIN: &str = "h*0.08";

/// Overlay `overlay.text` onto `input`, writing `output`.
///
/// The text goes through a sidecar file (`textfile=`) so arbitrary user
/// text never has to survive filtergraph escaping.
pub async fn overlay_text(
    tools: &ToolRegistry,
    input: &Path,
    output: &Path,
    overlay: &TextOverlay,
) -> cf_core::Result<()> {
    let text_file = output.with_extension("txt");
    tokio::fs::write(&text_file, overlay.text.as_bytes()).await?;

    tracing::info!("overlay text on {:?}", input);

    let filter = drawtext_filter(overlay, &text_file);
    let mut cmd = tools.command("ffmpeg")?;
    cmd.args(["-y", "-i"]);
    cmd.arg(input.to_string_lossy().as_ref());
    cmd.args(["-vf", &filter]);
    cmd.args(["-c:v", "libx264", "-preset", "veryfast", "-crf", "20"]);
    cmd.args(["-c:a", "copy"]);
    cmd.arg(output.to_string_lossy().as_ref());
    let result = cmd.execute().await;

    let _ = tokio::fs::remove_file(&text_file).await;
    result.map(|_| ())
}

/// Build the drawtext filter for `overlay`, reading its text from `text_file`.
pub fn drawtext_filter(overlay: &TextOverlay, text_file: &Path) -> String {
    let mut opts: Vec<(&str, String)> = vec![("textfile", text_file.to_string_lossy().to_string())];

    if let Some(font) = overlay.font.as_deref().filter(|f| !f.is_empty()) {
        let is_file = font.contains('/') || font.ends_with(".ttf") || font.ends_with(".otf");
        opts.push((if is_file { "fontfile" } else { "font" }, font.to_string()));
    }

    opts.push(("fontsize", overlay.font_size.to_string()));
    opts.push(("fontcolor", overlay.color.clone()));

    let (x, y) = match &overlay.position {
        TextPosition::Top => ("(w-text_w)/2".to_string(), EDGE_MARGIN.to_string()),
        TextPosition::Center => ("(w-text_w)/2".to_string(), "(h-text_h)/2".to_string()),
        TextPosition::Bottom => ("(w-text_w)/2".to_string(), format!("h-text_h-{EDGE_MARGIN}")),
        TextPosition::Custom { x, y } => (x.clone(), y.clone()),
    };
    opts.push(("x", x));
    opts.push(("y", y));

    if let Some(color) = overlay.box_color.as_deref().filter(|c| !c.is_empty()) {
        opts.push(("box", "1".into()));
        opts.push(("boxcolor", color.to_string()));
        opts.push(("boxborderw", "12".into()));
    }

    let enable = match (overlay.start_secs, overlay.end_secs) {
        (Some(start), Some(end)) => Some(format!("between(t,{},{})", secs(start), secs(end))),
        (Some(start), None) => Some(format!("gte(t,{})", secs(start))),
        (None, Some(end)) => Some(format!("lte(t,{})", secs(end))),
        (None, None) => None,
    };
    if let Some(enable) = enable {
        opts.push(("enable", enable));
    }

    let args: Vec<String> = opts
        .iter()
        .map(|(k, v)| format!("{k}={}", escape_filter_value(v)))
        .collect();
    format!("drawtext={}", args.join(":"))
}

/// Escape a filter option value for both levels of ffmpeg parsing: the
/// option list (`:` separated) and the enclosing filtergraph.
pub fn escape_filter_value(value: &str) -> String {
    let mut option_level = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '\\' | '\'' | ':') {
            option_level.push('\\');
        }
        option_level.push(c);
    }

    let mut graph_level = String::with_capacity(option_level.len());
    for c in option_level.chars() {
        if matches!(c, '\\' | '\'' | '[' | ']' | ',' | ';') {
            graph_level.push('\\');
        }
        graph_level.push(c);
    }
    graph_level
}

#[cfg(test)]
mod tests {
    use super::*;

    fn overlay() -> TextOverlay {
        TextOverlay {
            text: "Hello: it's 100%".into(),
            font: None,
            font_size: 48,
            color: "white".into(),
            position: TextPosition::Bottom,
            start_secs: None,
            end_secs: None,
            box_color: None,
        }
    }

    #[test]
    fn escape_plain_path_unchanged() {
        assert_eq!(escape_filter_value("/tmp/job/000-t.txt"), "/tmp/job/000-t.txt");
    }

    #[test]
    fn escape_separators() {
        assert_eq!(escape_filter_value("a:b"), r"a\\:b");
        assert_eq!(escape_filter_value("f(t,1)"), r"f(t\,1)");
        assert_eq!(escape_filter_value("it's"), r"it\\\'s");
    }

    #[test]
    fn filter_reads_text_from_file() {
        let f = drawtext_filter(&overlay(), Path::new("/tmp/a/x.txt"));
        assert!(f.starts_with("drawtext=textfile=/tmp/a/x.txt:"));
        // User text never appears inline.
        assert!(!f.contains("Hello"));
        assert!(f.contains("fontsize=48"));
        assert!(f.contains("y=h-text_h-h*0.08"));
        assert!(!f.contains("enable="));
        assert!(!f.contains("box=1"));
    }

    #[test]
    fn filter_time_window_and_box() {
        let mut o = overlay();
        o.start_secs = Some(1.0);
        o.end_secs = Some(3.5);
        o.box_color = Some("black@0.5".into());
        o.font = Some("/fonts/Inter.ttf".into());
        let f = drawtext_filter(&o, Path::new("/t.txt"));
        assert!(f.contains(r"enable=between(t\,1.000\,3.500)"));
        assert!(f.contains("box=1:boxcolor=black@0.5"));
        assert!(f.contains("fontfile=/fonts/Inter.ttf"));
    }

    #[test]
    fn filter_custom_position_and_font_name() {
        let mut o = overlay();
        o.position = TextPosition::Custom {
            x: "10".into(),
            y: "20".into(),
        };
        o.font = Some("Inter".into());
        o.start_secs = Some(2.0);
        let f = drawtext_filter(&o, Path::new("/t.txt"));
        assert!(f.contains(":font=Inter:"));
        assert!(f.contains(":x=10:y=20"));
        assert!(f.contains(r"enable=gte(t\,2.000)"));
    }
}
