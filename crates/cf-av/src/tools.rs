//! External tool detection and management.
//!
//! The [`ToolRegistry`] discovers and caches the locations of ffmpeg and
//! ffprobe and hands out [`ToolCommand`]s pre-configured with the tool's path
//! and timeout.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use cf_core::config::ToolsConfig;
use serde::{Deserialize, Serialize};

use crate::command::ToolCommand;

/// Known tool names that the registry manages.
const KNOWN_TOOLS: &[&str] = &["ffmpeg", "ffprobe"];

/// A discovered tool: where it lives and how long it may run.
#[derive(Debug, Clone)]
pub struct ToolConfig {
    pub name: String,
    pub path: PathBuf,
    /// Maximum execution time before the tool is killed.
    pub timeout: Duration,
}

/// Availability information for a tool, returned by [`ToolRegistry::check_all`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInfo {
    pub name: String,
    pub available: bool,
    /// First line of `-version` output, if available.
    pub version: Option<String>,
    pub path: Option<PathBuf>,
}

/// Registry holding discovered tool configurations.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, ToolConfig>,
}

impl ToolRegistry {
    /// Discover tools by searching `PATH` (or using overrides from config).
    ///
    /// A configured path is used when it exists; otherwise [`which::which`]
    /// locates the tool. Tools that are not found are omitted, and
    /// [`ToolRegistry::require`] reports them when an operation needs them.
    pub fn discover(config: &ToolsConfig) -> Self {
        let timeout = Duration::from_secs(config.timeout_secs);
        let mut tools = HashMap::new();

        for &name in KNOWN_TOOLS {
            let custom_path = match name {
                "ffmpeg" => config.ffmpeg_path.as_deref(),
                "ffprobe" => config.ffprobe_path.as_deref(),
                _ => None,
            };

            let resolved = match custom_path {
                Some(p) if p.exists() => Some(p.to_path_buf()),
                Some(p) => {
                    tracing::warn!(tool = name, path = %p.display(), "Configured tool path missing; searching PATH");
                    which::which(name).ok()
                }
                None => which::which(name).ok(),
            };

            if let Some(path) = resolved {
                tools.insert(
                    name.to_string(),
                    ToolConfig {
                        name: name.to_string(),
                        path,
                        timeout,
                    },
                );
            }
        }

        Self { tools }
    }

    /// Return the [`ToolConfig`] for `name`, or an [`cf_core::Error::Transcode`]
    /// if the tool was not found during discovery.
    pub fn require(&self, name: &str) -> cf_core::Result<&ToolConfig> {
        self.tools.get(name).ok_or_else(|| {
            cf_core::Error::transcode(name, format!("{name} not found; is it installed and in PATH?"))
        })
    }

    /// A [`ToolCommand`] for `name` with the configured timeout applied.
    pub fn command(&self, name: &str) -> cf_core::Result<ToolCommand> {
        let tool = self.require(name)?;
        let mut cmd = ToolCommand::new(tool.path.clone());
        cmd.timeout(tool.timeout);
        Ok(cmd)
    }

    /// Check all known tools and return availability information.
    pub fn check_all(&self) -> Vec<ToolInfo> {
        KNOWN_TOOLS
            .iter()
            .map(|&name| match self.tools.get(name) {
                Some(cfg) => ToolInfo {
                    name: name.to_string(),
                    available: true,
                    version: detect_version(&cfg.path),
                    path: Some(cfg.path.clone()),
                },
                None => ToolInfo {
                    name: name.to_string(),
                    available: false,
                    version: None,
                    path: None,
                },
            })
            .collect()
    }
}

/// Run `<tool> -version` and return the first line of stdout.
fn detect_version(path: &Path) -> Option<String> {
    let output = std::process::Command::new(path)
        .arg("-version")
        .output()
        .ok()?;

    if !output.status.success() {
        return None;
    }

    String::from_utf8_lossy(&output.stdout)
        .lines()
        .next()
        .map(|s| s.to_string())
}
