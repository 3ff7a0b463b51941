//! Pipeline configuration and config file hot reload.

use crate::capture::Facing;
use crate::frame::CaptureSize;
use crate::render::viewport::ScaleType;
use anyhow::{Context, Result};
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver};
use std::time::Duration;
use tracing::{error, info, warn};

/// Settings for one camera pipeline, loadable from YAML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Desired capture width; the nearest supported size is used
    pub width: u32,
    /// Desired capture height
    pub height: u32,
    pub facing: Facing,
    pub scale_type: ScaleType,
    /// Request redraws from the CPU path instead of on every surface frame
    pub sync_preview_and_processing: bool,
    /// Capacity of the frame reader
    pub max_images: usize,
    /// Bound on acquiring the open/close gate
    pub open_timeout_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            facing: Facing::Front,
            scale_type: ScaleType::CenterCrop,
            sync_preview_and_processing: false,
            max_images: 2,
            open_timeout_ms: 2500,
        }
    }
}

impl PipelineConfig {
    /// Reads a YAML config file. Missing keys take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_yaml(&content).with_context(|| format!("failed to parse config file {}", path.display()))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        Ok(config.sanitized())
    }

    pub fn desired_size(&self) -> CaptureSize {
        CaptureSize::new(self.width, self.height)
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    /// Clamps values the pipeline cannot work with.
    fn sanitized(mut self) -> Self {
        if self.max_images == 0 {
            warn!("max_images must be at least 1, using 1");
            self.max_images = 1;
        }
        if self.width == 0 || self.height == 0 {
            let defaults = Self::default();
            warn!(width = self.width, height = self.height, "Invalid capture size, using {}x{}", defaults.width, defaults.height);
            self.width = defaults.width;
            self.height = defaults.height;
        }
        self
    }
}

/// Differences between two configs that can be applied without reopening the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LiveChanges {
    pub scale_type: Option<ScaleType>,
    pub sync_preview_and_processing: Option<bool>,
    /// Size or facing changed; takes effect on the next open
    pub needs_reopen: bool,
}

impl LiveChanges {
    pub fn between(old: &PipelineConfig, new: &PipelineConfig) -> Self {
        Self {
            scale_type: (old.scale_type != new.scale_type).then_some(new.scale_type),
            sync_preview_and_processing: (old.sync_preview_and_processing != new.sync_preview_and_processing)
                .then_some(new.sync_preview_and_processing),
            needs_reopen: old.desired_size() != new.desired_size()
                || old.facing != new.facing
                || old.max_images != new.max_images
                || old.open_timeout_ms != new.open_timeout_ms,
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Watches a config file and re-parses it when it changes.
pub struct ConfigWatcher {
    path: PathBuf,
    _watcher: RecommendedWatcher,
    rx: Receiver<std::result::Result<Event, notify::Error>>,
    current: PipelineConfig,
}

impl ConfigWatcher {
    /// Starts watching `path`. `current` is the config the app is running with.
    pub fn new(path: PathBuf, current: PipelineConfig) -> Result<Self> {
        let (tx, rx) = channel();
        let mut watcher = RecommendedWatcher::new(tx, notify::Config::default()).context("failed to create config watcher")?;
        watcher
            .watch(&path, RecursiveMode::NonRecursive)
            .with_context(|| format!("failed to watch config file {}", path.display()))?;
        info!("Watching config file {:?} for changes", path);

        Ok(Self {
            path,
            _watcher: watcher,
            rx,
            current,
        })
    }

    pub fn current(&self) -> &PipelineConfig {
        &self.current
    }

    /// Drains pending file events. Returns the changes when the file was
    /// modified and parses to a different config.
    pub fn check_for_changes(&mut self) -> Option<LiveChanges> {
        let mut needs_reload = false;
        while let Ok(res) = self.rx.try_recv() {
            match res {
                Ok(event) => {
                    if matches!(event.kind, notify::EventKind::Modify(_) | notify::EventKind::Create(_)) {
                        needs_reload = true;
                    }
                }
                Err(e) => warn!("Config watch error: {}", e),
            }
        }
        if !needs_reload {
            return None;
        }

        info!("Config file changed, checking for updates...");
        match PipelineConfig::load(&self.path) {
            Ok(new_config) => self.apply(new_config),
            Err(e) => {
                error!("Failed to reload config: {:#}", e);
                None
            }
        }
    }

    fn apply(&mut self, new_config: PipelineConfig) -> Option<LiveChanges> {
        let changes = LiveChanges::between(&self.current, &new_config);
        self.current = new_config;
        if changes.is_empty() {
            return None;
        }
        if changes.needs_reopen {
            info!("Capture size, facing or session settings changed; they apply after the camera is reopened");
        }
        Some(changes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_gives_defaults() {
        let config = PipelineConfig::from_yaml("{}").unwrap();
        assert_eq!(config, PipelineConfig::default());
        assert_eq!(config.desired_size(), CaptureSize::new(640, 480));
        assert_eq!(config.open_timeout(), Duration::from_millis(2500));
    }

    #[test]
    fn yaml_fields_use_snake_case() {
        let config = PipelineConfig::from_yaml(
            "width: 1280\nheight: 720\nfacing: back\nscale_type: fit_end\nsync_preview_and_processing: true\n",
        )
        .unwrap();
        assert_eq!(config.desired_size(), CaptureSize::new(1280, 720));
        assert_eq!(config.facing, Facing::Back);
        assert_eq!(config.scale_type, ScaleType::FitEnd);
        assert!(config.sync_preview_and_processing);
        assert_eq!(config.max_images, 2);
    }

    #[test]
    fn unusable_values_are_clamped() {
        let config = PipelineConfig::from_yaml("max_images: 0\nwidth: 0\n").unwrap();
        assert_eq!(config.max_images, 1);
        assert_eq!(config.desired_size(), CaptureSize::new(640, 480));
    }

    #[test]
    fn unknown_scale_type_is_rejected() {
        assert!(PipelineConfig::from_yaml("scale_type: zoom\n").is_err());
    }

    #[test]
    fn live_changes_separate_reopen_settings() {
        let old = PipelineConfig::default();
        let mut new = old.clone();
        new.scale_type = ScaleType::FitCenter;
        new.sync_preview_and_processing = true;

        let changes = LiveChanges::between(&old, &new);
        assert_eq!(changes.scale_type, Some(ScaleType::FitCenter));
        assert_eq!(changes.sync_preview_and_processing, Some(true));
        assert!(!changes.needs_reopen);

        new.facing = Facing::Back;
        assert!(LiveChanges::between(&old, &new).needs_reopen);
        assert!(LiveChanges::between(&old, &old).is_empty());
    }

    #[test]
    fn load_reports_missing_file() {
        let err = PipelineConfig::load(Path::new("/nonexistent/periscope.yaml")).unwrap_err();
        assert!(format!("{err:#}").contains("failed to read config file"));
    }
}
