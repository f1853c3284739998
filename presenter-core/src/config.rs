use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::render::{PagePart, RenderTarget, ViewTargets};

pub const CONFIG_FILE_NAME: &str = "presenter.toml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheLimits {
    pub max_entries: usize,
    pub max_bytes: usize,
}

impl Default for CacheLimits {
    fn default() -> Self {
        Self {
            max_entries: 10,
            max_bytes: 100 * 1024 * 1024,
        }
    }
}

/// Rasterization hints, fixed for the lifetime of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderHints {
    pub text_antialiasing: bool,
    pub path_antialiasing: bool,
    pub image_smoothing: bool,
}

impl Default for RenderHints {
    fn default() -> Self {
        Self {
            text_antialiasing: true,
            path_antialiasing: true,
            image_smoothing: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewConfig {
    pub slide: RenderTarget,
    pub notes: Option<RenderTarget>,
    pub thumbnail: Option<RenderTarget>,
}

impl Default for ViewConfig {
    fn default() -> Self {
        Self {
            slide: RenderTarget::new(1920, 1080),
            notes: Some(RenderTarget::new(1280, 720)),
            thumbnail: None,
        }
    }
}

/// Settings for one presentation session. Built once at startup and handed
/// to the session by value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub cache: CacheLimits,
    /// Pages kept rendered on each side of the current page.
    pub prefetch_radius: usize,
    pub page_part: PagePart,
    pub views: ViewConfig,
    pub render: RenderHints,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cache: CacheLimits::default(),
            prefetch_radius: 4,
            page_part: PagePart::Whole,
            views: ViewConfig::default(),
            render: RenderHints::default(),
        }
    }
}

impl SessionConfig {
    pub fn default_path(dirs: &ProjectDirs) -> PathBuf {
        dirs.config_dir().join(CONFIG_FILE_NAME)
    }

    pub fn from_toml(source: &str) -> Result<Self> {
        toml::from_str(source).context("invalid session configuration")
    }

    /// Reads `path`, falling back to defaults when the file does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let source = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {:?}", path))?;
        Self::from_toml(&source).with_context(|| format!("failed to load {:?}", path))
    }

    pub fn view_targets(&self) -> ViewTargets {
        ViewTargets {
            slide: self.views.slide,
            notes: self.views.notes,
            thumbnail: self.views.thumbnail,
            part: self.page_part,
        }
    }
}
