//! Reader configuration.
//!
//! Values come from, lowest precedence first:
//! 1. Built-in defaults
//! 2. `config.toml` in the platform config directory (or `FOLIO_CONFIG`)
//! 3. `FOLIO_*` environment variables

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

const ENV_PREFIX: &str = "FOLIO";

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct ReaderConfig {
    pub storage: StorageConfig,
    pub layout: LayoutConfig,
    pub timing: TimingConfig,
    pub loading: LoadingConfig,
    pub messages: MessageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    /// Prefix of structured progress keys, `{namespace}_{document_id}`.
    pub namespace: String,
    /// Directory holding the progress file. Defaults to the platform data dir.
    pub state_dir: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            namespace: "hsk-reader-meta".to_string(),
            state_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LayoutConfig {
    /// Viewports narrower than this (CSS px) use the narrow layout.
    pub narrow_breakpoint: f32,
    pub narrow_window_radius: usize,
    pub wide_window_radius: usize,
    pub min_zoom: f32,
    pub narrow_max_zoom: f32,
    pub wide_max_zoom: f32,
    pub zoom_step: f32,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            narrow_breakpoint: 768.0,
            narrow_window_radius: 1,
            wide_window_radius: 3,
            min_zoom: 0.5,
            narrow_max_zoom: 2.5,
            wide_max_zoom: 3.0,
            zoom_step: 0.15,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TimingConfig {
    pub save_debounce_ms: u64,
    pub settle_delay_ms: u64,
    pub restore_retries: u32,
    pub jump_retries: u32,
    pub retry_interval_ms: u64,
    pub jump_highlight_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            save_debounce_ms: 500,
            settle_delay_ms: 450,
            restore_retries: 20,
            jump_retries: 24,
            retry_interval_ms: 90,
            jump_highlight_ms: 4000,
        }
    }
}

impl TimingConfig {
    pub fn save_debounce(&self) -> Duration {
        Duration::from_millis(self.save_debounce_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn jump_highlight(&self) -> Duration {
        Duration::from_millis(self.jump_highlight_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoadingConfig {
    pub narrow_range_chunk_size: usize,
    pub wide_range_chunk_size: usize,
    pub use_system_fonts: bool,
    pub stop_at_errors: bool,
    /// Explicit pdfium shared library, tried before the system library.
    pub pdfium_library_path: Option<PathBuf>,
}

impl Default for LoadingConfig {
    fn default() -> Self {
        Self {
            narrow_range_chunk_size: 256 * 1024,
            wide_range_chunk_size: 1024 * 1024,
            use_system_fonts: true,
            stop_at_errors: false,
            pdfium_library_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MessageConfig {
    pub load_failed: String,
    pub missing_source: String,
}

impl Default for MessageConfig {
    fn default() -> Self {
        Self {
            load_failed: "加载失败，请检查网络或 PDF 链接".to_string(),
            missing_source: "暂无可用 PDF".to_string(),
        }
    }
}

impl ReaderConfig {
    pub fn load() -> Result<Self> {
        let path = Self::config_file_path()?;
        Self::load_from_path(&path)
    }

    /// Missing files fall back to defaults; environment overrides still apply.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {:?}", path))?;
            toml::from_str(&content)
                .with_context(|| format!("failed to parse config file {:?}", path))?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn load_from_str(content: &str) -> Result<Self> {
        let mut config: ReaderConfig =
            toml::from_str(content).context("failed to parse config TOML")?;
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn config_file_path() -> Result<PathBuf> {
        if let Ok(path) = std::env::var(format!("{ENV_PREFIX}_CONFIG")) {
            return Ok(PathBuf::from(path));
        }
        let dirs = project_dirs()?;
        Ok(dirs.config_dir().join("config.toml"))
    }

    pub fn state_dir(&self) -> Result<PathBuf> {
        match &self.storage.state_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(project_dirs()?.data_local_dir().join("state")),
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var(format!("{ENV_PREFIX}_STATE_DIR")) {
            self.storage.state_dir = if val.is_empty() {
                None
            } else {
                Some(PathBuf::from(val))
            };
        }

        if let Ok(val) = std::env::var(format!("{ENV_PREFIX}_NAMESPACE")) {
            if !val.is_empty() {
                self.storage.namespace = val;
            }
        }

        if let Ok(val) = std::env::var(format!("{ENV_PREFIX}_PDFIUM_LIBRARY_PATH")) {
            self.loading.pdfium_library_path = if val.is_empty() {
                None
            } else {
                Some(PathBuf::from(val))
            };
        }
    }
}

pub fn project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from("net", "folio", "folio")
        .ok_or_else(|| anyhow!("unable to resolve platform data directories"))
}
