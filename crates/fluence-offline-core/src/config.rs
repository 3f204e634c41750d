//! Worker configuration management.
//!
//! This module handles loading and saving the configuration: the site origin,
//! the cache version and partition prefix, the static manifest, the cacheable
//! prefix whitelist and the offline-action endpoints.
//!
//! Configuration is stored at `~/.config/fluence-offline/config.json`; any
//! field missing from the file takes its default.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::queue::ActionKind;

/// Application name used for config/cache directory paths
const APP_NAME: &str = "fluence-offline";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Environment variable overriding the configured origin
pub const ORIGIN_ENV: &str = "FLUENCE_ORIGIN";

const GOOGLE_FONTS_CSS: &str = "https://fonts.googleapis.com/css2?family=Inter:wght@400;500;600&family=EB+Garamond:ital,wght@0,400;0,600;1,400&family=Caveat:wght@400;700&display=swap";

/// How the static manifest is written during install.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InstallMode {
    /// Each asset is fetched and stored on its own; failures are reported
    /// but never abort the install.
    #[default]
    PerAsset,
    /// Same-origin assets are stored only if every one of them was fetched.
    /// Cross-origin assets keep per-asset handling.
    Atomic,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Endpoints {
    pub quiz_result: String,
    pub progress_update: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            quiz_result: "/api/quiz-results".to_string(),
            progress_update: "/api/progress".to_string(),
        }
    }
}

impl Endpoints {
    pub fn for_kind(&self, kind: ActionKind) -> &str {
        match kind {
            ActionKind::QuizResult => &self.quiz_result,
            ActionKind::ProgressUpdate => &self.progress_update,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Site origin; relative manifest entries and endpoints resolve against it
    pub origin: String,
    /// Prefix for partition names; empty gives `static-<version>`
    pub cache_prefix: String,
    /// Bumped on each deploy to evict stale partitions
    pub cache_version: String,
    pub static_assets: Vec<String>,
    /// Substrings of the full request URL that make a response cacheable
    pub cacheable_prefixes: Vec<String>,
    pub install_mode: InstallMode,
    pub endpoints: Endpoints,
    /// Background sync tag that triggers a queue drain
    pub sync_tag: String,
    /// Key the offline queue is persisted under
    pub queue_key: String,
    pub start_online: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            origin: "http://localhost:8080".to_string(),
            cache_prefix: "fluence".to_string(),
            cache_version: "v2.1".to_string(),
            static_assets: [
                "/",
                "/manifest.json",
                "/fluence-icon-192.png",
                "/fluence-icon-512.png",
                "/fluence-favicon.ico",
                "/assets/sprites/creatures/math-dragon.svg",
                "/assets/sprites/creatures/science-owl.svg",
                "/assets/sprites/creatures/general-fox.svg",
                "/assets/sounds/effects/click.mp3",
                "/assets/sounds/effects/correct.mp3",
                "/assets/sounds/effects/incorrect.mp3",
                "/assets/icons/quiz-shortcut.png",
                "/assets/icons/progress-shortcut.png",
                "/assets/icons/report-shortcut.png",
                GOOGLE_FONTS_CSS,
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            cacheable_prefixes: [
                "/assets/sprites/",
                "/assets/sounds/",
                "/assets/images/",
                "https://api.github.com/",
                "https://fonts.gstatic.com/",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            install_mode: InstallMode::default(),
            endpoints: Endpoints::default(),
            sync_tag: "quiz-results".to_string(),
            queue_key: "fluence_offline_queue".to_string(),
            start_online: true,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load from a file, falling back to defaults if it doesn't exist.
    /// `FLUENCE_ORIGIN` overrides the origin either way.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config: Self = if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };
        config.override_origin(std::env::var(ORIGIN_ENV).ok());
        Ok(config)
    }

    fn override_origin(&mut self, origin: Option<String>) {
        if let Some(origin) = origin.filter(|o| !o.is_empty()) {
            self.origin = origin;
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Root for cache partitions and key-value storage
    pub fn cache_dir(&self) -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    pub fn static_cache_name(&self) -> String {
        self.partition_name("static")
    }

    pub fn dynamic_cache_name(&self) -> String {
        self.partition_name("dynamic")
    }

    fn partition_name(&self, kind: &str) -> String {
        if self.cache_prefix.is_empty() {
            format!("{}-{}", kind, self.cache_version)
        } else {
            format!("{}-{}-{}", self.cache_prefix, kind, self.cache_version)
        }
    }

    pub fn origin_url(&self) -> Result<Url, url::ParseError> {
        Url::parse(&self.origin)
    }

    /// Resolve a manifest entry or endpoint. Absolute URLs pass through.
    pub fn resolve(&self, path: &str) -> Result<Url, url::ParseError> {
        self.origin_url()?.join(path)
    }

    /// URL of the root document served as the offline navigation fallback.
    pub fn root_document(&self) -> Result<Url, url::ParseError> {
        self.resolve("/")
    }

    pub fn is_same_origin(&self, url: &Url) -> bool {
        self.origin_url()
            .map(|origin| origin.origin() == url.origin())
            .unwrap_or(false)
    }

    /// Substring match of the full URL against the whitelist.
    pub fn is_cacheable(&self, url: &str) -> bool {
        self.cacheable_prefixes
            .iter()
            .any(|prefix| url.contains(prefix.as_str()))
    }
}
