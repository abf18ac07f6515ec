use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::extraction::{CommandExtractor, Extractor, NoopExtractor, RuleExtractor};
use crate::resolver::DEFAULT_SUGGESTION_LIMIT;

/// Which extraction collaborator processes stories
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExtractorConfig {
    /// Stories are saved but never produce candidates
    None,
    Rules,
    /// External program: request JSON on stdin, response JSON on stdout
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default = "default_timeout_secs")]
        timeout_secs: u64,
    },
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        ExtractorConfig::Rules
    }
}

fn default_timeout_secs() -> u64 {
    30
}
fn default_owner_id() -> String {
    "local".to_string()
}
fn default_suggestion_limit() -> usize {
    DEFAULT_SUGGESTION_LIMIT
}
fn default_confidence() -> f64 {
    0.5
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Owner every record is scoped to
    #[serde(default = "default_owner_id")]
    pub owner_id: String,
    #[serde(default = "default_suggestion_limit")]
    pub suggestion_limit: usize,
    /// Confidence given to candidates that arrive without one
    #[serde(default = "default_confidence")]
    pub default_confidence: f64,
    #[serde(default)]
    pub extractor: ExtractorConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            owner_id: default_owner_id(),
            suggestion_limit: default_suggestion_limit(),
            default_confidence: default_confidence(),
            extractor: ExtractorConfig::default(),
        }
    }
}

impl Settings {
    fn check(&self) -> Result<()> {
        if self.owner_id.trim().is_empty() {
            bail!("owner_id cannot be empty");
        }
        if self.suggestion_limit == 0 {
            bail!("suggestion_limit must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.default_confidence) {
            bail!("default_confidence must be within [0, 1]");
        }
        if let ExtractorConfig::Command { program, .. } = &self.extractor {
            if program.trim().is_empty() {
                bail!("command extractor needs a program");
            }
        }
        Ok(())
    }
}

/// Settings plus the file they came from.
///
/// Loaded once at startup and handed to the server explicitly.
#[derive(Debug, Clone)]
pub struct AppContext {
    path: PathBuf,
    settings: Settings,
}

impl AppContext {
    /// `<config dir>/rapport/settings.json`
    pub fn default_path() -> PathBuf {
        let mut path = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
        path.push("rapport");
        path.push("settings.json");
        path
    }

    /// Read settings from `path`; a missing file yields defaults
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let settings = match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str::<Settings>(&content)
                .with_context(|| format!("Invalid settings file {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no settings file, using defaults");
                Settings::default()
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read settings file {}", path.display()))
            }
        };
        settings.check()?;
        Ok(Self { path, settings })
    }

    pub fn new(path: impl Into<PathBuf>, settings: Settings) -> Self {
        Self {
            path: path.into(),
            settings,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn settings_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    /// Write settings back through a temp file and rename
    pub fn save(&self) -> Result<()> {
        self.settings.check()?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let content =
            serde_json::to_string_pretty(&self.settings).context("Failed to serialize settings")?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, content)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;
        info!(path = %self.path.display(), "settings saved");
        Ok(())
    }

    /// Instantiate the configured collaborator
    pub fn build_extractor(&self) -> Result<Arc<dyn Extractor>> {
        Ok(match &self.settings.extractor {
            ExtractorConfig::None => Arc::new(NoopExtractor),
            ExtractorConfig::Rules => Arc::new(RuleExtractor::new()?),
            ExtractorConfig::Command {
                program,
                args,
                timeout_secs,
            } => Arc::new(CommandExtractor::new(
                program.clone(),
                args.clone(),
                Duration::from_secs(*timeout_secs),
            )),
        })
    }
}
