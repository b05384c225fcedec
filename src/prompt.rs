//! Prompt templates that seed a new session with a system message.
//!
//! A template is looked up, in order, as:
//!
//! 1. the literal path given on the command line,
//! 2. a file with that name in the config directory (`~/.config/confab`),
//! 3. `<name>.yaml` in the config directory, in the older YAML form:
//!
//! ```yaml
//! system: You are a careful reviewer.
//! model: gpt-4
//! temperature: 0.2
//! ```
//!
//! Plain files are used verbatim.  Files ending in `.yaml` or `.yml` are always read in the YAML
//! form.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::store::APP_NAME;

/// A resolved prompt template.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PromptTemplate {
    /// Text of the system message.
    pub system: String,
    /// Model the template asks for, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Temperature the template asks for, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

impl PromptTemplate {
    /// Creates a template that only carries system text.
    pub fn new(system: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            ..Self::default()
        }
    }

    /// Parses the YAML form.
    pub fn from_yaml(text: &str) -> std::result::Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(text)
    }
}

/// Returns `~/.config/confab`, falling back to the platform config directory.
pub fn resolve_config_dir() -> Option<PathBuf> {
    dirs::home_dir()
        .map(|home| home.join(".config"))
        .or_else(dirs::config_dir)
        .map(|dir| dir.join(APP_NAME))
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    )
}

/// Finds prompt templates by name or path.
#[derive(Clone, Debug)]
pub struct PromptLibrary {
    config_dir: Option<PathBuf>,
}

impl PromptLibrary {
    /// Creates a library that searches `config_dir`.
    pub fn new(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: Some(config_dir.into()),
        }
    }

    /// Creates a library that searches the user's config directory.
    pub fn from_environment() -> Self {
        Self {
            config_dir: resolve_config_dir(),
        }
    }

    /// Loads a template.
    ///
    /// # Errors
    ///
    /// Returns `PromptNotFound` listing every path tried when none of them exists, or `Format`
    /// when a YAML template cannot be parsed.
    pub fn load(&self, name_or_path: &str) -> Result<PromptTemplate> {
        if name_or_path.is_empty() {
            return Err(Error::prompt_not_found(name_or_path, Vec::new()));
        }
        let mut candidates = vec![PathBuf::from(name_or_path)];
        if let Some(dir) = &self.config_dir {
            candidates.push(dir.join(name_or_path));
            candidates.push(dir.join(format!("{name_or_path}.yaml")));
        }
        let mut searched = Vec::new();
        for (idx, path) in candidates.into_iter().enumerate() {
            let text = match fs::read_to_string(&path) {
                Ok(text) => text,
                Err(err)
                    if err.kind() == io::ErrorKind::NotFound
                        || err.kind() == io::ErrorKind::IsADirectory =>
                {
                    searched.push(path);
                    continue;
                }
                Err(err) => {
                    return Err(Error::io(format!("cannot read {}", path.display()), err));
                }
            };
            debug!("loaded prompt template from {}", path.display());
            // The third candidate is always the YAML form.
            return if idx == 2 || is_yaml(&path) {
                PromptTemplate::from_yaml(&text).map_err(|err| {
                    Error::format(
                        format!("invalid prompt config: {err}"),
                        Some(path),
                        Some(Box::new(err)),
                    )
                })
            } else {
                Ok(PromptTemplate::new(text))
            };
        }
        Err(Error::prompt_not_found(name_or_path, searched))
    }
}
