use std::path::Path;

use serde::Deserialize;

use crate::counter::EngineKind;
use crate::error::Error;

pub const DEFAULT_REPS: u64 = 10_000_000_000;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    pub reps: u64,
    pub engines: Vec<EngineKind>,
    pub flag_backwards: bool,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            reps: DEFAULT_REPS,
            engines: vec![EngineKind::Rdtsc, EngineKind::Rdtscp],
            flag_backwards: true,
        }
    }
}

impl SamplerConfig {
    /// Clamp `reps` and normalize the engine list.
    pub fn validate(&mut self) {
        self.reps = self.reps.max(1);

        let mut seen = Vec::with_capacity(self.engines.len());
        self.engines.retain(|e| {
            if seen.contains(e) {
                false
            } else {
                seen.push(*e);
                true
            }
        });
        if self.engines.is_empty() {
            self.engines = Self::default().engines;
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sampler: SamplerConfig,
}

/// Load configuration from a TOML file.
///
/// - If `explicit_path` is `None`, returns the compiled-in defaults without
///   touching the filesystem.
/// - If `explicit_path` is `Some` and the file is missing, returns an error.
pub fn load_config(explicit_path: Option<&Path>) -> Result<Config, Error> {
    let Some(path) = explicit_path else {
        return Ok(Config::default());
    };
    if !path.exists() {
        return Err(Error::InvalidArgs(format!(
            "config file not found: {}",
            path.display()
        )));
    }

    let contents = std::fs::read_to_string(path).map_err(|e| {
        Error::InvalidArgs(format!("failed to read config {}: {}", path.display(), e))
    })?;

    toml::from_str(&contents).map_err(|e| {
        Error::InvalidArgs(format!("failed to parse config {}: {}", path.display(), e))
    })
}
