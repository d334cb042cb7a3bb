//! Configuration types for recording and replay

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{ReplayCompError, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ReplayCompConfig {
    /// Recording configuration
    #[serde(default)]
    pub recording: RecordingConfig,

    /// Replay configuration
    #[serde(default)]
    pub replay: ReplayConfig,
}

/// Recording configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    /// Record units of work at all
    pub enabled: bool,

    /// Comma-separated glob patterns selecting the recorded units; a leading
    /// `~` excludes. Unset records every unit.
    pub filter: Option<String>,

    /// Directory receiving `<unitId>.json` traces
    pub output_dir: PathBuf,
}

fn default_output_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("replaycomp")
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            filter: None,
            output_dir: default_output_dir(),
        }
    }
}

impl RecordingConfig {
    /// The compiled unit filter
    pub fn unit_filter(&self) -> Result<RecordingFilter> {
        match &self.filter {
            Some(expression) => RecordingFilter::parse(expression),
            None => Ok(RecordingFilter::default()),
        }
    }
}

/// Replay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    /// Fail when a call has no recorded result instead of answering with
    /// the operation's default value
    pub divergence_is_failure: bool,

    /// Extension of trace files when scanning directories
    pub trace_extension: String,

    /// Compare the artifact produced on replay with the recorded one
    pub compare_artifacts: bool,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            divergence_is_failure: false,
            trace_extension: "json".to_string(),
            compare_artifacts: false,
        }
    }
}

impl ReplayCompConfig {
    /// Load configuration from file and environment variables.
    ///
    /// Loads in this order:
    /// 1. Default configuration
    /// 2. Configuration file (replaycomp.toml)
    /// 3. The file named by REPLAYCOMP_CONFIG_PATH
    /// 4. Environment variable overrides (`REPLAYCOMP_RECORDING__ENABLED=true`)
    ///
    /// # Errors
    ///
    /// Returns an error if a configuration file is invalid or a value fails
    /// validation.
    pub fn load() -> Result<Self> {
        use figment::{
            Figment,
            providers::{Env, Format, Serialized, Toml},
        };

        let mut figment = Figment::from(Serialized::defaults(ReplayCompConfig::default()))
            .merge(Toml::file("replaycomp.toml"));

        // Check for custom config path
        if let Ok(path) = std::env::var("REPLAYCOMP_CONFIG_PATH") {
            figment = figment.merge(Toml::file(path));
        }

        let config: ReplayCompConfig = figment
            .merge(Env::prefixed("REPLAYCOMP_").ignore(&["config_path"]).split("__"))
            .extract()
            .map_err(|e| {
                ReplayCompError::Configuration(format!("Failed to load configuration: {}", e))
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        use figment::{
            Figment,
            providers::{Format, Serialized, Toml},
        };

        let path = path.as_ref();
        if !path.exists() {
            return Err(ReplayCompError::Configuration(format!(
                "Configuration file {} does not exist",
                path.display()
            )));
        }
        let config: ReplayCompConfig = Figment::from(Serialized::defaults(ReplayCompConfig::default()))
            .merge(Toml::file(path))
            .extract()
            .map_err(|e| {
                ReplayCompError::Configuration(format!("Failed to load configuration file: {}", e))
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the filter does not compile or the trace
    /// extension is empty.
    pub fn validate(&self) -> Result<()> {
        self.recording.unit_filter()?;
        let extension = self.replay.trace_extension.trim_start_matches('.');
        if extension.is_empty() {
            return Err(ReplayCompError::Configuration(
                "replay.trace_extension must not be empty".into(),
            ));
        }
        Ok(())
    }
}

/// Decides which units of work get recorded
///
/// A unit is recorded when it matches at least one including pattern (or
/// there are none) and no excluding pattern.
#[derive(Debug, Clone, Default)]
pub struct RecordingFilter {
    include: Vec<Regex>,
    exclude: Vec<Regex>,
}

impl RecordingFilter {
    /// Parse `Foo.*,~Foo.skip*` style expressions
    pub fn parse(expression: &str) -> Result<Self> {
        let mut filter = Self::default();
        for pattern in expression.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (negated, glob) = match pattern.strip_prefix('~') {
                Some(rest) => (true, rest.trim()),
                None => (false, pattern),
            };
            if glob.is_empty() {
                return Err(ReplayCompError::Configuration(format!(
                    "empty pattern in recording filter {:?}",
                    expression
                )));
            }
            let regex = glob_to_regex(glob)?;
            if negated {
                filter.exclude.push(regex);
            } else {
                filter.include.push(regex);
            }
        }
        Ok(filter)
    }

    pub fn matches(&self, unit_name: &str) -> bool {
        let included =
            self.include.is_empty() || self.include.iter().any(|r| r.is_match(unit_name));
        included && !self.exclude.iter().any(|r| r.is_match(unit_name))
    }
}

fn glob_to_regex(glob: &str) -> Result<Regex> {
    let body = glob
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    Regex::new(&format!("^{}$", body)).map_err(|e| {
        ReplayCompError::Configuration(format!("invalid recording filter pattern {}: {}", glob, e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ReplayCompConfig::default();
        assert!(!config.recording.enabled);
        assert!(config.recording.output_dir.ends_with("replaycomp"));
        assert!(!config.replay.divergence_is_failure);
        assert_eq!(config.replay.trace_extension, "json");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file_merges_over_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[recording]\nenabled = true\nfilter = \"Foo.*, ~Foo.skip*\"\n\n[replay]\ndivergence_is_failure = true"
        )
        .unwrap();

        let config = ReplayCompConfig::from_file(file.path()).unwrap();
        assert!(config.recording.enabled);
        assert!(config.replay.divergence_is_failure);
        assert_eq!(config.replay.trace_extension, "json");

        let filter = config.recording.unit_filter().unwrap();
        assert!(filter.matches("Foo.bar"));
        assert!(!filter.matches("Foo.skipMe"));
        assert!(!filter.matches("Bar.baz"));
    }

    #[test]
    fn test_from_file_rejects_invalid_values() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[replay]\ntrace_extension = \"\"").unwrap();
        assert!(ReplayCompConfig::from_file(file.path()).is_err());
        assert!(ReplayCompConfig::from_file("/nonexistent/replaycomp.toml").is_err());
    }

    #[test]
    fn test_filter_globs() {
        let everything = RecordingFilter::parse("").unwrap();
        assert!(everything.matches("anything"));

        let only_excludes = RecordingFilter::parse("~*Test*").unwrap();
        assert!(only_excludes.matches("String.hashCode"));
        assert!(!only_excludes.matches("MyTest.run"));

        // regex metacharacters are literal
        let literal = RecordingFilter::parse("a.b(c)").unwrap();
        assert!(literal.matches("a.b(c)"));
        assert!(!literal.matches("axb(c)"));

        assert!(RecordingFilter::parse("Foo,~").is_err());
    }
}
