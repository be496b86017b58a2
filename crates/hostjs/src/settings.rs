//! Engine settings
//!
//! Built from the engine arguments handed to `initialize`, optionally merged
//! with a JSON settings file.

use crate::error::EmbedError;
use rquickjs::Runtime;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_PROGRAM_NAME: &str = "hostjs";

/// Settings applied to a runtime instance at initialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Reported to guest code as `process.argv[0]`.
    pub program_name: String,
    /// Heap limit in bytes.
    pub memory_limit: Option<usize>,
    /// Native stack limit in bytes.
    pub max_stack_size: Option<usize>,
    /// Allocation threshold in bytes that triggers a GC pass.
    pub gc_threshold: Option<usize>,
    /// Arguments not consumed here; exposed as `process.execArgv`.
    pub exec_argv: Vec<String>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            program_name: DEFAULT_PROGRAM_NAME.to_string(),
            memory_limit: None,
            max_stack_size: None,
            gc_threshold: None,
            exec_argv: Vec::new(),
        }
    }
}

impl EngineSettings {
    /// Parse engine arguments. Later arguments override earlier ones,
    /// including values loaded through `--settings=<file>`.
    pub fn from_args<S: AsRef<str>>(program_name: &str, args: &[S]) -> Result<Self, EmbedError> {
        let mut settings = Self {
            program_name: program_name.to_string(),
            ..Self::default()
        };

        for arg in args {
            let arg = arg.as_ref();
            let Some((key, value)) = arg.split_once('=') else {
                settings.pass_through(arg);
                continue;
            };
            match key {
                "--memory-limit" => settings.memory_limit = Some(parse_bytes(arg, value)?),
                "--stack-size" => settings.max_stack_size = Some(parse_bytes(arg, value)?),
                "--gc-threshold" => settings.gc_threshold = Some(parse_bytes(arg, value)?),
                "--settings" => {
                    let loaded = Self::from_file(value).map_err(|err| EmbedError::InvalidEngineArg {
                        arg: arg.to_string(),
                        reason: err.to_string(),
                    })?;
                    settings.merge(loaded);
                }
                _ => settings.pass_through(arg),
            }
        }

        Ok(settings)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, EmbedError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text).map_err(|err| EmbedError::InvalidEngineArg {
            arg: "--settings".to_string(),
            reason: err.to_string(),
        })
    }

    /// Applies the engine limits to a freshly created runtime.
    pub(crate) fn apply(&self, runtime: &Runtime) {
        if let Some(limit) = self.memory_limit {
            runtime.set_memory_limit(limit);
        }
        if let Some(limit) = self.max_stack_size {
            runtime.set_max_stack_size(limit);
        }
        if let Some(threshold) = self.gc_threshold {
            runtime.set_gc_threshold(threshold);
        }
    }

    // The program name always comes from `initialize`, not from a file.
    fn merge(&mut self, other: Self) {
        self.memory_limit = other.memory_limit.or(self.memory_limit);
        self.max_stack_size = other.max_stack_size.or(self.max_stack_size);
        self.gc_threshold = other.gc_threshold.or(self.gc_threshold);
        self.exec_argv.extend(other.exec_argv);
    }

    fn pass_through(&mut self, arg: &str) {
        tracing::warn!(arg, "engine argument not recognised, exposing via process.execArgv");
        self.exec_argv.push(arg.to_string());
    }
}

/// Accepts plain byte counts and `k`/`m`/`g` suffixes.
fn parse_bytes(arg: &str, value: &str) -> Result<usize, EmbedError> {
    let value = value.trim();
    let (digits, scale) = match value.char_indices().last() {
        Some((i, 'k' | 'K')) => (&value[..i], 1024),
        Some((i, 'm' | 'M')) => (&value[..i], 1024 * 1024),
        Some((i, 'g' | 'G')) => (&value[..i], 1024 * 1024 * 1024),
        _ => (value, 1),
    };
    digits
        .parse::<usize>()
        .ok()
        .and_then(|n| n.checked_mul(scale))
        .ok_or_else(|| EmbedError::InvalidEngineArg {
            arg: arg.to_string(),
            reason: format!("'{value}' is not a byte size"),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = EngineSettings::from_args::<&str>("app", &[]).unwrap();
        assert_eq!(settings.program_name, "app");
        assert_eq!(settings.memory_limit, None);
        assert!(settings.exec_argv.is_empty());
    }

    #[test]
    fn test_limits_and_pass_through() {
        let settings = EngineSettings::from_args(
            "app",
            &["--memory-limit=64m", "--stack-size=512k", "--trace-gc", "--gc-threshold=4096"],
        )
        .unwrap();
        assert_eq!(settings.memory_limit, Some(64 * 1024 * 1024));
        assert_eq!(settings.max_stack_size, Some(512 * 1024));
        assert_eq!(settings.gc_threshold, Some(4096));
        assert_eq!(settings.exec_argv, vec!["--trace-gc".to_string()]);
    }

    #[test]
    fn test_invalid_size() {
        let err = EngineSettings::from_args("app", &["--memory-limit=lots"]).unwrap_err();
        assert!(matches!(err, EmbedError::InvalidEngineArg { .. }));
    }

    #[test]
    fn test_json_is_partial() {
        let settings = EngineSettings::from_json(r#"{ "gc_threshold": 1024 }"#).unwrap();
        assert_eq!(settings.gc_threshold, Some(1024));
        assert_eq!(settings.program_name, DEFAULT_PROGRAM_NAME);
    }

    #[test]
    fn test_settings_file_then_override() {
        let path = std::env::temp_dir()
            .join(format!("hostjs-settings-{}.json", std::process::id()));
        std::fs::write(&path, r#"{ "memory_limit": 1000, "max_stack_size": 2000 }"#).unwrap();

        let settings = EngineSettings::from_args(
            "app",
            &[format!("--settings={}", path.display()), "--memory-limit=3000".to_string()],
        )
        .unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(settings.memory_limit, Some(3000));
        assert_eq!(settings.max_stack_size, Some(2000));
        assert_eq!(settings.program_name, "app");
    }

    #[test]
    fn test_missing_settings_file() {
        let err = EngineSettings::from_args("app", &["--settings=/definitely/not/here.json"])
            .unwrap_err();
        assert!(matches!(err, EmbedError::InvalidEngineArg { .. }));
    }
}
