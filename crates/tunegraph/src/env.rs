//! Environment-driven configuration.
//!
//! | variable | meaning | default |
//! |---|---|---|
//! | `TUNEGRAPH_SYNTH_PATH` | search path (path-list) for the external synthesizer | empty |
//! | `TUNEGRAPH_SYNTH` | executable name of the external synthesizer | `tunesynth` |
//! | `TUNEGRAPH_RECORD_CACHE_DIR` | enables the persistent record cache in this directory | unset |
//! | `TUNEGRAPH_TUNE_WARMUP` | untimed launches before measurement | `0` |
//! | `TUNEGRAPH_TUNE_ROUNDS` | timed launches averaged into `time_ms` | `1` |
//! | `TUNEGRAPH_CUDA_ARCH` | NVRTC virtual architecture override, e.g. `compute_80` | device query |
//! | `TUNEGRAPH_CUDA_SYNTH` | `external` or `builtin` synthesizer for CUDA MemBound | `external` |

use std::env;
use std::path::PathBuf;

pub const SYNTH_PATH_VAR: &str = "TUNEGRAPH_SYNTH_PATH";
pub const SYNTH_TOOL_VAR: &str = "TUNEGRAPH_SYNTH";
pub const RECORD_CACHE_DIR_VAR: &str = "TUNEGRAPH_RECORD_CACHE_DIR";
pub const TUNE_WARMUP_VAR: &str = "TUNEGRAPH_TUNE_WARMUP";
pub const TUNE_ROUNDS_VAR: &str = "TUNEGRAPH_TUNE_ROUNDS";
pub const CUDA_ARCH_VAR: &str = "TUNEGRAPH_CUDA_ARCH";
pub const CUDA_SYNTH_VAR: &str = "TUNEGRAPH_CUDA_SYNTH";

pub const DEFAULT_SYNTH_TOOL: &str = "tunesynth";

fn non_empty_var(key: &str) -> Option<String> {
    match env::var(key) {
        Ok(value) if !value.trim().is_empty() => Some(value.trim().to_string()),
        _ => None,
    }
}

fn parse_count(key: &str, default: usize) -> usize {
    match non_empty_var(key) {
        Some(value) => match value.parse::<usize>() {
            Ok(parsed) => parsed,
            Err(_) => {
                tracing::warn!(var = key, value = %value, "ignoring non-numeric value");
                default
            }
        },
        None => default,
    }
}

/// Knobs for the tuning measurement and record persistence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TuneConfig {
    pub warmup_rounds: usize,
    /// Always treated as at least one.
    pub timing_rounds: usize,
    pub record_cache_dir: Option<PathBuf>,
}

impl Default for TuneConfig {
    fn default() -> Self {
        Self {
            warmup_rounds: 0,
            timing_rounds: 1,
            record_cache_dir: None,
        }
    }
}

impl TuneConfig {
    pub fn from_env() -> Self {
        Self {
            warmup_rounds: parse_count(TUNE_WARMUP_VAR, 0),
            timing_rounds: parse_count(TUNE_ROUNDS_VAR, 1).max(1),
            record_cache_dir: non_empty_var(RECORD_CACHE_DIR_VAR).map(PathBuf::from),
        }
    }

    pub fn with_rounds(mut self, warmup_rounds: usize, timing_rounds: usize) -> Self {
        self.warmup_rounds = warmup_rounds;
        self.timing_rounds = timing_rounds.max(1);
        self
    }

    pub fn with_record_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.record_cache_dir = Some(dir.into());
        self
    }
}

pub fn synth_search_path() -> Vec<PathBuf> {
    match env::var_os(SYNTH_PATH_VAR) {
        Some(value) => env::split_paths(&value)
            .filter(|path| !path.as_os_str().is_empty())
            .collect(),
        None => Vec::new(),
    }
}

pub fn synth_tool_name() -> String {
    non_empty_var(SYNTH_TOOL_VAR).unwrap_or_else(|| DEFAULT_SYNTH_TOOL.to_string())
}

pub fn cuda_arch_override() -> Option<String> {
    non_empty_var(CUDA_ARCH_VAR)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SynthMode {
    External,
    Builtin,
}

pub fn cuda_synth_mode() -> SynthMode {
    match non_empty_var(CUDA_SYNTH_VAR) {
        Some(value) => parse_synth_mode(&value),
        None => SynthMode::External,
    }
}

fn parse_synth_mode(value: &str) -> SynthMode {
    let normalized = value.trim().to_ascii_lowercase();
    match normalized.as_str() {
        "builtin" | "internal" | "inproc" => SynthMode::Builtin,
        "external" | "process" => SynthMode::External,
        other => {
            tracing::warn!(var = CUDA_SYNTH_VAR, value = other, "unknown synth mode, using external");
            SynthMode::External
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_single_timed_round_without_persistence() {
        let config = TuneConfig::default();
        assert_eq!(config.warmup_rounds, 0);
        assert_eq!(config.timing_rounds, 1);
        assert!(config.record_cache_dir.is_none());
    }

    #[test]
    fn with_rounds_never_drops_below_one_timed_round() {
        let config = TuneConfig::default().with_rounds(3, 0);
        assert_eq!(config.warmup_rounds, 3);
        assert_eq!(config.timing_rounds, 1);
    }

    #[test]
    fn synth_mode_parsing_accepts_aliases() {
        assert_eq!(parse_synth_mode("Builtin"), SynthMode::Builtin);
        assert_eq!(parse_synth_mode(" process "), SynthMode::External);
        assert_eq!(parse_synth_mode("bogus"), SynthMode::External);
    }
}
