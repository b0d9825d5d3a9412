use anyhow::{Context, Result};
use facer_attendance::WorkflowSettings;
use facer_core::PreprocessOptions;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// CLI configuration: defaults, then an optional TOML file, then `FACER_*` env vars.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// ONNX embedding model file.
    pub model_path: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Cosine similarity threshold for a positive match.
    pub similarity_threshold: f32,
    /// Geofence radius for sessions that set a center but no radius.
    pub default_radius_m: f64,
    /// Side length of the square model input.
    pub input_size: u32,
    /// Symmetric padding applied around the detector box.
    pub pad_ratio: f32,
    /// Expected embedding length; 0 accepts whatever the model emits.
    pub embedding_dim: usize,
    /// ONNX Runtime intra-op threads.
    pub intra_threads: usize,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = xdg_dir("XDG_DATA_HOME", ".local/share").join("facer");
        Self {
            model_path: data_dir.join("models/face_embedder.onnx"),
            db_path: data_dir.join("facer.db"),
            similarity_threshold: facer_core::types::DEFAULT_MATCH_THRESHOLD,
            default_radius_m: facer_core::geofence::DEFAULT_RADIUS_M,
            input_size: facer_core::preprocess::DEFAULT_INPUT_SIZE,
            pad_ratio: facer_core::preprocess::DEFAULT_PAD_RATIO,
            embedding_dim: facer_core::recognizer::DEFAULT_EMBEDDING_DIM,
            intra_threads: 4,
        }
    }
}

impl Config {
    /// Load from the config file (if present) and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.map(Path::to_path_buf).unwrap_or_else(default_config_path);
        let base = Self::from_file(&path)?;
        Ok(base.with_env())
    }

    fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config at {}", path.display()))?;
        let cfg: Self =
            toml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))?;
        tracing::debug!(path = %path.display(), "loaded config file");
        Ok(cfg)
    }

    /// Overlay `FACER_*` environment variables; unparseable values are ignored.
    fn with_env(self) -> Self {
        Self {
            model_path: env_path("FACER_MODEL_PATH").unwrap_or(self.model_path),
            db_path: env_path("FACER_DB_PATH").unwrap_or(self.db_path),
            similarity_threshold: env_parse("FACER_SIMILARITY_THRESHOLD", self.similarity_threshold),
            default_radius_m: env_parse("FACER_DEFAULT_RADIUS_M", self.default_radius_m),
            input_size: env_parse("FACER_INPUT_SIZE", self.input_size),
            pad_ratio: env_parse("FACER_PAD_RATIO", self.pad_ratio),
            embedding_dim: env_parse("FACER_EMBEDDING_DIM", self.embedding_dim),
            intra_threads: env_parse("FACER_INTRA_THREADS", self.intra_threads),
        }
    }

    pub fn workflow_settings(&self) -> WorkflowSettings {
        WorkflowSettings {
            threshold: self.similarity_threshold,
            default_radius_m: self.default_radius_m,
        }
    }

    pub fn preprocess_options(&self) -> PreprocessOptions {
        PreprocessOptions {
            size: self.input_size,
            pad_ratio: self.pad_ratio,
        }
    }

    pub fn expected_dim(&self) -> Option<usize> {
        (self.embedding_dim > 0).then_some(self.embedding_dim)
    }
}

fn default_config_path() -> PathBuf {
    std::env::var("FACER_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| xdg_dir("XDG_CONFIG_HOME", ".config").join("facer/config.toml"))
}

fn xdg_dir(var: &str, home_fallback: &str) -> PathBuf {
    std::env::var(var).map(PathBuf::from).unwrap_or_else(|_| {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        PathBuf::from(home).join(home_fallback)
    })
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var(key).ok().filter(|v| !v.is_empty()).map(PathBuf::from)
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.similarity_threshold, 0.5);
        assert_eq!(cfg.default_radius_m, 150.0);
        assert_eq!(cfg.input_size, 160);
        assert_eq!(cfg.pad_ratio, 0.25);
        assert_eq!(cfg.expected_dim(), Some(128));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let cfg: Config = toml::from_str("similarity_threshold = 0.62\nembedding_dim = 0\n").unwrap();
        assert_eq!(cfg.similarity_threshold, 0.62);
        assert_eq!(cfg.expected_dim(), None);
        assert_eq!(cfg.input_size, 160);
    }

    #[test]
    fn test_missing_file_is_default() {
        let cfg = Config::from_file(Path::new("/nonexistent/facer/config.toml")).unwrap();
        assert_eq!(cfg, Config::default());
    }

    #[test]
    fn test_env_parse_fallback() {
        assert_eq!(env_parse("FACER_TEST_UNSET_VARIABLE", 7usize), 7);
    }
}
