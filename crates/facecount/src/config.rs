use facecount_core::scrfd::{DEFAULT_CONFIDENCE_THRESHOLD, DEFAULT_PYRAMID_LEVELS};
use facecount_core::{DetectionConfig, FusionPolicy};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid value for {key}: {value:?}")]
    InvalidEnv { key: String, value: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Where annotated frames go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    /// Log face counts only.
    Headless,
    /// Write annotated frames as image files.
    Snapshot,
}

/// Session configuration.
///
/// Layers, later wins: built-in defaults, TOML file, `FACECOUNT_*`
/// environment variables, command-line flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// V4L2 device path, or a directory of still images.
    pub source: String,
    /// Requested camera resolution.
    pub capture_width: u32,
    pub capture_height: u32,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Primary detector model; relative names resolve against `model_dir`.
    pub primary_model: PathBuf,
    /// Secondary detector model; relative names resolve against `model_dir`.
    pub secondary_model: PathBuf,
    /// Parameters passed to both detectors on every frame.
    pub detection: DetectionConfig,
    /// Fusion shape/overlap rules and precedence.
    pub fusion: FusionPolicy,
    /// Raw anchor score threshold inside the SCRFD backend.
    pub confidence_threshold: f32,
    /// Scales evaluated per frame by each detector.
    pub pyramid_levels: u32,
    /// Run the two detectors concurrently on each frame.
    pub parallel_detectors: bool,
    pub sink: SinkKind,
    /// Output file for the snapshot sink.
    pub snapshot_path: PathBuf,
    /// Write one numbered file per frame instead of overwriting one file.
    pub snapshot_sequence: bool,
    /// Upper bound on the per-frame wait for a stop request.
    pub poll_wait_ms: u64,
    /// Stop after this many frames.
    pub max_frames: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            source: "/dev/video0".to_string(),
            capture_width: 640,
            capture_height: 480,
            model_dir: default_model_dir(),
            primary_model: PathBuf::from("det_10g.onnx"),
            secondary_model: PathBuf::from("det_2.5g.onnx"),
            detection: DetectionConfig::default(),
            fusion: FusionPolicy::default(),
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            pyramid_levels: DEFAULT_PYRAMID_LEVELS,
            parallel_detectors: false,
            sink: SinkKind::Headless,
            snapshot_path: PathBuf::from("facecount-preview.png"),
            snapshot_sequence: false,
            poll_wait_ms: 1,
            max_frames: None,
        }
    }
}

/// `$XDG_DATA_HOME/facecount/models`, falling back to `~/.local/share`.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facecount/models")
}

impl Config {
    /// Defaults, overlaid with the TOML file at `path` when given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Apply `FACECOUNT_*` environment variables.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup (the environment in production).
    pub fn apply_env_from(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(v) = lookup("FACECOUNT_SOURCE") {
            self.source = v;
        }
        if let Some(v) = lookup("FACECOUNT_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("FACECOUNT_PRIMARY_MODEL") {
            self.primary_model = PathBuf::from(v);
        }
        if let Some(v) = lookup("FACECOUNT_SECONDARY_MODEL") {
            self.secondary_model = PathBuf::from(v);
        }
        if let Some(v) = lookup("FACECOUNT_SNAPSHOT_PATH") {
            self.snapshot_path = PathBuf::from(v);
        }
        parse_env(&lookup, "FACECOUNT_CAPTURE_WIDTH", &mut self.capture_width)?;
        parse_env(&lookup, "FACECOUNT_CAPTURE_HEIGHT", &mut self.capture_height)?;
        parse_env(&lookup, "FACECOUNT_CONFIDENCE_THRESHOLD", &mut self.confidence_threshold)?;
        parse_env(&lookup, "FACECOUNT_PYRAMID_LEVELS", &mut self.pyramid_levels)?;
        parse_env(&lookup, "FACECOUNT_SCALE_STEP", &mut self.detection.scale_step)?;
        parse_env(&lookup, "FACECOUNT_MIN_NEIGHBOR_VOTES", &mut self.detection.min_neighbor_votes)?;
        parse_env(&lookup, "FACECOUNT_MIN_BOX_SIDE", &mut self.detection.min_box_side)?;
        parse_env(&lookup, "FACECOUNT_MAX_BOX_SIDE", &mut self.detection.max_box_side)?;
        parse_env(&lookup, "FACECOUNT_POLL_WAIT_MS", &mut self.poll_wait_ms)?;
        if let Some(v) = lookup("FACECOUNT_PARALLEL_DETECTORS") {
            self.parallel_detectors = v != "0";
        }
        if let Some(v) = lookup("FACECOUNT_MAX_FRAMES") {
            let parsed = v.parse().map_err(|_| ConfigError::InvalidEnv {
                key: "FACECOUNT_MAX_FRAMES".into(),
                value: v.clone(),
            })?;
            self.max_frames = Some(parsed);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.detection
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        let fusion = &self.fusion;
        if !(fusion.min_aspect > 0.0 && fusion.min_aspect <= fusion.max_aspect) {
            return Err(ConfigError::Invalid(format!(
                "fusion aspect bounds [{}, {}] are empty or non-positive",
                fusion.min_aspect, fusion.max_aspect
            )));
        }
        if !(0.0..=1.0).contains(&fusion.overlap_fraction) {
            return Err(ConfigError::Invalid(format!(
                "fusion overlap_fraction must be within [0, 1], got {}",
                fusion.overlap_fraction
            )));
        }
        if self.pyramid_levels == 0 {
            return Err(ConfigError::Invalid("pyramid_levels must be at least 1".into()));
        }
        if self.source.is_empty() {
            return Err(ConfigError::Invalid("source must not be empty".into()));
        }
        Ok(())
    }

    pub fn primary_model_path(&self) -> PathBuf {
        self.model_dir.join(&self.primary_model)
    }

    pub fn secondary_model_path(&self) -> PathBuf {
        self.model_dir.join(&self.secondary_model)
    }

    /// True when `source` names a directory of still images.
    pub fn source_is_image_dir(&self) -> bool {
        Path::new(&self.source).is_dir()
    }
}

fn parse_env<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    slot: &mut T,
) -> Result<(), ConfigError> {
    if let Some(v) = lookup(key) {
        *slot = v.parse().map_err(|_| ConfigError::InvalidEnv {
            key: key.to_string(),
            value: v.clone(),
        })?;
    }
    Ok(())
}
