//! Node configuration – reads `~/.gsm/config.toml` or an explicit `--config`
//! path.  Every field has a default; `GSM_*` variables override the file.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use gsm_perception::MapConfig;
use gsm_runtime::{ControllerConfig, ControllerVariant, ExtractionStrategy};
use gsm_types::ColorScheme;

/// Persisted node configuration.  Durations are in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub variant: ControllerVariant,
    pub voxel_size: f32,
    pub voxels_per_side: usize,
    pub world_frame: String,
    pub camera_frame: String,
    pub window_frame: String,
    pub window_radius: f32,
    pub window_check_period: f64,
    pub pose_wait: f64,
    /// `0` disables idle shutdown.
    pub no_update_timeout: f64,
    pub min_blocks_to_publish: usize,
    pub association_threshold: f32,
    pub color_scheme: ColorScheme,
    pub mesh_period: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mesh_file: Option<PathBuf>,
    pub export_dir: PathBuf,
    pub publish_segment_updates: bool,
    pub publish_segment_mesh: bool,
    pub publish_bboxes: bool,
    pub publish_scene_mesh: bool,
    pub publish_feature_blocks: bool,
    pub use_label_propagation: bool,
    pub enable_semantic_instance_segmentation: bool,
    /// `fresh` or `caching`; unset picks the variant's strategy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extraction: Option<ExtractionStrategy>,
    /// Per-topic buffer of the outbound bus.
    pub bus_capacity: usize,
    /// Observation file; stdin when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        let c = ControllerConfig::default();
        Self {
            variant: c.variant,
            voxel_size: c.map.voxel_size,
            voxels_per_side: c.map.voxels_per_side,
            world_frame: c.world_frame,
            camera_frame: c.camera_frame,
            window_frame: c.window_frame,
            window_radius: c.window_radius,
            window_check_period: c.window_check_period.as_secs_f64(),
            pose_wait: c.pose_wait.as_secs_f64(),
            no_update_timeout: c.no_update_timeout.as_secs_f64(),
            min_blocks_to_publish: c.min_blocks_to_publish,
            association_threshold: c.association_threshold,
            color_scheme: c.color_scheme,
            mesh_period: c.mesh_period.as_secs_f64(),
            mesh_file: c.mesh_file,
            export_dir: c.export_dir,
            publish_segment_updates: c.publish_segment_updates,
            publish_segment_mesh: c.publish_segment_mesh,
            publish_bboxes: c.publish_bboxes,
            publish_scene_mesh: c.publish_scene_mesh,
            publish_feature_blocks: c.publish_feature_blocks,
            use_label_propagation: c.use_label_propagation,
            enable_semantic_instance_segmentation: c.enable_semantic_instance_segmentation,
            extraction: c.extraction,
            bus_capacity: 256,
            input: None,
        }
    }
}

impl Config {
    /// Convert into the pipeline configuration and validate it.
    pub fn to_controller_config(&self) -> Result<ControllerConfig, String> {
        let config = ControllerConfig {
            variant: self.variant,
            map: MapConfig {
                voxel_size: self.voxel_size,
                voxels_per_side: self.voxels_per_side,
            },
            world_frame: self.world_frame.clone(),
            camera_frame: self.camera_frame.clone(),
            window_frame: self.window_frame.clone(),
            window_radius: self.window_radius,
            window_check_period: seconds("window_check_period", self.window_check_period)?,
            pose_wait: seconds("pose_wait", self.pose_wait)?,
            no_update_timeout: seconds("no_update_timeout", self.no_update_timeout)?,
            min_blocks_to_publish: self.min_blocks_to_publish,
            association_threshold: self.association_threshold,
            color_scheme: self.color_scheme,
            mesh_period: seconds("mesh_period", self.mesh_period)?,
            mesh_file: self.mesh_file.clone(),
            export_dir: self.export_dir.clone(),
            publish_segment_updates: self.publish_segment_updates,
            publish_segment_mesh: self.publish_segment_mesh,
            publish_bboxes: self.publish_bboxes,
            publish_scene_mesh: self.publish_scene_mesh,
            publish_feature_blocks: self.publish_feature_blocks,
            use_label_propagation: self.use_label_propagation,
            enable_semantic_instance_segmentation: self.enable_semantic_instance_segmentation,
            extraction: self.extraction,
        };
        config.validate().map_err(|e| e.to_string())?;
        if self.bus_capacity == 0 {
            return Err("bus_capacity must be > 0".to_string());
        }
        Ok(config)
    }
}

fn seconds(field: &str, value: f64) -> Result<Duration, String> {
    Duration::try_from_secs_f64(value).map_err(|e| format!("{field}: {e}"))
}

/// Return the path to `~/.gsm/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".gsm").join("config.toml")
}

/// Load the configuration.  An explicit path must exist; a missing default
/// file yields the defaults.  Environment overrides apply either way.
pub fn load(explicit: Option<&Path>) -> Result<Config, String> {
    let mut cfg = match explicit {
        Some(path) => load_from(path)?
            .ok_or_else(|| format!("Config file {} does not exist", path.display()))?,
        None => load_from(&config_path())?.unwrap_or_default(),
    };
    apply_env_overrides(&mut cfg);
    Ok(cfg)
}

/// Load a config file.  Returns `None` if the file does not exist.
pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    toml::from_str(&raw)
        .map(Some)
        .map_err(|e| format!("Failed to parse config: {}", e))
}

/// Apply `GSM_*` environment variable overrides to `cfg`.  Values that do
/// not parse are ignored.
///
/// | Variable | Config field |
/// |---|---|
/// | `GSM_VARIANT` | `variant` (`unbounded` / `sliding_window`) |
/// | `GSM_WINDOW_RADIUS` | `window_radius` |
/// | `GSM_NO_UPDATE_TIMEOUT` | `no_update_timeout` |
/// | `GSM_MIN_BLOCKS` | `min_blocks_to_publish` |
/// | `GSM_COLOR_SCHEME` | `color_scheme` |
/// | `GSM_MESH_FILE` | `mesh_file` |
/// | `GSM_INPUT` | `input` |
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("GSM_VARIANT") {
        match v.as_str() {
            "unbounded" => cfg.variant = ControllerVariant::Unbounded,
            "sliding_window" => cfg.variant = ControllerVariant::SlidingWindow,
            _ => {}
        }
    }
    if let Ok(v) = std::env::var("GSM_WINDOW_RADIUS")
        && let Ok(radius) = v.parse::<f32>() {
            cfg.window_radius = radius;
        }
    if let Ok(v) = std::env::var("GSM_NO_UPDATE_TIMEOUT")
        && let Ok(timeout) = v.parse::<f64>() {
            cfg.no_update_timeout = timeout;
        }
    if let Ok(v) = std::env::var("GSM_MIN_BLOCKS")
        && let Ok(min) = v.parse::<usize>() {
            cfg.min_blocks_to_publish = min;
        }
    if let Ok(v) = std::env::var("GSM_COLOR_SCHEME") {
        match v.as_str() {
            "label" => cfg.color_scheme = ColorScheme::Label,
            "semantic" => cfg.color_scheme = ColorScheme::Semantic,
            "instance" => cfg.color_scheme = ColorScheme::Instance,
            "merged" => cfg.color_scheme = ColorScheme::Merged,
            _ => {}
        }
    }
    if let Ok(v) = std::env::var("GSM_MESH_FILE") {
        cfg.mesh_file = Some(PathBuf::from(v));
    }
    if let Ok(v) = std::env::var("GSM_INPUT") {
        cfg.input = Some(PathBuf::from(v));
    }
}

/// Write `cfg` to `path`, creating parent directories.
pub fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
    }
    let raw = toml::to_string_pretty(cfg)
        .map_err(|e| format!("Failed to serialize config: {}", e))?;
    fs::write(path, raw)
        .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))
}
