use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::blend::{BlendMode, CorrespondenceOracle, Image, TemporalBlender};
use crate::cache::ConditioningCache;
use crate::checkpoint::CheckpointManager;
use crate::denoise::{FrameCodec, Smoother};
use crate::error::FuseError;
use crate::fusion::ChunkedFusion;
use crate::window::validate_window_params;

const CONFIG_FILE_NAME: &str = "framefuse.toml";
const ENV_DATA_DIR: &str = "FRAMEFUSE_DATA_DIR";
const CONDITIONING_CACHE_DIR_NAME: &str = "controlnet_caches";
const SMOOTHER_CACHE_DIR_NAME: &str = "smoother";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct FuseConfig {
    pub fusion: FusionConfig,
    pub cache: CacheConfig,
    pub blend: BlendConfig,
    pub paths: PathsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FusionConfig {
    pub window_size: usize,
    pub stride: usize,
    pub sub_batch_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CacheConfig {
    pub capacity: usize,
    pub processor_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BlendConfig {
    pub mode: BlendMode,
    pub window_size: usize,
    pub batch_size: usize,
    pub spill_to_disk: bool,
    /// Denoising steps whose estimate is blended before the step is taken.
    pub smooth_steps: Vec<usize>,
    /// Blend the decoded output once more after the last step.
    pub smooth_final: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub output_dir: PathBuf,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            window_size: 16,
            stride: 8,
            sub_batch_size: 1,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 32,
            processor_count: 0,
        }
    }
}

impl Default for BlendConfig {
    fn default() -> Self {
        Self {
            mode: BlendMode::Fast,
            window_size: 60,
            batch_size: 8,
            spill_to_disk: true,
            smooth_steps: Vec::new(),
            smooth_final: true,
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("output"),
        }
    }
}

/// Directories derived from `paths.output_dir`, resolved against the data directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPaths {
    pub output_dir: PathBuf,
    pub conditioning_cache_dir: PathBuf,
    pub checkpoint_dir: PathBuf,
    pub smoother_cache_dir: PathBuf,
}

impl ResolvedPaths {
    pub fn for_output_dir(output_dir: PathBuf) -> Self {
        Self {
            conditioning_cache_dir: output_dir.join(CONDITIONING_CACHE_DIR_NAME),
            checkpoint_dir: output_dir.clone(),
            smoother_cache_dir: output_dir.join(SMOOTHER_CACHE_DIR_NAME),
            output_dir,
        }
    }
}

impl FuseConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("config path does not have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;

        let encoded = toml::to_string_pretty(self).context("failed to serialize config TOML")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Rejects every setting that would fail mid-run. Called before any work starts.
    pub fn validate(&self) -> crate::error::Result<()> {
        validate_window_params(self.fusion.window_size, self.fusion.stride)?;
        if self.fusion.sub_batch_size == 0 {
            return Err(FuseError::config("fusion.sub_batch_size must be at least 1"));
        }
        if self.cache.capacity == 0 {
            return Err(FuseError::config("cache.capacity must be at least 1"));
        }
        if self.blend.batch_size == 0 {
            return Err(FuseError::config("blend.batch_size must be at least 1"));
        }
        Ok(())
    }

    pub fn resolve_paths(&self, data_dir: &Path) -> ResolvedPaths {
        ResolvedPaths::for_output_dir(resolve_relative_to(data_dir, &self.paths.output_dir))
    }

    pub fn chunked_fusion(&self) -> crate::error::Result<ChunkedFusion> {
        ChunkedFusion::new(
            self.fusion.window_size,
            self.fusion.stride,
            self.fusion.sub_batch_size,
        )
    }

    pub fn conditioning_cache(&self, paths: &ResolvedPaths) -> crate::error::Result<ConditioningCache> {
        ConditioningCache::new(
            &paths.conditioning_cache_dir,
            self.cache.processor_count,
            self.cache.capacity,
        )
    }

    pub fn checkpoint(&self, paths: &ResolvedPaths) -> CheckpointManager {
        CheckpointManager::new(&paths.checkpoint_dir)
    }

    pub fn blender(&self, paths: &ResolvedPaths) -> crate::error::Result<TemporalBlender> {
        Ok(
            TemporalBlender::new(self.blend.mode, self.blend.window_size, self.blend.batch_size)?
                .with_cache_dir(&paths.smoother_cache_dir, self.blend.spill_to_disk),
        )
    }

    /// Smoothing stage for a denoising run with the configured schedule.
    pub fn smoother<'a>(
        &self,
        blender: &'a TemporalBlender,
        guide: &'a [Image],
        oracle: &'a mut dyn CorrespondenceOracle,
        codec: &'a mut dyn FrameCodec,
    ) -> Smoother<'a> {
        Smoother::new(blender, guide, oracle, codec)
            .at_steps(self.blend.smooth_steps.iter().copied())
            .with_final_pass(self.blend.smooth_final)
    }
}

/// Resolve the data directory with 3-tier priority:
/// 1. CLI override if provided
/// 2. FRAMEFUSE_DATA_DIR environment variable
/// 3. Default: ./data
pub fn data_dir(cli_override: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_override {
        return path.to_path_buf();
    }

    if let Some(env_dir) = env::var_os(ENV_DATA_DIR) {
        return PathBuf::from(env_dir);
    }

    PathBuf::from("data")
}

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

/// Creates the data directory and writes a default config unless one exists.
/// Returns whether a new config file was written.
pub fn initialize_data_dir(data_dir: &Path) -> Result<bool> {
    if !data_dir.exists() {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
    }

    let cfg_path = config_path(data_dir);
    if cfg_path.exists() {
        return Ok(false);
    }
    FuseConfig::default().save_to_path(&cfg_path)?;
    Ok(true)
}

/// Returns `path` unchanged if absolute, otherwise joined onto `base`.
pub fn resolve_relative_to(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = FuseConfig::default();

        assert_eq!(cfg.fusion.window_size, 16);
        assert_eq!(cfg.fusion.stride, 8);
        assert_eq!(cfg.fusion.sub_batch_size, 1);
        assert_eq!(cfg.cache.capacity, 32);
        assert_eq!(cfg.cache.processor_count, 0);
        assert_eq!(cfg.blend.mode, BlendMode::Fast);
        assert_eq!(cfg.blend.window_size, 60);
        assert_eq!(cfg.blend.batch_size, 8);
        assert!(cfg.blend.spill_to_disk);
        assert_eq!(cfg.paths.output_dir, PathBuf::from("output"));
        cfg.validate().expect("defaults are valid");
    }

    #[test]
    fn toml_roundtrip_preserves_values() {
        let mut original = FuseConfig::default();
        original.blend.mode = BlendMode::Accurate;
        original.fusion.stride = 4;
        let encoded = toml::to_string_pretty(&original).expect("serialize config");
        let decoded: FuseConfig = toml::from_str(&encoded).expect("deserialize config");
        assert_eq!(decoded, original);
    }

    #[test]
    fn partial_toml_fills_missing_fields_with_defaults() {
        let cfg: FuseConfig =
            toml::from_str("[blend]\nmode = \"balanced\"\n\n[fusion]\nstride = 2\n").expect("parse");
        assert_eq!(cfg.blend.mode, BlendMode::Balanced);
        assert_eq!(cfg.blend.batch_size, 8);
        assert_eq!(cfg.fusion.stride, 2);
        assert_eq!(cfg.fusion.window_size, 16);
    }

    #[test]
    fn smoothing_schedule_reaches_the_smoother() {
        struct NoCodec;
        impl FrameCodec for NoCodec {
            fn decode(&mut self, _: &ndarray::ArrayD<f32>) -> anyhow::Result<Vec<Image>> {
                anyhow::bail!("unused")
            }
            fn encode(&mut self, _: &[Image]) -> anyhow::Result<ndarray::ArrayD<f32>> {
                anyhow::bail!("unused")
            }
        }

        let cfg: FuseConfig =
            toml::from_str("[blend]\nsmooth_steps = [2, 5]\nsmooth_final = false\n").expect("parse");
        assert_eq!(cfg.blend.smooth_steps, vec![2, 5]);
        assert!(!cfg.blend.smooth_final);
        assert!(FuseConfig::default().blend.smooth_steps.is_empty());

        let blender = cfg.blender(&cfg.resolve_paths(Path::new("/data"))).expect("blender");
        let mut oracle = crate::blend::test_support::IdentityOracle::default();
        let mut codec = NoCodec;
        let smoother = cfg.smoother(&blender, &[], &mut oracle, &mut codec);
        assert!(smoother.runs_at(2) && smoother.runs_at(5));
        assert!(!smoother.runs_at(3));
    }

    #[test]
    fn unknown_blend_mode_fails_to_parse() {
        let result: std::result::Result<FuseConfig, _> = toml::from_str("[blend]\nmode = \"turbo\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn validate_rejects_settings_that_would_fail_mid_run() {
        let cases: [fn(&mut FuseConfig); 6] = [
            |c| c.fusion.window_size = 0,
            |c| c.fusion.stride = 0,
            |c| c.fusion.stride = c.fusion.window_size + 1,
            |c| c.fusion.sub_batch_size = 0,
            |c| c.cache.capacity = 0,
            |c| c.blend.batch_size = 0,
        ];
        for (i, mutate) in cases.iter().enumerate() {
            let mut cfg = FuseConfig::default();
            mutate(&mut cfg);
            let err = cfg.validate().expect_err("invalid config");
            assert!(err.is_configuration(), "case {i}: {err}");
        }
    }

    #[test]
    fn load_from_nonexistent_file_returns_defaults() {
        let dir = tempfile::tempdir().expect("temp dir");
        let loaded = FuseConfig::load_from_path(&dir.path().join("missing.toml")).expect("load");
        assert_eq!(loaded, FuseConfig::default());
    }

    #[test]
    fn empty_file_returns_defaults() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("framefuse.toml");
        fs::write(&path, "  \n").expect("write empty config");
        assert_eq!(FuseConfig::load_from_path(&path).expect("load"), FuseConfig::default());
    }

    #[test]
    fn data_dir_uses_cli_override() {
        let result = data_dir(Some(Path::new("/custom")));
        assert_eq!(result, PathBuf::from("/custom"));
    }

    #[test]
    fn data_dir_env_then_default() {
        let previous = env::var_os(ENV_DATA_DIR);

        env::set_var(ENV_DATA_DIR, "/env/path");
        let from_env = data_dir(None);
        env::remove_var(ENV_DATA_DIR);
        let fallback = data_dir(None);

        if let Some(val) = previous {
            env::set_var(ENV_DATA_DIR, val);
        }

        assert_eq!(from_env, PathBuf::from("/env/path"));
        assert_eq!(fallback, PathBuf::from("data"));
    }

    #[test]
    fn config_path_is_data_dir_join_framefuse_toml() {
        assert_eq!(
            config_path(Path::new("/data")),
            PathBuf::from("/data/framefuse.toml")
        );
    }

    #[test]
    fn initialize_creates_data_dir_and_preserves_existing_config() {
        let temp = tempfile::tempdir().expect("temp dir");
        let root = temp.path().join("data");
        assert!(initialize_data_dir(&root).expect("first init"));
        assert!(root.join("framefuse.toml").exists());

        let custom = "[fusion]\nwindow_size = 4\nstride = 2\n";
        fs::write(config_path(&root), custom).expect("write custom config");
        assert!(!initialize_data_dir(&root).expect("second init"));
        assert_eq!(fs::read_to_string(config_path(&root)).expect("read"), custom);
    }

    #[test]
    fn relative_output_dir_resolves_against_data_dir() {
        let cfg = FuseConfig::default();
        let paths = cfg.resolve_paths(Path::new("/data"));
        assert_eq!(paths.output_dir, PathBuf::from("/data/output"));
        assert_eq!(paths.checkpoint_dir, PathBuf::from("/data/output"));
        assert_eq!(
            paths.conditioning_cache_dir,
            PathBuf::from("/data/output/controlnet_caches")
        );
        assert_eq!(paths.smoother_cache_dir, PathBuf::from("/data/output/smoother"));

        let mut absolute = FuseConfig::default();
        absolute.paths.output_dir = PathBuf::from("/abs/out");
        assert_eq!(
            absolute.resolve_paths(Path::new("/data")).output_dir,
            PathBuf::from("/abs/out")
        );
    }

    #[test]
    fn builders_carry_configured_values() {
        let cfg = FuseConfig::default();
        let paths = cfg.resolve_paths(Path::new("/data"));
        let fusion = cfg.chunked_fusion().expect("fusion");
        assert_eq!((fusion.window_size(), fusion.stride()), (16, 8));
        let blender = cfg.blender(&paths).expect("blender");
        assert_eq!(blender.mode(), BlendMode::Fast);
        assert_eq!(blender.cache_dir(), Some(Path::new("/data/output/smoother")));
        assert_eq!(cfg.checkpoint(&paths).dir(), Path::new("/data/output"));
    }
}
