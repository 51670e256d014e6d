use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

use crate::core::error::PipelineError;
use crate::core::state::{CharacterInfo, DirectionHints, Mode};
use crate::services::engine::http::HttpEngineConfig;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    pub project_id: String,

    #[serde(default = "default_input")]
    pub input_folder: String,

    #[serde(default = "default_output")]
    pub output_folder: String,

    #[serde(default = "default_build")]
    pub build_folder: String,

    #[serde(default)]
    pub unattended: bool,

    #[serde(default = "default_language")]
    pub language: String,

    #[serde(default)]
    pub mode: Mode,

    #[serde(default = "default_character")]
    pub default_character: String,

    #[serde(default)]
    pub strict_speakers: bool,

    #[serde(default)]
    pub characters: HashMap<String, CharacterInfo>,

    #[serde(default)]
    pub chapters: BTreeMap<String, ChapterOverrides>,

    #[serde(default)]
    pub generation: GenerationConfig,

    #[serde(default)]
    pub stitching: StitchingConfig,

    #[serde(default)]
    pub quality: QualityThresholds,

    #[serde(default)]
    pub engines: Vec<EngineConfig>,
}

/// Per-chapter settings layered over the project defaults at ingest.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct ChapterOverrides {
    pub title: Option<String>,
    pub language: Option<String>,
    pub mode: Option<Mode>,
    pub default_character: Option<String>,
    pub engine: Option<String>,
    #[serde(default)]
    pub direction: DirectionHints,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStrategy {
    #[default]
    BreathGroup,
    Sentence,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FallbackScope {
    #[default]
    Chapter,
    Project,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GenerationConfig {
    pub default_engine: Option<String>,
    /// Forces a single engine for every chunk of the run.
    pub engine_override: Option<String>,
    #[serde(default)]
    pub fallback_chain: Vec<String>,
    #[serde(default)]
    pub fallback_scope: FallbackScope,
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
    #[serde(default)]
    pub strategy: ChunkStrategy,
    #[serde(default = "default_inline_threshold")]
    pub inline_threshold_words: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries_per_chunk: usize,
    #[serde(default)]
    pub retry_delay_ms: u64,
    #[serde(default)]
    pub retry_jitter_ms: u64,
    #[serde(default = "default_engine_timeout")]
    pub engine_timeout_secs: u64,
    #[serde(default = "default_parallel_chunks")]
    pub max_parallel_chunks: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            default_engine: None,
            engine_override: None,
            fallback_chain: Vec::new(),
            fallback_scope: FallbackScope::default(),
            max_chars: default_max_chars(),
            strategy: ChunkStrategy::default(),
            inline_threshold_words: default_inline_threshold(),
            max_retries_per_chunk: default_max_retries(),
            retry_delay_ms: 0,
            retry_jitter_ms: 0,
            engine_timeout_secs: default_engine_timeout(),
            max_parallel_chunks: default_parallel_chunks(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StitchingConfig {
    #[serde(default = "default_crossfade")]
    pub crossfade_ms: u64,
    #[serde(default = "default_crossfade_min")]
    pub crossfade_min_ms: u64,
    #[serde(default)]
    pub engine_crossfade_ms: HashMap<String, u64>,
    #[serde(default)]
    pub leading_silence_ms: u64,
}

impl Default for StitchingConfig {
    fn default() -> Self {
        Self {
            crossfade_ms: default_crossfade(),
            crossfade_min_ms: default_crossfade_min(),
            engine_crossfade_ms: HashMap::new(),
            leading_silence_ms: 0,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct QualityThresholds {
    #[serde(default = "default_min_snr")]
    pub min_snr_db: f64,
    #[serde(default = "default_max_peak")]
    pub max_peak_dbfs: f64,
    #[serde(default = "default_duration_fail")]
    pub max_duration_deviation_percent: f64,
    #[serde(default = "default_duration_warn")]
    pub warn_duration_deviation_percent: f64,
    #[serde(default = "default_pitch_jump")]
    pub max_pitch_jump_semitones: f64,
    #[serde(default = "default_target_lufs")]
    pub target_lufs: f64,
    #[serde(default = "default_lufs_fail")]
    pub lufs_fail_tolerance: f64,
    #[serde(default = "default_lufs_warn")]
    pub lufs_warn_tolerance: f64,
    /// Expected speaking rate used to derive a chunk's expected duration.
    #[serde(default = "default_chars_per_second")]
    pub chars_per_second: f64,
    #[serde(default = "default_fail_threshold")]
    pub fail_threshold_percent: f64,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            min_snr_db: default_min_snr(),
            max_peak_dbfs: default_max_peak(),
            max_duration_deviation_percent: default_duration_fail(),
            warn_duration_deviation_percent: default_duration_warn(),
            max_pitch_jump_semitones: default_pitch_jump(),
            target_lufs: default_target_lufs(),
            lufs_fail_tolerance: default_lufs_fail(),
            lufs_warn_tolerance: default_lufs_warn(),
            chars_per_second: default_chars_per_second(),
            fail_threshold_percent: default_fail_threshold(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EngineConfig {
    Http(HttpEngineConfig),
}

impl EngineConfig {
    pub fn id(&self) -> &str {
        match self {
            EngineConfig::Http(cfg) => &cfg.id,
        }
    }

    pub fn fallback(&self) -> Option<&[String]> {
        match self {
            EngineConfig::Http(cfg) => cfg.fallback.as_deref(),
        }
    }
}

fn default_input() -> String {
    "input".to_string()
}
fn default_output() -> String {
    "output".to_string()
}
fn default_build() -> String {
    "build".to_string()
}
fn default_language() -> String {
    "ar".to_string()
}
fn default_character() -> String {
    "narrator".to_string()
}
fn default_max_chars() -> usize {
    250
}
fn default_inline_threshold() -> usize {
    3
}
fn default_max_retries() -> usize {
    3
}
fn default_engine_timeout() -> u64 {
    120
}
fn default_parallel_chunks() -> usize {
    4
}
fn default_crossfade() -> u64 {
    40
}
fn default_crossfade_min() -> u64 {
    10
}
fn default_min_snr() -> f64 {
    20.0
}
fn default_max_peak() -> f64 {
    -1.0
}
fn default_duration_fail() -> f64 {
    60.0
}
fn default_duration_warn() -> f64 {
    30.0
}
fn default_pitch_jump() -> f64 {
    12.0
}
fn default_target_lufs() -> f64 {
    -18.0
}
fn default_lufs_fail() -> f64 {
    6.0
}
fn default_lufs_warn() -> f64 {
    2.0
}
fn default_chars_per_second() -> f64 {
    14.0
}
fn default_fail_threshold() -> f64 {
    10.0
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let path = Path::new(path);
        if !path.exists() {
            anyhow::bail!("{} not found. Please create one.", path.display());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Config = serde_yaml_ng::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &str) -> Result<()> {
        let content = serde_yaml_ng::to_string(self)?;
        fs::write(path, content).with_context(|| format!("Failed to write {}", path))?;
        Ok(())
    }

    pub fn ensure_directories(&self) -> Result<()> {
        fs::create_dir_all(&self.input_folder)?;
        fs::create_dir_all(&self.output_folder)?;
        fs::create_dir_all(&self.build_folder)?;
        Ok(())
    }

    pub fn engine(&self, id: &str) -> Option<&EngineConfig> {
        self.engines.iter().find(|e| e.id() == id)
    }

    /// Checks that every engine id referenced anywhere is defined.
    pub fn validate(&self) -> std::result::Result<(), PipelineError> {
        if self.project_id.trim().is_empty() {
            return Err(PipelineError::Config("project_id must not be empty".to_string()));
        }
        if self.generation.max_chars == 0 {
            return Err(PipelineError::Config("generation.max_chars must be > 0".to_string()));
        }

        let mut referenced: Vec<(&str, String)> = Vec::new();
        if let Some(e) = &self.generation.default_engine {
            referenced.push((e.as_str(), "generation.default_engine".to_string()));
        }
        if let Some(e) = &self.generation.engine_override {
            referenced.push((e.as_str(), "generation.engine_override".to_string()));
        }
        for e in &self.generation.fallback_chain {
            referenced.push((e.as_str(), "generation.fallback_chain".to_string()));
        }
        for (name, info) in &self.characters {
            if let Some(e) = &info.engine {
                referenced.push((e.as_str(), format!("characters.{}", name)));
            }
        }
        for (id, ch) in &self.chapters {
            if let Some(e) = &ch.engine {
                referenced.push((e.as_str(), format!("chapters.{}", id)));
            }
        }
        for engine in &self.engines {
            for e in engine.fallback().unwrap_or_default() {
                referenced.push((e.as_str(), format!("engines.{}.fallback", engine.id())));
            }
        }

        for (engine, origin) in referenced {
            if self.engine(engine).is_none() {
                return Err(PipelineError::Config(format!(
                    "{} refers to undefined engine '{}'",
                    origin, engine
                )));
            }
        }
        Ok(())
    }
}
