pub mod http;
pub mod registry;

use crate::core::error::EngineError;
use crate::utils::audio::AudioBuffer;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// What a speech backend can do. Read from config, never queried at runtime.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Capabilities {
    pub streaming: bool,
    pub voice_cloning: bool,
    pub markup_prosody: bool,
    /// Holds a scarce local resource (accelerator memory). At most one
    /// exclusive engine is in use at any time.
    pub resource_exclusive: bool,
    /// Renders short foreign phrases inside a chunk acceptably.
    pub inline_foreign: bool,
    /// Supported language tags. Empty means any.
    pub languages: Vec<String>,
    pub max_concurrency: usize,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            streaming: false,
            voice_cloning: false,
            markup_prosody: false,
            resource_exclusive: false,
            inline_foreign: false,
            languages: Vec::new(),
            max_concurrency: 4,
        }
    }
}

impl Capabilities {
    pub fn supports_language(&self, language: &str) -> bool {
        self.languages.is_empty()
            || self
                .languages
                .iter()
                .any(|l| l.eq_ignore_ascii_case(language))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisRequest {
    pub text: String,
    pub voice: Option<String>,
    pub language: String,
    /// Direction hints and engine-specific parameters, passed through untouched.
    pub params: Vec<(String, String)>,
}

#[async_trait]
pub trait SpeechBackend: Send + Sync {
    fn id(&self) -> &str;

    fn capabilities(&self) -> &Capabilities;

    async fn available(&self) -> bool {
        true
    }

    async fn synthesize(&self, request: &SynthesisRequest) -> Result<AudioBuffer, EngineError>;

    /// Frees the scarce resource held by an exclusive engine.
    async fn release(&self) -> Result<()> {
        Ok(())
    }

    /// Switches to a lighter mode after resource exhaustion. Returns false
    /// when the backend has nothing lighter to offer.
    fn degrade(&self) -> bool {
        false
    }
}
