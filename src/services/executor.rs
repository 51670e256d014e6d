use crate::core::config::GenerationConfig;
use crate::core::error::{EngineError, PipelineError, PipelineResult};
use crate::core::state::{AttemptOutcome, Chunk, GenerationAttempt};
use crate::services::engine::registry::{EngineRegistry, FallbackPolicy};
use crate::services::engine::SynthesisRequest;
use crate::utils::audio::AudioBuffer;
use log::{debug, warn};
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Cooperative cancellation shared between the caller and running generation.
#[derive(Clone, Default, Debug)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    /// Calls per engine before moving down the chain.
    pub max_retries: usize,
    pub retry_delay: Duration,
    pub retry_jitter_ms: u64,
    pub timeout: Duration,
}

impl From<&GenerationConfig> for ExecutorOptions {
    fn from(cfg: &GenerationConfig) -> Self {
        Self {
            max_retries: cfg.max_retries_per_chunk.max(1),
            retry_delay: Duration::from_millis(cfg.retry_delay_ms),
            retry_jitter_ms: cfg.retry_jitter_ms,
            timeout: Duration::from_secs(cfg.engine_timeout_secs.max(1)),
        }
    }
}

#[derive(Debug)]
pub enum ChunkOutcome {
    Succeeded { engine: String, audio: AudioBuffer },
    /// Nothing speakable in the chunk text. Counted as a failure but the
    /// chapter goes on.
    Skipped { reason: String },
    /// Every engine in the chain was exhausted.
    Failed { reason: String },
}

#[derive(Debug)]
pub struct ChunkReport {
    pub outcome: ChunkOutcome,
    pub attempts: Vec<GenerationAttempt>,
}

/// Synthesizes single chunks, walking the fallback chain with bounded retries.
pub struct Executor<'a> {
    registry: &'a EngineRegistry,
    policy: &'a FallbackPolicy,
    options: ExecutorOptions,
    cancel: CancelFlag,
}

impl<'a> Executor<'a> {
    pub fn new(
        registry: &'a EngineRegistry,
        policy: &'a FallbackPolicy,
        options: ExecutorOptions,
        cancel: CancelFlag,
    ) -> Self {
        Self {
            registry,
            policy,
            options,
            cancel,
        }
    }

    /// Runs one chunk to a terminal outcome.
    ///
    /// Returns `Err(Cancelled)` if the cancel flag is raised before an engine
    /// call starts. The chunk then stays pending in the persisted state.
    pub async fn synthesize(
        &self,
        chunk_id: &str,
        chunk: &Chunk,
        language: &str,
        params: &[(String, String)],
    ) -> PipelineResult<ChunkReport> {
        let mut attempts = Vec::new();

        if !chunk.text.chars().any(|c| c.is_alphanumeric()) {
            return Ok(ChunkReport {
                outcome: ChunkOutcome::Skipped {
                    reason: format!("nothing to speak in {:?}", chunk.text),
                },
                attempts,
            });
        }

        let chain = self.policy.apply(self.registry.fallback_chain(&chunk.engine));
        let mut last_error = String::from("no engine in chain");

        'engines: for engine_id in chain {
            let backend = self.registry.get(&engine_id)?;

            if !backend.capabilities().supports_language(language) {
                last_error = format!("engine '{}' does not speak '{}'", engine_id, language);
                debug!("{} for {}", last_error, chunk_id);
                attempts.push(attempt(
                    chunk_id,
                    &engine_id,
                    1,
                    AttemptOutcome::FatalFailure,
                    Some(&last_error),
                ));
                continue;
            }

            let request = SynthesisRequest {
                text: chunk.text.clone(),
                // Voices are engine specific; fallbacks use their own default.
                voice: if engine_id == chunk.engine { chunk.voice.clone() } else { None },
                language: language.to_string(),
                params: params.to_vec(),
            };

            let mut calls = 0;
            let mut budget = self.options.max_retries;
            let mut degraded = false;

            while budget > 0 {
                if self.cancel.is_cancelled() {
                    return Err(PipelineError::Cancelled);
                }
                budget -= 1;
                calls += 1;

                let slot = self.registry.acquire(&engine_id).await?;
                let call = tokio::time::timeout(self.options.timeout, backend.synthesize(&request));
                let result = match call.await {
                    Ok(result) => result,
                    Err(_) => Err(EngineError::Transient(format!(
                        "timed out after {:?}",
                        self.options.timeout
                    ))),
                };
                drop(slot);

                let err = match result {
                    Ok(audio) if !audio.is_empty() => {
                        attempts.push(attempt(
                            chunk_id,
                            &engine_id,
                            calls,
                            AttemptOutcome::Success,
                            None,
                        ));
                        return Ok(ChunkReport {
                            outcome: ChunkOutcome::Succeeded {
                                engine: engine_id,
                                audio,
                            },
                            attempts,
                        });
                    }
                    Ok(_) => EngineError::Transient("engine returned no audio".to_string()),
                    Err(e) => e,
                };

                last_error = err.to_string();
                match err {
                    EngineError::Transient(_) => {
                        warn!(
                            "{} on '{}' (attempt {}/{}): {}",
                            chunk_id, engine_id, calls, self.options.max_retries, last_error
                        );
                        attempts.push(attempt(
                            chunk_id,
                            &engine_id,
                            calls,
                            AttemptOutcome::TransientFailure,
                            Some(&last_error),
                        ));
                        if budget > 0 {
                            self.backoff().await;
                        }
                    }
                    EngineError::ResourceExhausted(_) if !degraded && backend.degrade() => {
                        warn!(
                            "{} exhausted '{}', retrying degraded: {}",
                            chunk_id, engine_id, last_error
                        );
                        attempts.push(attempt(
                            chunk_id,
                            &engine_id,
                            calls,
                            AttemptOutcome::TransientFailure,
                            Some(&last_error),
                        ));
                        degraded = true;
                        budget = budget.max(1);
                    }
                    EngineError::InvalidInput(_) => {
                        // Rejects this text only; the engine stays in rotation.
                        warn!("{} rejected by '{}': {}", chunk_id, engine_id, last_error);
                        attempts.push(attempt(
                            chunk_id,
                            &engine_id,
                            calls,
                            AttemptOutcome::FatalFailure,
                            Some(&last_error),
                        ));
                        continue 'engines;
                    }
                    EngineError::Fatal(_) | EngineError::ResourceExhausted(_) => {
                        warn!("{} fatal on '{}': {}", chunk_id, engine_id, last_error);
                        attempts.push(attempt(
                            chunk_id,
                            &engine_id,
                            calls,
                            AttemptOutcome::FatalFailure,
                            Some(&last_error),
                        ));
                        break;
                    }
                }
            }

            self.policy.demote(&engine_id);
        }

        Ok(ChunkReport {
            outcome: ChunkOutcome::Failed {
                reason: format!("all engines exhausted, last error: {}", last_error),
            },
            attempts,
        })
    }

    async fn backoff(&self) {
        let mut delay = self.options.retry_delay;
        if self.options.retry_jitter_ms > 0 {
            let jitter = rand::rng().random_range(0..=self.options.retry_jitter_ms);
            delay += Duration::from_millis(jitter);
        }
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

fn attempt(
    chunk_id: &str,
    engine_id: &str,
    number: usize,
    outcome: AttemptOutcome,
    error: Option<&str>,
) -> GenerationAttempt {
    GenerationAttempt {
        chunk_id: chunk_id.to_string(),
        engine_id: engine_id.to_string(),
        attempt: number,
        outcome,
        audio: None,
        error: error.map(str::to_string),
    }
}
