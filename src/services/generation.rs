use crate::core::config::Config;
use crate::core::error::{PipelineError, PipelineResult};
use crate::core::state::{
    Chapter, ChapterGenerationState, ChapterStatus, CharacterMap, Chunk, ChunkState, ChunkStatus,
};
use crate::services::engine::registry::{EngineRegistry, FallbackPolicy};
use crate::services::executor::{CancelFlag, ChunkOutcome, Executor, ExecutorOptions};
use crate::services::segmenter::{self, ChunkOptions};
use crate::services::stitcher::{self, StitchPiece};
use crate::services::store::StateStore;
use async_trait::async_trait;
use futures_util::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn};

/// Persists chapter progress. Called after every chunk settles.
#[async_trait]
pub trait Checkpoint: Send {
    async fn save(&mut self, state: &ChapterGenerationState) -> PipelineResult<()>;
}

#[derive(Debug, Clone)]
pub struct ChapterOutput {
    pub audio_path: String,
    /// Resource-exclusive engines that produced audio for this chapter.
    pub exclusive_engines: Vec<String>,
}

/// Segments and chunks a chapter, resolving an engine and voice per chunk.
/// Ordinals run across the whole chapter.
pub fn plan_chapter(
    chapter: &Chapter,
    characters: &CharacterMap,
    registry: &EngineRegistry,
    config: &Config,
) -> PipelineResult<Vec<Chunk>> {
    let segments = segmenter::segment(
        &chapter.text,
        chapter.mode,
        &chapter.default_character,
        characters,
        config.strict_speakers,
    )?;

    let mut chunks = Vec::new();
    for segment in &segments {
        let engine = registry.resolve(
            &segment.character,
            characters,
            &chapter.default_character,
            chapter.engine.as_deref(),
        )?;
        let voice = characters
            .characters
            .get(&segment.character)
            .or_else(|| characters.characters.get(&chapter.default_character))
            .and_then(|info| info.voice_id.clone());

        let options = ChunkOptions {
            max_chars: config.generation.max_chars,
            strategy: config.generation.strategy,
            inline_threshold_words: config.generation.inline_threshold_words,
            inline_foreign: registry.get(&engine)?.capabilities().inline_foreign,
            engine,
            voice,
        };
        for mut chunk in segmenter::chunk(segment, &options) {
            chunk.ordinal = chunks.len();
            chunks.push(chunk);
        }
    }

    debug!(
        "Chapter {}: {} segments, {} chunks",
        chapter.id,
        segments.len(),
        chunks.len()
    );
    Ok(chunks)
}

pub struct ChapterGenerator<'a> {
    registry: &'a EngineRegistry,
    store: &'a StateStore,
    config: &'a Config,
    policy: &'a FallbackPolicy,
    cancel: CancelFlag,
}

impl<'a> ChapterGenerator<'a> {
    pub fn new(
        registry: &'a EngineRegistry,
        store: &'a StateStore,
        config: &'a Config,
        policy: &'a FallbackPolicy,
        cancel: CancelFlag,
    ) -> Self {
        Self {
            registry,
            store,
            config,
            policy,
            cancel,
        }
    }

    /// Brings the chunk list in `state` in line with the planned chunks.
    ///
    /// Chunks up to the watermark are trusted if their artifacts still exist.
    /// Everything after it is synthesized again.
    async fn reconcile(
        &self,
        chapter: &Chapter,
        chunks: &[Chunk],
        state: &mut ChapterGenerationState,
    ) -> PipelineResult<()> {
        let same_shape = state.chunks.len() == chunks.len()
            && state
                .chunks
                .iter()
                .zip(chunks)
                .all(|(s, c)| s.chars == c.text.chars().count() && s.character == c.character);

        if !same_shape {
            if !state.chunks.is_empty() {
                warn!(
                    "Chapter {} chunking changed ({} -> {} chunks), restarting from chunk 0",
                    chapter.id,
                    state.chunks.len(),
                    chunks.len()
                );
            }
            state.reset();
            self.store.clear_chapter(&chapter.id).await?;
            state.chunks = chunks
                .iter()
                .map(|c| ChunkStatus {
                    ordinal: c.ordinal,
                    character: c.character.clone(),
                    chars: c.text.chars().count(),
                    ..Default::default()
                })
                .collect();
            return Ok(());
        }

        let mut done = state.chunks_done().min(chunks.len());
        for i in 0..done {
            if state.chunks[i].state != ChunkState::Succeeded {
                continue;
            }
            let path = self.store.chunk_path(&chapter.id, i);
            if !self.store.exists(&path).await? {
                warn!("Chapter {}: chunk {} artifact missing, resuming from it", chapter.id, i);
                done = i;
                break;
            }
        }

        state.last_completed_chunk = done.checked_sub(1);
        for status in state.chunks.iter_mut().skip(done) {
            status.state = ChunkState::Pending;
            status.engine = None;
        }
        if done > 0 {
            info!("Chapter {}: resuming at chunk {}/{}", chapter.id, done, chunks.len());
        }
        Ok(())
    }

    pub async fn generate(
        &self,
        chapter: &Chapter,
        characters: &CharacterMap,
        state: &mut ChapterGenerationState,
        checkpoint: &mut dyn Checkpoint,
    ) -> PipelineResult<ChapterOutput> {
        let chunks = plan_chapter(chapter, characters, self.registry, self.config)?;
        if chunks.is_empty() {
            return Err(PipelineError::ChapterFailed {
                chapter: chapter.id.clone(),
                ordinal: None,
                reason: "chapter has no speakable text".to_string(),
            });
        }

        self.policy.begin_chapter();
        self.reconcile(chapter, &chunks, state).await?;
        state.status = ChapterStatus::Partial;
        state.last_error = None;
        checkpoint.save(state).await?;

        let done = state.chunks_done();
        let executor = Executor::new(
            self.registry,
            self.policy,
            ExecutorOptions::from(&self.config.generation),
            self.cancel.clone(),
        );
        let params = chapter.direction.to_params();

        let pb = ProgressBar::new(chunks.len() as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
                .map_err(anyhow::Error::from)?
                .progress_chars("#>-"),
        );
        pb.set_message(chapter.id.clone());
        pb.set_position(done as u64);

        let executor = &executor;
        let params = &params;
        let mut results = futures_util::stream::iter(chunks.iter().skip(done))
            .map(|chunk| async move {
                let chunk_id = format!("{}:{}", chapter.id, chunk.ordinal);
                let language = segmenter::language_for(chunk.script, &chapter.language);
                let report = executor.synthesize(&chunk_id, chunk, &language, params).await;
                (chunk.ordinal, report)
            })
            .buffer_unordered(self.config.generation.max_parallel_chunks.max(1));

        let mut failure: Option<(usize, String)> = None;
        while let Some((ordinal, report)) = results.next().await {
            let report = match report {
                Ok(report) => report,
                Err(e) => {
                    pb.abandon();
                    return Err(e);
                }
            };

            let status = &mut state.chunks[ordinal];
            status.attempts.extend(report.attempts);
            match report.outcome {
                ChunkOutcome::Succeeded { engine, audio } => {
                    self.store.write_chunk(&chapter.id, ordinal, &audio).await?;
                    if let Some(last) = status.attempts.last_mut() {
                        last.audio = Some(self.store.chunk_path(&chapter.id, ordinal));
                    }
                    status.state = ChunkState::Succeeded;
                    status.engine = Some(engine.clone());
                    state.engines_used.insert(engine);
                }
                ChunkOutcome::Skipped { reason } => {
                    warn!("Chapter {}: chunk {} skipped: {}", chapter.id, ordinal, reason);
                    status.state = ChunkState::Skipped;
                    state.last_error = Some(format!("chunk {} skipped: {}", ordinal, reason));
                }
                ChunkOutcome::Failed { reason } => {
                    status.state = ChunkState::Failed;
                    failure = Some((ordinal, reason));
                }
            }

            state.advance_watermark();
            checkpoint.save(state).await?;
            pb.inc(1);

            if failure.is_some() {
                break;
            }
        }
        drop(results);

        if let Some((ordinal, reason)) = failure {
            pb.abandon_with_message(format!("{} failed", chapter.id));
            state.status = ChapterStatus::Failed;
            state.last_error = Some(format!("chunk {}: {}", ordinal, reason));
            checkpoint.save(state).await?;
            return Err(PipelineError::ChapterFailed {
                chapter: chapter.id.clone(),
                ordinal: Some(ordinal),
                reason,
            });
        }
        pb.finish_with_message(format!("{} synthesized", chapter.id));

        let audio_path = self.stitch(chapter, state).await?;
        state.status = ChapterStatus::Complete;
        checkpoint.save(state).await?;

        let exclusive_engines = state
            .engines_used
            .iter()
            .filter(|id| self.registry.is_exclusive(id))
            .cloned()
            .collect();

        Ok(ChapterOutput {
            audio_path,
            exclusive_engines,
        })
    }

    async fn stitch(
        &self,
        chapter: &Chapter,
        state: &ChapterGenerationState,
    ) -> PipelineResult<String> {
        let mut pieces = Vec::new();
        for status in &state.chunks {
            if status.state != ChunkState::Succeeded {
                continue;
            }
            let path = self.store.chunk_path(&chapter.id, status.ordinal);
            pieces.push(StitchPiece {
                ordinal: status.ordinal,
                engine: status.engine.clone().unwrap_or_default(),
                audio: self.store.read_audio(&path).await?,
            });
        }

        if pieces.is_empty() {
            return Err(PipelineError::ChapterFailed {
                chapter: chapter.id.clone(),
                ordinal: None,
                reason: "every chunk was skipped".to_string(),
            });
        }

        let audio = stitcher::stitch(pieces, &self.config.stitching).map_err(|e| {
            PipelineError::ChapterFailed {
                chapter: chapter.id.clone(),
                ordinal: None,
                reason: format!("{:#}", e),
            }
        })?;
        let path = self.store.chapter_audio_path(&chapter.id);
        self.store.write_audio(&path, &audio).await?;
        info!(
            "Chapter {} stitched: {:.1}s from {} engines",
            chapter.id,
            audio.duration_secs(),
            state.engines_used.len()
        );
        Ok(path)
    }
}
