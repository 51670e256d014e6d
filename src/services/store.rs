use crate::core::error::{PipelineError, PipelineResult};
use crate::core::io::Storage;
use crate::core::state::{Chapter, PipelineStatus};
use crate::utils::audio::{decode_wav, encode_wav, AudioBuffer};
use anyhow::Context;
use log::{debug, warn};
use std::path::Path;
use std::sync::Arc;

const STATUS_FILE: &str = "pipeline_status.json";
const MANIFEST_FILE: &str = "chapters.json";
const CHAPTER_AUDIO: &str = "chapter.wav";

/// Durable home for pipeline status, the chapter manifest and audio artifacts.
///
/// Every write goes through [`Storage::write`], which replaces files
/// atomically. A failed status write is a [`PipelineError::Persistence`].
#[derive(Clone)]
pub struct StateStore {
    storage: Arc<dyn Storage>,
    build_folder: String,
}

fn join(base: &str, parts: &[&str]) -> String {
    let mut path = Path::new(base).to_path_buf();
    for part in parts {
        path.push(part);
    }
    path.to_string_lossy().to_string()
}

impl StateStore {
    pub fn new(storage: Arc<dyn Storage>, build_folder: &str) -> Self {
        Self {
            storage,
            build_folder: build_folder.to_string(),
        }
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn status_path(&self) -> String {
        join(&self.build_folder, &[STATUS_FILE])
    }

    pub fn chapter_dir(&self, chapter_id: &str) -> String {
        join(&self.build_folder, &[chapter_id])
    }

    pub fn chunk_path(&self, chapter_id: &str, ordinal: usize) -> String {
        join(
            &self.build_folder,
            &[chapter_id, &format!("chunk_{:04}.wav", ordinal)],
        )
    }

    pub fn chapter_audio_path(&self, chapter_id: &str) -> String {
        join(&self.build_folder, &[chapter_id, CHAPTER_AUDIO])
    }

    /// Loads the persisted status, or a fresh one when none exists yet.
    pub async fn load(&self, project_id: &str) -> PipelineResult<PipelineStatus> {
        let path = self.status_path();
        if !self.storage.exists(&path).await.map_err(PipelineError::Persistence)? {
            debug!("No status at {}, starting fresh", path);
            return Ok(PipelineStatus::new(project_id));
        }

        let bytes = self
            .storage
            .read(&path)
            .await
            .map_err(PipelineError::Persistence)?;
        let status: PipelineStatus = serde_json::from_slice(&bytes)
            .with_context(|| format!("Corrupt status file {}", path))
            .map_err(PipelineError::Persistence)?;

        if status.project_id != project_id {
            warn!(
                "Status at {} belongs to project '{}', starting fresh for '{}'",
                path, status.project_id, project_id
            );
            return Ok(PipelineStatus::new(project_id));
        }
        Ok(status)
    }

    pub async fn save(&self, status: &PipelineStatus) -> PipelineResult<()> {
        let content = serde_json::to_vec_pretty(status)
            .context("Failed to serialize pipeline status")
            .map_err(PipelineError::Persistence)?;
        self.storage
            .write(&self.status_path(), &content)
            .await
            .map_err(PipelineError::Persistence)
    }

    pub async fn load_manifest(&self) -> PipelineResult<Vec<Chapter>> {
        let path = join(&self.build_folder, &[MANIFEST_FILE]);
        if !self.storage.exists(&path).await? {
            return Ok(Vec::new());
        }
        let bytes = self.storage.read(&path).await?;
        let chapters: Vec<Chapter> = serde_json::from_slice(&bytes)
            .with_context(|| format!("Corrupt chapter manifest {}", path))?;
        Ok(chapters)
    }

    pub async fn save_manifest(&self, chapters: &[Chapter]) -> PipelineResult<()> {
        let path = join(&self.build_folder, &[MANIFEST_FILE]);
        let content = serde_json::to_vec_pretty(chapters).context("Failed to serialize chapters")?;
        self.storage
            .write(&path, &content)
            .await
            .map_err(PipelineError::Persistence)
    }

    pub async fn write_chunk(
        &self,
        chapter_id: &str,
        ordinal: usize,
        audio: &AudioBuffer,
    ) -> PipelineResult<String> {
        let path = self.chunk_path(chapter_id, ordinal);
        let bytes = encode_wav(audio)?;
        self.storage
            .write(&path, &bytes)
            .await
            .map_err(PipelineError::Persistence)?;
        Ok(path)
    }

    pub async fn read_audio(&self, path: &str) -> PipelineResult<AudioBuffer> {
        let bytes = self.storage.read(path).await?;
        let audio = decode_wav(&bytes).with_context(|| format!("Failed to decode {}", path))?;
        Ok(audio)
    }

    pub async fn write_audio(&self, path: &str, audio: &AudioBuffer) -> PipelineResult<()> {
        let bytes = encode_wav(audio)?;
        self.storage
            .write(path, &bytes)
            .await
            .map_err(PipelineError::Persistence)
    }

    pub async fn exists(&self, path: &str) -> PipelineResult<bool> {
        Ok(self.storage.exists(path).await?)
    }

    /// Drops every artifact of a chapter before regenerating it from scratch.
    pub async fn clear_chapter(&self, chapter_id: &str) -> PipelineResult<()> {
        self.storage
            .delete(&self.chapter_dir(chapter_id))
            .await
            .map_err(PipelineError::Persistence)
    }
}
