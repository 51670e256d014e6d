//! Post-generation stages. Audio processing, composition, mixing and export
//! formats live outside the pipeline and plug in as [`StageHook`]s.

use crate::core::state::Node;
use crate::services::store::StateStore;
use anyhow::{Context, Result};
use async_trait::async_trait;
use log::info;
use std::path::Path;

/// A stitched chapter handed to downstream stages.
#[derive(Debug, Clone, PartialEq)]
pub struct ChapterTrack {
    pub chapter_id: String,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    Done { detail: Option<String> },
    Skipped { reason: String },
}

#[async_trait]
pub trait StageHook: Send + Sync {
    async fn run(&self, node: Node, tracks: &[ChapterTrack]) -> Result<StageOutcome>;
}

/// Copies each chapter track to `<output_folder>/<chapter>.wav`.
pub struct WavExport {
    store: StateStore,
    output_folder: String,
}

impl WavExport {
    pub fn new(store: StateStore, output_folder: &str) -> Self {
        Self {
            store,
            output_folder: output_folder.to_string(),
        }
    }

    pub fn target(&self, chapter_id: &str) -> String {
        Path::new(&self.output_folder)
            .join(format!("{}.wav", chapter_id))
            .to_string_lossy()
            .to_string()
    }
}

#[async_trait]
impl StageHook for WavExport {
    async fn run(&self, _node: Node, tracks: &[ChapterTrack]) -> Result<StageOutcome> {
        let storage = self.store.storage();
        for track in tracks {
            let target = self.target(&track.chapter_id);
            let bytes = storage
                .read(&track.path)
                .await
                .with_context(|| format!("Missing chapter track {}", track.path))?;
            storage.write(&target, &bytes).await?;
            info!("Exported {} -> {}", track.chapter_id, target);
        }
        Ok(StageOutcome::Done {
            detail: Some(format!("{} chapters exported to {}", tracks.len(), self.output_folder)),
        })
    }
}
