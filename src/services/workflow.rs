use crate::core::config::Config;
use crate::core::error::{PipelineError, PipelineResult};
use crate::core::io::Storage;
use crate::core::state::{
    Chapter, ChapterGenerationState, ChapterStatus, CharacterMap, ChunkState, GateVerdict, Node,
    NodeStatus, PipelineStatus,
};
use crate::services::engine::registry::{EngineRegistry, FallbackPolicy};
use crate::services::executor::CancelFlag;
use crate::services::generation::{plan_chapter, ChapterGenerator, Checkpoint};
use crate::services::quality::{
    evaluate_chapter_batch, evaluate_chunk, BasicMetrics, BatchDecision, MetricsProvider, Verdict,
};
use crate::services::stages::{ChapterTrack, StageHook, StageOutcome, WavExport};
use crate::services::store::StateStore;
use async_trait::async_trait;
use chrono::Utc;
use log::{error, info, warn};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    /// A hard gate passed its automatic checks and needs an explicit approval.
    AwaitingApproval(Node),
}

struct NodeResult {
    status: NodeStatus,
    verdict: Option<GateVerdict>,
    detail: Option<String>,
}

impl NodeResult {
    fn complete(detail: impl Into<String>) -> Self {
        Self {
            status: NodeStatus::Complete,
            verdict: None,
            detail: Some(detail.into()),
        }
    }
}

/// Writes chapter progress into the pipeline status and persists it.
struct StatusCheckpoint<'a> {
    status: &'a mut PipelineStatus,
    store: &'a StateStore,
}

#[async_trait]
impl<'a> Checkpoint for StatusCheckpoint<'a> {
    async fn save(&mut self, state: &ChapterGenerationState) -> PipelineResult<()> {
        self.status.put_chapter_state(state.clone());
        self.store.save(self.status).await
    }
}

/// Drives a project through every pipeline node, persisting status on each transition.
pub struct WorkflowManager {
    config: Config,
    store: StateStore,
    registry: EngineRegistry,
    policy: FallbackPolicy,
    metrics: Box<dyn MetricsProvider>,
    hooks: HashMap<Node, Arc<dyn StageHook>>,
    status: PipelineStatus,
    chapters: Vec<Chapter>,
    cancel: CancelFlag,
}

impl WorkflowManager {
    pub async fn new(
        config: Config,
        registry: EngineRegistry,
        storage: Arc<dyn Storage>,
    ) -> PipelineResult<Self> {
        let store = StateStore::new(storage, &config.build_folder);
        let status = store.load(&config.project_id).await?;
        let chapters = store.load_manifest().await?;
        let policy = FallbackPolicy::new(config.generation.fallback_scope);

        Ok(Self {
            config,
            store,
            registry,
            policy,
            metrics: Box::new(BasicMetrics),
            hooks: HashMap::new(),
            status,
            chapters,
            cancel: CancelFlag::new(),
        })
    }

    pub fn with_hook(mut self, node: Node, hook: Arc<dyn StageHook>) -> Self {
        self.hooks.insert(node, hook);
        self
    }

    pub fn with_metrics(mut self, metrics: Box<dyn MetricsProvider>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Raising this flag stops generation before the next engine call.
    pub fn cancel_handle(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub fn status(&self) -> &PipelineStatus {
        &self.status
    }

    pub fn chapters(&self) -> &[Chapter] {
        &self.chapters
    }

    fn characters(&self) -> CharacterMap {
        CharacterMap {
            characters: self.config.characters.clone(),
        }
    }

    async fn persist(&self) -> PipelineResult<()> {
        self.store.save(&self.status).await
    }

    /// Runs every unfinished node in order.
    ///
    /// Stops at a hard gate that waits for approval. A gate with a failing
    /// verdict is surfaced as [`PipelineError::GateRejected`].
    pub async fn run(&mut self) -> PipelineResult<RunOutcome> {
        for node in Node::ALL {
            let state = self.status.node(node);
            if node.is_hard_gate() {
                match state.verdict {
                    Some(GateVerdict::Pass) if state.status.is_finished() => continue,
                    Some(GateVerdict::AwaitingApproval) => {
                        return Ok(RunOutcome::AwaitingApproval(node))
                    }
                    Some(GateVerdict::Fail) => {
                        return Err(PipelineError::GateRejected {
                            node: node.label().to_string(),
                            reason: state.detail.clone().unwrap_or_else(|| "rejected".to_string()),
                        })
                    }
                    _ => {}
                }
            } else if state.status.is_finished() {
                continue;
            }

            self.run_node(node).await?;

            if self.status.node(node).verdict == Some(GateVerdict::AwaitingApproval) {
                info!("Gate {} is waiting for approval", node);
                return Ok(RunOutcome::AwaitingApproval(node));
            }
        }

        info!("Project {} complete", self.config.project_id);
        Ok(RunOutcome::Completed)
    }

    fn blocked_by(&self, node: Node) -> Option<Node> {
        Node::ALL[..node.position()].iter().copied().find(|n| {
            let state = self.status.node(*n);
            !state.status.is_finished()
                || (n.is_hard_gate() && state.verdict != Some(GateVerdict::Pass))
        })
    }

    /// Runs a single node. Every earlier node must be finished and every
    /// earlier hard gate must have passed.
    pub async fn run_node(&mut self, node: Node) -> PipelineResult<()> {
        if let Some(blocker) = self.blocked_by(node) {
            return Err(PipelineError::OutOfOrder {
                node: node.label().to_string(),
                blocked_by: blocker.label().to_string(),
            });
        }

        info!("Starting node {}", node);
        self.status.set_status(node, NodeStatus::Running, None);
        self.status.node_mut(node).verdict = None;
        self.persist().await?;

        let result = match node {
            Node::Bootstrap => self.bootstrap().await,
            Node::Ingest => self.ingest().await,
            Node::Validate => self.validate().await,
            Node::Generate => self.generate().await,
            Node::QualityScan => self.quality_scan().await,
            Node::Process | Node::Compose | Node::Mix | Node::Export => self.stage(node).await,
            Node::QualityFinal => self.quality_final().await,
        };

        match result {
            Ok(outcome) => {
                let state = self.status.node_mut(node);
                state.status = outcome.status;
                state.verdict = outcome.verdict;
                state.detail = outcome.detail;
                state.updated_at = Some(Utc::now());
                self.persist().await?;
                info!(
                    "Node {} -> {:?}{}",
                    node,
                    outcome.status,
                    outcome
                        .verdict
                        .map(|v| format!(" ({:?})", v))
                        .unwrap_or_default()
                );
                Ok(())
            }
            Err(e) => {
                let status = match e {
                    PipelineError::Cancelled => NodeStatus::Partial,
                    _ => NodeStatus::Failed,
                };
                self.status.set_status(node, status, Some(e.to_string()));
                if matches!(
                    e,
                    PipelineError::GateRejected { .. } | PipelineError::AutoGateHalt { .. }
                ) {
                    self.status.node_mut(node).verdict = Some(GateVerdict::Fail);
                }
                error!("Node {} failed: {}", node, e);
                self.persist().await?;
                Err(e)
            }
        }
    }

    /// Records an explicit pass for a hard gate waiting on approval.
    pub async fn approve_gate(&mut self, node: Node) -> PipelineResult<()> {
        let state = self.status.node(node);
        if !node.is_hard_gate() || state.verdict != Some(GateVerdict::AwaitingApproval) {
            return Err(PipelineError::Config(format!(
                "Node {} is not waiting for approval",
                node
            )));
        }
        let state = self.status.node_mut(node);
        state.verdict = Some(GateVerdict::Pass);
        state.status = NodeStatus::Complete;
        state.updated_at = Some(Utc::now());
        info!("Gate {} approved", node);
        self.persist().await
    }

    pub async fn reject_gate(&mut self, node: Node, reason: &str) -> PipelineResult<()> {
        if !node.is_hard_gate() {
            return Err(PipelineError::Config(format!("Node {} is not a hard gate", node)));
        }
        self.status
            .set_status(node, NodeStatus::Failed, Some(reason.to_string()));
        self.status.node_mut(node).verdict = Some(GateVerdict::Fail);
        warn!("Gate {} rejected: {}", node, reason);
        self.persist().await
    }

    /// Sends `node` and everything after it back to pending. Chapter
    /// generation progress is kept.
    pub async fn reopen(&mut self, node: Node) -> PipelineResult<()> {
        for n in &Node::ALL[node.position()..] {
            let state = self.status.node_mut(*n);
            state.status = NodeStatus::Pending;
            state.verdict = None;
            state.detail = None;
            state.updated_at = Some(Utc::now());
        }
        info!("Reopened pipeline from {}", node);
        self.persist().await
    }

    /// Replaces an ingested chapter. Its generated audio is discarded and the
    /// pipeline goes back to validation.
    pub async fn update_chapter(&mut self, chapter: Chapter) -> PipelineResult<()> {
        let id = chapter.id.clone();
        match self.chapters.iter_mut().find(|c| c.id == id) {
            Some(existing) => *existing = chapter,
            None => self.chapters.push(chapter),
        }
        self.store.save_manifest(&self.chapters).await?;

        self.status.node_mut(Node::Generate).chapters.remove(&id);
        self.store.clear_chapter(&id).await?;
        info!("Chapter {} updated, generation state reset", id);
        self.reopen(Node::Validate).await
    }

    // --- Nodes ---

    async fn bootstrap(&mut self) -> PipelineResult<NodeResult> {
        self.config.validate()?;
        self.config.ensure_directories()?;

        let mut wanted: BTreeSet<&str> = BTreeSet::new();
        wanted.extend(self.config.generation.default_engine.as_deref());
        wanted.extend(self.config.generation.engine_override.as_deref());
        wanted.extend(self.config.generation.fallback_chain.iter().map(String::as_str));
        wanted.extend(self.config.characters.values().filter_map(|c| c.engine.as_deref()));
        for id in wanted {
            self.registry.get(id)?;
        }

        Ok(NodeResult::complete(format!(
            "{} engines registered",
            self.registry.ids().len()
        )))
    }

    async fn ingest(&mut self) -> PipelineResult<NodeResult> {
        let storage = self.store.storage().clone();
        let mut entries: Vec<String> = storage
            .list(&self.config.input_folder)
            .await?
            .into_iter()
            .filter(|e| e.ends_with(".txt"))
            .collect();
        entries.sort();

        let mut added = 0;
        for path in &entries {
            let Some(id) = Path::new(path).file_stem().map(|s| s.to_string_lossy().to_string())
            else {
                continue;
            };
            if self.chapters.iter().any(|c| c.id == id) {
                continue;
            }

            let bytes = storage.read(path).await?;
            let text = String::from_utf8(bytes)
                .map_err(|e| PipelineError::Config(format!("{} is not UTF-8: {}", path, e)))?;
            let overrides = self.config.chapters.get(&id).cloned().unwrap_or_default();

            self.chapters.push(Chapter {
                title: overrides.title.unwrap_or_else(|| id.clone()),
                language: overrides.language.unwrap_or_else(|| self.config.language.clone()),
                mode: overrides.mode.unwrap_or(self.config.mode),
                default_character: overrides
                    .default_character
                    .unwrap_or_else(|| self.config.default_character.clone()),
                engine: overrides.engine,
                direction: overrides.direction,
                id,
                text,
            });
            added += 1;
        }

        if self.chapters.is_empty() {
            return Err(PipelineError::Config(format!(
                "No .txt chapters found in {}",
                self.config.input_folder
            )));
        }

        self.chapters.sort_by(|a, b| a.id.cmp(&b.id));
        self.store.save_manifest(&self.chapters).await?;
        Ok(NodeResult::complete(format!(
            "{} chapters ({} new)",
            self.chapters.len(),
            added
        )))
    }

    fn gate_verdict(&self, detail: String) -> NodeResult {
        if self.config.unattended {
            NodeResult {
                status: NodeStatus::Complete,
                verdict: Some(GateVerdict::Pass),
                detail: Some(detail),
            }
        } else {
            NodeResult {
                status: NodeStatus::Partial,
                verdict: Some(GateVerdict::AwaitingApproval),
                detail: Some(detail),
            }
        }
    }

    async fn validate(&mut self) -> PipelineResult<NodeResult> {
        let characters = self.characters();
        let mut problems = Vec::new();
        let mut engines = BTreeSet::new();
        let mut total_chunks = 0;

        for chapter in &self.chapters {
            match plan_chapter(chapter, &characters, &self.registry, &self.config) {
                Ok(chunks) if chunks.is_empty() => {
                    problems.push(format!("{}: no speakable text", chapter.id));
                }
                Ok(chunks) => {
                    total_chunks += chunks.len();
                    engines.extend(chunks.into_iter().map(|c| c.engine));
                }
                Err(e) => problems.push(format!("{}: {}", chapter.id, e)),
            }
        }

        if !problems.is_empty() {
            return Err(PipelineError::GateRejected {
                node: Node::Validate.label().to_string(),
                reason: problems.join("; "),
            });
        }

        for id in &engines {
            if !self.registry.get(id)?.available().await {
                warn!("Engine '{}' is not reachable, fallbacks will be used", id);
            }
        }

        Ok(self.gate_verdict(format!(
            "{} chapters, {} chunks, engines: {}",
            self.chapters.len(),
            total_chunks,
            engines.into_iter().collect::<Vec<_>>().join(", ")
        )))
    }

    async fn generate(&mut self) -> PipelineResult<NodeResult> {
        let characters = self.characters();
        let chapters = self.chapters.clone();
        let mut generated = 0;

        for chapter in &chapters {
            let mut state = self
                .status
                .chapter_state(&chapter.id)
                .cloned()
                .unwrap_or_else(|| ChapterGenerationState::new(&chapter.id));

            if state.status == ChapterStatus::Complete {
                if self.store.exists(&self.store.chapter_audio_path(&chapter.id)).await? {
                    info!("Chapter {} already complete", chapter.id);
                    continue;
                }
                warn!("Chapter {} audio is missing, regenerating", chapter.id);
                state.reset();
            }

            let generator = ChapterGenerator::new(
                &self.registry,
                &self.store,
                &self.config,
                &self.policy,
                self.cancel.clone(),
            );
            let mut checkpoint = StatusCheckpoint {
                status: &mut self.status,
                store: &self.store,
            };
            let result = generator
                .generate(chapter, &characters, &mut state, &mut checkpoint)
                .await;

            // Exclusive engines are released once per chapter, failed chapters included.
            let exclusive: Vec<String> = match &result {
                Ok(output) => output.exclusive_engines.clone(),
                Err(_) => state
                    .engines_used
                    .iter()
                    .filter(|id| self.registry.is_exclusive(id))
                    .cloned()
                    .collect(),
            };
            for id in &exclusive {
                if let Err(e) = self.registry.release(id).await {
                    warn!("Failed to release engine '{}': {}", id, e);
                }
            }

            let output = result?;
            info!("Chapter {} done: {}", chapter.id, output.audio_path);
            generated += 1;
        }

        Ok(NodeResult::complete(format!(
            "{} chapters generated, {} total",
            generated,
            chapters.len()
        )))
    }

    async fn quality_scan(&mut self) -> PipelineResult<NodeResult> {
        let thresholds = &self.config.quality;
        let mut verdicts = Vec::new();
        let mut failing = Vec::new();
        let mut warned = 0;

        for chapter in &self.chapters {
            let Some(state) = self.status.chapter_state(&chapter.id) else {
                continue;
            };
            for chunk in &state.chunks {
                let id = format!("{}:{}", chapter.id, chunk.ordinal);
                if chunk.state != ChunkState::Succeeded {
                    verdicts.push(Verdict::Fail);
                    failing.push(format!("{} ({:?})", id, chunk.state));
                    continue;
                }

                let audio = self
                    .store
                    .read_audio(&self.store.chunk_path(&chapter.id, chunk.ordinal))
                    .await?;
                let metrics = self.metrics.measure(&audio);
                let expected = (thresholds.chars_per_second > 0.0)
                    .then(|| chunk.chars as f64 / thresholds.chars_per_second);
                let verdict = evaluate_chunk(&metrics, expected, thresholds);

                match verdict.verdict {
                    Verdict::Fail => {
                        failing.push(format!("{} ({})", id, verdict.violations.join(", ")))
                    }
                    Verdict::Warn => warned += 1,
                    Verdict::Pass => {}
                }
                verdicts.push(verdict.verdict);
            }
        }

        match evaluate_chapter_batch(&verdicts, thresholds.fail_threshold_percent) {
            BatchDecision::Halt {
                failed,
                total,
                failure_rate,
            } => Err(PipelineError::AutoGateHalt {
                failed,
                total,
                failure_rate,
                threshold: thresholds.fail_threshold_percent,
                failing,
            }),
            BatchDecision::Proceed => {
                if !failing.is_empty() {
                    warn!("Quality scan passed with failing chunks: {}", failing.join("; "));
                }
                Ok(NodeResult {
                    status: NodeStatus::Complete,
                    verdict: Some(GateVerdict::Pass),
                    detail: Some(format!(
                        "{} chunks, {} failed, {} warned",
                        verdicts.len(),
                        failing.len(),
                        warned
                    )),
                })
            }
        }
    }

    fn tracks(&self) -> Vec<ChapterTrack> {
        self.chapters
            .iter()
            .map(|c| ChapterTrack {
                chapter_id: c.id.clone(),
                path: self.store.chapter_audio_path(&c.id),
            })
            .collect()
    }

    async fn stage(&mut self, node: Node) -> PipelineResult<NodeResult> {
        let tracks = self.tracks();
        let hook: Arc<dyn StageHook> = match self.hooks.get(&node) {
            Some(hook) => hook.clone(),
            None => match node {
                Node::Export => Arc::new(WavExport::new(
                    self.store.clone(),
                    &self.config.output_folder,
                )),
                Node::Compose => {
                    return Ok(NodeResult {
                        status: NodeStatus::Skipped,
                        verdict: None,
                        detail: Some("no composer configured".to_string()),
                    })
                }
                _ => return Ok(NodeResult::complete("pass-through")),
            },
        };

        match hook.run(node, &tracks).await? {
            StageOutcome::Done { detail } => Ok(NodeResult {
                status: NodeStatus::Complete,
                verdict: None,
                detail,
            }),
            StageOutcome::Skipped { reason } => Ok(NodeResult {
                status: NodeStatus::Skipped,
                verdict: None,
                detail: Some(reason),
            }),
        }
    }

    async fn quality_final(&mut self) -> PipelineResult<NodeResult> {
        let thresholds = &self.config.quality;
        let mut problems = Vec::new();

        for track in self.tracks() {
            let audio = self.store.read_audio(&track.path).await?;
            let metrics = self.metrics.measure(&audio);
            if metrics.peak_dbfs > thresholds.max_peak_dbfs {
                problems.push(format!(
                    "{}: peak {:.1} dBFS above {:.1}",
                    track.chapter_id, metrics.peak_dbfs, thresholds.max_peak_dbfs
                ));
            }
            let off = (metrics.lufs - thresholds.target_lufs).abs();
            if off > thresholds.lufs_fail_tolerance {
                problems.push(format!(
                    "{}: loudness {:.1} LUFS is {:.1} from target",
                    track.chapter_id, metrics.lufs, off
                ));
            }
        }

        if !problems.is_empty() {
            return Err(PipelineError::GateRejected {
                node: Node::QualityFinal.label().to_string(),
                reason: problems.join("; "),
            });
        }
        Ok(self.gate_verdict(format!("{} chapter tracks checked", self.chapters.len())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::EngineError;
    use crate::core::io::NativeStorage;
    use crate::services::engine::mock::{speech_like, ScriptedBackend};
    use crate::utils::audio::AudioBuffer;
    use anyhow::Result;
    use std::fs;

    struct Project {
        _dir: tempfile::TempDir,
        config: Config,
        input: std::path::PathBuf,
        output: std::path::PathBuf,
        build: std::path::PathBuf,
    }

    fn project(unattended: bool, extra: &str) -> Project {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input");
        let output = dir.path().join("output");
        let build = dir.path().join("build");
        fs::create_dir_all(&input).unwrap();

        let yaml = format!(
            r#"
project_id: desert-tales
input_folder: "{}"
output_folder: "{}"
build_folder: "{}"
unattended: {}
language: en
characters:
  narrator: {{ voice_id: layla }}
  hero: {{ engine: local_x, voice_id: sami }}
generation:
  default_engine: cloud_a
  fallback_chain: [cloud_a, cloud_b]
  max_chars: 60
  max_retries_per_chunk: 2
stitching:
  crossfade_ms: 10
  crossfade_min_ms: 5
engines:
  - {{ kind: http, id: cloud_a, base_url: "http://127.0.0.1:1" }}
  - {{ kind: http, id: cloud_b, base_url: "http://127.0.0.1:2" }}
  - {{ kind: http, id: local_x, base_url: "http://127.0.0.1:3", capabilities: {{ resource_exclusive: true }} }}
{}
"#,
            input.display(),
            output.display(),
            build.display(),
            unattended,
            extra
        );
        let config: Config = serde_yaml_ng::from_str(&yaml).unwrap();
        Project {
            _dir: dir,
            config,
            input,
            output,
            build,
        }
    }

    const CHAPTER_ONE: &str = "The night was long and the road was longer.\n\n\
        [hero] I will carry the lantern myself.\n\n\
        The guide shrugged and walked ahead of them.\n\n\
        [hero] Then wait for me at the old well.\n\n\
        Nobody answered him before the dawn came.";

    const CHAPTER_TWO: &str = "Morning found them at the well.\n\nThe water was cold and sweet.";

    struct Engines {
        cloud_a: Arc<ScriptedBackend>,
        cloud_b: Arc<ScriptedBackend>,
        local_x: Arc<ScriptedBackend>,
    }

    fn engines(cloud_a: ScriptedBackend) -> Engines {
        Engines {
            cloud_a: Arc::new(cloud_a),
            cloud_b: Arc::new(ScriptedBackend::new("cloud_b")),
            local_x: Arc::new(ScriptedBackend::exclusive("local_x")),
        }
    }

    fn registry(config: &Config, e: &Engines) -> EngineRegistry {
        let mut registry = EngineRegistry::new(
            config.generation.default_engine.clone(),
            config.generation.engine_override.clone(),
            config.generation.fallback_chain.clone(),
        );
        registry.register(e.cloud_a.clone(), None);
        registry.register(e.cloud_b.clone(), None);
        registry.register(e.local_x.clone(), None);
        registry
    }

    async fn manager(p: &Project, e: &Engines) -> Result<WorkflowManager> {
        let storage = Arc::new(NativeStorage::new());
        Ok(WorkflowManager::new(p.config.clone(), registry(&p.config, e), storage).await?)
    }

    fn write_chapters(p: &Project) {
        fs::write(p.input.join("ch01.txt"), CHAPTER_ONE).unwrap();
        fs::write(p.input.join("ch02.txt"), CHAPTER_TWO).unwrap();
    }

    #[tokio::test]
    async fn test_unattended_run_exports_every_chapter() -> Result<()> {
        let p = project(true, "");
        write_chapters(&p);
        let e = engines(ScriptedBackend::new("cloud_a"));
        let mut wf = manager(&p, &e).await?;

        assert_eq!(wf.run().await?, RunOutcome::Completed);

        assert!(p.output.join("ch01.wav").exists());
        assert!(p.output.join("ch02.wav").exists());
        for node in Node::ALL {
            let expected = if node == Node::Compose {
                NodeStatus::Skipped
            } else {
                NodeStatus::Complete
            };
            assert_eq!(wf.status().node(node).status, expected, "node {}", node);
        }

        // Status on disk matches memory.
        let on_disk: PipelineStatus =
            serde_json::from_slice(&fs::read(p.build.join("pipeline_status.json"))?)?;
        assert_eq!(on_disk.node(Node::Export).status, NodeStatus::Complete);
        assert_eq!(on_disk.chapter_state("ch01").unwrap().status, ChapterStatus::Complete);
        Ok(())
    }

    #[tokio::test]
    async fn test_exclusive_engine_released_once_per_chapter() -> Result<()> {
        let p = project(true, "");
        fs::write(p.input.join("ch01.txt"), CHAPTER_ONE)?;
        let e = engines(ScriptedBackend::new("cloud_a"));
        let mut wf = manager(&p, &e).await?;

        wf.run().await?;
        // hero speaks 2 of the 5 chunks on local_x.
        assert_eq!(e.local_x.calls(), 2);
        assert_eq!(e.local_x.releases(), 1);
        assert_eq!(e.cloud_a.releases(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_hard_gates_wait_for_approval() -> Result<()> {
        let p = project(false, "");
        write_chapters(&p);
        let e = engines(ScriptedBackend::new("cloud_a"));
        let mut wf = manager(&p, &e).await?;

        assert_eq!(wf.run().await?, RunOutcome::AwaitingApproval(Node::Validate));
        assert_eq!(e.cloud_a.calls(), 0);

        let err = wf.run_node(Node::Generate).await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::OutOfOrder { ref blocked_by, .. } if blocked_by == "validate"
        ));

        wf.approve_gate(Node::Validate).await?;
        assert_eq!(wf.run().await?, RunOutcome::AwaitingApproval(Node::QualityFinal));
        assert!(!p.output.join("ch01.wav").exists());

        wf.approve_gate(Node::QualityFinal).await?;
        assert_eq!(wf.run().await?, RunOutcome::Completed);
        assert!(p.output.join("ch01.wav").exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_rejected_gate_is_surfaced() -> Result<()> {
        let p = project(false, "");
        write_chapters(&p);
        let e = engines(ScriptedBackend::new("cloud_a"));
        let mut wf = manager(&p, &e).await?;

        wf.run().await?;
        wf.reject_gate(Node::Validate, "wrong narrator voice").await?;
        match wf.run().await {
            Err(PipelineError::GateRejected { node, reason }) => {
                assert_eq!(node, "validate");
                assert_eq!(reason, "wrong narrator voice");
            }
            other => panic!("unexpected: {:?}", other.map_err(|e| e.to_string())),
        }
        assert!(wf.approve_gate(Node::Validate).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_strict_unknown_speaker_fails_validation() -> Result<()> {
        let p = project(true, "strict_speakers: true");
        fs::write(p.input.join("ch01.txt"), "Calm night.\n[stranger] Who is there?")?;
        let e = engines(ScriptedBackend::new("cloud_a"));
        let mut wf = manager(&p, &e).await?;

        let err = wf.run().await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::GateRejected { ref reason, .. } if reason.contains("stranger")
        ));
        assert_eq!(wf.status().node(Node::Validate).verdict, Some(GateVerdict::Fail));
        assert_eq!(wf.status().node(Node::Generate).status, NodeStatus::Pending);
        Ok(())
    }

    #[tokio::test]
    async fn test_auto_gate_halts_on_clipped_audio() -> Result<()> {
        let p = project(true, "");
        fs::write(p.input.join("ch01.txt"), CHAPTER_ONE)?;
        let clipped = AudioBuffer::new(16000, 1, vec![1.0; 16000]);
        let e = engines(
            ScriptedBackend::new("cloud_a")
                .then(Ok(clipped.clone()))
                .then(Ok(clipped)),
        );
        let mut wf = manager(&p, &e).await?;

        match wf.run().await {
            Err(PipelineError::AutoGateHalt {
                failed,
                total,
                failing,
                ..
            }) => {
                assert_eq!((failed, total), (2, 5));
                assert_eq!(failing.len(), 2);
                assert!(failing[0].starts_with("ch01:"));
            }
            other => panic!("unexpected: {:?}", other.map_err(|e| e.to_string())),
        }
        assert_eq!(wf.status().node(Node::QualityScan).status, NodeStatus::Failed);
        assert_eq!(wf.status().node(Node::Process).status, NodeStatus::Pending);
        Ok(())
    }

    #[tokio::test]
    async fn test_auto_gate_tolerates_failures_at_threshold() -> Result<()> {
        // 1 clipped chunk of 5 is 20%, exactly the threshold.
        let p = project(true, "quality: { fail_threshold_percent: 20.0 }");
        fs::write(p.input.join("ch01.txt"), CHAPTER_ONE)?;
        let clipped = AudioBuffer::new(16000, 1, vec![0.999; 16000]);
        let e = engines(ScriptedBackend::new("cloud_a").then(Ok(clipped)));
        let mut wf = manager(&p, &e).await?;

        wf.run_node(Node::Bootstrap).await?;
        wf.run_node(Node::Ingest).await?;
        wf.run_node(Node::Validate).await?;
        wf.run_node(Node::Generate).await?;
        wf.run_node(Node::QualityScan).await?;
        assert_eq!(wf.status().node(Node::QualityScan).verdict, Some(GateVerdict::Pass));
        Ok(())
    }

    #[tokio::test]
    async fn test_restart_resumes_failed_chapter_only() -> Result<()> {
        let p = project(true, "");
        write_chapters(&p);

        // First process: cloud_a and cloud_b both reject everything after chapter 1.
        {
            let fatal = EngineError::Fatal("401".to_string());
            let mut e = engines(ScriptedBackend::new("cloud_a"));
            let ch1_chunks = 3; // narrator chunks on cloud_a in chapter 1
            let mut a = ScriptedBackend::new("cloud_a");
            for _ in 0..ch1_chunks {
                a = a.then(Ok(speech_like(40)));
            }
            e.cloud_a = Arc::new(a.fail_always(fatal.clone(), 10));
            e.cloud_b = Arc::new(ScriptedBackend::new("cloud_b").fail_always(fatal, 10));
            let mut wf = manager(&p, &e).await?;

            let err = wf.run().await.unwrap_err();
            assert!(matches!(
                err,
                PipelineError::ChapterFailed { ref chapter, ordinal: Some(_), .. }
                    if chapter == "ch02"
            ));
            assert_eq!(wf.status().node(Node::Generate).status, NodeStatus::Failed);
        }

        // Second process with healthy engines picks up at chapter 2.
        let e = engines(ScriptedBackend::new("cloud_a"));
        let mut wf = manager(&p, &e).await?;
        assert_eq!(wf.run().await?, RunOutcome::Completed);
        assert_eq!(e.local_x.calls(), 0, "chapter 1 must not be regenerated");
        assert_eq!(e.cloud_a.calls(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_chapter_audio_is_regenerated() -> Result<()> {
        let p = project(true, "");
        write_chapters(&p);
        let e = engines(ScriptedBackend::new("cloud_a"));
        let mut wf = manager(&p, &e).await?;
        wf.run().await?;
        let calls = e.cloud_a.calls();

        fs::remove_file(p.build.join("ch02").join("chapter.wav"))?;
        wf.reopen(Node::Generate).await?;
        wf.run().await?;

        assert_eq!(e.cloud_a.calls(), calls + 2);
        assert_eq!(e.local_x.calls(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_ingest_keeps_chapters_immutable_and_update_resets() -> Result<()> {
        let p = project(true, "");
        write_chapters(&p);
        let e = engines(ScriptedBackend::new("cloud_a"));
        let mut wf = manager(&p, &e).await?;
        wf.run().await?;

        fs::write(p.input.join("ch02.txt"), "Edited behind our back.")?;
        wf.reopen(Node::Ingest).await?;
        wf.run().await?;
        let ch2 = wf.chapters().iter().find(|c| c.id == "ch02").unwrap().clone();
        assert_eq!(ch2.text, CHAPTER_TWO);

        let mut edited = ch2;
        edited.text = "A brand new ending.".to_string();
        wf.update_chapter(edited).await?;
        assert!(wf.status().chapter_state("ch02").is_none());
        assert!(wf.status().chapter_state("ch01").is_some());
        assert_eq!(wf.status().node(Node::Validate).status, NodeStatus::Pending);

        let before = e.cloud_a.calls();
        wf.run().await?;
        assert_eq!(e.cloud_a.calls(), before + 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_cancel_leaves_generate_partial() -> Result<()> {
        let p = project(true, "");
        write_chapters(&p);
        let e = engines(ScriptedBackend::new("cloud_a"));
        let mut wf = manager(&p, &e).await?;
        wf.run_node(Node::Bootstrap).await?;
        wf.run_node(Node::Ingest).await?;
        wf.run_node(Node::Validate).await?;

        wf.cancel_handle().cancel();
        let err = wf.run_node(Node::Generate).await.unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled));
        assert_eq!(wf.status().node(Node::Generate).status, NodeStatus::Partial);
        Ok(())
    }

    /// Storage whose status writes always fail.
    struct BrokenStatusStorage(NativeStorage);

    #[async_trait]
    impl Storage for BrokenStatusStorage {
        async fn read(&self, path: &str) -> Result<Vec<u8>> {
            self.0.read(path).await
        }
        async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
            if path.ends_with("pipeline_status.json") {
                anyhow::bail!("disk full");
            }
            self.0.write(path, content).await
        }
        async fn delete(&self, path: &str) -> Result<()> {
            self.0.delete(path).await
        }
        async fn exists(&self, path: &str) -> Result<bool> {
            self.0.exists(path).await
        }
        async fn list(&self, prefix: &str) -> Result<Vec<String>> {
            self.0.list(prefix).await
        }
    }

    #[tokio::test]
    async fn test_persistence_failure_stops_the_run() -> Result<()> {
        let p = project(true, "");
        write_chapters(&p);
        let e = engines(ScriptedBackend::new("cloud_a"));
        let mut wf = WorkflowManager::new(
            p.config.clone(),
            registry(&p.config, &e),
            Arc::new(BrokenStatusStorage(NativeStorage::new())),
        )
        .await?;

        let err = wf.run().await.unwrap_err();
        assert!(matches!(err, PipelineError::Persistence(_)));
        assert_eq!(e.cloud_a.calls(), 0);
        Ok(())
    }
}
