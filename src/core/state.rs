use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

// --- Text model ---

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Single,
    #[default]
    Multi,
}

/// Opaque direction strings passed through to engines untouched.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct DirectionHints {
    pub pace: Option<String>,
    pub energy: Option<String>,
    pub emotion: Option<String>,
}

impl DirectionHints {
    pub fn to_params(&self) -> Vec<(String, String)> {
        [
            ("pace", &self.pace),
            ("energy", &self.energy),
            ("emotion", &self.emotion),
        ]
        .into_iter()
        .filter_map(|(k, v)| v.as_ref().map(|v| (k.to_string(), v.clone())))
        .collect()
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Chapter {
    pub id: String,
    pub title: String,
    pub language: String,
    pub text: String,
    pub mode: Mode,
    pub default_character: String,
    /// Chapter-level engine used when a character does not name one.
    pub engine: Option<String>,
    #[serde(default)]
    pub direction: DirectionHints,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct CharacterMap {
    pub characters: HashMap<String, CharacterInfo>,
}

impl CharacterMap {
    pub fn contains(&self, name: &str) -> bool {
        self.characters.contains_key(name)
    }
}

#[derive(Serialize, Deserialize, Default, Clone, Debug, PartialEq)]
pub struct CharacterInfo {
    pub engine: Option<String>,
    pub voice_id: Option<String>,
    pub description: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Segment {
    pub index: usize,
    pub character: String,
    pub text: String,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Script {
    Arabic,
    Latin,
    Neutral,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Chunk {
    pub segment_index: usize,
    pub ordinal: usize,
    pub text: String,
    /// Dominant script of the chunk text.
    pub script: Script,
    pub character: String,
    pub engine: String,
    pub voice: Option<String>,
}

// --- Generation progress ---

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    TransientFailure,
    FatalFailure,
}

/// One engine call for one chunk. Append-only.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct GenerationAttempt {
    pub chunk_id: String,
    pub engine_id: String,
    pub attempt: usize,
    pub outcome: AttemptOutcome,
    pub audio: Option<String>,
    pub error: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChunkState {
    #[default]
    Pending,
    Succeeded,
    /// Every engine in the chain was exhausted.
    Failed,
    /// Malformed input; recorded as a failure but does not block the chapter.
    Skipped,
}

impl ChunkState {
    pub fn is_settled(self) -> bool {
        matches!(self, ChunkState::Succeeded | ChunkState::Skipped)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct ChunkStatus {
    pub ordinal: usize,
    pub character: String,
    /// Character count of the chunk text, used for expected-duration checks.
    pub chars: usize,
    pub state: ChunkState,
    pub engine: Option<String>,
    #[serde(default)]
    pub attempts: Vec<GenerationAttempt>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChapterStatus {
    #[default]
    Pending,
    Partial,
    Complete,
    Failed,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct ChapterGenerationState {
    pub chapter_id: String,
    pub status: ChapterStatus,
    #[serde(default)]
    pub chunks: Vec<ChunkStatus>,
    #[serde(default)]
    pub engines_used: BTreeSet<String>,
    pub last_completed_chunk: Option<usize>,
    pub last_error: Option<String>,
}

impl ChapterGenerationState {
    pub fn new(chapter_id: &str) -> Self {
        Self {
            chapter_id: chapter_id.to_string(),
            ..Default::default()
        }
    }

    /// Number of leading chunks that are trusted on resume.
    pub fn chunks_done(&self) -> usize {
        self.last_completed_chunk.map(|o| o + 1).unwrap_or(0)
    }

    pub fn reset(&mut self) {
        *self = Self::new(&self.chapter_id);
    }

    /// Pushes the watermark forward over every contiguous settled chunk.
    pub fn advance_watermark(&mut self) {
        let mut next = self.chunks_done();
        while next < self.chunks.len() && self.chunks[next].state.is_settled() {
            self.last_completed_chunk = Some(next);
            next += 1;
        }
    }
}

// --- Pipeline status ---

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Node {
    Bootstrap,
    Ingest,
    Validate,
    Generate,
    QualityScan,
    Process,
    Compose,
    Mix,
    QualityFinal,
    Export,
}

impl Node {
    pub const ALL: [Node; 10] = [
        Node::Bootstrap,
        Node::Ingest,
        Node::Validate,
        Node::Generate,
        Node::QualityScan,
        Node::Process,
        Node::Compose,
        Node::Mix,
        Node::QualityFinal,
        Node::Export,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Node::Bootstrap => "bootstrap",
            Node::Ingest => "ingest",
            Node::Validate => "validate",
            Node::Generate => "generate",
            Node::QualityScan => "quality_scan",
            Node::Process => "process",
            Node::Compose => "compose",
            Node::Mix => "mix",
            Node::QualityFinal => "quality_final",
            Node::Export => "export",
        }
    }

    /// Needs an explicit pass verdict before anything after it may start.
    pub fn is_hard_gate(self) -> bool {
        matches!(self, Node::Validate | Node::QualityFinal)
    }

    pub fn is_optional(self) -> bool {
        matches!(self, Node::Compose)
    }

    pub fn position(self) -> usize {
        Node::ALL.iter().position(|n| *n == self).unwrap_or(0)
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    #[default]
    Pending,
    Running,
    Partial,
    Complete,
    Failed,
    Skipped,
}

impl NodeStatus {
    pub fn is_finished(self) -> bool {
        matches!(self, NodeStatus::Complete | NodeStatus::Skipped)
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GateVerdict {
    Pass,
    Fail,
    /// Automatic checks passed, waiting for an explicit approval.
    AwaitingApproval,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct NodeState {
    pub status: NodeStatus,
    pub updated_at: Option<DateTime<Utc>>,
    pub verdict: Option<GateVerdict>,
    pub detail: Option<String>,
    /// Generate node sub-state, keyed by chapter id.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub chapters: BTreeMap<String, ChapterGenerationState>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PipelineStatus {
    pub project_id: String,
    pub nodes: BTreeMap<Node, NodeState>,
}

impl PipelineStatus {
    pub fn new(project_id: &str) -> Self {
        Self {
            project_id: project_id.to_string(),
            nodes: Node::ALL
                .iter()
                .map(|n| (*n, NodeState::default()))
                .collect(),
        }
    }

    pub fn node(&self, node: Node) -> &NodeState {
        static EMPTY: std::sync::OnceLock<NodeState> = std::sync::OnceLock::new();
        self.nodes
            .get(&node)
            .unwrap_or_else(|| EMPTY.get_or_init(NodeState::default))
    }

    pub fn node_mut(&mut self, node: Node) -> &mut NodeState {
        self.nodes.entry(node).or_default()
    }

    pub fn set_status(&mut self, node: Node, status: NodeStatus, detail: Option<String>) {
        let state = self.node_mut(node);
        state.status = status;
        state.detail = detail;
        state.updated_at = Some(Utc::now());
    }

    pub fn chapter_state(&self, chapter_id: &str) -> Option<&ChapterGenerationState> {
        self.node(Node::Generate).chapters.get(chapter_id)
    }

    pub fn put_chapter_state(&mut self, state: ChapterGenerationState) {
        let node = self.node_mut(Node::Generate);
        node.updated_at = Some(Utc::now());
        node.chapters.insert(state.chapter_id.clone(), state);
    }
}
