use thiserror::Error;

/// Failure reported by a speech backend for a single synthesis call.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    /// Network fault, rate limit, timeout. Same engine may be retried.
    #[error("transient engine failure: {0}")]
    Transient(String),

    /// Authentication, unsupported language, missing model. Advance the fallback chain.
    #[error("fatal engine failure: {0}")]
    Fatal(String),

    /// Accelerator memory or similar scarce resource exhausted.
    #[error("engine resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The engine rejected the text itself.
    #[error("invalid synthesis input: {0}")]
    InvalidInput(String),
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Unknown speaker tag '[{tag}]' on line {line}")]
    UnknownSpeaker { tag: String, line: usize },

    #[error("Unknown engine '{engine}'")]
    UnknownEngine { engine: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Chapter '{chapter}' failed{}: {reason}", fmt_ordinal(.ordinal))]
    ChapterFailed {
        chapter: String,
        ordinal: Option<usize>,
        reason: String,
    },

    #[error(
        "Quality gate halted the pipeline: {failed}/{total} chunks failed ({failure_rate:.1}% > {threshold:.1}%)"
    )]
    AutoGateHalt {
        failed: usize,
        total: usize,
        failure_rate: f64,
        threshold: f64,
        failing: Vec<String>,
    },

    #[error("Gate '{node}' rejected: {reason}")]
    GateRejected { node: String, reason: String },

    #[error("Node '{node}' cannot start before '{blocked_by}' is finished")]
    OutOfOrder { node: String, blocked_by: String },

    #[error("Failed to persist pipeline status: {0:#}")]
    Persistence(anyhow::Error),

    #[error("Generation cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

fn fmt_ordinal(ordinal: &Option<usize>) -> String {
    match ordinal {
        Some(o) => format!(" at chunk {}", o),
        None => String::new(),
    }
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chapter_failed_names_chunk() {
        let err = PipelineError::ChapterFailed {
            chapter: "ch02".to_string(),
            ordinal: Some(7),
            reason: "all engines exhausted".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Chapter 'ch02' failed at chunk 7: all engines exhausted"
        );
    }

    #[test]
    fn test_auto_gate_halt_names_threshold() {
        let err = PipelineError::AutoGateHalt {
            failed: 3,
            total: 10,
            failure_rate: 30.0,
            threshold: 20.0,
            failing: vec!["ch01:4".to_string()],
        };
        assert!(err.to_string().contains("30.0% > 20.0%"));
    }

    #[test]
    fn test_engine_error_display() {
        let err = EngineError::Transient("rate limited".to_string());
        assert_eq!(err.to_string(), "transient engine failure: rate limited");
    }
}
