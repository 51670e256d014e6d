use crate::core::config::QualityThresholds;
use crate::utils::audio::AudioBuffer;
use serde::{Deserialize, Serialize};

const SILENCE_DB: f64 = -120.0;
const FRAME_MS: u64 = 20;

/// Measurements for one chunk of audio.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetrics {
    pub snr_db: f64,
    pub peak_dbfs: f64,
    pub duration_sec: f64,
    /// Largest pitch jump across the chunk, in semitones.
    pub pitch_jump_semitones: f64,
    pub lufs: f64,
}

/// Source of chunk measurements. Real DSP lives outside the pipeline.
pub trait MetricsProvider: Send + Sync {
    fn measure(&self, audio: &AudioBuffer) -> ChunkMetrics;
}

/// Level-based estimates computed straight from the samples.
///
/// Loudness is an ungated, unweighted approximation. SNR compares loud frames
/// against the quietest ones. Pitch is not tracked and always reads 0.
#[derive(Debug, Default, Clone, Copy)]
pub struct BasicMetrics;

fn to_db(amplitude: f64) -> f64 {
    if amplitude <= 0.0 {
        SILENCE_DB
    } else {
        (20.0 * amplitude.log10()).max(SILENCE_DB)
    }
}

impl MetricsProvider for BasicMetrics {
    fn measure(&self, audio: &AudioBuffer) -> ChunkMetrics {
        let peak = audio
            .samples
            .iter()
            .fold(0.0f32, |m, s| m.max(s.abs())) as f64;

        let mean_square = if audio.samples.is_empty() {
            0.0
        } else {
            audio.samples.iter().map(|s| (*s as f64).powi(2)).sum::<f64>()
                / audio.samples.len() as f64
        };
        let lufs = if mean_square > 0.0 {
            (-0.691 + 10.0 * mean_square.log10()).max(SILENCE_DB)
        } else {
            SILENCE_DB
        };

        let frame_len = (crate::utils::audio::ms_to_frames(audio.sample_rate, FRAME_MS)
            * audio.channels as usize)
            .max(1);
        let mut frame_rms: Vec<f64> = audio
            .samples
            .chunks(frame_len)
            .map(|f| (f.iter().map(|s| (*s as f64).powi(2)).sum::<f64>() / f.len() as f64).sqrt())
            .collect();
        frame_rms.sort_by(|a, b| a.total_cmp(b));

        let snr_db = match frame_rms.len() {
            0 => 0.0,
            n => {
                let noise = frame_rms[(n - 1) / 10];
                let signal = frame_rms[(n - 1) * 9 / 10];
                if signal <= 0.0 {
                    0.0
                } else {
                    to_db(signal) - to_db(noise)
                }
            }
        };

        ChunkMetrics {
            snr_db,
            peak_dbfs: to_db(peak),
            duration_sec: audio.duration_secs(),
            pitch_jump_semitones: 0.0,
            lufs,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Warn,
    Fail,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChunkVerdict {
    pub verdict: Verdict,
    pub violations: Vec<String>,
}

/// Scores one chunk. Any hard violation fails it; soft deviations only warn.
pub fn evaluate_chunk(
    metrics: &ChunkMetrics,
    expected_duration_sec: Option<f64>,
    thresholds: &QualityThresholds,
) -> ChunkVerdict {
    let mut fails = Vec::new();
    let mut warns = Vec::new();

    if metrics.snr_db < thresholds.min_snr_db {
        fails.push(format!(
            "snr {:.1} dB below {:.1} dB",
            metrics.snr_db, thresholds.min_snr_db
        ));
    }
    if metrics.peak_dbfs > thresholds.max_peak_dbfs {
        fails.push(format!(
            "peak {:.1} dBFS above {:.1} dBFS",
            metrics.peak_dbfs, thresholds.max_peak_dbfs
        ));
    }
    if metrics.pitch_jump_semitones > thresholds.max_pitch_jump_semitones {
        fails.push(format!(
            "pitch jump {:.1} st above {:.1} st",
            metrics.pitch_jump_semitones, thresholds.max_pitch_jump_semitones
        ));
    }

    if let Some(expected) = expected_duration_sec.filter(|e| *e > 0.0) {
        let deviation = (metrics.duration_sec - expected).abs() / expected * 100.0;
        let message = format!(
            "duration {:.2}s deviates {:.0}% from expected {:.2}s",
            metrics.duration_sec, deviation, expected
        );
        if deviation > thresholds.max_duration_deviation_percent {
            fails.push(message);
        } else if deviation > thresholds.warn_duration_deviation_percent {
            warns.push(message);
        }
    }

    let loudness_off = (metrics.lufs - thresholds.target_lufs).abs();
    let message = format!(
        "loudness {:.1} LUFS is {:.1} from target {:.1}",
        metrics.lufs, loudness_off, thresholds.target_lufs
    );
    if loudness_off > thresholds.lufs_fail_tolerance {
        fails.push(message);
    } else if loudness_off > thresholds.lufs_warn_tolerance {
        warns.push(message);
    }

    let verdict = if !fails.is_empty() {
        Verdict::Fail
    } else if !warns.is_empty() {
        Verdict::Warn
    } else {
        Verdict::Pass
    };
    fails.extend(warns);

    ChunkVerdict {
        verdict,
        violations: fails,
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BatchDecision {
    Proceed,
    Halt {
        failed: usize,
        total: usize,
        failure_rate: f64,
    },
}

/// Halts when the failure rate, in percent, is strictly above the threshold.
pub fn evaluate_chapter_batch(verdicts: &[Verdict], fail_threshold_percent: f64) -> BatchDecision {
    let total = verdicts.len();
    if total == 0 {
        return BatchDecision::Proceed;
    }
    let failed = verdicts.iter().filter(|v| **v == Verdict::Fail).count();
    let failure_rate = failed as f64 * 100.0 / total as f64;

    if failure_rate > fail_threshold_percent {
        BatchDecision::Halt {
            failed,
            total,
            failure_rate,
        }
    } else {
        BatchDecision::Proceed
    }
}
