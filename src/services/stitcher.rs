use crate::core::config::StitchingConfig;
use crate::utils::audio::{ms_to_frames, AudioBuffer};
use anyhow::{anyhow, Result};
use log::debug;

/// One synthesized chunk waiting to be joined.
#[derive(Debug, Clone)]
pub struct StitchPiece {
    pub ordinal: usize,
    pub engine: String,
    pub audio: AudioBuffer,
}

/// Crossfade used at the junction leading into a chunk from `engine`.
pub fn crossfade_ms(engine: &str, config: &StitchingConfig) -> u64 {
    config
        .engine_crossfade_ms
        .get(engine)
        .copied()
        .unwrap_or(config.crossfade_ms)
        .max(config.crossfade_min_ms)
}

/// Joins chunk audio in ordinal order with a linear crossfade at every junction.
///
/// Pieces may arrive in any order. All pieces must share one sample rate and
/// channel count. Leading silence goes before the first chunk only.
pub fn stitch(mut pieces: Vec<StitchPiece>, config: &StitchingConfig) -> Result<AudioBuffer> {
    pieces.sort_by_key(|p| p.ordinal);

    let first = pieces.first().ok_or_else(|| anyhow!("Nothing to stitch"))?;
    let sample_rate = first.audio.sample_rate;
    let channels = first.audio.channels;
    let ch = channels as usize;

    if let Some(odd) = pieces.iter().find(|p| !p.audio.same_format(&first.audio)) {
        return Err(anyhow!(
            "Chunk {} is {} Hz x{}, expected {} Hz x{}",
            odd.ordinal,
            odd.audio.sample_rate,
            odd.audio.channels,
            sample_rate,
            channels
        ));
    }

    let mut out = AudioBuffer::silence(sample_rate, channels, config.leading_silence_ms);
    let lead_frames = out.frames();

    for (i, piece) in pieces.iter().enumerate() {
        let samples = &piece.audio.samples;
        if i == 0 {
            out.samples.extend_from_slice(samples);
            continue;
        }

        let requested = ms_to_frames(sample_rate, crossfade_ms(&piece.engine, config));
        // Never fade into the leading silence or past either chunk.
        let overlap = requested
            .min(out.frames() - lead_frames)
            .min(piece.audio.frames());
        debug!(
            "Junction before chunk {}: {} frames crossfade ({})",
            piece.ordinal, overlap, piece.engine
        );

        let tail_start = out.samples.len() - overlap * ch;
        for f in 0..overlap {
            let t = (f as f32 + 1.0) / (overlap as f32 + 1.0);
            for c in 0..ch {
                let idx = tail_start + f * ch + c;
                out.samples[idx] = out.samples[idx] * (1.0 - t) + samples[f * ch + c] * t;
            }
        }
        out.samples.extend_from_slice(&samples[overlap * ch..]);
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const SR: u32 = 1000;

    fn piece(ordinal: usize, engine: &str, value: f32, frames: usize) -> StitchPiece {
        StitchPiece {
            ordinal,
            engine: engine.to_string(),
            audio: AudioBuffer::new(SR, 1, vec![value; frames]),
        }
    }

    fn config() -> StitchingConfig {
        StitchingConfig {
            crossfade_ms: 10,
            crossfade_min_ms: 5,
            engine_crossfade_ms: HashMap::from([("local_x".to_string(), 40)]),
            leading_silence_ms: 0,
        }
    }

    #[test]
    fn test_crossfade_uses_second_engine_and_floor() {
        let mut cfg = config();
        assert_eq!(crossfade_ms("local_x", &cfg), 40);
        assert_eq!(crossfade_ms("cloud_a", &cfg), 10);
        cfg.engine_crossfade_ms.insert("cloud_b".to_string(), 1);
        assert_eq!(crossfade_ms("cloud_b", &cfg), 5);
    }

    #[test]
    fn test_orders_by_ordinal_not_arrival() {
        let pieces = vec![
            piece(2, "cloud_a", 0.3, 100),
            piece(0, "cloud_a", 0.1, 100),
            piece(1, "cloud_a", 0.2, 100),
        ];
        let out = stitch(pieces, &config()).unwrap();
        // Each junction overlaps 10 frames.
        assert_eq!(out.frames(), 300 - 20);
        assert_eq!(out.samples[0], 0.1);
        assert!((out.samples[130] - 0.2).abs() < 1e-6);
        assert!((out.samples[out.samples.len() - 1] - 0.3).abs() < 1e-6);
    }

    #[test]
    fn test_mixed_engine_junctions() {
        let pieces = vec![
            piece(0, "cloud_a", 0.0, 200),
            piece(1, "local_x", 1.0, 200),
            piece(2, "cloud_a", 0.0, 200),
        ];
        let out = stitch(pieces, &config()).unwrap();
        assert_eq!(out.frames(), 600 - 40 - 10);

        // The fade into local_x ramps over 40 frames.
        let ramp = &out.samples[160..200];
        assert!(ramp.windows(2).all(|w| w[1] >= w[0]));
        assert!(ramp[0] > 0.0 && ramp[39] < 1.0);
    }

    #[test]
    fn test_leading_silence_only_once() {
        let mut cfg = config();
        cfg.leading_silence_ms = 50;
        let out = stitch(
            vec![piece(0, "cloud_a", 0.5, 100), piece(1, "cloud_a", 0.5, 100)],
            &cfg,
        )
        .unwrap();
        assert_eq!(out.frames(), 50 + 200 - 10);
        assert!(out.samples[..50].iter().all(|s| *s == 0.0));
        assert_eq!(out.samples[50], 0.5);
    }

    #[test]
    fn test_short_chunk_limits_overlap() {
        let out = stitch(
            vec![piece(0, "cloud_a", 0.5, 100), piece(1, "local_x", 0.5, 8)],
            &config(),
        )
        .unwrap();
        assert_eq!(out.frames(), 100);
    }

    #[test]
    fn test_format_mismatch_is_error() {
        let mut odd = piece(1, "cloud_a", 0.5, 100);
        odd.audio.sample_rate = 22050;
        let err = stitch(vec![piece(0, "cloud_a", 0.5, 100), odd], &config()).unwrap_err();
        assert!(err.to_string().contains("Chunk 1"));
    }

    #[test]
    fn test_empty_input_is_error() {
        assert!(stitch(Vec::new(), &config()).is_err());
    }
}
