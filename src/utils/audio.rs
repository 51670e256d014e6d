use anyhow::{anyhow, Result};
use std::io::{Cursor, Read, Seek, SeekFrom, Write};

const FORMAT_PCM: u16 = 1;
const FORMAT_FLOAT: u16 = 3;

/// Decoded audio held in memory as interleaved `f32` samples in `[-1.0, 1.0]`.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    pub sample_rate: u32,
    pub channels: u16,
    pub samples: Vec<f32>,
}

impl AudioBuffer {
    pub fn new(sample_rate: u32, channels: u16, samples: Vec<f32>) -> Self {
        Self {
            sample_rate,
            channels: channels.max(1),
            samples,
        }
    }

    pub fn silence(sample_rate: u32, channels: u16, ms: u64) -> Self {
        let frames = ms_to_frames(sample_rate, ms);
        Self::new(sample_rate, channels, vec![0.0; frames * channels.max(1) as usize])
    }

    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }

    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.sample_rate as f64
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn same_format(&self, other: &AudioBuffer) -> bool {
        self.sample_rate == other.sample_rate && self.channels == other.channels
    }
}

pub fn ms_to_frames(sample_rate: u32, ms: u64) -> usize {
    (sample_rate as u64 * ms / 1000) as usize
}

struct WavInfo {
    format: u16,
    channels: u16,
    sample_rate: u32,
    bits_per_sample: u16,
    data_offset: u64,
    data_size: u32,
}

fn scan_wav(bytes: &[u8]) -> Result<WavInfo> {
    let mut f = Cursor::new(bytes);

    let mut id = [0u8; 4];
    f.read_exact(&mut id)?;
    if &id != b"RIFF" {
        return Err(anyhow!("Not a RIFF file"));
    }

    f.seek(SeekFrom::Current(4))?;

    f.read_exact(&mut id)?;
    if &id != b"WAVE" {
        return Err(anyhow!("Not a WAVE file"));
    }

    let mut fmt: Option<(u16, u16, u32, u16)> = None;
    let mut data: Option<(u64, u32)> = None;

    loop {
        let mut chunk_id = [0u8; 4];
        let n = f.read(&mut chunk_id)?;
        if n == 0 {
            break;
        }
        if n < 4 {
            return Err(anyhow!("Unexpected EOF reading chunk ID"));
        }

        let mut size_buf = [0u8; 4];
        f.read_exact(&mut size_buf)?;
        let chunk_size = u32::from_le_bytes(size_buf);

        if &chunk_id == b"fmt " {
            let mut buf = vec![0u8; chunk_size as usize];
            f.read_exact(&mut buf)?;
            if buf.len() < 16 {
                return Err(anyhow!("fmt chunk too short ({} bytes)", buf.len()));
            }
            let format = u16::from_le_bytes([buf[0], buf[1]]);
            let channels = u16::from_le_bytes([buf[2], buf[3]]);
            let sample_rate = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
            let bits = u16::from_le_bytes([buf[14], buf[15]]);
            fmt = Some((format, channels, sample_rate, bits));
        } else if &chunk_id == b"data" {
            let offset = f.stream_position()?;
            let available = (bytes.len() as u64).saturating_sub(offset);
            // Streamed WAVs sometimes carry a placeholder size.
            let size = (chunk_size as u64).min(available) as u32;
            data = Some((offset, size));
            break;
        } else {
            f.seek(SeekFrom::Current(chunk_size as i64 + (chunk_size % 2) as i64))?;
        }
    }

    let (format, channels, sample_rate, bits_per_sample) =
        fmt.ok_or_else(|| anyhow!("Missing fmt chunk"))?;
    let (data_offset, data_size) = data.ok_or_else(|| anyhow!("Missing data chunk"))?;

    Ok(WavInfo {
        format,
        channels,
        sample_rate,
        bits_per_sample,
        data_offset,
        data_size,
    })
}

/// Decodes 16-bit PCM or 32-bit float WAV bytes.
pub fn decode_wav(bytes: &[u8]) -> Result<AudioBuffer> {
    let info = scan_wav(bytes)?;
    let start = info.data_offset as usize;
    let data = &bytes[start..start + info.data_size as usize];

    let samples: Vec<f32> = match (info.format, info.bits_per_sample) {
        (FORMAT_PCM, 16) => data
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / 32768.0)
            .collect(),
        (FORMAT_FLOAT, 32) => data
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
        (format, bits) => {
            return Err(anyhow!(
                "Unsupported WAV encoding: format {} with {} bits per sample",
                format,
                bits
            ))
        }
    };

    Ok(AudioBuffer::new(info.sample_rate, info.channels, samples))
}

/// Encodes a buffer as a 16-bit PCM WAV file.
pub fn encode_wav(audio: &AudioBuffer) -> Result<Vec<u8>> {
    let channels = audio.channels.max(1);
    let block_align = channels * 2;
    let byte_rate = audio.sample_rate * block_align as u32;
    let data_size = (audio.samples.len() * 2) as u32;

    let mut out = Vec::with_capacity(44 + data_size as usize);
    out.write_all(b"RIFF")?;
    out.write_all(&(36 + data_size).to_le_bytes())?;
    out.write_all(b"WAVE")?;

    out.write_all(b"fmt ")?;
    out.write_all(&16u32.to_le_bytes())?;
    out.write_all(&FORMAT_PCM.to_le_bytes())?;
    out.write_all(&channels.to_le_bytes())?;
    out.write_all(&audio.sample_rate.to_le_bytes())?;
    out.write_all(&byte_rate.to_le_bytes())?;
    out.write_all(&block_align.to_le_bytes())?;
    out.write_all(&16u16.to_le_bytes())?;

    out.write_all(b"data")?;
    out.write_all(&data_size.to_le_bytes())?;
    for s in &audio.samples {
        let v = (s.clamp(-1.0, 1.0) * 32767.0).round() as i16;
        out.write_all(&v.to_le_bytes())?;
    }

    Ok(out)
}
