//! Speaker segmentation and size-bounded chunking of chapter text.
//!
//! Segmentation attributes lines to characters using `[id]` speaker tags.
//! Chunking then partitions each segment into same-script runs (Arabic, Latin)
//! and cuts every run into breath groups no longer than `max_chars`.

use crate::core::config::ChunkStrategy;
use crate::core::error::{PipelineError, PipelineResult};
use crate::core::state::{CharacterMap, Chunk, Mode, Script, Segment};
use log::warn;

/// Sentence-ending punctuation, Latin and Arabic.
const SENTENCE_ENDINGS: &[char] = &['.', '!', '?', '…', '؟', '۔'];

/// Splits chapter text into ordered speaker segments.
///
/// A line that is exactly `[id]`, or starts with `[id]` followed by whitespace,
/// switches the active character. A blank line flushes and resets to
/// `default_character`. Unknown tags fold into the default character unless
/// `strict` is set.
pub fn segment(
    text: &str,
    mode: Mode,
    default_character: &str,
    known: &CharacterMap,
    strict: bool,
) -> PipelineResult<Vec<Segment>> {
    let mut segments = Vec::new();
    let mut active = default_character.to_string();
    let mut buffer: Vec<&str> = Vec::new();

    for (i, raw) in text.lines().enumerate() {
        let line = raw.trim();

        if line.is_empty() {
            flush(&mut segments, &active, &mut buffer);
            active = default_character.to_string();
            continue;
        }

        let Some((tag, rest)) = parse_tag(line) else {
            buffer.push(line);
            continue;
        };

        let speaker = if mode == Mode::Single {
            default_character
        } else if tag == default_character || known.contains(tag) {
            tag
        } else if strict {
            return Err(PipelineError::UnknownSpeaker {
                tag: tag.to_string(),
                line: i + 1,
            });
        } else {
            warn!(
                "Unknown speaker '[{}]' on line {}, using '{}'",
                tag,
                i + 1,
                default_character
            );
            default_character
        };

        // Buffered text belongs to the character active before the switch.
        if speaker != active {
            flush(&mut segments, &active, &mut buffer);
            active = speaker.to_string();
        }
        if !rest.is_empty() {
            buffer.push(rest);
        }
    }

    flush(&mut segments, &active, &mut buffer);
    Ok(segments)
}

fn flush(segments: &mut Vec<Segment>, character: &str, buffer: &mut Vec<&str>) {
    if buffer.is_empty() {
        return;
    }
    segments.push(Segment {
        index: segments.len(),
        character: character.to_string(),
        text: buffer.join("\n"),
    });
    buffer.clear();
}

fn parse_tag(line: &str) -> Option<(&str, &str)> {
    let inner = line.strip_prefix('[')?;
    let close = inner.find(']')?;
    let tag = &inner[..close];
    if tag.is_empty()
        || !tag
            .chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '-')
    {
        return None;
    }
    let rest = &inner[close + 1..];
    if !rest.is_empty() && !rest.starts_with(char::is_whitespace) {
        return None;
    }
    Some((tag, rest.trim()))
}

// --- Chunking ---

#[derive(Debug, Clone)]
pub struct ChunkOptions {
    pub max_chars: usize,
    pub strategy: ChunkStrategy,
    pub inline_threshold_words: usize,
    /// Target engine renders short foreign phrases inside a chunk acceptably.
    pub inline_foreign: bool,
    pub engine: String,
    pub voice: Option<String>,
}

/// Cuts one segment into chunks. Ordinals start at 0 within the segment.
pub fn chunk(segment: &Segment, options: &ChunkOptions) -> Vec<Chunk> {
    let mut runs = language_runs(&segment.text);
    if options.inline_foreign {
        runs = merge_short_runs(runs, options.inline_threshold_words);
    }

    let mut chunks = Vec::new();
    for run in runs {
        for text in split_run(&run.text, options.max_chars.max(1), options.strategy) {
            chunks.push(Chunk {
                segment_index: segment.index,
                ordinal: chunks.len(),
                text,
                script: run.script,
                character: segment.character.clone(),
                engine: options.engine.clone(),
                voice: options.voice.clone(),
            });
        }
    }
    chunks
}

/// Language tag passed to engines for a chunk of the given script.
pub fn language_for(script: Script, chapter_language: &str) -> String {
    match script {
        Script::Arabic => "ar".to_string(),
        Script::Latin => "en".to_string(),
        Script::Neutral => chapter_language.to_string(),
    }
}

pub fn classify(c: char) -> Script {
    match c as u32 {
        // Arabic comma, semicolon, question mark, digits and full stop stay neutral.
        0x060C | 0x061B | 0x061F | 0x0660..=0x0669 | 0x06D4 => Script::Neutral,
        0x0600..=0x06FF | 0x0750..=0x077F | 0x08A0..=0x08FF | 0xFB50..=0xFDFF
        | 0xFE70..=0xFEFF => Script::Arabic,
        0x00D7 | 0x00F7 => Script::Neutral,
        0x00C0..=0x024F | 0x1E00..=0x1EFF => Script::Latin,
        _ if c.is_ascii_alphabetic() => Script::Latin,
        _ => Script::Neutral,
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Run {
    script: Script,
    text: String,
}

impl Run {
    fn words(&self) -> usize {
        self.text.split_whitespace().count()
    }
}

/// Maximal same-script runs; neutral characters attach to the preceding run.
fn language_runs(text: &str) -> Vec<Run> {
    let mut runs: Vec<Run> = Vec::new();
    for c in text.chars() {
        let script = classify(c);
        match runs.last_mut() {
            Some(run) if script == Script::Neutral || run.script == script => run.text.push(c),
            Some(run) if run.script == Script::Neutral => {
                run.script = script;
                run.text.push(c);
            }
            _ => runs.push(Run {
                script,
                text: c.to_string(),
            }),
        }
    }
    runs
}

/// Folds runs shorter than `threshold` words into the neighbouring run.
fn merge_short_runs(runs: Vec<Run>, threshold: usize) -> Vec<Run> {
    if runs.len() < 2 {
        return runs;
    }

    let mut merged: Vec<Run> = Vec::new();
    let mut leading: Option<Run> = None;

    for mut run in runs {
        let short = run.words() < threshold;
        if let Some(last) = merged.last_mut() {
            if short || last.script == run.script {
                last.text.push_str(&run.text);
                continue;
            }
        } else if short {
            match leading.as_mut() {
                Some(l) => l.text.push_str(&run.text),
                None => leading = Some(run),
            }
            continue;
        }
        if let Some(prefix) = leading.take() {
            run.text.insert_str(0, &prefix.text);
        }
        merged.push(run);
    }

    if let Some(rest) = leading {
        merged.push(rest);
    }
    merged
}

fn char_len(s: &str) -> usize {
    s.trim().chars().count()
}

/// Sentence-like units: text up to a sentence ending or line break, trailing whitespace included.
fn sentence_units(text: &str) -> Vec<&str> {
    let mut units = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        let ends_sentence = SENTENCE_ENDINGS.contains(&c)
            && chars.peek().map_or(true, |(_, next)| next.is_whitespace());
        if c != '\n' && !ends_sentence {
            continue;
        }
        let mut end = i + c.len_utf8();
        while let Some(&(j, next)) = chars.peek() {
            if !next.is_whitespace() {
                break;
            }
            end = j + next.len_utf8();
            chars.next();
        }
        units.push(&text[start..end]);
        start = end;
    }

    if start < text.len() {
        units.push(&text[start..]);
    }
    units
}

fn split_run(text: &str, max_chars: usize, strategy: ChunkStrategy) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut current = String::new();

    for unit in sentence_units(text) {
        let unit_len = char_len(unit);
        if unit_len == 0 {
            current.push_str(unit);
            continue;
        }

        if unit_len > max_chars {
            push_piece(&mut pieces, &mut current);
            pieces.extend(split_words(unit, max_chars));
            continue;
        }

        if char_len(&format!("{}{}", current, unit)) > max_chars {
            push_piece(&mut pieces, &mut current);
        }
        current.push_str(unit);

        if strategy == ChunkStrategy::Sentence {
            push_piece(&mut pieces, &mut current);
        }
    }

    push_piece(&mut pieces, &mut current);
    pieces
}

fn push_piece(pieces: &mut Vec<String>, current: &mut String) {
    let piece = current.trim();
    if !piece.is_empty() {
        pieces.push(piece.to_string());
    }
    current.clear();
}

/// Word-level fallback for a unit longer than the budget. A single word longer
/// than `max_chars` becomes its own piece.
fn split_words(unit: &str, max_chars: usize) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut current = String::new();

    for word in unit.split_whitespace() {
        let needed = if current.is_empty() {
            word.chars().count()
        } else {
            current.chars().count() + 1 + word.chars().count()
        };
        if needed > max_chars && !current.is_empty() {
            pieces.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);
    }

    if !current.is_empty() {
        pieces.push(current);
    }
    pieces
}
