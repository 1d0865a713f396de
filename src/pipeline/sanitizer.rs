//! `TextSanitizer`: turns the raw LLM token stream into TTS-ready
//! [`Utterance`]s.
//!
//! Incoming text passes through a `<think>...</think>` stripping stage
//! first, then incremental markdown-markup stripping, then sentence/clause
//! boundary scanning to flush complete fragments as soon as they are ready
//! to speak rather than waiting for the whole reply.

use crate::pipeline::messages::Utterance;

const MIN_LENGTH: usize = 10;
const MAX_LENGTH: usize = 100;

const SENTENCE_PUNCTUATION: &[char] = &['.', '?', '!', '。', '！', '？'];
const PAUSE_PUNCTUATION: &[char] = &[',', '，', ';', '；', ':', '：'];

/// Incrementally strips `<think>...</think>` spans from a token stream,
/// carrying partial-tag state across calls.
#[derive(Default)]
struct ThinkTagStripper {
    in_think_block: bool,
    carry: String,
}

impl ThinkTagStripper {
    fn push(&mut self, fragment: &str) -> String {
        self.carry.push_str(fragment);
        let mut out = String::new();
        loop {
            if self.in_think_block {
                match self.carry.find("</think>") {
                    Some(end) => {
                        self.carry.drain(..end + "</think>".len());
                        self.in_think_block = false;
                    }
                    None => {
                        // Keep a short tail in case "</think>" is split
                        // across the next push.
                        let keep = self.carry.len().min(8);
                        let boundary = self.carry.len() - keep;
                        self.carry.drain(..boundary);
                        break;
                    }
                }
            } else {
                match self.carry.find("<think>") {
                    Some(start) => {
                        out.push_str(&self.carry[..start]);
                        self.carry.drain(..start + "<think>".len());
                        self.in_think_block = true;
                    }
                    None => {
                        let keep = self.carry.len().min(7);
                        let boundary = self.carry.len() - keep;
                        out.push_str(&self.carry[..boundary]);
                        self.carry.drain(..boundary);
                        break;
                    }
                }
            }
        }
        out
    }

    fn finish(&mut self) -> String {
        std::mem::take(&mut self.carry)
    }
}

/// Strip markdown-style decoration that would otherwise be read aloud
/// verbatim by TTS. Operates on a whole fragment at flush time; the screen
/// display keeps the original, unstripped tokens.
fn strip_markup(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    let mut at_line_start = true;

    while let Some(c) = chars.next() {
        match c {
            '*' | '_' => {
                // Collapse run of the same marker (bold/italic delimiters);
                // emit nothing.
                while chars.peek() == Some(&c) {
                    chars.next();
                }
            }
            '`' => {
                // Strip inline/backtick fences; the content between them is
                // kept, only the fence characters are dropped.
                while chars.peek() == Some(&'`') {
                    chars.next();
                }
            }
            '#' if at_line_start => {
                while chars.peek() == Some(&'#') {
                    chars.next();
                }
                if chars.peek() == Some(&' ') {
                    chars.next();
                }
            }
            '-' | '+' if at_line_start && chars.peek() == Some(&' ') => {
                chars.next();
            }
            '【' | '】' | '「' | '」' => {}
            '\n' => {
                out.push(c);
                at_line_start = true;
                continue;
            }
            _ => {
                // Numeric bullet markers "N. " at line start.
                if at_line_start && c.is_ascii_digit() {
                    let mut lookahead = chars.clone();
                    let mut digits = String::from(c);
                    while let Some(&d) = lookahead.peek() {
                        if d.is_ascii_digit() {
                            digits.push(d);
                            lookahead.next();
                        } else {
                            break;
                        }
                    }
                    if lookahead.peek() == Some(&'.') {
                        let mut after_dot = lookahead.clone();
                        after_dot.next();
                        if after_dot.peek() == Some(&' ') {
                            chars = lookahead;
                            chars.next();
                            chars.next();
                            at_line_start = false;
                            continue;
                        }
                    }
                }
                out.push(c);
            }
        }
        at_line_start = false;
    }
    out
}

fn find_sentence_boundary(buf: &str) -> Option<usize> {
    buf.char_indices()
        .find(|(_, c)| SENTENCE_PUNCTUATION.contains(c))
        .map(|(i, c)| i + c.len_utf8())
}

fn find_pause_boundary(buf: &str) -> Option<usize> {
    buf.char_indices()
        .find(|(_, c)| PAUSE_PUNCTUATION.contains(c))
        .map(|(i, c)| i + c.len_utf8())
}

/// A line break is also a flush boundary: list items and paragraph breaks
/// each become their own utterance rather than being read as one run-on
/// fragment.
fn find_newline_boundary(buf: &str) -> Option<usize> {
    buf.find('\n').map(|i| i + 1)
}

/// Find the last pause-punctuation boundary within the final quarter of
/// the buffer, used when a fragment hits `max_length` with no sentence end.
fn find_pause_in_last_quarter(buf: &str) -> Option<usize> {
    let total_chars = buf.chars().count();
    let quarter_start_char = total_chars - total_chars / 4;
    let quarter_start_byte = buf
        .char_indices()
        .nth(quarter_start_char)
        .map(|(i, _)| i)
        .unwrap_or(0);
    buf[quarter_start_byte..]
        .char_indices()
        .filter(|(_, c)| PAUSE_PUNCTUATION.contains(c))
        .last()
        .map(|(i, c)| quarter_start_byte + i + c.len_utf8())
}

/// Converts a token stream into TTS-ready, markup-stripped [`Utterance`]s.
pub struct TextSanitizer {
    think_stripper: ThinkTagStripper,
    raw: String,
}

impl Default for TextSanitizer {
    fn default() -> Self {
        Self::new()
    }
}

impl TextSanitizer {
    pub fn new() -> Self {
        Self {
            think_stripper: ThinkTagStripper::default(),
            raw: String::new(),
        }
    }

    /// Feed one token's text; returns zero or more completed fragments.
    pub fn push(&mut self, token_text: &str) -> Vec<Utterance> {
        let visible = self.think_stripper.push(token_text);
        if visible.is_empty() {
            return Vec::new();
        }
        self.raw.push_str(&visible);
        self.drain_ready_fragments()
    }

    fn drain_ready_fragments(&mut self) -> Vec<Utterance> {
        let mut out = Vec::new();
        loop {
            let char_len = self.raw.chars().count();

            let boundary = if let Some(idx) = find_sentence_boundary(&self.raw) {
                Some(idx)
            } else if char_len >= MIN_LENGTH {
                find_pause_boundary(&self.raw)
            } else {
                None
            };

            let boundary = boundary.or_else(|| find_newline_boundary(&self.raw));

            let boundary = boundary.or_else(|| {
                if char_len >= MAX_LENGTH {
                    Some(find_pause_in_last_quarter(&self.raw).unwrap_or(self.raw.len()))
                } else {
                    None
                }
            });

            let Some(boundary) = boundary else {
                break;
            };
            if boundary == 0 {
                break;
            }

            let fragment: String = self.raw.drain(..boundary).collect();
            if let Some(u) = self.finalize_fragment(fragment, false) {
                out.push(u);
            }
        }
        out
    }

    fn finalize_fragment(&self, fragment: String, is_terminal: bool) -> Option<Utterance> {
        let stripped = strip_markup(&fragment);
        let trimmed = stripped.trim_end().to_owned();
        if trimmed.trim().is_empty() {
            return None;
        }
        Some(Utterance {
            text: trimmed,
            is_terminal,
        })
    }

    /// The LLM stream ended. Flush whatever remains as a terminal
    /// fragment; suppressed if empty after stripping.
    pub fn finish(&mut self) -> Option<Utterance> {
        let tail = self.think_stripper.finish();
        self.raw.push_str(&tail);
        let remaining = std::mem::take(&mut self.raw);
        self.finalize_fragment(remaining, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(tokens: &[&str]) -> Vec<String> {
        let mut s = TextSanitizer::new();
        let mut out = Vec::new();
        for t in tokens {
            out.extend(s.push(t).into_iter().map(|u| u.text));
        }
        if let Some(u) = s.finish() {
            out.push(u.text);
        }
        out
    }

    #[test]
    fn flushes_on_sentence_terminator() {
        let out = run(&[" It", " is", " about", " three", " pm", "."]);
        assert_eq!(out, vec!["It is about three pm."]);
    }

    #[test]
    fn strips_bold_and_bullets_s3() {
        let out = run(&["**Hi** there.\n- item one\n- item two\n"]);
        assert_eq!(out, vec!["Hi there.", "item one", "item two"]);
    }

    #[test]
    fn empty_final_flush_is_suppressed() {
        let out = run(&["done."]);
        assert_eq!(out, vec!["done."]);
    }

    #[test]
    fn whitespace_only_stream_produces_nothing() {
        let out = run(&["   ", "\n"]);
        assert!(out.is_empty());
    }

    #[test]
    fn think_block_is_stripped_across_chunks() {
        let mut s = TextSanitizer::new();
        let mut out = Vec::new();
        out.extend(s.push("<thi").into_iter().map(|u| u.text));
        out.extend(s.push("nk>reasoning").into_iter().map(|u| u.text));
        out.extend(s.push("</thin").into_iter().map(|u| u.text));
        out.extend(s.push("k>hello.").into_iter().map(|u| u.text));
        if let Some(u) = s.finish() {
            out.push(u.text);
        }
        assert_eq!(out, vec!["hello."]);
    }

    #[test]
    fn max_length_flush_prefers_recent_pause() {
        let long = "word ".repeat(30); // > 100 chars, no sentence terminator
        let out = run(&[&long]);
        assert!(!out.is_empty());
        assert!(out.iter().all(|f| f.chars().count() <= MAX_LENGTH + 10));
    }
}
