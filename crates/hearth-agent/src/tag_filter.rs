//! Incremental separation of visible text from internal reasoning.
//!
//! Models that think out loud wrap their reasoning in marker pairs such as
//! `<think>` … `</think>`. Markers can be split across stream chunks, so the
//! filter holds back only the trailing bytes that could still be the start of
//! a marker and releases everything else as soon as it arrives.

use serde::{Deserialize, Serialize};

/// A piece of streamed text, tagged by where it belongs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamToken {
    pub text: String,
    pub is_internal: bool,
}

impl StreamToken {
    pub fn visible(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_internal: false,
        }
    }

    pub fn internal(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_internal: true,
        }
    }
}

/// Marker pairs recognised when none are configured.
pub fn default_markers() -> Vec<(String, String)> {
    vec![
        ("<think>".to_string(), "</think>".to_string()),
        ("<thinking>".to_string(), "</thinking>".to_string()),
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FilterState {
    Passthrough,
    /// Inside a reasoning block opened by the marker pair at this index.
    Suppressing(usize),
}

/// Streaming parser with two states, passthrough and suppressing.
///
/// Concatenating every emitted token in order yields the input with the
/// marker delimiters removed.
#[derive(Debug, Clone)]
pub struct TagFilter {
    markers: Vec<(String, String)>,
    buffer: String,
    state: FilterState,
}

impl Default for TagFilter {
    fn default() -> Self {
        Self::new(default_markers())
    }
}

impl TagFilter {
    /// Create a filter. Pairs with an empty opening or closing marker are ignored.
    pub fn new(markers: Vec<(String, String)>) -> Self {
        let markers = markers
            .into_iter()
            .filter(|(open, close)| !open.is_empty() && !close.is_empty())
            .collect();
        Self {
            markers,
            buffer: String::new(),
            state: FilterState::Passthrough,
        }
    }

    /// True while inside a reasoning block.
    pub fn is_suppressing(&self) -> bool {
        matches!(self.state, FilterState::Suppressing(_))
    }

    /// Feed a chunk and collect whatever can be released now.
    pub fn push(&mut self, chunk: &str) -> Vec<StreamToken> {
        self.buffer.push_str(chunk);
        let mut out = Vec::new();

        loop {
            match self.state {
                FilterState::Passthrough => match self.find_open() {
                    Some((pos, idx)) => {
                        let marker_len = self.markers[idx].0.len();
                        self.release(pos, marker_len, false, &mut out);
                        self.state = FilterState::Suppressing(idx);
                    }
                    None => {
                        let opens: Vec<&str> =
                            self.markers.iter().map(|(open, _)| open.as_str()).collect();
                        let hold = self.ambiguous_suffix(&opens);
                        let ready = self.buffer.len() - hold;
                        self.release(ready, 0, false, &mut out);
                        break;
                    }
                },
                FilterState::Suppressing(idx) => {
                    let close = &self.markers[idx].1;
                    match self.buffer.find(close.as_str()) {
                        Some(pos) => {
                            let marker_len = close.len();
                            self.release(pos, marker_len, true, &mut out);
                            self.state = FilterState::Passthrough;
                        }
                        None => {
                            let hold = self.ambiguous_suffix(&[close.as_str()]);
                            let ready = self.buffer.len() - hold;
                            self.release(ready, 0, true, &mut out);
                            break;
                        }
                    }
                }
            }
        }

        out
    }

    /// Flush the held-back tail under the current state.
    pub fn finish(&mut self) -> Vec<StreamToken> {
        let mut out = Vec::new();
        let is_internal = self.is_suppressing();
        let len = self.buffer.len();
        self.release(len, 0, is_internal, &mut out);
        self.state = FilterState::Passthrough;
        out
    }

    /// Emit `buffer[..upto]` and drop it plus `skip` marker bytes.
    fn release(&mut self, upto: usize, skip: usize, is_internal: bool, out: &mut Vec<StreamToken>) {
        if upto > 0 {
            out.push(StreamToken {
                text: self.buffer[..upto].to_string(),
                is_internal,
            });
        }
        self.buffer.drain(..upto + skip);
    }

    /// Earliest opening marker in the buffer. Longest marker wins a tie.
    fn find_open(&self) -> Option<(usize, usize)> {
        let mut best: Option<(usize, usize)> = None;
        for (idx, (open, _)) in self.markers.iter().enumerate() {
            if let Some(pos) = self.buffer.find(open.as_str()) {
                best = match best {
                    Some((best_pos, best_idx))
                        if best_pos < pos
                            || (best_pos == pos
                                && self.markers[best_idx].0.len() >= open.len()) =>
                    {
                        Some((best_pos, best_idx))
                    }
                    _ => Some((pos, idx)),
                };
            }
        }
        best
    }

    /// Length of the longest buffer suffix that is a proper prefix of a marker.
    fn ambiguous_suffix(&self, candidates: &[&str]) -> usize {
        let longest = candidates.iter().map(|m| m.len()).max().unwrap_or(0);
        let max_hold = longest.saturating_sub(1).min(self.buffer.len());

        for hold in (1..=max_hold).rev() {
            let start = self.buffer.len() - hold;
            if !self.buffer.is_char_boundary(start) {
                continue;
            }
            let tail = &self.buffer[start..];
            if candidates
                .iter()
                .any(|marker| marker.len() > hold && marker.starts_with(tail))
            {
                return hold;
            }
        }
        0
    }
}
