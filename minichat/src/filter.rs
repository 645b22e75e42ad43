//! Incremental removal of `<think>...</think>` blocks from streamed model output.

const OPEN_MARKER: &str = "<think>";
const CLOSE_MARKER: &str = "</think>";

/// Longest marker, in chars. The pending buffer never holds more than one
/// char beyond this.
const MAX_MARKER_LEN: usize = 8;

/// Streaming filter that drops thinking blocks, including their markers.
///
/// Fragments must be fed in arrival order. Text is held back only while it
/// could still turn out to be part of a marker, so a marker split across any
/// number of fragments is still detected. Call [`ThinkFilter::flush`] at end of
/// stream to release what is left.
///
/// Markers are matched literally: `<thinking>` is ordinary text, while a
/// literal `<think>` anywhere in the output always starts a hidden block.
#[derive(Debug, Default)]
pub struct ThinkFilter {
    inside_thinking: bool,
    pending: String,
}

impl ThinkFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_inside_thinking(&self) -> bool {
        self.inside_thinking
    }

    /// Consume `fragment` and return the text now known to lie outside any
    /// thinking block.
    pub fn feed(&mut self, fragment: &str) -> String {
        let mut out = String::new();
        for c in fragment.chars() {
            self.pending.push(c);

            if !self.inside_thinking && self.pending.ends_with(OPEN_MARKER) {
                // Whatever preceded the marker in the window is visible text.
                let visible = self.pending.len() - OPEN_MARKER.len();
                out.push_str(&self.pending[..visible]);
                self.inside_thinking = true;
                self.pending.clear();
            } else if self.inside_thinking && self.pending.ends_with(CLOSE_MARKER) {
                self.inside_thinking = false;
                self.pending.clear();
            } else if self.pending.chars().count() > MAX_MARKER_LEN {
                let oldest = self.pending.remove(0);
                // Hidden content is dropped, visible content is released.
                if !self.inside_thinking {
                    out.push(oldest);
                }
            }
        }
        out
    }

    /// Release anything still held back and reset the filter.
    ///
    /// An unterminated thinking block yields nothing.
    pub fn flush(&mut self) -> String {
        let pending = std::mem::take(&mut self.pending);
        let inside = std::mem::replace(&mut self.inside_thinking, false);
        if inside { String::new() } else { pending }
    }
}

/// Strip thinking blocks from a complete text in one pass.
pub fn strip_thinking(text: &str) -> String {
    let mut filter = ThinkFilter::new();
    let mut out = filter.feed(text);
    out.push_str(&filter.flush());
    out
}
