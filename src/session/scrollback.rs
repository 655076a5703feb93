use std::collections::VecDeque;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// Default scrollback cap in lines.
pub const DEFAULT_SCROLLBACK_LINES: usize = 10_000;

/// A page of scrollback lines for incremental loading.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrollbackChunk {
    pub session_id: String,
    pub start_line: usize,
    pub end_line: usize,
    pub total_lines: usize,
    pub data: String,
    pub has_more: bool,
}

/// Bounded ring of terminal lines. The reader task is the only writer;
/// re-attach paths take the shared side of the registry lock.
#[derive(Debug)]
struct Scrollback {
    lines: VecDeque<String>,
    capacity: usize,
    total_bytes: usize,
}

impl Scrollback {
    fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity.min(256)),
            capacity: capacity.max(1),
            total_bytes: 0,
        }
    }

    /// Append a chunk of output. Text up to the first newline continues the
    /// current line; the ring drops its oldest line once past capacity.
    fn append(&mut self, data: &str) {
        let mut parts = data.split('\n');

        if let Some(first) = parts.next() {
            match self.lines.back_mut() {
                Some(last) => {
                    last.push_str(first);
                    self.total_bytes += first.len();
                }
                None => self.push_line(first.to_string()),
            }
        }

        for part in parts {
            self.push_line(part.to_string());
        }
    }

    fn push_line(&mut self, line: String) {
        self.total_bytes += line.len() + 1;
        self.lines.push_back(line);
        while self.lines.len() > self.capacity {
            if let Some(dropped) = self.lines.pop_front() {
                self.total_bytes = self.total_bytes.saturating_sub(dropped.len() + 1);
            }
        }
    }

    fn as_string(&self) -> String {
        let mut out = String::with_capacity(self.total_bytes);
        for (i, line) in self.lines.iter().enumerate() {
            if i > 0 {
                out.push('\n');
            }
            out.push_str(line);
        }
        out
    }
}

/// Tracks the xterm alternate screen so full-screen applications do not
/// pollute the scrollback. Raw output still reaches subscribers unfiltered.
pub struct AltScreenFilter {
    in_alt_screen: bool,
}

const ALT_ENTER: &str = "\x1b[?1049h";
const ALT_EXIT: &str = "\x1b[?1049l";

impl AltScreenFilter {
    pub fn new() -> Self {
        Self {
            in_alt_screen: false,
        }
    }

    pub fn process(&mut self, data: &str) -> String {
        let mut result = String::new();
        let mut pos = 0;

        while pos < data.len() {
            let remaining = &data[pos..];
            if self.in_alt_screen {
                match remaining.find(ALT_EXIT) {
                    Some(idx) => {
                        self.in_alt_screen = false;
                        pos += idx + ALT_EXIT.len();
                    }
                    None => break,
                }
            } else {
                match remaining.find(ALT_ENTER) {
                    Some(idx) => {
                        result.push_str(&remaining[..idx]);
                        self.in_alt_screen = true;
                        pos += idx + ALT_ENTER.len();
                    }
                    None => {
                        result.push_str(remaining);
                        break;
                    }
                }
            }
        }

        result
    }
}

impl Default for AltScreenFilter {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-session scrollback registry with a memoized has-buffer cache so the
/// hot `has_buffer` query never touches the buffer locks.
pub struct ScrollbackRegistry {
    buffers: DashMap<String, Arc<RwLock<Scrollback>>>,
    presence: DashMap<String, bool>,
    capacity: usize,
}

impl ScrollbackRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffers: DashMap::new(),
            presence: DashMap::new(),
            capacity,
        }
    }

    pub async fn append(&self, session_id: &str, data: &str) {
        let buffer = self
            .buffers
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(Scrollback::new(self.capacity))))
            .clone();
        self.presence.insert(session_id.to_string(), true);

        let mut guard = buffer.write().await;
        guard.append(data);
    }

    pub async fn as_string(&self, session_id: &str) -> Option<String> {
        let buffer = self.buffers.get(session_id)?.clone();
        let guard = buffer.read().await;
        Some(guard.as_string())
    }

    pub async fn chunk(
        &self,
        session_id: &str,
        start_line: usize,
        chunk_size: usize,
    ) -> ScrollbackChunk {
        let Some(buffer) = self.buffers.get(session_id).map(|b| b.clone()) else {
            return ScrollbackChunk {
                session_id: session_id.to_string(),
                start_line: 0,
                end_line: 0,
                total_lines: 0,
                data: String::new(),
                has_more: false,
            };
        };

        let guard = buffer.read().await;
        let total_lines = guard.lines.len();
        let end_line = (start_line + chunk_size).min(total_lines);
        let data = if start_line < total_lines {
            guard
                .lines
                .iter()
                .skip(start_line)
                .take(end_line - start_line)
                .cloned()
                .collect::<Vec<_>>()
                .join("\n")
        } else {
            String::new()
        };

        ScrollbackChunk {
            session_id: session_id.to_string(),
            start_line,
            end_line,
            total_lines,
            data,
            has_more: end_line < total_lines,
        }
    }

    pub fn has_buffer(&self, session_id: &str) -> bool {
        self.presence
            .get(session_id)
            .map(|present| *present)
            .unwrap_or(false)
    }

    pub fn remove(&self, session_id: &str) {
        self.buffers.remove(session_id);
        self.presence.remove(session_id);
    }

    pub async fn line_count(&self, session_id: &str) -> usize {
        match self.buffers.get(session_id).map(|b| b.clone()) {
            Some(buffer) => buffer.read().await.lines.len(),
            None => 0,
        }
    }
}

impl Default for ScrollbackRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_SCROLLBACK_LINES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_splits_lines_and_continues_last() {
        let mut buffer = Scrollback::new(100);
        buffer.append("hello ");
        buffer.append("world\nsecond");
        assert_eq!(buffer.as_string(), "hello world\nsecond");
    }

    #[test]
    fn at_capacity_drops_single_oldest_line() {
        let mut buffer = Scrollback::new(3);
        buffer.append("a\nb\nc");
        assert_eq!(buffer.lines.len(), 3);

        buffer.append("\nd");
        assert_eq!(buffer.lines.len(), 3);
        assert_eq!(buffer.as_string(), "b\nc\nd");
    }

    #[tokio::test]
    async fn registry_roundtrip_and_presence_cache() {
        let registry = ScrollbackRegistry::new(10);
        assert!(!registry.has_buffer("t1"));

        registry.append("t1", "line one\nline two").await;
        assert!(registry.has_buffer("t1"));
        assert_eq!(
            registry.as_string("t1").await.unwrap(),
            "line one\nline two"
        );

        registry.remove("t1");
        assert!(!registry.has_buffer("t1"));
        assert!(registry.as_string("t1").await.is_none());
    }

    #[tokio::test]
    async fn chunked_reads() {
        let registry = ScrollbackRegistry::new(100);
        registry.append("t1", "0\n1\n2\n3\n4").await;

        let chunk = registry.chunk("t1", 1, 2).await;
        assert_eq!(chunk.data, "1\n2");
        assert_eq!(chunk.total_lines, 5);
        assert!(chunk.has_more);

        let tail = registry.chunk("t1", 3, 10).await;
        assert_eq!(tail.data, "3\n4");
        assert!(!tail.has_more);
    }

    #[test]
    fn alt_screen_content_is_filtered() {
        let mut filter = AltScreenFilter::new();
        assert_eq!(filter.process("before\x1b[?1049h hidden"), "before");
        assert_eq!(filter.process("still hidden"), "");
        assert_eq!(filter.process("gone\x1b[?1049l after"), " after");
    }

    #[test]
    fn alt_screen_toggle_in_one_chunk() {
        let mut filter = AltScreenFilter::new();
        let input = "start \x1b[?1049hinside\x1b[?1049l end";
        assert_eq!(filter.process(input), "start  end");
    }
}
