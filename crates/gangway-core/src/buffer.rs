//! Bounded tail buffer for captured process output.
//!
//! Retains the most recent pushes under two caps — item count and total
//! bytes — so a long-running exec can always report its last output without
//! unbounded memory growth.

use std::collections::VecDeque;

/// Append-only text accumulator bounded by item count and byte count.
///
/// Eviction is oldest-first. The most recently pushed item is always
/// retained; a single item larger than `max_bytes` is truncated (keeping its
/// tail) so the buffer never exceeds the byte cap.
#[derive(Debug, Clone)]
pub struct CircularBuffer {
    items: VecDeque<String>,
    max_items: usize,
    max_bytes: usize,
    total_bytes: usize,
}

impl CircularBuffer {
    /// Create a buffer holding at most `max_items` entries and `max_bytes`
    /// total bytes.
    pub fn new(max_items: usize, max_bytes: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(max_items.min(64)),
            max_items,
            max_bytes,
            total_bytes: 0,
        }
    }

    /// Append a chunk, evicting from the front until both caps hold.
    pub fn push(&mut self, text: impl Into<String>) {
        let mut text = text.into();

        // An oversized single chunk keeps only its tail. The cut rounds
        // forward to the next char boundary so the tail never exceeds the
        // byte cap.
        if text.len() > self.max_bytes {
            let start = ceil_char_boundary(&text, text.len() - self.max_bytes);
            text = text[start..].to_string();
        }

        self.total_bytes += text.len();
        self.items.push_back(text);

        while self.items.len() > self.max_items
            || (self.total_bytes > self.max_bytes && self.items.len() > 1)
        {
            if let Some(evicted) = self.items.pop_front() {
                self.total_bytes -= evicted.len();
            }
        }
    }

    /// Number of retained items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns `true` when nothing is retained.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Total bytes currently retained.
    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    /// Concatenate all retained items in push order.
    pub fn contents(&self) -> String {
        let mut out = String::with_capacity(self.total_bytes);
        for item in &self.items {
            out.push_str(item);
        }
        out
    }

    /// Most recently pushed item, if any.
    pub fn last(&self) -> Option<&str> {
        self.items.back().map(String::as_str)
    }
}

/// Smallest char boundary `>= index` (stable stand-in for
/// `str::ceil_char_boundary`).
fn ceil_char_boundary(s: &str, index: usize) -> usize {
    let mut i = index.min(s.len());
    while i < s.len() && !s.is_char_boundary(i) {
        i += 1;
    }
    i
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retains_under_both_caps() {
        let mut buf = CircularBuffer::new(5, 100);
        for i in 0..10 {
            buf.push(format!("chunk-{i:02} "));
        }
        assert!(buf.len() <= 5);
        assert!(buf.total_bytes() <= 100);
        assert_eq!(buf.last(), Some("chunk-09 "));
    }

    #[test]
    fn test_byte_cap_evicts_oldest() {
        let mut buf = CircularBuffer::new(100, 20);
        buf.push("aaaaaaaaaa"); // 10 bytes
        buf.push("bbbbbbbbbb"); // 10 bytes
        buf.push("cc");
        assert!(buf.total_bytes() <= 20);
        assert!(!buf.contents().contains('a'));
        assert!(buf.contents().contains("cc"));
    }

    #[test]
    fn test_oversized_single_item_truncated_to_tail() {
        let mut buf = CircularBuffer::new(5, 10);
        buf.push("0123456789abcdef");
        assert_eq!(buf.len(), 1);
        assert!(buf.total_bytes() <= 10);
        assert_eq!(buf.contents(), "6789abcdef");
    }

    #[test]
    fn test_oversized_truncation_respects_char_boundaries() {
        // 11 bytes; the cut point (11 - 7 = 4) lands mid-é, so the split
        // rounds forward and the tail stays under the cap.
        let mut buf = CircularBuffer::new(5, 7);
        buf.push("xxxéééé");
        assert_eq!(buf.len(), 1);
        assert!(buf.total_bytes() <= 7);
        assert_eq!(buf.contents(), "ééé");
    }

    #[test]
    fn test_oversized_mid_char_cut_never_exceeds_cap() {
        // Every cut offset across a run of 2-byte chars must keep the
        // retained tail at or under the byte cap.
        for cap in 1..=9 {
            let mut buf = CircularBuffer::new(3, cap);
            buf.push("aéééé"); // 9 bytes
            assert!(
                buf.total_bytes() <= cap,
                "cap {cap}: retained {} bytes",
                buf.total_bytes()
            );
            assert_eq!(buf.len(), 1);
        }
    }

    #[test]
    fn test_contents_preserves_push_order() {
        let mut buf = CircularBuffer::new(3, 1000);
        buf.push("one ");
        buf.push("two ");
        buf.push("three");
        assert_eq!(buf.contents(), "one two three");
    }

    #[test]
    fn test_empty_buffer() {
        let buf = CircularBuffer::new(3, 10);
        assert!(buf.is_empty());
        assert_eq!(buf.total_bytes(), 0);
        assert_eq!(buf.contents(), "");
        assert_eq!(buf.last(), None);
    }
}
