//! Bounded per-session output history.
//!
//! Terminal output is kept verbatim (escape sequences included) so a view can
//! replay it when the session becomes active.

/// Byte-bounded text buffer that evicts its oldest output first.
#[derive(Debug, Clone)]
pub struct OutputBuffer {
    text: String,
    max_bytes: usize,
    /// Total bytes ever appended; never decreases, even across eviction.
    written: u64,
}

impl OutputBuffer {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            text: String::new(),
            max_bytes: max_bytes.max(1),
            written: 0,
        }
    }

    pub fn push(&mut self, chunk: &str) {
        if chunk.is_empty() {
            return;
        }
        self.written += chunk.len() as u64;
        self.text.push_str(chunk);
        if self.text.len() > self.max_bytes {
            let mut cut = self.text.len() - self.max_bytes;
            while !self.text.is_char_boundary(cut) {
                cut += 1;
            }
            self.text.drain(..cut);
        }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn len(&self) -> usize {
        self.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn clear(&mut self) {
        self.text.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_everything_under_the_limit() {
        let mut buffer = OutputBuffer::new(64);
        buffer.push("$ ls\r\n");
        buffer.push("Cargo.toml\r\n");
        assert_eq!(buffer.as_str(), "$ ls\r\nCargo.toml\r\n");
        assert_eq!(buffer.written(), 18);
    }

    #[test]
    fn evicts_oldest_bytes_first() {
        let mut buffer = OutputBuffer::new(8);
        buffer.push("abcdef");
        buffer.push("ghij");
        assert_eq!(buffer.as_str(), "cdefghij");
        assert_eq!(buffer.written(), 10);
    }

    #[test]
    fn eviction_never_splits_a_character() {
        let mut buffer = OutputBuffer::new(5);
        buffer.push("ab");
        // 'é' is two bytes; cutting one byte would land inside it.
        buffer.push("éédd");
        assert!(buffer.len() <= 5);
        assert_eq!(buffer.as_str(), "édd");
    }

    #[test]
    fn oversized_chunk_keeps_its_tail() {
        let mut buffer = OutputBuffer::new(4);
        buffer.push("0123456789");
        assert_eq!(buffer.as_str(), "6789");
    }

    #[test]
    fn clear_keeps_written_counter() {
        let mut buffer = OutputBuffer::new(16);
        buffer.push("hello");
        buffer.clear();
        assert!(buffer.is_empty());
        assert_eq!(buffer.written(), 5);
    }
}
