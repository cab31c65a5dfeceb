//! Line framing for text protocols
//!
//! Accumulates raw bytes and cuts them into `\n`-terminated lines. The partial
//! line after the last delimiter stays buffered until more data arrives.

/// Default cap for the unterminated remainder
pub const DEFAULT_LINE_BUFFER_CAP: usize = 4096;

/// Which lines a [`LineFramer`] hands out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LineFilter {
    /// Every non-empty line
    #[default]
    Any,
    /// Lines that look like NMEA sentences (`$` first, `*` somewhere)
    Nmea,
}

impl LineFilter {
    fn accepts(self, line: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Nmea => line.starts_with('$') && line.contains('*'),
        }
    }
}

/// Output of one [`LineFramer::push`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FramedLines {
    /// Complete, trimmed, non-empty lines that passed the filter
    pub lines: Vec<String>,
    /// Non-empty lines the filter rejected
    pub rejected: Vec<String>,
    /// Bytes dropped from the remainder because it exceeded the cap
    pub overflowed: Option<usize>,
}

/// Newline framer with a bounded remainder
#[derive(Debug, Clone)]
pub struct LineFramer {
    buffer: Vec<u8>,
    cap: usize,
    filter: LineFilter,
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new(LineFilter::Any, DEFAULT_LINE_BUFFER_CAP)
    }
}

impl LineFramer {
    /// Create a framer
    pub fn new(filter: LineFilter, cap: usize) -> Self {
        Self {
            buffer: Vec::new(),
            cap: cap.max(1),
            filter,
        }
    }

    /// Framer for NMEA sentences
    pub fn nmea(cap: usize) -> Self {
        Self::new(LineFilter::Nmea, cap)
    }

    /// Append data and return the lines it completed
    pub fn push(&mut self, data: &[u8]) -> FramedLines {
        self.buffer.extend_from_slice(data);

        let mut out = FramedLines::default();
        let mut start = 0;
        while let Some(pos) = self.buffer[start..].iter().position(|&b| b == b'\n') {
            let raw = &self.buffer[start..start + pos];
            start += pos + 1;

            let text = String::from_utf8_lossy(raw);
            let line = text.trim();
            if line.is_empty() {
                continue;
            }
            if self.filter.accepts(line) {
                out.lines.push(line.to_string());
            } else {
                out.rejected.push(line.to_string());
            }
        }
        self.buffer.drain(..start);

        // Oldest bytes win; the tail of a runaway line is dropped
        if self.buffer.len() > self.cap {
            out.overflowed = Some(self.buffer.len() - self.cap);
            self.buffer.truncate(self.cap);
        }

        out
    }

    /// Bytes waiting for a delimiter
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Clear buffer
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}
