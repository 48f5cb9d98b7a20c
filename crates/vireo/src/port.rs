//! Input and output ports.
//!
//! Ports are heap objects wrapping host streams. Input ports buffer text and
//! refill a line at a time from their backing reader, so the reader can pull
//! characters incrementally from an interactive stream without blocking past
//! the end of a datum. Output ports write through to their sink; stdout is
//! line-buffered by the underlying handle.

use std::{
    fmt,
    fs::File,
    io::{self, BufRead, BufReader, BufWriter, Read as _, Write},
};

/// A port heap object. Closing a port replaces it with `Closed` in place, so
/// stale references observe a closed port rather than dangling state.
pub(crate) enum Port {
    Input(InputPort),
    Output(OutputPort),
    Closed,
}

impl fmt::Debug for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Input(_) => f.write_str("Port::Input"),
            Self::Output(_) => f.write_str("Port::Output"),
            Self::Closed => f.write_str("Port::Closed"),
        }
    }
}

/// Buffered character source for the reader.
pub(crate) struct InputPort {
    buf: String,
    pos: usize,
    source: Option<Box<dyn BufRead>>,
}

impl InputPort {
    /// Port over a fixed string; used by `eval` of source text and in tests.
    pub fn from_string(text: impl Into<String>) -> Self {
        Self {
            buf: text.into(),
            pos: 0,
            source: None,
        }
    }

    /// Port over standard input, refilled a line at a time.
    pub fn stdin() -> Self {
        Self {
            buf: String::new(),
            pos: 0,
            source: Some(Box::new(BufReader::new(io::stdin()))),
        }
    }

    /// Port over a file. The whole file is read eagerly; file ports do not
    /// need interactive refill.
    pub fn open(path: &str) -> io::Result<Self> {
        let mut text = String::new();
        File::open(path)?.read_to_string(&mut text)?;
        Ok(Self::from_string(text))
    }

    /// Pulls one more line from the backing reader. Returns false at EOF.
    fn refill(&mut self) -> bool {
        let Some(source) = self.source.as_mut() else {
            return false;
        };
        let mut line = String::new();
        match source.read_line(&mut line) {
            Ok(0) | Err(_) => false,
            Ok(_) => {
                self.buf.push_str(&line);
                true
            }
        }
    }

    /// Peeks the next character without consuming it, refilling if needed.
    pub fn peek_char(&mut self) -> Option<char> {
        loop {
            if let Some(c) = self.buf[self.pos..].chars().next() {
                return Some(c);
            }
            if !self.refill() {
                return None;
            }
        }
    }

    /// Consumes and returns the next character.
    pub fn next_char(&mut self) -> Option<char> {
        let c = self.peek_char()?;
        self.pos += c.len_utf8();
        Some(c)
    }
}

enum OutputSink {
    Stdout,
    Stderr,
    File(BufWriter<File>),
}

/// Write-through character sink.
pub(crate) struct OutputPort {
    sink: OutputSink,
}

impl OutputPort {
    pub fn stdout() -> Self {
        Self { sink: OutputSink::Stdout }
    }

    pub fn stderr() -> Self {
        Self { sink: OutputSink::Stderr }
    }

    pub fn create(path: &str) -> io::Result<Self> {
        Ok(Self {
            sink: OutputSink::File(BufWriter::new(File::create(path)?)),
        })
    }

    pub fn write_str(&mut self, text: &str) -> io::Result<()> {
        match &mut self.sink {
            OutputSink::Stdout => io::stdout().write_all(text.as_bytes()),
            OutputSink::Stderr => io::stderr().write_all(text.as_bytes()),
            OutputSink::File(w) => w.write_all(text.as_bytes()),
        }
    }

    pub fn write_char(&mut self, c: char) -> io::Result<()> {
        let mut utf8 = [0u8; 4];
        self.write_str(c.encode_utf8(&mut utf8))
    }

    pub fn flush(&mut self) -> io::Result<()> {
        match &mut self.sink {
            OutputSink::Stdout => io::stdout().flush(),
            OutputSink::Stderr => io::stderr().flush(),
            OutputSink::File(w) => w.flush(),
        }
    }
}

impl Drop for OutputPort {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_port_yields_chars_then_eof() {
        let mut port = InputPort::from_string("ab");
        assert_eq!(port.peek_char(), Some('a'));
        assert_eq!(port.next_char(), Some('a'));
        assert_eq!(port.next_char(), Some('b'));
        assert_eq!(port.next_char(), None);
        assert_eq!(port.peek_char(), None);
    }
}
