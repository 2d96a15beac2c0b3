//! Turns a raw byte stream into newline-delimited text lines.

use bytes::{Buf, BytesMut};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Default number of bytes requested from the underlying stream per read.
pub const DEFAULT_READ_CHUNK_SIZE: NumBytes = NumBytes(16 * 1024);

/// Default maximum length of a single line.
pub const DEFAULT_MAX_LINE_LENGTH: NumBytes = NumBytes(1024 * 1024);

/// A number of bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NumBytes(usize);

impl NumBytes {
    pub const fn zero() -> Self {
        Self(0)
    }

    pub const fn bytes(self) -> usize {
        self.0
    }
}

/// Construct [NumBytes] from plain numbers, e.g. `16.kilobytes()`.
pub trait NumBytesExt {
    fn bytes(self) -> NumBytes;

    fn kilobytes(self) -> NumBytes;

    fn megabytes(self) -> NumBytes;
}

impl NumBytesExt for usize {
    fn bytes(self) -> NumBytes {
        NumBytes(self)
    }

    fn kilobytes(self) -> NumBytes {
        NumBytes(self * 1024)
    }

    fn megabytes(self) -> NumBytes {
        NumBytes(self * 1024 * 1024)
    }
}

/// What to do with a line exceeding [LineParsingOptions::max_line_length].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LineOverflowBehavior {
    /// Emit the first `max_line_length` bytes as a line and continue framing the remaining bytes
    /// as if they started a new line. No data is lost.
    #[default]
    EmitAdditionalAsNewLines,

    /// Emit the first `max_line_length` bytes as a line and discard everything up to the next
    /// newline.
    DropAdditionalData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineParsingOptions {
    /// Maximum length of a single line in bytes. A value of zero disables the limit, letting a
    /// process that never writes a newline grow the line buffer without bound.
    ///
    /// default: 1 MiB
    pub max_line_length: NumBytes,

    /// default: [LineOverflowBehavior::EmitAdditionalAsNewLines]
    pub overflow_behavior: LineOverflowBehavior,
}

impl Default for LineParsingOptions {
    fn default() -> Self {
        Self {
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
            overflow_behavior: LineOverflowBehavior::default(),
        }
    }
}

/// Reads from `reader` and yields every line, without its trailing `\n`.
///
/// Bytes which are not valid UTF-8 are replaced with `U+FFFD`. A trailing line not terminated by a
/// newline is yielded once the stream is closed. A read error closes the framer early; data read
/// before the error is still yielded.
///
/// A framer is bound to the one stream it was constructed with.
pub struct LineFramer<R> {
    reader: R,
    buf: BytesMut,

    /// Length of the prefix of `buf` known to not contain a newline.
    scanned: usize,

    /// Set while skipping the remainder of an overlong line.
    discarding: bool,

    chunk_size: usize,
    options: LineParsingOptions,
    eof: bool,
}

impl<R: AsyncRead + Unpin> LineFramer<R> {
    pub fn new(reader: R, options: LineParsingOptions) -> Self {
        Self::with_chunk_size(reader, DEFAULT_READ_CHUNK_SIZE, options)
    }

    pub fn with_chunk_size(reader: R, chunk_size: NumBytes, options: LineParsingOptions) -> Self {
        let chunk_size = chunk_size.bytes().max(1);
        Self {
            reader,
            buf: BytesMut::with_capacity(chunk_size),
            scanned: 0,
            discarding: false,
            chunk_size,
            options,
            eof: false,
        }
    }

    /// Whether the underlying stream was observed to be closed.
    pub fn is_closed(&self) -> bool {
        self.eof
    }

    /// Returns the next line, or `None` once the stream is closed and every line was yielded.
    ///
    /// This function is cancel safe. Dropping the returned future before completion loses no data.
    pub async fn next_line(&mut self) -> Option<String> {
        loop {
            if let Some(line) = self.next_buffered_line() {
                return Some(line);
            }
            if self.eof {
                return self.take_partial();
            }
            self.fill().await;
        }
    }

    /// Yields every line that is already buffered, including a trailing partial line, without
    /// reading from the stream again.
    pub fn flush(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        while let Some(line) = self.next_buffered_line() {
            lines.push(line);
        }
        lines.extend(self.take_partial());
        lines
    }

    async fn fill(&mut self) {
        self.buf.reserve(self.chunk_size);
        match self.reader.read_buf(&mut self.buf).await {
            Ok(0) => self.eof = true,
            Ok(_bytes_read) => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => {
                tracing::warn!(error = %err, "Could not read from stream, treating it as closed");
                self.eof = true;
            }
        }
    }

    fn next_buffered_line(&mut self) -> Option<String> {
        let max = self.options.max_line_length.bytes();
        loop {
            let newline = self.buf[self.scanned..]
                .iter()
                .position(|b| *b == b'\n')
                .map(|offset| self.scanned + offset);

            if self.discarding {
                // Skipping the tail of an overlong line whose head was already emitted.
                match newline {
                    Some(pos) => {
                        self.buf.advance(pos + 1);
                        self.scanned = 0;
                        self.discarding = false;
                        continue;
                    }
                    None => {
                        self.buf.clear();
                        self.scanned = 0;
                        return None;
                    }
                }
            }

            let line_length = newline.unwrap_or(self.buf.len());
            if max != 0 && line_length > max {
                let head = self.buf.split_to(max);
                self.scanned = 0;
                if self.options.overflow_behavior == LineOverflowBehavior::DropAdditionalData {
                    self.discarding = true;
                }
                return Some(decode(&head));
            }

            return match newline {
                Some(pos) => {
                    let line = self.buf.split_to(pos + 1);
                    self.scanned = 0;
                    Some(decode(&line[..pos]))
                }
                None => {
                    self.scanned = self.buf.len();
                    None
                }
            };
        }
    }

    fn take_partial(&mut self) -> Option<String> {
        self.scanned = 0;
        if self.discarding {
            self.discarding = false;
            self.buf.clear();
            return None;
        }
        if self.buf.is_empty() {
            return None;
        }
        let line = self.buf.split();
        Some(decode(&line))
    }
}

fn decode(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use assertr::prelude::*;
    use std::time::Duration;
    use tokio::io::{AsyncWrite, AsyncWriteExt};

    pub(crate) async fn write_test_data(mut write: impl AsyncWrite + Unpin) {
        write.write_all("snapshot 1a2b3c4d saved\n".as_bytes()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        write.write_all("Files: 12 new, ".as_bytes()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        write.write_all("0 changed\n".as_bytes()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        write.write_all("Added to the repository: 4.2 MiB\n".as_bytes()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        write.write_all("processed 12 files".as_bytes()).await.unwrap();
    }

    async fn frame(input: &[u8], chunk_size: NumBytes, options: LineParsingOptions) -> Vec<String> {
        let mut framer = LineFramer::with_chunk_size(input, chunk_size, options);
        let mut lines = Vec::new();
        while let Some(line) = framer.next_line().await {
            lines.push(line);
        }
        lines
    }

    #[tokio::test]
    async fn frames_lines_across_chunk_boundaries() {
        // Helper function to reduce duplication in test cases
        async fn run_test_case(test_name: &str, input: &[u8], expected_lines: &[&str]) {
            for chunk_size in [1, 2, 3, 7, 64] {
                let lines = frame(input, chunk_size.bytes(), LineParsingOptions::default()).await;
                assert_that(lines)
                    .with_detail_message(format!("Test case: {test_name}, chunk size {chunk_size}"))
                    .is_equal_to(expected_lines.iter().map(|s| s.to_string()).collect::<Vec<_>>());
            }
        }

        run_test_case("Empty stream", b"", &[]).await;
        run_test_case("Single complete line", b"one line\n", &["one line"]).await;
        run_test_case(
            "Multiple complete lines",
            b"first line\nsecond line\nthird line\n",
            &["first line", "second line", "third line"],
        )
        .await;
        run_test_case(
            "Partial line at the end",
            b"complete line\npartial",
            &["complete line", "partial"],
        )
        .await;
        run_test_case("Empty lines", b"\n\na\n\n", &["", "", "a", ""]).await;
        run_test_case("Carriage returns are kept", b"a\r\nb\r\n", &["a\r", "b\r"]).await;
    }

    #[tokio::test]
    async fn replaces_invalid_utf8_without_losing_the_rest_of_the_stream() {
        let lines = frame(
            b"valid utf8\xF0\x28\x8C\xBC invalid utf8\nnext\ntrailing \xFF",
            2.bytes(),
            LineParsingOptions::default(),
        )
        .await;

        assert_that(lines.len()).is_equal_to(3);
        assert_that(lines[0].as_str()).contains("valid utf8");
        assert_that(lines[0].as_str()).contains("invalid utf8");
        assert_that(lines[0].as_str()).contains("\u{FFFD}");
        assert_that(lines[1].as_str()).is_equal_to("next");
        assert_that(lines[2].as_str()).starts_with("trailing ");
    }

    #[tokio::test]
    async fn splits_overlong_lines_when_emitting_additional_data() {
        let options = LineParsingOptions {
            max_line_length: 4.bytes(),
            overflow_behavior: LineOverflowBehavior::EmitAdditionalAsNewLines,
        };
        let lines = frame(b"abcdefghij\nabcd\nxy", 3.bytes(), options).await;
        assert_that(lines).is_equal_to(vec![
            "abcd".to_string(),
            "efgh".to_string(),
            "ij".to_string(),
            "abcd".to_string(),
            "xy".to_string(),
        ]);
    }

    #[tokio::test]
    async fn truncates_overlong_lines_when_dropping_additional_data() {
        let options = LineParsingOptions {
            max_line_length: 4.bytes(),
            overflow_behavior: LineOverflowBehavior::DropAdditionalData,
        };
        let lines = frame(b"abcdefghij\nnext\nlast-partial-line", 3.bytes(), options).await;
        assert_that(lines).is_equal_to(vec![
            "abcd".to_string(),
            "next".to_string(),
            "last".to_string(),
        ]);
    }

    #[tokio::test]
    async fn unlimited_line_length() {
        let options = LineParsingOptions {
            max_line_length: NumBytes::zero(),
            ..Default::default()
        };
        let long = "x".repeat(100_000);
        let input = format!("{long}\nshort\n");
        let lines = frame(input.as_bytes(), 1.kilobytes(), options).await;
        assert_that(lines).is_equal_to(vec![long, "short".to_string()]);
    }

    #[tokio::test]
    async fn flush_yields_buffered_lines_and_the_partial_tail() {
        let (read_half, mut write_half) = tokio::io::duplex(64);
        let mut framer = LineFramer::new(read_half, LineParsingOptions::default());

        write_half.write_all(b"first\nsecond\nthi").await.unwrap();
        assert_that(framer.next_line().await).is_equal_to(Some("first".to_string()));

        assert_that(framer.flush()).is_equal_to(vec!["second".to_string(), "thi".to_string()]);
        assert_that(framer.is_closed()).is_false();
    }

    #[tokio::test]
    async fn follows_a_slow_writer_until_it_closes() {
        let (read_half, write_half) = tokio::io::duplex(64);
        let mut framer = LineFramer::new(read_half, LineParsingOptions::default());

        let writer = tokio::spawn(write_test_data(write_half));

        let mut lines = Vec::new();
        while let Some(line) = framer.next_line().await {
            lines.push(line);
        }
        writer.await.unwrap();

        assert_that(framer.is_closed()).is_true();
        assert_that(lines).is_equal_to(vec![
            "snapshot 1a2b3c4d saved".to_string(),
            "Files: 12 new, 0 changed".to_string(),
            "Added to the repository: 4.2 MiB".to_string(),
            "processed 12 files".to_string(),
        ]);
    }

    #[tokio::test]
    async fn next_line_is_cancel_safe() {
        let (read_half, mut write_half) = tokio::io::duplex(64);
        let mut framer = LineFramer::new(read_half, LineParsingOptions::default());

        write_half.write_all(b"half a ").await.unwrap();
        let pending = tokio::time::timeout(Duration::from_millis(50), framer.next_line()).await;
        assert_that(pending.is_err()).is_true();

        write_half.write_all(b"line\n").await.unwrap();
        assert_that(framer.next_line().await).is_equal_to(Some("half a line".to_string()));
    }
}
