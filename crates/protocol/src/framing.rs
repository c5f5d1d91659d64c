use std::io::Read;

use flate2::read::MultiGzDecoder;

pub const GZIP_START: &str = "gzip_start";
pub const GZIP_END: &str = "gzip_end";

/// Longest single line accepted from the agent's output streams.
///
/// Compressed payloads are split on raw `\n` bytes, so a line can be arbitrary binary; the
/// limit only guards against a runaway stream with no newline at all.
pub const MAX_LINE_LENGTH: usize = 16 * 1024 * 1024;

/// Accumulates the raw lines between `gzip_start` and `gzip_end`.
///
/// The line reader strips the `\n` delimiters, which are part of the compressed stream, so
/// they are put back here. The end marker arrives glued to the tail of the last line.
#[derive(Debug, Default)]
pub struct GzipFrame {
    buffer: Vec<u8>,
}

impl GzipFrame {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one raw line; returns the complete compressed payload once the end marker shows up.
    pub fn push(&mut self, line: &[u8]) -> Option<Vec<u8>> {
        let line = line
            .strip_suffix(b"\r")
            .filter(|stripped| stripped.ends_with(GZIP_END.as_bytes()))
            .unwrap_or(line);
        if let Some(head) = line.strip_suffix(GZIP_END.as_bytes()) {
            self.buffer.extend_from_slice(head);
            return Some(std::mem::take(&mut self.buffer));
        }
        self.buffer.extend_from_slice(line);
        self.buffer.push(b'\n');
        None
    }

    /// Gives up on a frame whose end marker never arrived, returning what was buffered.
    pub fn abandon(self) -> Vec<u8> {
        self.buffer
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

/// Decompresses a framed payload into its plaintext lines.
pub fn decompress_lines(payload: &[u8]) -> std::io::Result<Vec<String>> {
    let mut decoder = MultiGzDecoder::new(payload);
    let mut plain = Vec::new();
    decoder.read_to_end(&mut plain)?;
    Ok(String::from_utf8_lossy(&plain)
        .lines()
        .map(|line| line.trim_end_matches('\r').to_string())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn gzip(text: &str) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(text.as_bytes()).expect("write");
        encoder.finish().expect("finish")
    }

    fn feed(frame: &mut GzipFrame, stream: &[u8]) -> Option<Vec<u8>> {
        let mut done = None;
        for line in stream.split(|byte| *byte == b'\n') {
            if done.is_some() {
                assert!(line.is_empty(), "data after end marker");
                continue;
            }
            done = frame.push(line);
        }
        done
    }

    #[test]
    fn reassembles_payload_with_marker_glued_to_last_line() {
        let plain = "s:Jan  2 15:04,3\nm:1:first\nm:2:second\n";
        let mut wire = gzip(plain);
        wire.extend_from_slice(GZIP_END.as_bytes());
        wire.push(b'\n');

        let mut frame = GzipFrame::new();
        let payload = feed(&mut frame, &wire).expect("complete payload");
        let lines = decompress_lines(&payload).expect("decompress");
        assert_eq!(lines, vec!["s:Jan  2 15:04,3", "m:1:first", "m:2:second"]);
        assert!(frame.is_empty());
    }

    #[test]
    fn tolerates_carriage_return_after_end_marker() {
        let mut wire = gzip("m:7:only\n");
        wire.extend_from_slice(b"gzip_end\r\n");

        let mut frame = GzipFrame::new();
        let payload = feed(&mut frame, &wire).expect("complete payload");
        assert_eq!(decompress_lines(&payload).expect("decompress"), vec!["m:7:only"]);
    }

    #[test]
    fn abandoned_frame_keeps_the_buffered_lines() {
        let mut frame = GzipFrame::new();
        assert!(frame.push(b"\x1f\x8b partial").is_none());
        assert!(frame.push(b"exit_code:1").is_none());
        assert_eq!(frame.abandon(), b"\x1f\x8b partial\nexit_code:1\n".to_vec());
    }

    #[test]
    fn corrupt_payload_is_an_error() {
        assert!(decompress_lines(b"definitely not gzip").is_err());
    }
}
