//! Multi-file upload framing.
//!
//! One connection carries one batch:
//!
//! ```text
//! <count>\n
//! <file name>\n<date>\n<size>\n<size raw bytes>   (repeated <count> times)
//! ```
//!
//! Headers are newline-terminated text, bodies are length-delimited with no
//! trailing separator, so the switch between line mode and body mode happens at
//! the byte offset given by the size field, never at a chunk boundary. The
//! parser below does no I/O: callers `push` whatever the transport delivered and
//! drain `next_frame` until it returns `None`.

use bytes::{Bytes, BytesMut};

/// Header lines longer than this are treated as a malformed stream.
pub const MAX_LINE_LEN: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    pub name: String,
    /// Informational only, not used when persisting
    pub date: String,
    pub size: u64,
    /// 1-based
    pub index: usize,
    pub total: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Count line parsed; an unparseable count reads as zero files.
    BatchStart { total: usize },
    /// A complete header; exactly `size` bytes of `Body` follow before `FileEnd`.
    FileHeader(FileHeader),
    /// Header whose size line is not a number. No body follows for it.
    InvalidHeader {
        name: String,
        index: usize,
        total: usize,
        reason: String,
    },
    Body(Bytes),
    FileEnd,
    BatchEnd,
    /// The stream cannot be framed any further.
    Malformed(String),
}

#[derive(Debug)]
enum State {
    AwaitingCount,
    AwaitingFileName,
    AwaitingDate { name: String },
    AwaitingSize { name: String, date: String },
    ReceivingBody { remaining: u64 },
    Closing,
    Finished,
}

#[derive(Debug)]
pub struct UploadParser {
    state: State,
    buffer: BytesMut,
    total: usize,
    index: usize,
}

impl Default for UploadParser {
    fn default() -> Self {
        Self::new()
    }
}

impl UploadParser {
    pub fn new() -> Self {
        Self {
            state: State::AwaitingCount,
            buffer: BytesMut::new(),
            total: 0,
            index: 0,
        }
    }

    /// Append bytes received from the transport.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state, State::Finished)
    }

    /// True while a file body is partially received.
    pub fn in_body(&self) -> bool {
        matches!(self.state, State::ReceivingBody { .. })
    }

    pub fn total(&self) -> usize {
        self.total
    }

    /// Index of the file currently being received (0 before the first header).
    pub fn current_index(&self) -> usize {
        self.index
    }

    /// Bytes held back, waiting for a newline or past the end of the batch.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn next_frame(&mut self) -> Option<Frame> {
        loop {
            match std::mem::replace(&mut self.state, State::Finished) {
                State::AwaitingCount => match self.take_line() {
                    Ok(Some(line)) => {
                        self.total = line.parse::<usize>().unwrap_or_else(|_| {
                            log::warn!("[Protocol] Unreadable file count {:?}, assuming 0", line);
                            0
                        });
                        self.state = if self.total == 0 {
                            State::Closing
                        } else {
                            State::AwaitingFileName
                        };
                        return Some(Frame::BatchStart { total: self.total });
                    }
                    Ok(None) => {
                        self.state = State::AwaitingCount;
                        return None;
                    }
                    Err(frame) => return Some(frame),
                },
                State::AwaitingFileName => match self.take_line() {
                    Ok(Some(name)) => self.state = State::AwaitingDate { name },
                    Ok(None) => {
                        self.state = State::AwaitingFileName;
                        return None;
                    }
                    Err(frame) => return Some(frame),
                },
                State::AwaitingDate { name } => match self.take_line() {
                    Ok(Some(date)) => self.state = State::AwaitingSize { name, date },
                    Ok(None) => {
                        self.state = State::AwaitingDate { name };
                        return None;
                    }
                    Err(frame) => return Some(frame),
                },
                State::AwaitingSize { name, date } => match self.take_line() {
                    Ok(Some(line)) => {
                        self.index += 1;
                        match line.parse::<u64>() {
                            Ok(size) => {
                                self.state = State::ReceivingBody { remaining: size };
                                return Some(Frame::FileHeader(FileHeader {
                                    name,
                                    date,
                                    size,
                                    index: self.index,
                                    total: self.total,
                                }));
                            }
                            Err(_) => {
                                self.advance_file();
                                return Some(Frame::InvalidHeader {
                                    name,
                                    index: self.index,
                                    total: self.total,
                                    reason: format!("invalid file size {:?}", line),
                                });
                            }
                        }
                    }
                    Ok(None) => {
                        self.state = State::AwaitingSize { name, date };
                        return None;
                    }
                    Err(frame) => return Some(frame),
                },
                State::ReceivingBody { remaining: 0 } => {
                    self.advance_file();
                    return Some(Frame::FileEnd);
                }
                State::ReceivingBody { remaining } => {
                    if self.buffer.is_empty() {
                        self.state = State::ReceivingBody { remaining };
                        return None;
                    }
                    // Anything past this file's quota stays buffered for the next header
                    let take = (self.buffer.len() as u64).min(remaining) as usize;
                    let slice = self.buffer.split_to(take).freeze();
                    self.state = State::ReceivingBody {
                        remaining: remaining - take as u64,
                    };
                    return Some(Frame::Body(slice));
                }
                State::Closing => {
                    self.state = State::Finished;
                    return Some(Frame::BatchEnd);
                }
                State::Finished => return None,
            }
        }
    }

    fn advance_file(&mut self) {
        self.state = if self.index >= self.total {
            State::Closing
        } else {
            State::AwaitingFileName
        };
    }

    /// `Ok(None)` means no newline yet. On overflow the parser moves to `Finished`.
    fn take_line(&mut self) -> Result<Option<String>, Frame> {
        match self.buffer.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                let line = self.buffer.split_to(pos + 1);
                let text = String::from_utf8_lossy(&line[..pos]).trim().to_string();
                Ok(Some(text))
            }
            None if self.buffer.len() > MAX_LINE_LEN => {
                self.state = State::Finished;
                Err(Frame::Malformed(format!(
                    "header line exceeds {} bytes",
                    MAX_LINE_LEN
                )))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCENARIO: &[u8] = b"2\na.jpg\n2024-01-01\n5\nAAAAAb.jpg\n2024-01-01\n3\nBBB";

    fn drain(parser: &mut UploadParser) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Some(frame) = parser.next_frame() {
            frames.push(frame);
        }
        frames
    }

    fn feed(chunks: &[&[u8]]) -> Vec<Frame> {
        let mut parser = UploadParser::new();
        let mut frames = Vec::new();
        for chunk in chunks {
            parser.push(chunk);
            frames.extend(drain(&mut parser));
        }
        frames
    }

    /// Collapse consecutive body slices so chunkings can be compared
    fn merge_bodies(frames: Vec<Frame>) -> Vec<Frame> {
        let mut merged: Vec<Frame> = Vec::new();
        for frame in frames {
            if let (Some(Frame::Body(prev)), Frame::Body(next)) = (merged.last_mut(), &frame) {
                let mut joined = prev.to_vec();
                joined.extend_from_slice(next);
                *prev = Bytes::from(joined);
                continue;
            }
            merged.push(frame);
        }
        merged
    }

    fn header(name: &str, size: u64, index: usize, total: usize) -> Frame {
        Frame::FileHeader(FileHeader {
            name: name.to_string(),
            date: "2024-01-01".to_string(),
            size,
            index,
            total,
        })
    }

    #[test]
    fn test_two_files_in_one_chunk() {
        let frames = feed(&[SCENARIO]);
        assert_eq!(
            frames,
            vec![
                Frame::BatchStart { total: 2 },
                header("a.jpg", 5, 1, 2),
                Frame::Body(Bytes::from_static(b"AAAAA")),
                Frame::FileEnd,
                header("b.jpg", 3, 2, 2),
                Frame::Body(Bytes::from_static(b"BBB")),
                Frame::FileEnd,
                Frame::BatchEnd,
            ]
        );
    }

    #[test]
    fn test_byte_at_a_time_matches_contiguous() {
        let chunks: Vec<&[u8]> = SCENARIO.chunks(1).collect();
        let bytewise = merge_bodies(feed(&chunks));
        let whole = merge_bodies(feed(&[SCENARIO]));
        assert_eq!(bytewise, whole);
    }

    #[test]
    fn test_every_split_point_is_equivalent() {
        let whole = merge_bodies(feed(&[SCENARIO]));
        for split in 0..=SCENARIO.len() {
            let (left, right) = SCENARIO.split_at(split);
            assert_eq!(merge_bodies(feed(&[left, right])), whole, "split at {}", split);
        }
    }

    #[test]
    fn test_body_never_exceeds_declared_size() {
        // Second file header arrives in the same chunk as the first body
        let frames = feed(&[b"2\na\nd\n3\nXY", b"Zb\nd\n1\nQ"]);
        let bodies: Vec<&Bytes> = frames
            .iter()
            .filter_map(|f| match f {
                Frame::Body(b) => Some(b),
                _ => None,
            })
            .collect();
        assert_eq!(bodies[0].as_ref(), b"XY");
        assert_eq!(bodies[1].as_ref(), b"Z");
        assert_eq!(bodies[2].as_ref(), b"Q");
        assert_eq!(frames.last(), Some(&Frame::BatchEnd));
    }

    #[test]
    fn test_unparseable_count_is_empty_batch() {
        let frames = feed(&[b"abc\nwhatever"]);
        assert_eq!(frames, vec![Frame::BatchStart { total: 0 }, Frame::BatchEnd]);
    }

    #[test]
    fn test_invalid_size_skips_file() {
        let frames = feed(&[b"2\nbad.jpg\nd\nnope\ngood.jpg\nd\n2\nOK"]);
        assert_eq!(
            frames[1],
            Frame::InvalidHeader {
                name: "bad.jpg".to_string(),
                index: 1,
                total: 2,
                reason: "invalid file size \"nope\"".to_string(),
            }
        );
        assert!(matches!(&frames[2], Frame::FileHeader(h) if h.name == "good.jpg" && h.index == 2));
        assert_eq!(frames.last(), Some(&Frame::BatchEnd));
    }

    #[test]
    fn test_zero_size_file() {
        let frames = feed(&[b"1\nempty.jpg\nd\n0\n"]);
        assert_eq!(
            frames,
            vec![
                Frame::BatchStart { total: 1 },
                Frame::FileHeader(FileHeader {
                    name: "empty.jpg".to_string(),
                    date: "d".to_string(),
                    size: 0,
                    index: 1,
                    total: 1,
                }),
                Frame::FileEnd,
                Frame::BatchEnd,
            ]
        );
    }

    #[test]
    fn test_crlf_lines_are_trimmed() {
        let frames = feed(&[b"1\r\nphoto.jpg\r\n2024\r\n2\r\nhi"]);
        assert!(matches!(&frames[1], Frame::FileHeader(h) if h.name == "photo.jpg" && h.size == 2));
    }

    #[test]
    fn test_truncated_body_waits() {
        let mut parser = UploadParser::new();
        parser.push(b"1\na.jpg\nd\n10\nabc");
        let frames = drain(&mut parser);
        assert_eq!(frames.last(), Some(&Frame::Body(Bytes::from_static(b"abc"))));
        assert!(parser.in_body());
        assert!(!parser.is_finished());
        assert_eq!(parser.current_index(), 1);
    }

    #[test]
    fn test_trailing_bytes_after_batch_are_kept_aside() {
        let mut parser = UploadParser::new();
        parser.push(b"1\na\nd\n1\nXtrailing");
        let frames = drain(&mut parser);
        assert_eq!(frames.last(), Some(&Frame::BatchEnd));
        assert!(parser.is_finished());
        assert_eq!(parser.buffered(), "trailing".len());
    }

    #[test]
    fn test_overlong_header_line() {
        let mut parser = UploadParser::new();
        parser.push(b"1\n");
        parser.push(&vec![b'x'; MAX_LINE_LEN + 1]);
        let frames = drain(&mut parser);
        assert!(matches!(frames.last(), Some(Frame::Malformed(_))));
        assert!(parser.is_finished());
    }
}
