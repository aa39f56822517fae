//! Conversation reconstruction and replay
//!
//! Once both directions of a session have drained, the recorded chunks
//! are merged by capture timestamp and replayed: consecutive chunks that
//! share a direction are concatenated and handed to the matching parser
//! until it runs dry. A parse error never aborts the replay; the reader
//! resynchronizes at the next line.

use tracing::debug;

use crate::reassembly::Direction;

use super::StreamData;

/// Meta information about a fully observed conversation
#[derive(Debug, Clone)]
pub struct ConversationInfo {
    pub ident: String,
    pub client_ip: String,
    pub server_ip: String,
    pub client_port: u16,
    pub server_port: u16,
    /// Nanosecond timestamp of the first client packet
    pub first_client_packet: i64,
    /// Nanosecond timestamp of the first server packet
    pub first_server_packet: i64,
    /// All chunks, merged and sorted by capture timestamp
    pub data: Vec<StreamData>,
}

impl ConversationInfo {
    /// Concatenated raw bytes of the whole conversation in capture order
    pub fn raw(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for d in &self.data {
            out.extend_from_slice(&d.raw);
        }
        out
    }

    /// Concatenated bytes of one direction, capped at `limit` (0 = all)
    pub fn side(&self, dir: Direction, limit: usize) -> Vec<u8> {
        let mut out = Vec::new();
        for d in self.data.iter().filter(|d| d.dir == dir) {
            for &b in &d.raw {
                out.push(b);
                if limit != 0 && out.len() >= limit {
                    return out;
                }
            }
        }
        out
    }
}

/// Error surface of the replay parsers
#[derive(Debug)]
pub enum DecodeError {
    /// No more parseable data in this group
    Eof,
    /// One message could not be parsed; the replay resynchronizes
    Malformed(String),
}

/// Byte cursor the protocol parsers consume
pub struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    pub fn remaining(&self) -> &'a [u8] {
        &self.data[self.pos.min(self.data.len())..]
    }

    /// Read one line, consuming the terminator. The returned slice has
    /// CR/LF stripped. None at end of data.
    pub fn read_line(&mut self) -> Option<&'a [u8]> {
        if self.is_empty() {
            return None;
        }

        let rest = &self.data[self.pos..];
        match rest.iter().position(|&b| b == b'\n') {
            Some(idx) => {
                let mut line = &rest[..idx];
                if line.ends_with(b"\r") {
                    line = &line[..line.len() - 1];
                }
                self.pos += idx + 1;
                Some(line)
            }
            None => {
                self.pos = self.data.len();
                let mut line = rest;
                if line.ends_with(b"\r") {
                    line = &line[..line.len() - 1];
                }
                Some(line)
            }
        }
    }

    /// Take up to n bytes
    pub fn take(&mut self, n: usize) -> &'a [u8] {
        let end = (self.pos + n).min(self.data.len());
        let out = &self.data[self.pos..end];
        self.pos = end;
        out
    }

    /// Consume and return everything left
    pub fn take_rest(&mut self) -> &'a [u8] {
        let out = self.remaining();
        self.pos = self.data.len();
        out
    }

    /// Drop data up to and including the next line break
    pub fn skip_line(&mut self) {
        let _ = self.read_line();
    }
}

/// Replay a merged conversation through per-direction parser closures.
///
/// Each closure is invoked repeatedly over one direction group until it
/// reports `Eof`. `Malformed` results are logged and skipped past.
pub fn decode_conversation<C, S>(ident: &str, data: &[StreamData], mut client: C, mut server: S)
where
    C: FnMut(&mut ByteReader<'_>) -> Result<(), DecodeError>,
    S: FnMut(&mut ByteReader<'_>) -> Result<(), DecodeError>,
{
    if data.is_empty() {
        return;
    }

    let mut buf: Vec<u8> = Vec::new();
    let mut previous_dir = data[0].dir;

    let mut run_group = |dir: Direction, bytes: &[u8]| {
        let mut reader = ByteReader::new(bytes);
        loop {
            if reader.is_empty() {
                break;
            }
            let before = reader.pos();
            let result = match dir {
                Direction::ClientToServer => client(&mut reader),
                Direction::ServerToClient => server(&mut reader),
            };
            match result {
                Ok(()) => {}
                Err(DecodeError::Eof) => break,
                Err(DecodeError::Malformed(msg)) => {
                    debug!(ident, dir = %dir, error = %msg, "stream parse error, resynchronizing");
                    if reader.pos() == before {
                        reader.skip_line();
                    }
                }
            }
        }
    };

    for d in data {
        if d.dir == previous_dir {
            buf.extend_from_slice(&d.raw);
        } else {
            run_group(previous_dir, &buf);
            buf.clear();
            previous_dir = d.dir;
            buf.extend_from_slice(&d.raw);
        }
    }

    run_group(previous_dir, &buf);
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn chunk(dir: Direction, raw: &[u8], ts: i64) -> StreamData {
        StreamData {
            raw: raw.to_vec(),
            timestamp: chrono::Utc.timestamp_nanos(ts),
            dir,
        }
    }

    #[test]
    fn test_byte_reader_lines() {
        let mut r = ByteReader::new(b"one\r\ntwo\nthree");
        assert_eq!(r.read_line(), Some(&b"one"[..]));
        assert_eq!(r.read_line(), Some(&b"two"[..]));
        assert_eq!(r.read_line(), Some(&b"three"[..]));
        assert_eq!(r.read_line(), None);
    }

    #[test]
    fn test_direction_grouping() {
        let data = vec![
            chunk(Direction::ClientToServer, b"a\n", 0),
            chunk(Direction::ClientToServer, b"b\n", 1),
            chunk(Direction::ServerToClient, b"x\n", 2),
            chunk(Direction::ClientToServer, b"c\n", 3),
        ];

        let mut client_lines = Vec::new();
        let mut server_lines = Vec::new();

        decode_conversation(
            "test",
            &data,
            |r| match r.read_line() {
                Some(line) => {
                    client_lines.push(String::from_utf8_lossy(line).to_string());
                    Ok(())
                }
                None => Err(DecodeError::Eof),
            },
            |r| match r.read_line() {
                Some(line) => {
                    server_lines.push(String::from_utf8_lossy(line).to_string());
                    Ok(())
                }
                None => Err(DecodeError::Eof),
            },
        );

        assert_eq!(client_lines, vec!["a", "b", "c"]);
        assert_eq!(server_lines, vec!["x"]);
    }

    #[test]
    fn test_malformed_resynchronizes() {
        let data = vec![chunk(Direction::ClientToServer, b"bad line\ngood\n", 0)];

        let mut seen = Vec::new();
        decode_conversation(
            "test",
            &data,
            |r| {
                let line = r.read_line().ok_or(DecodeError::Eof)?;
                if line.starts_with(b"bad") {
                    return Err(DecodeError::Malformed("bad".into()));
                }
                seen.push(String::from_utf8_lossy(line).to_string());
                Ok(())
            },
            |_| Err(DecodeError::Eof),
        );

        assert_eq!(seen, vec!["good"]);
    }

    #[test]
    fn test_side_with_limit() {
        let conv = ConversationInfo {
            ident: "i".into(),
            client_ip: String::new(),
            server_ip: String::new(),
            client_port: 0,
            server_port: 0,
            first_client_packet: 0,
            first_server_packet: 0,
            data: vec![
                chunk(Direction::ServerToClient, b"hello ", 0),
                chunk(Direction::ClientToServer, b"nope", 1),
                chunk(Direction::ServerToClient, b"world", 2),
            ],
        };

        assert_eq!(conv.side(Direction::ServerToClient, 0), b"hello world");
        assert_eq!(conv.side(Direction::ServerToClient, 8), b"hello wo");
    }
}
