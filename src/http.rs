use std::mem;

use bytes::{Buf, BytesMut};
use thiserror::Error;

const MAX_HEADERS: usize = 64;
const MAX_HEAD: usize = 64 * 1024;
const MAX_CHUNK_LINE: usize = 4096;

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("malformed response head")]
    BadHead,
    #[error("response head too large")]
    HeadTooLarge,
    #[error("malformed chunk framing")]
    BadChunk,
    #[error("connection closed mid-response")]
    Truncated,
}

/// A fully parsed response. The capture buffers are filled only when the
/// parser runs with capture enabled; headers are `name\0value\0` pairs.
#[derive(Debug)]
pub struct Completed {
    pub status: u16,
    pub keep_alive: bool,
    pub headers: Vec<u8>,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, Copy)]
enum State {
    Head,
    Body(Body),
}

#[derive(Debug, Clone, Copy)]
enum Body {
    Length(u64),
    Chunked(Chunk),
    UntilClose,
}

#[derive(Debug, Clone, Copy)]
enum Chunk {
    Size,
    Data(u64),
    DataEnd,
    Trailer,
}

/// Incremental HTTP/1.x response parser over a byte stream.
///
/// Head parsing is delegated to `httparse`; this layer adds body framing
/// (content-length, chunked, read-until-close), pipelining, and keep-alive
/// inspection. Any framing violation is unrecoverable for the connection.
pub struct ResponseParser {
    state: State,
    capture: bool,
    status: u16,
    keep_alive: bool,
    headers: Vec<u8>,
    body: Vec<u8>,
}

impl ResponseParser {
    pub fn new(capture: bool) -> Self {
        Self {
            state: State::Head,
            capture,
            status: 0,
            keep_alive: false,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// Re-initializes for the next response on a fresh connection.
    pub fn reset(&mut self) {
        self.state = State::Head;
        self.status = 0;
        self.keep_alive = false;
        self.headers.clear();
        self.body.clear();
    }

    /// Consumes as much of `buf` as possible, appending every completed
    /// response to `out`. Leftover bytes stay in `buf` for the next call.
    pub fn advance(&mut self, buf: &mut BytesMut, out: &mut Vec<Completed>) -> Result<(), HttpError> {
        loop {
            match self.state {
                State::Head => {
                    if buf.is_empty() {
                        return Ok(());
                    }
                    if !self.parse_head(buf)? {
                        return Ok(());
                    }
                    if let State::Head = self.state {
                        // Bodyless response; already complete.
                        self.complete(out);
                    }
                }
                State::Body(Body::Length(remaining)) => {
                    if buf.is_empty() {
                        return Ok(());
                    }
                    let take = (buf.len() as u64).min(remaining) as usize;
                    if self.capture {
                        self.body.extend_from_slice(&buf[..take]);
                    }
                    buf.advance(take);
                    if remaining == take as u64 {
                        self.complete(out);
                    } else {
                        self.state = State::Body(Body::Length(remaining - take as u64));
                        return Ok(());
                    }
                }
                State::Body(Body::Chunked(chunk)) => {
                    if !self.parse_chunk(chunk, buf, out)? {
                        return Ok(());
                    }
                }
                State::Body(Body::UntilClose) => {
                    if self.capture {
                        self.body.extend_from_slice(buf);
                    }
                    buf.advance(buf.len());
                    return Ok(());
                }
            }
        }
    }

    /// Signals end of stream. A read-until-close body completes here; any
    /// other partial state is a truncation error.
    pub fn finish(&mut self, buf: &BytesMut, out: &mut Vec<Completed>) -> Result<(), HttpError> {
        match self.state {
            State::Body(Body::UntilClose) => {
                self.complete(out);
                Ok(())
            }
            State::Head if buf.is_empty() => Ok(()),
            _ => Err(HttpError::Truncated),
        }
    }

    /// Returns `true` when the head was consumed, `false` when more input is
    /// needed. Leaves `self.state` at `Head` for bodyless responses.
    fn parse_head(&mut self, buf: &mut BytesMut) -> Result<bool, HttpError> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut resp = httparse::Response::new(&mut headers);

        let head_len = match resp.parse(buf) {
            Ok(httparse::Status::Complete(n)) => n,
            Ok(httparse::Status::Partial) => {
                if buf.len() > MAX_HEAD {
                    return Err(HttpError::HeadTooLarge);
                }
                return Ok(false);
            }
            Err(_) => return Err(HttpError::BadHead),
        };

        let status = resp.code.ok_or(HttpError::BadHead)?;
        let minor = resp.version.ok_or(HttpError::BadHead)?;

        let mut keep_alive = minor == 1;
        let mut content_length = None;
        let mut chunked = false;

        if self.capture {
            self.headers.clear();
            self.body.clear();
        }

        for h in resp.headers.iter() {
            if h.name.eq_ignore_ascii_case("content-length") {
                let v = std::str::from_utf8(h.value)
                    .ok()
                    .and_then(|s| s.trim().parse::<u64>().ok())
                    .ok_or(HttpError::BadHead)?;
                content_length = Some(v);
            } else if h.name.eq_ignore_ascii_case("transfer-encoding") {
                if contains_token(h.value, "chunked") {
                    chunked = true;
                }
            } else if h.name.eq_ignore_ascii_case("connection") {
                if contains_token(h.value, "close") {
                    keep_alive = false;
                } else if contains_token(h.value, "keep-alive") {
                    keep_alive = true;
                }
            }

            if self.capture {
                self.headers.extend_from_slice(h.name.as_bytes());
                self.headers.push(0);
                self.headers.extend_from_slice(h.value);
                self.headers.push(0);
            }
        }

        buf.advance(head_len);

        self.status = status;
        self.state = if !has_body(status) {
            State::Head
        } else if chunked {
            State::Body(Body::Chunked(Chunk::Size))
        } else if let Some(n) = content_length {
            if n == 0 {
                State::Head
            } else {
                State::Body(Body::Length(n))
            }
        } else {
            // No framing at all: the body runs to connection close.
            keep_alive = false;
            State::Body(Body::UntilClose)
        };
        self.keep_alive = keep_alive;

        Ok(true)
    }

    /// Returns `true` when progress was made, `false` when more input is
    /// needed.
    fn parse_chunk(
        &mut self,
        chunk: Chunk,
        buf: &mut BytesMut,
        out: &mut Vec<Completed>,
    ) -> Result<bool, HttpError> {
        match chunk {
            Chunk::Size => {
                let Some(eol) = find_crlf(buf) else {
                    if buf.len() > MAX_CHUNK_LINE {
                        return Err(HttpError::BadChunk);
                    }
                    return Ok(false);
                };
                let line = std::str::from_utf8(&buf[..eol]).map_err(|_| HttpError::BadChunk)?;
                let size_part = line.split(';').next().unwrap_or("").trim();
                let size = u64::from_str_radix(size_part, 16).map_err(|_| HttpError::BadChunk)?;
                buf.advance(eol + 2);
                self.state = State::Body(Body::Chunked(if size == 0 {
                    Chunk::Trailer
                } else {
                    Chunk::Data(size)
                }));
            }
            Chunk::Data(remaining) => {
                if buf.is_empty() {
                    return Ok(false);
                }
                let take = (buf.len() as u64).min(remaining) as usize;
                if self.capture {
                    self.body.extend_from_slice(&buf[..take]);
                }
                buf.advance(take);
                self.state = State::Body(Body::Chunked(if remaining == take as u64 {
                    Chunk::DataEnd
                } else {
                    Chunk::Data(remaining - take as u64)
                }));
            }
            Chunk::DataEnd => {
                if buf.len() < 2 {
                    return Ok(false);
                }
                if &buf[..2] != b"\r\n" {
                    return Err(HttpError::BadChunk);
                }
                buf.advance(2);
                self.state = State::Body(Body::Chunked(Chunk::Size));
            }
            Chunk::Trailer => {
                let Some(eol) = find_crlf(buf) else {
                    if buf.len() > MAX_CHUNK_LINE {
                        return Err(HttpError::BadChunk);
                    }
                    return Ok(false);
                };
                let empty = eol == 0;
                buf.advance(eol + 2);
                if empty {
                    self.complete(out);
                }
            }
        }

        Ok(true)
    }

    fn complete(&mut self, out: &mut Vec<Completed>) {
        out.push(Completed {
            status: self.status,
            keep_alive: self.keep_alive,
            headers: mem::take(&mut self.headers),
            body: mem::take(&mut self.body),
        });
        self.state = State::Head;
    }
}

fn has_body(status: u16) -> bool {
    !(status < 200 || status == 204 || status == 304)
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

fn contains_token(value: &[u8], token: &str) -> bool {
    value
        .split(|&b| b == b',')
        .any(|part| part.trim_ascii().eq_ignore_ascii_case(token.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(parser: &mut ResponseParser, data: &[u8]) -> Vec<Completed> {
        let mut buf = BytesMut::from(data);
        let mut out = Vec::new();
        parser.advance(&mut buf, &mut out).unwrap();
        out
    }

    #[test]
    fn parses_simple_response() {
        let mut parser = ResponseParser::new(false);
        let out = feed(
            &mut parser,
            b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok",
        );

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].status, 200);
        assert!(out[0].keep_alive);
    }

    #[test]
    fn parses_pipelined_responses_in_one_buffer() {
        let mut parser = ResponseParser::new(false);
        let one = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok";
        let mut data = Vec::new();
        for _ in 0..4 {
            data.extend_from_slice(one);
        }

        let out = feed(&mut parser, &data);
        assert_eq!(out.len(), 4);
    }

    #[test]
    fn resumes_across_split_reads() {
        let mut parser = ResponseParser::new(false);
        let data = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";
        let mut buf = BytesMut::new();
        let mut out = Vec::new();

        for chunk in data.chunks(7) {
            buf.extend_from_slice(chunk);
            parser.advance(&mut buf, &mut out).unwrap();
        }

        assert_eq!(out.len(), 1);
        assert!(buf.is_empty());
    }

    #[test]
    fn decodes_chunked_body() {
        let mut parser = ResponseParser::new(true);
        let out = feed(
            &mut parser,
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
              5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n",
        );

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].body, b"hello world");
        assert!(out[0].keep_alive);
    }

    #[test]
    fn connection_close_disables_keep_alive() {
        let mut parser = ResponseParser::new(false);
        let out = feed(
            &mut parser,
            b"HTTP/1.1 200 OK\r\nConnection: close\r\nContent-Length: 0\r\n\r\n",
        );

        assert_eq!(out.len(), 1);
        assert!(!out[0].keep_alive);
    }

    #[test]
    fn http10_defaults_to_close() {
        let mut parser = ResponseParser::new(false);
        let out = feed(
            &mut parser,
            b"HTTP/1.0 200 OK\r\nContent-Length: 0\r\n\r\n",
        );
        assert!(!out[0].keep_alive);

        let mut parser = ResponseParser::new(false);
        let out = feed(
            &mut parser,
            b"HTTP/1.0 200 OK\r\nConnection: keep-alive\r\nContent-Length: 0\r\n\r\n",
        );
        assert!(out[0].keep_alive);
    }

    #[test]
    fn unframed_body_runs_until_close() {
        let mut parser = ResponseParser::new(true);
        let mut buf = BytesMut::from(&b"HTTP/1.1 200 OK\r\n\r\npartial"[..]);
        let mut out = Vec::new();

        parser.advance(&mut buf, &mut out).unwrap();
        assert!(out.is_empty());

        parser.finish(&buf, &mut out).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].body, b"partial");
        assert!(!out[0].keep_alive);
    }

    #[test]
    fn bodyless_status_completes_without_body() {
        let mut parser = ResponseParser::new(false);
        let out = feed(&mut parser, b"HTTP/1.1 204 No Content\r\n\r\n");
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].status, 204);
    }

    #[test]
    fn captures_headers_as_nul_separated_pairs() {
        let mut parser = ResponseParser::new(true);
        let out = feed(
            &mut parser,
            b"HTTP/1.1 200 OK\r\nX-A: 1\r\nContent-Length: 0\r\n\r\n",
        );

        assert_eq!(out[0].headers, b"X-A\x001\x00Content-Length\x000\x00");
    }

    #[test]
    fn truncated_length_body_is_an_error() {
        let mut parser = ResponseParser::new(false);
        let mut buf = BytesMut::from(&b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nabc"[..]);
        let mut out = Vec::new();

        parser.advance(&mut buf, &mut out).unwrap();
        assert!(parser.finish(&buf, &mut out).is_err());
    }

    #[test]
    fn garbage_is_an_error() {
        let mut parser = ResponseParser::new(false);
        let mut buf = BytesMut::from(&b"\x00\x01nonsense\r\n\r\n"[..]);
        let mut out = Vec::new();

        assert!(parser.advance(&mut buf, &mut out).is_err());
    }
}
