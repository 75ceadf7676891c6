//! Incremental HTTP/1.x decoders that aggregate whole messages.
//!
//! Both decoders work on a caller owned `BytesMut` and consume exactly the
//! bytes of the messages they return, so anything left in the buffer belongs
//! to whoever reads the connection next.
use crate::errors::{new_io_error, Error, Result};
use crate::message::{Request, Response};
use crate::{CR_LF, SPACE};
use bytes::{Buf, Bytes, BytesMut};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Version};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io::ErrorKind;
use std::sync::Arc;

/// Largest aggregated body accepted by default (512 MiB).
pub const DEFAULT_MAX_CONTENT_LENGTH: usize = 512 * 1024 * 1024;
/// Largest request or status line plus headers.
const MAX_HEAD_LENGTH: usize = 64 * 1024;
const HEAD_END: &[u8] = b"\r\n\r\n";

/// Methods of requests forwarded on a connection, oldest first.
///
/// The response decoder needs them to know when a response has no body.
pub type MethodQueue = Arc<Mutex<VecDeque<Method>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyKind {
  Empty,
  Length(usize),
  Chunked,
  UntilEof,
}

#[derive(Debug)]
enum BodyState {
  Length(usize),
  ChunkSize,
  ChunkData(usize),
  ChunkEnd,
  Trailer,
  UntilEof,
}

/// Accumulates one message body according to its framing.
#[derive(Debug)]
struct Framing {
  kind: BodyKind,
  state: BodyState,
  body: BytesMut,
  trailers: HeaderMap,
  max: usize,
}

impl Framing {
  fn new(kind: BodyKind, max: usize) -> Self {
    let state = match kind {
      BodyKind::Empty => BodyState::Length(0),
      BodyKind::Length(n) => BodyState::Length(n),
      BodyKind::Chunked => BodyState::ChunkSize,
      BodyKind::UntilEof => BodyState::UntilEof,
    };
    Self {
      kind,
      state,
      body: BytesMut::new(),
      trailers: HeaderMap::new(),
      max,
    }
  }

  /// Pull body bytes out of `buf`. `Ok(true)` once the body is complete.
  fn advance(&mut self, buf: &mut BytesMut) -> Result<bool> {
    loop {
      match self.state {
        BodyState::Length(0) => return Ok(true),
        BodyState::Length(remaining) => {
          if buf.is_empty() {
            return Ok(false);
          }
          let n = remaining.min(buf.len());
          self.body.extend_from_slice(&buf.split_to(n));
          self.state = BodyState::Length(remaining - n);
        }
        BodyState::ChunkSize => {
          let Some(line) = take_line(buf)? else {
            return Ok(false);
          };
          let size = parse_chunk_size(&line)?;
          if self.body.len().saturating_add(size) > self.max {
            return Err(Error::MessageTooLarge(self.max));
          }
          self.state = if size == 0 {
            BodyState::Trailer
          } else {
            BodyState::ChunkData(size)
          };
        }
        BodyState::ChunkData(remaining) => {
          if buf.is_empty() {
            return Ok(false);
          }
          let n = remaining.min(buf.len());
          self.body.extend_from_slice(&buf.split_to(n));
          self.state = if remaining == n {
            BodyState::ChunkEnd
          } else {
            BodyState::ChunkData(remaining - n)
          };
        }
        BodyState::ChunkEnd => {
          if buf.len() < CR_LF.len() {
            return Ok(false);
          }
          if !buf.starts_with(CR_LF) {
            return Err(Error::protocol("missing CRLF after chunk data"));
          }
          buf.advance(CR_LF.len());
          self.state = BodyState::ChunkSize;
        }
        BodyState::Trailer => {
          let Some(line) = take_line(buf)? else {
            return Ok(false);
          };
          if line.is_empty() {
            return Ok(true);
          }
          let (k, v) = parser_headers(&line)?;
          self.trailers.append(k, v);
        }
        BodyState::UntilEof => {
          if self.body.len() + buf.len() > self.max {
            return Err(Error::MessageTooLarge(self.max));
          }
          self.body.extend_from_slice(&buf.split());
          return Ok(false);
        }
      }
      if self.body.len() > self.max {
        return Err(Error::MessageTooLarge(self.max));
      }
    }
  }

  /// Fold trailers into `headers` and replace chunked framing with a length.
  fn finish(self, headers: &mut HeaderMap) -> Bytes {
    match self.kind {
      BodyKind::Chunked | BodyKind::UntilEof => {
        headers.remove(http::header::TRANSFER_ENCODING);
        for (k, v) in self.trailers.iter() {
          headers.append(k.clone(), v.clone());
        }
        headers.insert(http::header::CONTENT_LENGTH, HeaderValue::from(self.body.len()));
      }
      BodyKind::Empty | BodyKind::Length(_) => {}
    }
    self.body.freeze()
  }
}

#[derive(Debug)]
struct RequestHead {
  method: Method,
  uri: http::Uri,
  version: Version,
  headers: HeaderMap,
}

/// Decodes aggregated requests from a client byte stream.
#[derive(Debug)]
pub struct RequestDecoder {
  max_content_length: usize,
  head: Option<(RequestHead, Framing)>,
  expect_continue: bool,
}

impl RequestDecoder {
  /// Decoder rejecting bodies longer than `max_content_length`.
  pub fn new(max_content_length: usize) -> Self {
    Self {
      max_content_length,
      head: None,
      expect_continue: false,
    }
  }

  /// Decode the next complete request, `Ok(None)` when more bytes are needed.
  pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Request>> {
    if self.head.is_none() {
      let Some(head) = take_head(buf)? else {
        return Ok(None);
      };
      let (start, mut headers) = parse_head(&head)?;
      let (method, uri, version) = parser_request_line(start)?;
      let kind = request_body_kind(&headers, self.max_content_length)?;
      if kind != BodyKind::Empty && is_expect_continue(&headers) {
        headers.remove(http::header::EXPECT);
        self.expect_continue = true;
      }
      let framing = Framing::new(kind, self.max_content_length);
      self.head = Some((
        RequestHead {
          method,
          uri,
          version,
          headers,
        },
        framing,
      ));
    }
    let complete = match self.head.as_mut() {
      Some((_, framing)) => framing.advance(buf)?,
      None => false,
    };
    if !complete {
      return Ok(None);
    }
    self.expect_continue = false;
    match self.head.take() {
      Some((mut head, framing)) => {
        let body = framing.finish(&mut head.headers);
        Ok(Some(Request::from_parts(
          head.method,
          head.uri,
          head.version,
          head.headers,
          body,
        )))
      }
      None => Ok(None),
    }
  }

  /// `true` once if the pending request asked for `100 Continue`.
  pub fn take_expect_continue(&mut self) -> bool {
    std::mem::take(&mut self.expect_continue)
  }

  /// No partially decoded request is buffered.
  pub fn is_idle(&self) -> bool {
    self.head.is_none()
  }
}

#[derive(Debug)]
struct ResponseHead {
  version: Version,
  status: StatusCode,
  reason: Option<String>,
  headers: HeaderMap,
}

/// Decodes aggregated responses from a target byte stream.
#[derive(Debug)]
pub struct ResponseDecoder {
  max_content_length: usize,
  methods: MethodQueue,
  head: Option<(ResponseHead, Framing)>,
}

impl ResponseDecoder {
  /// Decoder consulting `methods` for the request each response answers.
  pub fn new(max_content_length: usize, methods: MethodQueue) -> Self {
    Self {
      max_content_length,
      methods,
      head: None,
    }
  }

  /// Decode the next complete response, `Ok(None)` when more bytes are needed.
  pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Response>> {
    if self.head.is_none() {
      let Some(head) = take_head(buf)? else {
        return Ok(None);
      };
      let (start, headers) = parse_head(&head)?;
      let (version, status, reason) = parser_status_line(start)?;
      // interim responses do not answer the request
      let method = if status.is_informational() {
        None
      } else {
        self.methods.lock().pop_front()
      };
      let kind = response_body_kind(method.as_ref(), status, &headers, self.max_content_length)?;
      let framing = Framing::new(kind, self.max_content_length);
      self.head = Some((
        ResponseHead {
          version,
          status,
          reason,
          headers,
        },
        framing,
      ));
    }
    let complete = match self.head.as_mut() {
      Some((_, framing)) => framing.advance(buf)?,
      None => false,
    };
    if !complete {
      return Ok(None);
    }
    Ok(self.head.take().map(|(head, framing)| build_response(head, framing)))
  }

  /// Complete a response delimited by the connection closing.
  pub fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Response>> {
    if let Some(response) = self.decode(buf)? {
      return Ok(Some(response));
    }
    match self.head.take() {
      Some((head, framing)) if framing.kind == BodyKind::UntilEof => {
        Ok(Some(build_response(head, framing)))
      }
      Some(_) => Err(new_io_error(
        ErrorKind::UnexpectedEof,
        "connection closed inside a response",
      )),
      None => Ok(None),
    }
  }
}

fn build_response(mut head: ResponseHead, framing: Framing) -> Response {
  let body = framing.finish(&mut head.headers);
  Response::from_parts(head.version, head.status, head.reason, head.headers, body)
}

/// Split a complete head, including its blank line, off the front of `buf`.
fn take_head(buf: &mut BytesMut) -> Result<Option<Bytes>> {
  // tolerate stray CRLFs between messages
  while buf.starts_with(CR_LF) {
    buf.advance(CR_LF.len());
  }
  match buf.windows(HEAD_END.len()).position(|w| w == HEAD_END) {
    Some(pos) => Ok(Some(buf.split_to(pos + HEAD_END.len()).freeze())),
    None if buf.len() > MAX_HEAD_LENGTH => {
      Err(Error::protocol("message head exceeds 64 KiB"))
    }
    None => Ok(None),
  }
}

fn take_line(buf: &mut BytesMut) -> Result<Option<Bytes>> {
  match buf.windows(CR_LF.len()).position(|w| w == CR_LF) {
    Some(pos) => {
      let line = buf.split_to(pos).freeze();
      buf.advance(CR_LF.len());
      Ok(Some(line))
    }
    None if buf.len() > MAX_HEAD_LENGTH => Err(Error::protocol("line too long")),
    None => Ok(None),
  }
}

fn parse_head(head: &[u8]) -> Result<(&[u8], HeaderMap)> {
  let head = head.strip_suffix(HEAD_END).unwrap_or(head);
  let mut lines = head
    .split(|b| *b == b'\n')
    .map(|l| l.strip_suffix(b"\r").unwrap_or(l));
  let start = lines
    .next()
    .ok_or_else(|| Error::protocol("empty message head"))?;
  let mut headers = HeaderMap::new();
  for line in lines.filter(|l| !l.is_empty()) {
    let (k, v) = parser_headers(line)?;
    headers.append(k, v);
  }
  Ok((start, headers))
}

pub(crate) fn parser_headers(buffer: &[u8]) -> Result<(HeaderName, HeaderValue)> {
  let buffer = buffer.strip_suffix(CR_LF).unwrap_or(buffer);
  let mut parts = buffer.splitn(2, |s| s == &b':');
  let name = parts.next().unwrap_or_default();
  let value = parts
    .next()
    .ok_or_else(|| Error::protocol("header line without colon"))?;
  let k = HeaderName::from_bytes(name)?;
  let v = HeaderValue::from_bytes(value.trim_ascii())?;
  Ok((k, v))
}

fn parser_version(vc: &[u8]) -> Result<Version> {
  match vc {
    b"HTTP/1.0" => Ok(Version::HTTP_10),
    b"HTTP/1.1" => Ok(Version::HTTP_11),
    _ => Err(Error::protocol(format!(
      "unsupported http version {}",
      vc.escape_ascii()
    ))),
  }
}

fn parser_request_line(line: &[u8]) -> Result<(Method, http::Uri, Version)> {
  let mut parts = line.splitn(3, |b| b == &SPACE[0]);
  let (Some(method), Some(target), Some(version)) = (parts.next(), parts.next(), parts.next())
  else {
    return Err(Error::protocol("invalid request line"));
  };
  let method =
    Method::from_bytes(method).map_err(|_| Error::protocol("invalid request method"))?;
  let uri = http::Uri::try_from(target).map_err(|e| Error::Http(http::Error::from(e)))?;
  Ok((method, uri, parser_version(version)?))
}

fn parser_status_line(line: &[u8]) -> Result<(Version, StatusCode, Option<String>)> {
  let mut parts = line.splitn(3, |b| b == &SPACE[0]);
  let (Some(version), Some(code)) = (parts.next(), parts.next()) else {
    return Err(Error::protocol("invalid status line"));
  };
  let version = parser_version(version)?;
  let status = StatusCode::from_bytes(code).map_err(|e| Error::Http(http::Error::from(e)))?;
  let reason = parts
    .next()
    .map(|r| String::from_utf8_lossy(r).into_owned());
  Ok((version, status, reason))
}

fn parse_chunk_size(line: &[u8]) -> Result<usize> {
  let size = line.split(|b| *b == b';').next().unwrap_or_default();
  let size = std::str::from_utf8(size)
    .map_err(|_| Error::protocol("invalid chunk size"))?
    .trim();
  usize::from_str_radix(size, 16).map_err(|_| Error::protocol("invalid chunk size"))
}

fn is_chunked(headers: &HeaderMap) -> bool {
  headers
    .get_all(http::header::TRANSFER_ENCODING)
    .iter()
    .filter_map(|v| v.to_str().ok())
    .flat_map(|v| v.split(','))
    .last()
    .is_some_and(|coding| coding.trim().eq_ignore_ascii_case("chunked"))
}

fn content_length(headers: &HeaderMap) -> Result<Option<usize>> {
  match headers.get(http::header::CONTENT_LENGTH) {
    None => Ok(None),
    Some(v) => v
      .to_str()
      .ok()
      .and_then(|s| s.trim().parse::<usize>().ok())
      .map(Some)
      .ok_or_else(|| Error::protocol("invalid content-length")),
  }
}

fn length_kind(headers: &HeaderMap, max: usize) -> Result<Option<BodyKind>> {
  if is_chunked(headers) {
    return Ok(Some(BodyKind::Chunked));
  }
  match content_length(headers)? {
    Some(n) if n > max => Err(Error::MessageTooLarge(max)),
    Some(0) => Ok(Some(BodyKind::Empty)),
    Some(n) => Ok(Some(BodyKind::Length(n))),
    None => Ok(None),
  }
}

fn request_body_kind(headers: &HeaderMap, max: usize) -> Result<BodyKind> {
  Ok(length_kind(headers, max)?.unwrap_or(BodyKind::Empty))
}

fn response_body_kind(
  method: Option<&Method>,
  status: StatusCode,
  headers: &HeaderMap,
  max: usize,
) -> Result<BodyKind> {
  if status.is_informational()
    || status == StatusCode::NO_CONTENT
    || status == StatusCode::NOT_MODIFIED
    || method == Some(&Method::HEAD)
    || (method == Some(&Method::CONNECT) && status.is_success())
  {
    return Ok(BodyKind::Empty);
  }
  Ok(length_kind(headers, max)?.unwrap_or(BodyKind::UntilEof))
}

fn is_expect_continue(headers: &HeaderMap) -> bool {
  headers
    .get(http::header::EXPECT)
    .is_some_and(|v| v.as_bytes().eq_ignore_ascii_case(b"100-continue"))
}

#[cfg(test)]
mod tests {
  use super::*;

  fn methods(list: &[Method]) -> MethodQueue {
    Arc::new(Mutex::new(list.iter().cloned().collect()))
  }

  #[test]
  fn request_arrives_in_pieces() {
    let mut decoder = RequestDecoder::new(DEFAULT_MAX_CONTENT_LENGTH);
    let mut buf = BytesMut::from(&b"POST /submit HTTP/1.1\r\nHost: a.test\r\nContent-"[..]);
    assert!(decoder.decode(&mut buf).unwrap().is_none());
    buf.extend_from_slice(b"Length: 4\r\n\r\nab");
    assert!(decoder.decode(&mut buf).unwrap().is_none());
    assert!(!decoder.is_idle());
    buf.extend_from_slice(b"cdGET / HTTP/1.1\r\n");
    let request = decoder.decode(&mut buf).unwrap().unwrap();
    assert_eq!(request.method(), Method::POST);
    assert_eq!(request.uri().path(), "/submit");
    assert_eq!(request.headers()["host"], "a.test");
    assert_eq!(&request.body()[..], b"abcd");
    assert_eq!(&buf[..], b"GET / HTTP/1.1\r\n", "next message stays buffered");
  }

  #[test]
  fn chunked_request_is_aggregated() {
    let mut decoder = RequestDecoder::new(DEFAULT_MAX_CONTENT_LENGTH);
    let mut buf = BytesMut::from(
      &b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n4;ext=1\r\nWiki\r\n5\r\npedia\r\n0\r\nX-Sum: 9\r\n\r\n"[..],
    );
    let request = decoder.decode(&mut buf).unwrap().unwrap();
    assert_eq!(&request.body()[..], b"Wikipedia");
    assert!(request.headers().get("transfer-encoding").is_none());
    assert_eq!(request.headers()["content-length"], "9");
    assert_eq!(request.headers()["x-sum"], "9");
    assert!(buf.is_empty());
  }

  #[test]
  fn connect_request_has_authority_target() {
    let mut decoder = RequestDecoder::new(DEFAULT_MAX_CONTENT_LENGTH);
    let mut buf =
      BytesMut::from(&b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n"[..]);
    let request = decoder.decode(&mut buf).unwrap().unwrap();
    assert_eq!(request.method(), Method::CONNECT);
    assert_eq!(request.uri().host(), Some("example.com"));
    assert_eq!(request.uri().port_u16(), Some(443));
  }

  #[test]
  fn oversized_request_is_rejected() {
    let mut decoder = RequestDecoder::new(8);
    let mut buf = BytesMut::from(&b"POST / HTTP/1.1\r\nContent-Length: 9\r\n\r\n"[..]);
    assert!(matches!(
      decoder.decode(&mut buf),
      Err(Error::MessageTooLarge(8))
    ));
  }

  #[test]
  fn expect_continue_is_reported_once() {
    let mut decoder = RequestDecoder::new(DEFAULT_MAX_CONTENT_LENGTH);
    let mut buf = BytesMut::from(
      &b"PUT /f HTTP/1.1\r\nExpect: 100-continue\r\nContent-Length: 2\r\n\r\n"[..],
    );
    assert!(decoder.decode(&mut buf).unwrap().is_none());
    assert!(decoder.take_expect_continue());
    assert!(!decoder.take_expect_continue());
    buf.extend_from_slice(b"ok");
    let request = decoder.decode(&mut buf).unwrap().unwrap();
    assert!(request.headers().get("expect").is_none());
  }

  #[test]
  fn malformed_heads_are_protocol_violations() {
    let mut decoder = RequestDecoder::new(DEFAULT_MAX_CONTENT_LENGTH);
    let mut buf = BytesMut::from(&b"GET / HTTP/9.9\r\n\r\n"[..]);
    assert!(matches!(
      decoder.decode(&mut buf),
      Err(Error::ProtocolViolation(_))
    ));
    let mut decoder = RequestDecoder::new(DEFAULT_MAX_CONTENT_LENGTH);
    let mut buf = BytesMut::from(&b"GET / HTTP/1.1\r\nbroken\r\n\r\n"[..]);
    assert!(decoder.decode(&mut buf).is_err());
  }

  #[test]
  fn head_response_has_no_body() {
    let mut decoder = ResponseDecoder::new(DEFAULT_MAX_CONTENT_LENGTH, methods(&[Method::HEAD]));
    let mut buf = BytesMut::from(&b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n"[..]);
    let response = decoder.decode(&mut buf).unwrap().unwrap();
    assert!(response.body().is_empty());
    assert_eq!(response.headers()["content-length"], "10");
  }

  #[test]
  fn interim_response_does_not_consume_method() {
    let queue = methods(&[Method::GET]);
    let mut decoder = ResponseDecoder::new(DEFAULT_MAX_CONTENT_LENGTH, queue.clone());
    let mut buf = BytesMut::from(
      &b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 200 Fine\r\nContent-Length: 2\r\n\r\nhi"[..],
    );
    let interim = decoder.decode(&mut buf).unwrap().unwrap();
    assert_eq!(interim.status_code(), StatusCode::CONTINUE);
    assert_eq!(queue.lock().len(), 1);
    let response = decoder.decode(&mut buf).unwrap().unwrap();
    assert_eq!(&response.body()[..], b"hi");
    assert!(queue.lock().is_empty());
    assert_eq!(
      &response.to_raw()[..],
      &b"HTTP/1.1 200 Fine\r\ncontent-length: 2\r\n\r\nhi"[..]
    );
  }

  #[test]
  fn unframed_response_ends_at_eof() {
    let mut decoder = ResponseDecoder::new(DEFAULT_MAX_CONTENT_LENGTH, methods(&[Method::GET]));
    let mut buf = BytesMut::from(&b"HTTP/1.0 200 OK\r\n\r\npartial"[..]);
    assert!(decoder.decode(&mut buf).unwrap().is_none());
    buf.extend_from_slice(b" body");
    let response = decoder.decode_eof(&mut buf).unwrap().unwrap();
    assert_eq!(&response.body()[..], b"partial body");
    assert_eq!(response.headers()["content-length"], "12");
  }

  #[test]
  fn truncated_length_response_fails_at_eof() {
    let mut decoder = ResponseDecoder::new(DEFAULT_MAX_CONTENT_LENGTH, methods(&[Method::GET]));
    let mut buf = BytesMut::from(&b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nab"[..]);
    assert!(decoder.decode_eof(&mut buf).is_err());
  }
}
