use std::fmt::{Debug, Formatter};

use bytes::{BufMut, Bytes, BytesMut};
use http::Request as HttpRequest;
use http::Response as HttpResponse;
use http::{HeaderMap, HeaderValue, Method, StatusCode, Version};

use crate::{COLON_SPACE, CR_LF, SPACE};

/// A fully aggregated HTTP request as seen by the proxy.
#[derive(Default, Clone, PartialEq)]
pub struct Request {
  method: Method,
  uri: http::Uri,
  version: Version,
  headers: HeaderMap<HeaderValue>,
  body: Bytes,
}

impl Debug for Request {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Request")
      .field("method", &self.method)
      .field("uri", &self.uri)
      .field("version", &self.version)
      .field("headers", &self.headers)
      .field("body", &format_args!("{}", &self.body.escape_ascii()))
      .finish()
  }
}

impl<T> From<HttpRequest<T>> for Request
where
  T: Into<Bytes>,
{
  fn from(value: HttpRequest<T>) -> Self {
    let (parts, body) = value.into_parts();
    Self {
      method: parts.method,
      uri: parts.uri,
      version: parts.version,
      headers: parts.headers,
      body: body.into(),
    }
  }
}

impl Request {
  pub(crate) fn from_parts(
    method: Method,
    uri: http::Uri,
    version: Version,
    headers: HeaderMap,
    body: Bytes,
  ) -> Self {
    Self {
      method,
      uri,
      version,
      headers,
      body,
    }
  }
  /// Serialize to HTTP/1.x wire bytes.
  ///
  /// The request-target is written as received. A `Content-Length` header is
  /// added when the body is not empty and no framing header is present.
  /// Header names are written in lowercase.
  pub fn to_raw(&self) -> Bytes {
    let mut http_requests = BytesMut::with_capacity(256 + self.body.len());
    http_requests.put_slice(self.method.as_str().as_bytes());
    http_requests.put_slice(SPACE);
    http_requests.put_slice(self.uri.to_string().as_bytes());
    http_requests.put_slice(SPACE);
    http_requests.put_slice(format!("{:?}", self.version).as_bytes());
    http_requests.put_slice(CR_LF);
    if self.headers.get(http::header::HOST).is_none() {
      if let Some(authority) = self.uri.authority() {
        put_header(
          &mut http_requests,
          http::header::HOST.as_str(),
          authority.as_str().as_bytes(),
        );
      }
    }
    for (k, v) in self.headers.iter() {
      put_header(&mut http_requests, k.as_str(), v.as_bytes());
    }
    if needs_content_length(&self.headers, &self.body) {
      put_header(
        &mut http_requests,
        http::header::CONTENT_LENGTH.as_str(),
        self.body.len().to_string().as_bytes(),
      );
    }
    http_requests.put_slice(CR_LF);
    http_requests.put_slice(&self.body);
    http_requests.freeze()
  }
  /// An HTTP request builder
  pub fn builder() -> http::request::Builder {
    http::request::Builder::new()
  }
  /// Get the method.
  pub fn method(&self) -> &Method {
    &self.method
  }
  /// Get the request-target.
  pub fn uri(&self) -> &http::Uri {
    &self.uri
  }
  /// Get the HTTP version.
  pub fn version(&self) -> Version {
    self.version
  }
  /// Get the headers.
  pub fn headers(&self) -> &HeaderMap {
    &self.headers
  }
  /// Get a mutable reference to the headers.
  pub fn headers_mut(&mut self) -> &mut HeaderMap {
    &mut self.headers
  }
  /// Get the aggregated body.
  pub fn body(&self) -> &Bytes {
    &self.body
  }
}

/// A fully aggregated HTTP response.
#[derive(Clone, PartialEq)]
pub struct Response {
  version: Version,
  status_code: StatusCode,
  reason: Option<String>,
  headers: HeaderMap<HeaderValue>,
  body: Bytes,
}

impl Debug for Response {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Response")
      .field("version", &self.version)
      .field("status_code", &self.status_code)
      .field("headers", &self.headers)
      .field("body", &format_args!("{}", &self.body.escape_ascii()))
      .finish()
  }
}

impl<T> From<HttpResponse<T>> for Response
where
  T: Into<Bytes>,
{
  fn from(value: HttpResponse<T>) -> Self {
    let (parts, body) = value.into_parts();
    Self {
      version: parts.version,
      status_code: parts.status,
      reason: None,
      headers: parts.headers,
      body: body.into(),
    }
  }
}

impl Response {
  pub(crate) fn from_parts(
    version: Version,
    status_code: StatusCode,
    reason: Option<String>,
    headers: HeaderMap,
    body: Bytes,
  ) -> Self {
    Self {
      version,
      status_code,
      reason,
      headers,
      body,
    }
  }
  /// Serialize to HTTP/1.x wire bytes, keeping the reason phrase the peer sent.
  pub fn to_raw(&self) -> Bytes {
    let mut http_response = BytesMut::with_capacity(128 + self.body.len());
    http_response.put_slice(format!("{:?}", self.version).as_bytes());
    http_response.put_slice(SPACE);
    match &self.reason {
      Some(reason) => {
        http_response.put_slice(self.status_code.as_str().as_bytes());
        http_response.put_slice(SPACE);
        http_response.put_slice(reason.as_bytes());
      }
      None => http_response.put_slice(format!("{}", self.status_code).as_bytes()),
    }
    http_response.put_slice(CR_LF);
    for (k, v) in self.headers.iter() {
      put_header(&mut http_response, k.as_str(), v.as_bytes());
    }
    if needs_content_length(&self.headers, &self.body) {
      put_header(
        &mut http_response,
        http::header::CONTENT_LENGTH.as_str(),
        self.body.len().to_string().as_bytes(),
      );
    }
    http_response.put_slice(CR_LF);
    http_response.put_slice(&self.body);
    http_response.freeze()
  }
  /// An HTTP response builder
  pub fn builder() -> http::response::Builder {
    http::response::Builder::new()
  }
  /// Get the `StatusCode` of this `Response`.
  pub fn status_code(&self) -> StatusCode {
    self.status_code
  }
  /// Get the HTTP `Version` of this `Response`.
  pub fn version(&self) -> Version {
    self.version
  }
  /// Get the `Headers` of this `Response`.
  pub fn headers(&self) -> &HeaderMap {
    &self.headers
  }
  /// Get the aggregated body.
  pub fn body(&self) -> &Bytes {
    &self.body
  }
}

fn put_header(buf: &mut BytesMut, name: &str, value: &[u8]) {
  buf.put_slice(name.as_bytes());
  buf.put_slice(COLON_SPACE);
  buf.put_slice(value);
  buf.put_slice(CR_LF);
}

fn needs_content_length(headers: &HeaderMap, body: &Bytes) -> bool {
  !body.is_empty()
    && !headers.contains_key(http::header::CONTENT_LENGTH)
    && !headers.contains_key(http::header::TRANSFER_ENCODING)
}
