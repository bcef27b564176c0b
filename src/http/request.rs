//! HTTP/1.1 request parsing using the [`httparse`] crate.
//!
//! Parsing happens in two steps: [`Request::parse`] reads the request head,
//! then [`Request::with_body`] attaches the body once the transport has
//! buffered `Content-Length` bytes. Attaching the body is also when form
//! parameters and multipart parts are decoded.

use bytes::Bytes;
use percent_encoding::percent_decode_str;
use thiserror::Error;

use super::multipart::{self, MultipartError, Part};
use super::{Headers, Method};

/// Errors that can occur while parsing an HTTP/1.1 request.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("request is incomplete, more data needed")]
    Incomplete,

    #[error("HTTP parse error: {0}")]
    Parse(#[from] httparse::Error),

    #[error("missing required field: {field}")]
    MissingField { field: &'static str },
}

/// A parsed HTTP/1.1 request.
///
/// # Examples
///
/// ```
/// use webby::http::Request;
///
/// let raw = b"GET /app/hello?name=J%C3%BCrgen&x=1 HTTP/1.1\r\nHost: localhost\r\nCookie: sid=abc; theme=dark\r\n\r\n";
/// let request = Request::from_bytes(raw).unwrap();
///
/// assert_eq!(request.method().as_str(), "GET");
/// assert_eq!(request.path(), "/app/hello");
/// assert_eq!(request.param("name"), Some("Jürgen"));
/// assert_eq!(request.cookie("theme"), Some("dark"));
/// ```
#[derive(Debug)]
pub struct Request {
    method: Method,
    path: String,
    /// HTTP minor version: 0 for HTTP/1.0, 1 for HTTP/1.1.
    version: u8,
    headers: Headers,
    query: Option<String>,
    body: Bytes,
    params: Vec<(String, String)>,
    parts: Option<Result<Vec<Part>, MultipartError>>,
}

impl Request {
    /// Maximum number of headers we support per request.
    const MAX_HEADERS: usize = 64;

    /// Parses the request head from `buf`.
    ///
    /// Returns the request (with an empty body) and the offset at which the
    /// body begins, i.e. immediately after the `\r\n\r\n` terminator.
    ///
    /// # Errors
    ///
    /// - [`RequestError::Incomplete`]: the head has not fully arrived yet.
    /// - [`RequestError::Parse`]: the data is malformed.
    /// - [`RequestError::MissingField`]: method, path or version is absent.
    pub fn parse(buf: &[u8]) -> Result<(Self, usize), RequestError> {
        let mut headers = [httparse::EMPTY_HEADER; Self::MAX_HEADERS];
        let mut raw_req = httparse::Request::new(&mut headers);

        let body_offset = match raw_req.parse(buf)? {
            httparse::Status::Complete(offset) => offset,
            httparse::Status::Partial => return Err(RequestError::Incomplete),
        };

        let method: Method = match raw_req.method {
            Some(m) => m.parse().unwrap_or_else(|never| match never {}),
            None => return Err(RequestError::MissingField { field: "method" }),
        };

        let raw_path = raw_req
            .path
            .ok_or(RequestError::MissingField { field: "path" })?;

        let (path, query) = match raw_path.split_once('?') {
            Some((path, query)) => (decode_component(path, false), Some(query.to_owned())),
            None => (decode_component(raw_path, false), None),
        };

        let version = raw_req
            .version
            .ok_or(RequestError::MissingField { field: "version" })?;

        let mut header_map = Headers::with_capacity(raw_req.headers.len());
        for header in raw_req.headers.iter() {
            if let Ok(value) = std::str::from_utf8(header.value) {
                header_map.insert(header.name, value);
            }
        }

        let params = query.as_deref().map(parse_urlencoded).unwrap_or_default();

        Ok((
            Self {
                method,
                path,
                version,
                headers: header_map,
                query,
                body: Bytes::new(),
                params,
                parts: None,
            },
            body_offset,
        ))
    }

    /// Parses a complete request (head and `Content-Length` body) from `buf`.
    ///
    /// # Errors
    ///
    /// Same as [`parse`](Self::parse); a body shorter than `Content-Length`
    /// is reported as [`RequestError::Incomplete`].
    pub fn from_bytes(buf: &[u8]) -> Result<Self, RequestError> {
        let (request, offset) = Self::parse(buf)?;
        let end = match offset.checked_add(request.content_length().unwrap_or(0)) {
            Some(end) if end <= buf.len() => end,
            _ => return Err(RequestError::Incomplete),
        };
        Ok(request.with_body(Bytes::copy_from_slice(&buf[offset..end])))
    }

    /// Attaches the request body and decodes form parameters from it.
    ///
    /// `application/x-www-form-urlencoded` bodies append to the query-string
    /// parameters. `multipart/form-data` bodies are split into parts; plain
    /// (non-file) fields become parameters as well. A malformed multipart
    /// body is remembered and reported by [`parts`](Self::parts).
    #[must_use]
    pub fn with_body(mut self, body: Bytes) -> Self {
        let content_type = self.headers.get("content-type").unwrap_or_default();

        if is_form_urlencoded(content_type) {
            let form = String::from_utf8_lossy(&body);
            self.params.extend(parse_urlencoded(&form));
        } else if let Some(boundary) = multipart::boundary(content_type) {
            let parts = multipart::parse(&body, boundary);
            if let Ok(parts) = &parts {
                for part in parts.iter().filter(|part| !part.is_file()) {
                    let value = String::from_utf8_lossy(part.data()).into_owned();
                    self.params.push((part.name().to_owned(), value));
                }
            }
            self.parts = Some(parts);
        }

        self.body = body;
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Returns the percent-decoded request path (without the query string).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the HTTP minor version number (0 = HTTP/1.0, 1 = HTTP/1.1).
    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns the raw query string (without the leading `?`), if any.
    pub fn query_string(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// Returns the first value of a query or form parameter.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Returns the multipart parts of the body.
    ///
    /// `Ok(&[])` when the body is not `multipart/form-data`.
    ///
    /// # Errors
    ///
    /// The [`MultipartError`] recorded while splitting a malformed body.
    pub fn parts(&self) -> Result<&[Part], MultipartError> {
        match &self.parts {
            None => Ok(&[]),
            Some(Ok(parts)) => Ok(parts),
            Some(Err(e)) => Err(e.clone()),
        }
    }

    /// Returns the value of the first cookie named `name` sent with the request.
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies()
            .find(|(key, _)| *key == name)
            .map(|(_, value)| value)
    }

    /// Iterates over every `name=value` pair across all `Cookie` headers.
    pub fn cookies(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers
            .get_all("cookie")
            .flat_map(|header| header.split(';'))
            .filter_map(|pair| pair.trim().split_once('='))
            .map(|(name, value)| (name.trim(), unquote(value.trim())))
    }

    /// Returns `true` if the connection should be kept alive after this request.
    ///
    /// HTTP/1.1 defaults to keep-alive. HTTP/1.0 defaults to close unless
    /// `Connection: keep-alive` is explicitly set.
    pub fn is_keep_alive(&self) -> bool {
        match self.headers.get("connection") {
            Some(conn) => conn.eq_ignore_ascii_case("keep-alive"),
            None => self.version == 1,
        }
    }

    /// Returns the value of the `Content-Length` header parsed as a `usize`, if present.
    pub fn content_length(&self) -> Option<usize> {
        self.headers.get("content-length")?.trim().parse().ok()
    }
}

fn is_form_urlencoded(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .is_some_and(|media| media.trim().eq_ignore_ascii_case("application/x-www-form-urlencoded"))
}

/// Parses `key=value&key2=value2` into ordered, percent-decoded pairs.
///
/// `+` decodes to a space; invalid UTF-8 after decoding is replaced lossily.
fn parse_urlencoded(input: &str) -> Vec<(String, String)> {
    input
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (decode_component(key, true), decode_component(value, true))
        })
        .collect()
}

fn decode_component(raw: &str, plus_as_space: bool) -> String {
    if plus_as_space && raw.contains('+') {
        percent_decode_str(&raw.replace('+', " "))
            .decode_utf8_lossy()
            .into_owned()
    } else {
        percent_decode_str(raw).decode_utf8_lossy().into_owned()
    }
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}
