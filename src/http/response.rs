//! HTTP/1.1 response builder.
//!
//! The dispatcher fills a [`Response`] in place (status, headers and body are
//! decided at different steps of an exchange); the builder methods are kept
//! for the transport's own short responses.
//!
//! A body is either in memory or a [`FileBody`] that is streamed to the peer
//! by [`Response::write_to`] without being loaded first.

use std::io;
use std::path::PathBuf;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::warn;

use super::{Headers, StatusCode};

/// A response body read from an open file while it is being sent.
#[derive(Debug)]
pub struct FileBody {
    file: File,
    len: u64,
    remove_after: Option<PathBuf>,
}

impl FileBody {
    /// Streams the first `len` bytes of `file`.
    pub fn new(file: File, len: u64) -> Self {
        Self {
            file,
            len,
            remove_after: None,
        }
    }

    /// Deletes `path` once the body has been written, or the write failed.
    #[must_use]
    pub fn remove_after(mut self, path: impl Into<PathBuf>) -> Self {
        self.remove_after = Some(path.into());
        self
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    async fn copy_to<W>(self, out: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let Self {
            file,
            len,
            remove_after,
        } = self;
        let copied = tokio::io::copy(&mut file.take(len), out).await;

        if let Some(path) = remove_after {
            if let Err(e) = fs::remove_file(&path).await {
                warn!(file = %path.display(), error = %e, "cannot delete file after sending");
            }
        }

        match copied? {
            n if n == len => Ok(()),
            n => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("file ended after {n} of {len} bytes"),
            )),
        }
    }
}

/// An HTTP/1.1 response, ready to be serialized and sent.
///
/// # Examples
///
/// ```
/// use webby::http::{Response, StatusCode};
///
/// let response = Response::redirect("/login");
/// assert_eq!(response.status(), StatusCode::FOUND);
///
/// let bytes = response.into_bytes();
/// let text = std::str::from_utf8(&bytes).unwrap();
/// assert!(text.starts_with("HTTP/1.1 302 Found\r\n"));
/// assert!(text.contains("Location: /login\r\n"));
/// ```
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    headers: Headers,
    body: Bytes,
    file: Option<FileBody>,
    keep_alive: bool,
}

impl Response {
    /// Creates a new response with the given status and an empty body.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Bytes::new(),
            file: None,
            keep_alive: true,
        }
    }

    /// A `text/plain` response with the given status and body.
    pub fn text(status: StatusCode, body: impl Into<String>) -> Self {
        Self::new(status)
            .header("Content-Type", "text/plain")
            .body(body)
    }

    /// A `302 Found` response pointing at `location`.
    pub fn redirect(location: impl Into<String>) -> Self {
        Self::new(StatusCode::FOUND).header("Location", location)
    }

    /// Appends a response header. Multiple calls with the same name are additive.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Sets the response body from a string.
    ///
    /// The `Content-Length` header is written automatically by [`into_bytes`](Self::into_bytes).
    #[must_use]
    pub fn body(mut self, body: impl Into<String>) -> Self {
        let body: String = body.into();
        self.set_body(body);
        self
    }

    /// Controls whether `Connection: keep-alive` or `Connection: close` is written.
    #[must_use]
    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Appends a header in place.
    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(name, value);
    }

    /// Replaces any existing values of a header in place.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.set(name, value);
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    /// Sets an in-memory body, replacing any file body.
    pub fn set_body(&mut self, body: impl Into<Bytes>) {
        self.body = body.into();
        self.file = None;
    }

    /// Sets a streamed file body, replacing any in-memory body.
    pub fn set_file_body(&mut self, body: FileBody) {
        self.body = Bytes::new();
        self.file = Some(body);
    }

    pub fn set_keep_alive(&mut self, keep_alive: bool) {
        self.keep_alive = keep_alive;
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns the first value of the named header.
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// The in-memory body; empty when the body is a file.
    pub fn body_bytes(&self) -> &Bytes {
        &self.body
    }

    pub fn file_body(&self) -> Option<&FileBody> {
        self.file.as_ref()
    }

    /// Writes the response to `out`, streaming a file body if there is one.
    ///
    /// # Errors
    ///
    /// Any write error, or [`io::ErrorKind::UnexpectedEof`] if a file body
    /// turned out shorter than announced.
    pub async fn write_to<W>(mut self, out: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let file = self.file.take();
        let content_length = file
            .as_ref()
            .map_or(self.body.len() as u64, FileBody::len);
        out.write_all(&self.encode(content_length)).await?;

        match file {
            Some(file) => file.copy_to(out).await,
            None => Ok(()),
        }
    }

    /// Serializes the response into a `BytesMut` buffer using HTTP/1.1 wire format.
    ///
    /// Automatically adds:
    /// - `Content-Type: text/plain; charset=utf-8` if the body is non-empty and no
    ///   `Content-Type` header was set.
    /// - `Content-Length: <n>` (always written).
    /// - `Connection: keep-alive` or `Connection: close`.
    ///
    /// A file body is not read here: only the head is produced and the file
    /// is dropped. Use [`write_to`](Self::write_to) to send one.
    pub fn into_bytes(mut self) -> BytesMut {
        let content_length = match self.file.take() {
            Some(file) => file.len(),
            None => self.body.len() as u64,
        };
        self.encode(content_length)
    }

    fn encode(mut self, content_length: u64) -> BytesMut {
        if content_length > 0 && !self.headers.contains("content-type") {
            self.headers
                .insert("Content-Type", "text/plain; charset=utf-8");
        }

        let connection = if self.keep_alive {
            "keep-alive"
        } else {
            "close"
        };
        self.headers.set("Connection", connection);

        let estimated_size = 128 + self.headers.len() * 64 + self.body.len();
        let mut buf = BytesMut::with_capacity(estimated_size);

        buf.put(
            format!(
                "HTTP/1.1 {} {}\r\n",
                self.status.as_u16(),
                self.status.canonical_reason()
            )
            .as_bytes(),
        );

        for (name, value) in self.headers.iter() {
            buf.put(format!("{name}: {value}\r\n").as_bytes());
        }

        // Content-Length is always the last header before the blank line
        buf.put(format!("Content-Length: {content_length}\r\n").as_bytes());
        buf.put(&b"\r\n"[..]);

        if !self.body.is_empty() {
            buf.put(self.body);
        }

        buf
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new(StatusCode::OK)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn to_string(bytes: BytesMut) -> String {
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn simple_ok_response() {
        let r = Response::new(StatusCode::OK).body("Hello");
        let s = to_string(r.into_bytes());
        assert!(s.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(s.contains("Content-Length: 5\r\n"));
        assert!(s.ends_with("\r\n\r\nHello"));
    }

    #[test]
    fn in_place_mutation() {
        let mut r = Response::default();
        r.add_header("Set-Cookie", "a=1");
        r.add_header("Set-Cookie", "b=2");
        r.set_status(StatusCode::from_u16(418));
        r.set_body(Bytes::from_static(b"\x00\x01"));
        assert_eq!(r.headers().get_all("set-cookie").count(), 2);

        let bytes = r.into_bytes();
        assert!(bytes.starts_with(b"HTTP/1.1 418 I'm a teapot\r\n"));
        assert!(bytes.ends_with(b"\r\n\r\n\x00\x01"));
    }

    #[test]
    fn text_response_has_plain_content_type() {
        let r = Response::text(StatusCode::NOT_FOUND, "nope");
        assert_eq!(r.header_value("content-type"), Some("text/plain"));
        let s = to_string(r.into_bytes());
        assert!(s.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(!s.contains("charset=utf-8"));
    }

    #[test]
    fn no_body_no_content_type() {
        let r = Response::new(StatusCode::NO_CONTENT);
        let s = to_string(r.into_bytes());
        assert!(!s.contains("Content-Type"));
        assert!(s.contains("Content-Length: 0\r\n"));
    }

    #[test]
    fn connection_close() {
        let r = Response::new(StatusCode::OK).keep_alive(false);
        let s = to_string(r.into_bytes());
        assert!(s.contains("Connection: close\r\n"));
    }

    #[test]
    fn header_values_cannot_inject_lines() {
        let r = Response::redirect("/home\r\nSet-Cookie: admin=1");
        let s = to_string(r.into_bytes());
        assert!(s.contains("Location: /homeSet-Cookie: admin=1\r\n"));
        assert!(!s.contains("\r\nSet-Cookie"));
    }

    #[tokio::test]
    async fn write_to_streams_file_and_removes_it() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.bin");
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &data).unwrap();

        let file = File::open(&path).await.unwrap();
        let mut r = Response::new(StatusCode::OK).header("Content-Type", "application/octet-stream");
        r.set_file_body(FileBody::new(file, data.len() as u64).remove_after(&path));
        assert!(r.body_bytes().is_empty());
        assert_eq!(r.file_body().map(FileBody::len), Some(100_000));

        let mut out = Vec::new();
        r.write_to(&mut out).await.unwrap();

        let head_end = out.windows(4).position(|w| w == b"\r\n\r\n").unwrap() + 4;
        let head = std::str::from_utf8(&out[..head_end]).unwrap();
        assert!(head.contains("Content-Length: 100000\r\n"));
        assert_eq!(&out[head_end..], &data[..]);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn short_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.txt");
        std::fs::write(&path, "abc").unwrap();

        let file = File::open(&path).await.unwrap();
        let mut r = Response::new(StatusCode::OK);
        r.set_file_body(FileBody::new(file, 10));

        let mut out = Vec::new();
        let err = r.write_to(&mut out).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
        assert!(path.exists());
    }

    #[tokio::test]
    async fn set_body_replaces_file_body() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.txt");
        std::fs::write(&path, "file").unwrap();

        let mut r = Response::default();
        r.set_file_body(FileBody::new(File::open(&path).await.unwrap(), 4));
        r.set_body("memory");
        assert!(r.file_body().is_none());

        let mut out = Vec::new();
        r.write_to(&mut out).await.unwrap();
        assert!(out.ends_with(b"\r\n\r\nmemory"));
    }
}
