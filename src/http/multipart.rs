//! `multipart/form-data` body splitting (RFC 7578).
//!
//! The parser is deliberately small: it splits a fully buffered body on the
//! boundary delimiter, reads each part's `Content-Disposition` and
//! `Content-Type` headers, and keeps the part data as a zero-copy slice of
//! the original [`Bytes`]. Nested multipart bodies and transfer encodings are
//! not interpreted.

use bytes::Bytes;
use thiserror::Error;

/// Errors produced while splitting a multipart body.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MultipartError {
    #[error("content type has no multipart boundary")]
    MissingBoundary,

    #[error("multipart body does not contain the opening boundary")]
    MissingOpeningBoundary,

    #[error("multipart part has no header terminator")]
    UnterminatedHeaders,

    #[error("multipart part is not closed by a boundary")]
    UnterminatedPart,

    #[error("multipart part has no form-data name")]
    MissingName,
}

/// One part of a `multipart/form-data` body.
#[derive(Debug, Clone)]
pub struct Part {
    name: String,
    filename: Option<String>,
    content_type: Option<String>,
    data: Bytes,
}

impl Part {
    /// The form field name from `Content-Disposition`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The submitted filename, present only for file fields.
    pub fn filename(&self) -> Option<&str> {
        self.filename.as_deref()
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Returns `true` if this part carries a file rather than a plain field.
    pub fn is_file(&self) -> bool {
        self.filename.is_some()
    }
}

/// Extracts the `boundary` parameter from a `multipart/form-data` content type.
///
/// Returns `None` for other media types.
pub fn boundary(content_type: &str) -> Option<&str> {
    let mut params = content_type.split(';');
    let media_type = params.next()?.trim();
    if !media_type.eq_ignore_ascii_case("multipart/form-data") {
        return None;
    }
    params
        .filter_map(|param| param.trim().split_once('='))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case("boundary"))
        .map(|(_, value)| unquote(value.trim()))
        .filter(|value| !value.is_empty())
}

/// Splits `body` into its parts using `boundary`.
///
/// # Errors
///
/// Any structural problem (missing delimiters, unterminated headers, a part
/// without a name) is reported as a [`MultipartError`]; partial results are
/// never returned.
pub fn parse(body: &Bytes, boundary: &str) -> Result<Vec<Part>, MultipartError> {
    if boundary.is_empty() {
        return Err(MultipartError::MissingBoundary);
    }

    let delimiter = format!("--{boundary}");
    let delimiter = delimiter.as_bytes();
    let closing = [b"\r\n", delimiter].concat();

    let mut pos = find(body, delimiter, 0).ok_or(MultipartError::MissingOpeningBoundary)?
        + delimiter.len();
    let mut parts = Vec::new();

    loop {
        // `--` right after a delimiter closes the body.
        if body[pos..].starts_with(b"--") {
            break;
        }
        if body[pos..].starts_with(b"\r\n") {
            pos += 2;
        }

        let headers_end =
            find(body, b"\r\n\r\n", pos).ok_or(MultipartError::UnterminatedHeaders)?;
        let head = String::from_utf8_lossy(&body[pos..headers_end]);
        let data_start = headers_end + 4;
        let data_end = find(body, &closing, data_start).ok_or(MultipartError::UnterminatedPart)?;

        parts.push(parse_part(&head, body.slice(data_start..data_end))?);
        pos = data_end + closing.len();
    }

    Ok(parts)
}

fn parse_part(head: &str, data: Bytes) -> Result<Part, MultipartError> {
    let mut name = None;
    let mut filename = None;
    let mut content_type = None;

    for line in head.split("\r\n") {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim();
        if key.eq_ignore_ascii_case("content-disposition") {
            for param in value.split(';').skip(1) {
                match param.trim().split_once('=') {
                    Some((k, v)) if k.trim().eq_ignore_ascii_case("name") => {
                        name = Some(unquote(v.trim()).to_owned());
                    }
                    Some((k, v)) if k.trim().eq_ignore_ascii_case("filename") => {
                        filename = Some(unquote(v.trim()).to_owned());
                    }
                    _ => {}
                }
            }
        } else if key.eq_ignore_ascii_case("content-type") {
            content_type = Some(value.trim().to_owned());
        }
    }

    Ok(Part {
        name: name.ok_or(MultipartError::MissingName)?,
        filename,
        content_type,
        data,
    })
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}

// Byte-wise substring search starting at `from`.
fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from > haystack.len() || needle.is_empty() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|offset| from + offset)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOUNDARY: &str = "XyZ123";

    fn sample_body() -> Bytes {
        Bytes::from_static(
            b"--XyZ123\r\n\
              Content-Disposition: form-data; name=\"title\"\r\n\
              \r\n\
              Quarterly report\r\n\
              --XyZ123\r\n\
              Content-Disposition: form-data; name=\"report\"; filename=\"q3.csv\"\r\n\
              Content-Type: text/csv\r\n\
              \r\n\
              a,b\r\n1,2\r\n\
              --XyZ123--\r\n",
        )
    }

    #[test]
    fn boundary_from_content_type() {
        assert_eq!(
            boundary("multipart/form-data; boundary=XyZ123"),
            Some("XyZ123")
        );
        assert_eq!(
            boundary("Multipart/Form-Data; charset=utf-8; boundary=\"quoted\""),
            Some("quoted")
        );
        assert_eq!(boundary("application/x-www-form-urlencoded"), None);
        assert_eq!(boundary("multipart/form-data"), None);
    }

    #[test]
    fn splits_fields_and_files() {
        let parts = parse(&sample_body(), BOUNDARY).unwrap();
        assert_eq!(parts.len(), 2);

        assert_eq!(parts[0].name(), "title");
        assert!(!parts[0].is_file());
        assert_eq!(&parts[0].data()[..], b"Quarterly report");

        assert_eq!(parts[1].name(), "report");
        assert_eq!(parts[1].filename(), Some("q3.csv"));
        assert_eq!(parts[1].content_type(), Some("text/csv"));
        // CRLF inside the data is preserved; only the delimiter's CRLF is stripped.
        assert_eq!(&parts[1].data()[..], b"a,b\r\n1,2");
    }

    #[test]
    fn missing_opening_boundary() {
        let body = Bytes::from_static(b"no delimiters here");
        assert_eq!(
            parse(&body, BOUNDARY).unwrap_err(),
            MultipartError::MissingOpeningBoundary
        );
    }

    #[test]
    fn unterminated_part() {
        let body = Bytes::from_static(
            b"--XyZ123\r\nContent-Disposition: form-data; name=\"a\"\r\n\r\nvalue",
        );
        assert_eq!(
            parse(&body, BOUNDARY).unwrap_err(),
            MultipartError::UnterminatedPart
        );
    }

    #[test]
    fn part_without_name() {
        let body = Bytes::from_static(
            b"--XyZ123\r\nContent-Type: text/plain\r\n\r\nvalue\r\n--XyZ123--",
        );
        assert_eq!(parse(&body, BOUNDARY).unwrap_err(), MultipartError::MissingName);
    }
}
