//! Read-only handle on one uploaded file.

use bytes::buf::Reader;
use bytes::{Buf, Bytes};

use crate::http::multipart::Part;

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// An uploaded `multipart/form-data` field.
///
/// The data is shared with the request body, so cloning a handle or opening
/// it several times does not copy the upload.
#[derive(Debug, Clone)]
pub struct FileUpload {
    name: String,
    content_type: String,
    submitted_file_name: Option<String>,
    data: Bytes,
}

impl FileUpload {
    pub(crate) fn from_part(part: &Part) -> Self {
        Self {
            name: part.name().to_owned(),
            content_type: part
                .content_type()
                .unwrap_or(DEFAULT_CONTENT_TYPE)
                .to_owned(),
            submitted_file_name: part.filename().map(str::to_owned),
            data: part.data().clone(),
        }
    }

    /// The name of the HTML form field.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The declared content type, `application/octet-stream` when the client sent none.
    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    /// The client-side file name, absent for plain form fields.
    pub fn submitted_file_name(&self) -> Option<&str> {
        self.submitted_file_name.as_deref()
    }

    /// The size of the upload in bytes.
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    /// Opens a reader over the uploaded bytes. The reader is released when dropped.
    pub fn open(&self) -> Reader<Bytes> {
        self.data.clone().reader()
    }
}
