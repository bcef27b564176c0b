//! The single pending response decision of an exchange.
//!
//! An [`Outcome`] is a sum type: assigning a new variant discards the old one
//! wholesale, so there is never more than one active response. The [`Model`]
//! lives next to it and is never touched by outcome changes.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use serde_json::{Map, Value};

use crate::http::StatusCode;

/// Key/value context handed to template rendering.
pub type Model = Map<String, Value>;

/// What the dispatcher should send back for this exchange.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Outcome {
    /// No decision yet; rendered as `404` if it is still unset after the app ran.
    #[default]
    Unset,
    /// Render the named template with the model as context.
    Template { name: String },
    /// Send a JSON document as `application/json`.
    Json { body: String },
    /// Send raw bytes with the given content type.
    Content { bytes: Bytes, content_type: String },
    /// Send the contents of a file on disk.
    Download(Download),
    /// Redirect the client to another URL.
    Redirect { location: String },
    /// Send a plain-text error with the given status.
    Error { status: StatusCode, message: String },
}

impl Outcome {
    /// Returns `true` unless the outcome is [`Outcome::Unset`].
    pub fn is_set(&self) -> bool {
        !matches!(self, Outcome::Unset)
    }

    /// Short variant name, used in log records.
    pub fn kind(&self) -> &'static str {
        match self {
            Outcome::Unset => "unset",
            Outcome::Template { .. } => "template",
            Outcome::Json { .. } => "json",
            Outcome::Content { .. } => "content",
            Outcome::Download(_) => "download",
            Outcome::Redirect { .. } => "redirect",
            Outcome::Error { .. } => "error",
        }
    }
}

/// A pending file download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Download {
    path: PathBuf,
    name: String,
    content_type: String,
    delete_after_send: bool,
}

impl Download {
    pub fn new(
        path: impl Into<PathBuf>,
        name: impl Into<String>,
        content_type: impl Into<String>,
        delete_after_send: bool,
    ) -> Self {
        Self {
            path: path.into(),
            name: name.into(),
            content_type: content_type.into(),
            delete_after_send,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Display name offered to the client; empty means "show inline".
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn delete_after_send(&self) -> bool {
        self.delete_after_send
    }

    /// Returns `true` when a `Content-Disposition: attachment` header applies.
    pub fn is_attachment(&self) -> bool {
        !self.name.is_empty()
    }
}
