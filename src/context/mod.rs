//! Per-request context: the facade an application sees.
//!
//! A [`WebRequest`] is created fresh for every exchange by the
//! [`Dispatcher`](crate::dispatcher::Dispatcher), handed to the application
//! exactly once, then inspected and dropped. It exposes:
//!
//! - request data: method, logical path, parameters, uploads, incoming cookies
//! - request-scoped attributes
//! - session values, delegated to the injected [`SessionStore`]
//! - the outgoing [`CookieJar`]
//! - the template [`Model`]
//! - the single pending [`Outcome`]
//!
//! "Required" accessors return [`WebError::NotFound`] when the value is
//! absent; each has an `*_or` twin that falls back to a default instead.

pub mod cookie;
pub mod outcome;
pub mod upload;

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use serde_json::Value;
use thiserror::Error;

use crate::http::{Request, StatusCode};
use crate::session::{SESSION_COOKIE, SessionStore};

pub use cookie::{Cookie, CookieJar};
pub use outcome::{Download, Model, Outcome};
pub use upload::FileUpload;

/// Content type used by [`WebRequest::set_html_content`].
pub const HTML_CONTENT_TYPE: &str = "text/html; charset=utf8";
/// Content type used by [`WebRequest::set_text_content`].
pub const TEXT_CONTENT_TYPE: &str = "text/plain; charset=utf8";

/// Which kind of value a failed lookup was for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    Parameter,
    Attribute,
    Session,
    Cookie,
    Model,
}

impl fmt::Display for Lookup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Lookup::Parameter => "parameter",
            Lookup::Attribute => "attribute",
            Lookup::Session => "session value",
            Lookup::Cookie => "cookie",
            Lookup::Model => "model value",
        })
    }
}

/// Errors returned by [`WebRequest`] accessors.
#[derive(Debug, Error)]
pub enum WebError {
    #[error("{what} \"{name}\" not found")]
    NotFound { what: Lookup, name: String },

    #[error("cannot read request body: {0}")]
    Io(#[from] io::Error),
}

impl WebError {
    fn not_found(what: Lookup, name: &str) -> Self {
        WebError::NotFound {
            what,
            name: name.to_owned(),
        }
    }

    /// Returns `true` for [`WebError::NotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self, WebError::NotFound { .. })
    }
}

/// The per-exchange facade handed to [`App::serve`](crate::app::App::serve).
pub struct WebRequest {
    method: String,
    path: String,
    request: Request,
    attributes: HashMap<String, Value>,
    sessions: Arc<dyn SessionStore>,
    session_id: Option<String>,
    cookies: CookieJar,
    model: Model,
    outcome: Outcome,
}

impl WebRequest {
    /// Binds a new context to `request`.
    ///
    /// `path` is the logical path, already stripped of the mount prefix. The
    /// context joins the session named by the incoming session cookie if the
    /// store still knows it.
    pub fn new(path: impl Into<String>, request: Request, sessions: Arc<dyn SessionStore>) -> Self {
        let session_id = request
            .cookie(SESSION_COOKIE)
            .filter(|id| sessions.exists(id))
            .map(str::to_owned);

        Self {
            method: request.method().as_str().to_owned(),
            path: path.into(),
            request,
            attributes: HashMap::new(),
            sessions,
            session_id,
            cookies: CookieJar::new(),
            model: Model::new(),
            outcome: Outcome::Unset,
        }
    }

    // ── request ──────────────────────────────────────────────────────────────

    /// The HTTP method, uppercase.
    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn is_get(&self) -> bool {
        self.method == "GET"
    }

    pub fn is_post(&self) -> bool {
        self.method == "POST"
    }

    /// The logical path: mount prefix and leading `/` removed.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The underlying transport request, for headers and the raw body.
    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn has_parameter(&self, name: &str) -> bool {
        self.request.param(name).is_some()
    }

    /// Returns a query or form parameter.
    ///
    /// # Errors
    ///
    /// [`WebError::NotFound`] exactly when [`has_parameter`](Self::has_parameter) is false.
    pub fn parameter(&self, name: &str) -> Result<&str, WebError> {
        self.request
            .param(name)
            .ok_or_else(|| WebError::not_found(Lookup::Parameter, name))
    }

    pub fn parameter_or<'a>(&'a self, name: &str, default: &'a str) -> &'a str {
        self.request.param(name).unwrap_or(default)
    }

    /// Looks up an uploaded multipart field by name.
    ///
    /// # Errors
    ///
    /// [`WebError::Io`] if the multipart body could not be parsed. A missing
    /// field is `Ok(None)`, not an error.
    pub fn find_file_upload(&self, name: &str) -> Result<Option<FileUpload>, WebError> {
        let parts = self
            .request
            .parts()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(parts
            .iter()
            .find(|part| part.name() == name)
            .map(FileUpload::from_part))
    }

    // ── attributes ───────────────────────────────────────────────────────────

    pub fn put_attribute(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.attributes.insert(key.into(), value.into());
    }

    /// # Errors
    ///
    /// [`WebError::NotFound`] if no attribute is stored under `key`.
    pub fn attribute(&self, key: &str) -> Result<&Value, WebError> {
        self.attributes
            .get(key)
            .ok_or_else(|| WebError::not_found(Lookup::Attribute, key))
    }

    pub fn attribute_or(&self, key: &str, default: impl Into<Value>) -> Value {
        self.attributes
            .get(key)
            .cloned()
            .unwrap_or_else(|| default.into())
    }

    // ── session ──────────────────────────────────────────────────────────────

    /// Stores a session value, creating the session on first write.
    ///
    /// A new session also stages the session cookie on the response.
    pub fn put_session(&mut self, key: &str, value: impl Into<Value>) {
        let id = match self.session_id.clone() {
            Some(id) => id,
            None => {
                let id = self.sessions.create();
                self.cookies.add(Cookie::new(SESSION_COOKIE, id.clone(), 0, false));
                self.session_id = Some(id.clone());
                id
            }
        };
        self.sessions.put(&id, key, value.into());
    }

    /// # Errors
    ///
    /// [`WebError::NotFound`] if there is no session, or the session has no
    /// value under `key`.
    pub fn session(&self, key: &str) -> Result<Value, WebError> {
        self.session_id
            .as_deref()
            .and_then(|id| self.sessions.get(id, key))
            .ok_or_else(|| WebError::not_found(Lookup::Session, key))
    }

    pub fn session_or(&self, key: &str, default: impl Into<Value>) -> Value {
        self.session(key).unwrap_or_else(|_| default.into())
    }

    /// Removes a session value. No-op without a session.
    pub fn remove_session(&mut self, key: &str) {
        if let Some(id) = &self.session_id {
            self.sessions.remove(id, key);
        }
    }

    /// Invalidates the whole session. No-op without a session.
    ///
    /// For the rest of the exchange the request behaves as having no session;
    /// a later [`put_session`](Self::put_session) starts a fresh one.
    pub fn kill_session(&mut self) {
        if let Some(id) = self.session_id.take() {
            self.sessions.invalidate(&id);
        }
    }

    /// Returns `true` if this request is bound to a live session.
    pub fn has_session(&self) -> bool {
        self.session_id.is_some()
    }

    // ── cookies ──────────────────────────────────────────────────────────────

    /// Returns the value of a cookie sent with the request.
    ///
    /// # Errors
    ///
    /// [`WebError::NotFound`] if the request carried no such cookie.
    pub fn cookie_value(&self, name: &str) -> Result<&str, WebError> {
        self.request
            .cookie(name)
            .ok_or_else(|| WebError::not_found(Lookup::Cookie, name))
    }

    pub fn cookie_value_or<'a>(&'a self, name: &str, default: &'a str) -> &'a str {
        self.request.cookie(name).unwrap_or(default)
    }

    /// Stages a cookie for the response. Incoming cookies are not affected.
    pub fn add_cookie(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
        max_age_secs: i64,
        secure: bool,
    ) {
        self.cookies
            .add(Cookie::new(name, value, max_age_secs, secure));
    }

    /// The cookies staged so far, in order.
    pub fn added_cookies(&self) -> &CookieJar {
        &self.cookies
    }

    // ── model ────────────────────────────────────────────────────────────────

    pub fn put_model(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.model.insert(key.into(), value.into());
    }

    /// # Errors
    ///
    /// [`WebError::NotFound`] if the model has no value under `key`.
    pub fn model_value(&self, key: &str) -> Result<&Value, WebError> {
        self.model
            .get(key)
            .ok_or_else(|| WebError::not_found(Lookup::Model, key))
    }

    pub fn model_value_or(&self, key: &str, default: impl Into<Value>) -> Value {
        self.model
            .get(key)
            .cloned()
            .unwrap_or_else(|| default.into())
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    // ── outcome ──────────────────────────────────────────────────────────────

    /// Returns `true` once any outcome setter has been called.
    pub fn has_response(&self) -> bool {
        self.outcome.is_set()
    }

    pub fn outcome(&self) -> &Outcome {
        &self.outcome
    }

    pub fn set_template(&mut self, name: impl Into<String>) {
        self.outcome = Outcome::Template { name: name.into() };
    }

    pub fn set_json(&mut self, json: impl Into<String>) {
        self.outcome = Outcome::Json { body: json.into() };
    }

    pub fn set_content(&mut self, bytes: impl Into<Bytes>, content_type: impl Into<String>) {
        self.outcome = Outcome::Content {
            bytes: bytes.into(),
            content_type: content_type.into(),
        };
    }

    /// Sets UTF-8 HTML content (`text/html; charset=utf8`).
    pub fn set_html_content(&mut self, html: impl Into<String>) {
        let html: String = html.into();
        self.set_content(html, HTML_CONTENT_TYPE);
    }

    /// Sets UTF-8 plain-text content (`text/plain; charset=utf8`).
    pub fn set_text_content(&mut self, text: impl Into<String>) {
        let text: String = text.into();
        self.set_content(text, TEXT_CONTENT_TYPE);
    }

    /// Sends a file. An empty `name` shows the file inline instead of as an
    /// attachment.
    pub fn set_download(
        &mut self,
        file: impl Into<PathBuf>,
        name: impl Into<String>,
        content_type: impl Into<String>,
        delete_after_send: bool,
    ) {
        self.outcome = Outcome::Download(Download::new(file, name, content_type, delete_after_send));
    }

    pub fn set_redirect(&mut self, location: impl Into<String>) {
        self.outcome = Outcome::Redirect {
            location: location.into(),
        };
    }

    /// Sets an error outcome.
    ///
    /// `status` must be a three-digit code (100 to 999); anything else is
    /// sent as 500.
    pub fn set_error(&mut self, status: u16, message: impl Into<String>) {
        let status = if (100..=999).contains(&status) {
            StatusCode::from_u16(status)
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        self.outcome = Outcome::Error {
            status,
            message: message.into(),
        };
    }

    /// Splits the context into what the dispatcher needs to render it.
    pub(crate) fn into_parts(self) -> (Outcome, Model, CookieJar) {
        (self.outcome, self.model, self.cookies)
    }
}

impl fmt::Debug for WebRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebRequest")
            .field("method", &self.method)
            .field("path", &self.path)
            .field("session", &self.session_id.is_some())
            .field("outcome", &self.outcome.kind())
            .finish_non_exhaustive()
    }
}
