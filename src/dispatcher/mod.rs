//! Turns one transport request into one response.
//!
//! For every exchange the [`Dispatcher`] builds a fresh [`WebRequest`],
//! invokes the application exactly once, then renders whatever outcome the
//! application left behind. Application failures never escape: an `Err` or a
//! panic becomes a 500 error outcome. Only rendering failures the dispatcher
//! cannot answer itself (a broken template, an unreadable download) are
//! returned as [`DispatchError`].
//!
//! Downloads are not read here: the response carries the open file and the
//! transport streams it, deleting the file afterwards when asked to.

use std::any::Any;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use thiserror::Error;
use tokio::fs;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::app::{App, AppContext, AppError, AppFactory};
use crate::config::Config;
use crate::context::{Download, Model, Outcome, WebRequest};
use crate::http::{FileBody, Request, Response, StatusCode};
use crate::session::{MemorySessionStore, SessionStore};
use crate::template::{FileTemplates, RenderError, TemplateEngine};

/// Content type of rendered templates.
pub const TEMPLATE_CONTENT_TYPE: &str = "text/html; charset=utf-8";
const JSON_CONTENT_TYPE: &str = "application/json";
const ERROR_CONTENT_TYPE: &str = "text/plain";
const DOWNLOAD_CONTENT_TYPE: &str = "application/octet-stream";

/// 500 message used when the failure text is hidden or empty.
const GENERIC_ERROR: &str = "internal server error";

const DEFAULT_SLOW_THRESHOLD: Duration = Duration::from_secs(3);

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("template rendering failed: {0}")]
    Render(#[from] RenderError),

    #[error("cannot open download: {0}")]
    Io(#[from] io::Error),
}

/// Hosts one application under a mount prefix.
///
/// Immutable once built; share it between connections with an [`Arc`].
pub struct Dispatcher {
    app: Box<dyn App>,
    templates: Arc<dyn TemplateEngine>,
    sessions: Arc<dyn SessionStore>,
    /// Mount prefix without a trailing `/`; empty when mounted at the root.
    mount: String,
    expose_errors: bool,
    slow_threshold: Duration,
}

impl Dispatcher {
    /// Creates a dispatcher mounted at `/` with an in-memory session store.
    pub fn new(app: Box<dyn App>, templates: Arc<dyn TemplateEngine>) -> Self {
        Self {
            app,
            templates,
            sessions: Arc::new(MemorySessionStore::new()),
            mount: String::new(),
            expose_errors: true,
            slow_threshold: DEFAULT_SLOW_THRESHOLD,
        }
    }

    /// Builds the application through `factory` and wires everything the
    /// configuration describes.
    ///
    /// # Errors
    ///
    /// Whatever `factory` returns.
    pub fn from_config(config: &Config, factory: AppFactory) -> Result<Self, AppError> {
        let app = factory(&AppContext::from_config(config))?;
        let templates =
            FileTemplates::new(config.template_root()).with_cache(config.template_cache());

        info!(
            mount = config.mount(),
            templates = %config.template_root().display(),
            "application initialised"
        );

        Ok(Self::new(app, Arc::new(templates))
            .with_sessions(Arc::new(MemorySessionStore::with_ttl(config.session_ttl())))
            .with_mount(config.mount())
            .expose_errors(config.expose_errors())
            .slow_threshold(config.slow_request()))
    }

    #[must_use]
    pub fn with_sessions(mut self, sessions: Arc<dyn SessionStore>) -> Self {
        self.sessions = sessions;
        self
    }

    #[must_use]
    pub fn with_mount(mut self, mount: impl Into<String>) -> Self {
        self.mount = mount.into().trim_end_matches('/').to_owned();
        self
    }

    /// Whether 500 bodies carry the failure text or a generic message.
    #[must_use]
    pub fn expose_errors(mut self, expose: bool) -> Self {
        self.expose_errors = expose;
        self
    }

    /// Exchanges slower than this are logged at `info` instead of `debug`.
    #[must_use]
    pub fn slow_threshold(mut self, threshold: Duration) -> Self {
        self.slow_threshold = threshold;
        self
    }

    pub fn sessions(&self) -> &Arc<dyn SessionStore> {
        &self.sessions
    }

    /// Returns `true` if `path` lies under the mount prefix.
    pub fn is_mounted(&self, path: &str) -> bool {
        self.logical_path(path).is_some()
    }

    /// Strips the mount prefix and the leading `/` from a request path.
    ///
    /// `None` if the path is outside the mount.
    pub fn logical_path<'a>(&self, path: &'a str) -> Option<&'a str> {
        let rest = path.strip_prefix(self.mount.as_str())?;
        if !rest.is_empty() && !rest.starts_with('/') {
            return None;
        }
        Some(rest.trim_start_matches('/'))
    }

    /// Handles one exchange.
    ///
    /// # Errors
    ///
    /// [`DispatchError`] when the outcome cannot be rendered. Application
    /// failures are not errors here; they produce a 500 response.
    pub async fn dispatch(&self, request: Request) -> Result<Response, DispatchError> {
        let start = Instant::now();

        let path = self
            .logical_path(request.path())
            .unwrap_or_else(|| request.path().trim_start_matches('/'))
            .to_owned();
        let mut req = WebRequest::new(path, request, Arc::clone(&self.sessions));

        self.invoke(&mut req);

        let method = req.method().to_owned();
        let path = req.path().to_owned();
        let (outcome, model, cookies) = req.into_parts();
        let kind = outcome.kind();

        let mut response = Response::new(StatusCode::OK);
        for cookie in &cookies {
            response.add_header("Set-Cookie", cookie.to_string());
        }

        let rendered = self
            .render(outcome, model, &method, &path, &mut response)
            .await;

        let elapsed = start.elapsed();
        let status = response.status().as_u16();
        if elapsed > self.slow_threshold {
            info!(%method, %path, outcome = kind, status, ?elapsed, "slow request");
        } else {
            debug!(%method, %path, outcome = kind, status, ?elapsed, "request handled");
        }

        rendered.map(|()| response)
    }

    /// Calls [`App::destroy`]. The server does this once on shutdown.
    pub fn destroy(&self) {
        self.app.destroy();
        info!("application destroyed");
    }

    fn invoke(&self, req: &mut WebRequest) {
        let failure = match panic::catch_unwind(AssertUnwindSafe(|| self.app.serve(req))) {
            Ok(Ok(())) => return,
            Ok(Err(e)) => {
                warn!(method = req.method(), path = req.path(), error = ?e, "application failed");
                e.to_string()
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                warn!(method = req.method(), path = req.path(), panic = %message, "application panicked");
                message
            }
        };

        let message = if self.expose_errors && !failure.is_empty() {
            failure
        } else {
            GENERIC_ERROR.to_owned()
        };
        req.set_error(StatusCode::INTERNAL_SERVER_ERROR.as_u16(), message);
    }

    async fn render(
        &self,
        outcome: Outcome,
        mut model: Model,
        method: &str,
        path: &str,
        response: &mut Response,
    ) -> Result<(), DispatchError> {
        match outcome {
            Outcome::Template { name } => {
                model
                    .entry("req")
                    .or_insert_with(|| json!({ "method": method, "path": path }));
                let body = self.templates.render(&name, &model)?;
                response.set_header("Content-Type", TEMPLATE_CONTENT_TYPE);
                response.set_body(body);
            }
            Outcome::Json { body } => {
                response.set_header("Content-Type", JSON_CONTENT_TYPE);
                response.set_body(body);
            }
            Outcome::Content {
                bytes,
                content_type,
            } => {
                response.set_header("Content-Type", content_type);
                response.set_body(bytes);
            }
            Outcome::Download(download) => send_file(&download, response).await?,
            Outcome::Redirect { location } => {
                response.set_status(StatusCode::FOUND);
                response.set_header("Location", location);
            }
            Outcome::Error { status, message } => error_page(response, status, &message),
            Outcome::Unset => error_page(
                response,
                StatusCode::NOT_FOUND,
                &format!("path \"{path}\" did not produce any result"),
            ),
        }
        Ok(())
    }
}

async fn send_file(download: &Download, response: &mut Response) -> Result<(), DispatchError> {
    let path = download.path();
    let is_file = matches!(fs::metadata(path).await, Ok(meta) if meta.is_file());
    if !is_file {
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy())
            .unwrap_or_default();
        error_page(
            response,
            StatusCode::NOT_FOUND,
            &format!("download file not found: \"{file_name}\""),
        );
        return Ok(());
    }

    let file = fs::File::open(path).await?;
    let len = file.metadata().await?.len();
    let mut body = FileBody::new(file, len);
    if download.delete_after_send() {
        body = body.remove_after(path);
    }

    let content_type = match download.content_type() {
        "" => DOWNLOAD_CONTENT_TYPE,
        content_type => content_type,
    };
    response.set_header("Content-Type", content_type);
    if download.is_attachment() {
        response.set_header(
            "Content-Disposition",
            format!("attachment; filename={}", download.name()),
        );
    }
    response.set_file_body(body);
    Ok(())
}

fn error_page(response: &mut Response, status: StatusCode, message: &str) {
    response.set_status(status);
    response.set_header("Content-Type", ERROR_CONTENT_TYPE);
    response.set_body(format!("status {}: {message}\r\n", status.as_u16()));
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        String::new()
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, Ordering};

    use serde_json::Value;

    use super::*;
    use crate::session::SESSION_COOKIE;

    /// Renders `name:` followed by the JSON of the context.
    struct EchoTemplates;

    impl TemplateEngine for EchoTemplates {
        fn render(&self, name: &str, context: &Model) -> Result<Vec<u8>, RenderError> {
            if name == "missing.html" {
                return Err(RenderError::NotFound {
                    name: name.to_owned(),
                });
            }
            Ok(format!("{name}:{}", Value::Object(context.clone())).into_bytes())
        }
    }

    fn dispatcher<F>(app: F) -> Dispatcher
    where
        F: Fn(&mut WebRequest) -> Result<(), AppError> + Send + Sync + 'static,
    {
        Dispatcher::new(Box::new(app), Arc::new(EchoTemplates))
    }

    async fn send(dispatcher: &Dispatcher, raw: &str) -> Response {
        let request = Request::from_bytes(raw.as_bytes()).unwrap();
        dispatcher.dispatch(request).await.unwrap()
    }

    async fn get(dispatcher: &Dispatcher, target: &str) -> Response {
        send(dispatcher, &format!("GET {target} HTTP/1.1\r\nHost: localhost\r\n\r\n")).await
    }

    fn body(response: &Response) -> String {
        String::from_utf8(response.body_bytes().to_vec()).unwrap()
    }

    #[tokio::test]
    async fn text_content() {
        let d = dispatcher(|req| {
            req.set_text_content("hello");
            Ok(())
        });
        let response = get(&d, "/greet").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.header_value("content-type"), Some("text/plain; charset=utf8"));
        assert_eq!(body(&response), "hello");
    }

    #[tokio::test]
    async fn no_outcome_is_404_naming_the_path() {
        let d = dispatcher(|_req| Ok(()));
        let response = get(&d, "/nothing/here").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.header_value("content-type"), Some("text/plain"));
        assert_eq!(
            body(&response),
            "status 404: path \"nothing/here\" did not produce any result\r\n"
        );
    }

    #[tokio::test]
    async fn missing_download_is_404() {
        let d = dispatcher(|req| {
            req.set_download("/definitely/not/here/report.csv", "r.csv", "text/csv", true);
            Ok(())
        });
        let response = get(&d, "/dl").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            body(&response),
            "status 404: download file not found: \"report.csv\"\r\n"
        );
    }

    #[tokio::test]
    async fn failing_app_is_500_with_message() {
        let d = dispatcher(|_req| Err("boom".into()));
        for _ in 0..3 {
            let response = get(&d, "/").await;
            assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
            assert_eq!(body(&response), "status 500: boom\r\n");
        }
    }

    #[tokio::test]
    async fn failure_replaces_earlier_outcome() {
        let d = dispatcher(|req| {
            req.set_text_content("partial");
            Err("late failure".into())
        });
        let response = get(&d, "/").await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body(&response).contains("late failure"));
    }

    #[tokio::test]
    async fn panicking_app_is_500() {
        let d = dispatcher(|_req| panic!("kaboom"));
        let response = get(&d, "/").await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body(&response), "status 500: kaboom\r\n");
    }

    #[tokio::test]
    async fn hidden_errors_use_generic_message() {
        let d = dispatcher(|_req| Err("secret detail".into())).expose_errors(false);
        let response = get(&d, "/").await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body(&response), "status 500: internal server error\r\n");
    }

    #[tokio::test]
    async fn cookie_and_redirect() {
        let d = dispatcher(|req| {
            req.add_cookie("sid", "abc", 3600, true);
            req.set_redirect("/login");
            Ok(())
        });
        let response = get(&d, "/").await;
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(response.header_value("location"), Some("/login"));

        let cookies: Vec<_> = response.headers().get_all("set-cookie").collect();
        assert_eq!(cookies, vec!["sid=abc; Max-Age=3600; Secure"]);
    }

    #[tokio::test]
    async fn cookies_survive_failure() {
        let d = dispatcher(|req| {
            req.add_cookie("a", "1", 0, false);
            req.add_cookie("b", "2", 0, false);
            Err("nope".into())
        });
        let response = get(&d, "/").await;
        let cookies: Vec<_> = response.headers().get_all("set-cookie").collect();
        assert_eq!(cookies, vec!["a=1", "b=2"]);
    }

    #[tokio::test]
    async fn explicit_error_outcome() {
        let d = dispatcher(|req| {
            req.set_error(403, "forbidden");
            Ok(())
        });
        let response = get(&d, "/").await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(body(&response), "status 403: forbidden\r\n");
    }

    #[tokio::test]
    async fn json_outcome() {
        let d = dispatcher(|req| {
            req.set_json(r#"{"ok":true}"#);
            Ok(())
        });
        let response = get(&d, "/").await;
        assert_eq!(response.header_value("content-type"), Some("application/json"));
        assert_eq!(body(&response), r#"{"ok":true}"#);
    }

    #[tokio::test]
    async fn template_gets_model_and_request() {
        let d = dispatcher(|req| {
            req.put_model("title", "Home");
            req.set_template("page.html");
            Ok(())
        });
        let response = get(&d, "/page").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.header_value("content-type"), Some(TEMPLATE_CONTENT_TYPE));

        let text = body(&response);
        let (name, context) = text.split_once(':').unwrap();
        assert_eq!(name, "page.html");
        let context: Value = serde_json::from_str(context).unwrap();
        assert_eq!(context["title"], "Home");
        assert_eq!(context["req"], json!({ "method": "GET", "path": "page" }));
    }

    #[tokio::test]
    async fn template_failure_is_a_dispatch_error() {
        let d = dispatcher(|req| {
            req.set_template("missing.html");
            Ok(())
        });
        let request = Request::from_bytes(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        assert!(matches!(
            d.dispatch(request).await,
            Err(DispatchError::Render(RenderError::NotFound { .. }))
        ));
    }

    async fn wire(response: Response) -> String {
        let mut out = Vec::new();
        response.write_to(&mut out).await.unwrap();
        String::from_utf8(out).unwrap()
    }

    #[tokio::test]
    async fn download_streams_then_deletes() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("export.tmp");
        std::fs::write(&file, "a,b\n1,2\n").unwrap();

        let target = file.clone();
        let d = dispatcher(move |req| {
            req.set_download(target.clone(), "report.csv", "text/csv", true);
            Ok(())
        });
        let response = get(&d, "/export").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.header_value("content-type"), Some("text/csv"));
        assert_eq!(
            response.header_value("content-disposition"),
            Some("attachment; filename=report.csv")
        );
        assert!(response.body_bytes().is_empty());
        assert_eq!(response.file_body().map(FileBody::len), Some(8));
        // still there until the body has been sent
        assert!(file.exists());

        let text = wire(response).await;
        assert!(text.contains("Content-Length: 8\r\n"));
        assert!(text.ends_with("\r\n\r\na,b\n1,2\n"));
        assert!(!file.exists());
    }

    #[tokio::test]
    async fn inline_download_keeps_file() {
        let dir = tempfile::tempdir().unwrap();
        let file: PathBuf = dir.path().join("logo.svg");
        std::fs::write(&file, "<svg/>").unwrap();

        let target = file.clone();
        let d = dispatcher(move |req| {
            req.set_download(target.clone(), "", "image/svg+xml", false);
            Ok(())
        });
        let response = get(&d, "/logo").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.header_value("content-disposition"), None);
        assert!(wire(response).await.ends_with("\r\n\r\n<svg/>"));
        assert!(file.exists());
    }

    #[tokio::test]
    async fn directory_is_not_a_download() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().to_owned();
        let d = dispatcher(move |req| {
            req.set_download(target.clone(), "x", "text/plain", true);
            Ok(())
        });
        let response = get(&d, "/").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(dir.path().exists());
    }

    #[tokio::test]
    async fn mount_prefix_is_stripped() {
        let d = dispatcher(|req| {
            let path = req.path().to_owned();
            req.set_text_content(path);
            Ok(())
        })
        .with_mount("/app/");

        assert!(d.is_mounted("/app"));
        assert!(d.is_mounted("/app/users/1"));
        assert!(!d.is_mounted("/application"));
        assert!(!d.is_mounted("/other"));
        assert_eq!(d.logical_path("/app"), Some(""));

        let response = get(&d, "/app/users/1").await;
        assert_eq!(body(&response), "users/1");
    }

    #[tokio::test]
    async fn root_mount_accepts_everything() {
        let d = dispatcher(|_req| Ok(()));
        assert!(d.is_mounted("/"));
        assert_eq!(d.logical_path("/a/b"), Some("a/b"));
    }

    #[tokio::test]
    async fn session_cookie_round_trip() {
        let d = dispatcher(|req| {
            let visits = req.session_or("visits", 0).as_i64().unwrap_or(0) + 1;
            req.put_session("visits", visits);
            req.set_text_content(visits.to_string());
            Ok(())
        });

        let first = get(&d, "/").await;
        assert_eq!(body(&first), "1");
        let cookie = first.header_value("set-cookie").unwrap().to_owned();
        let (name, id) = cookie.split_once('=').unwrap();
        assert_eq!(name, SESSION_COOKIE);

        let raw = format!("GET / HTTP/1.1\r\nHost: x\r\nCookie: {SESSION_COOKIE}={id}\r\n\r\n");
        let second = send(&d, &raw).await;
        assert_eq!(body(&second), "2");
        assert_eq!(second.header_value("set-cookie"), None);
    }

    #[tokio::test]
    async fn post_form_reaches_app() {
        let d = dispatcher(|req| {
            let greeting = format!("{} {}", req.method(), req.parameter("name")?);
            req.set_text_content(greeting);
            Ok(())
        });
        let raw = "POST /f HTTP/1.1\r\nHost: x\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: 8\r\n\r\nname=ann";
        assert_eq!(body(&send(&d, raw).await), "POST ann");

        // a missing required parameter propagates as a failure
        let response = get(&d, "/f").await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body(&response).contains("parameter \"name\" not found"));
    }

    #[tokio::test]
    async fn redirect_target_cannot_add_headers() {
        let d = dispatcher(|req| {
            let next = req.parameter_or("next", "/").to_owned();
            req.set_redirect(next);
            Ok(())
        });
        let response = get(&d, "/login?next=%2Fhome%0D%0ASet-Cookie%3A%20admin%3D1").await;
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(response.headers().get_all("set-cookie").count(), 0);

        let text = wire(response).await;
        assert!(text.contains("Location: /homeSet-Cookie: admin=1\r\n"));
        assert!(!text.contains("\r\nSet-Cookie:"));
    }

    #[tokio::test]
    async fn destroy_reaches_app() {
        struct Tracked(Arc<AtomicBool>);

        impl App for Tracked {
            fn serve(&self, _req: &mut WebRequest) -> Result<(), AppError> {
                Ok(())
            }

            fn destroy(&self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }

        let destroyed = Arc::new(AtomicBool::new(false));
        let d = Dispatcher::new(
            Box::new(Tracked(Arc::clone(&destroyed))),
            Arc::new(EchoTemplates),
        );
        d.destroy();
        assert!(destroyed.load(Ordering::SeqCst));
    }

    #[test]
    fn from_config_runs_factory() {
        fn factory(ctx: &AppContext) -> Result<Box<dyn App>, AppError> {
            let greeting = ctx.init_parameter("greeting").ok_or("greeting missing")?.to_owned();
            Ok(Box::new(move |req: &mut WebRequest| -> Result<(), AppError> {
                req.set_text_content(greeting.clone());
                Ok(())
            }))
        }

        let config = Config::from_toml_str(
            "mount = \"/app\"\nsession_ttl_secs = 60\n[params]\ngreeting = \"hi\"",
        )
        .unwrap();
        let d = Dispatcher::from_config(&config, factory).unwrap();
        assert!(d.is_mounted("/app/x"));
        assert!(!d.is_mounted("/x"));

        let bare = Config::from_toml_str("").unwrap();
        let err = Dispatcher::from_config(&bare, factory).err().unwrap();
        assert_eq!(err.to_string(), "greeting missing");
    }
}
