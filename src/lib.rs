//! # webby
//!
//! A small host for web applications, on top of an async HTTP/1.1 server.
//!
//! An application implements [`App`](app::App): for every request it gets a
//! [`WebRequest`](context::WebRequest), reads parameters, session values and
//! cookies from it, fills the template model, and picks exactly one outcome
//! (template, JSON, content, download, redirect or error). The
//! [`Dispatcher`](dispatcher::Dispatcher) turns that outcome into a response.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use webby::app::{App, AppContext, AppError};
//! use webby::config::Config;
//! use webby::context::WebRequest;
//! use webby::dispatcher::Dispatcher;
//! use webby::server::Server;
//!
//! struct Hello;
//!
//! impl App for Hello {
//!     fn serve(&self, req: &mut WebRequest) -> Result<(), AppError> {
//!         let name = req.parameter_or("name", "world").to_owned();
//!         req.put_model("name", name);
//!         req.set_template("hello.html");
//!         Ok(())
//!     }
//! }
//!
//! fn hello(_ctx: &AppContext) -> Result<Box<dyn App>, AppError> {
//!     Ok(Box::new(Hello))
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), AppError> {
//!     let config = Config::load("webby.toml")?;
//!     let dispatcher = Dispatcher::from_config(&config, hello)?;
//!     let server = Server::bind(config.bind())
//!         .await?
//!         .with_max_request_bytes(config.max_request_bytes());
//!     server.run(Arc::new(dispatcher)).await?;
//!     Ok(())
//! }
//! ```

pub mod app;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod escape;
pub mod http;
pub mod server;
pub mod session;
pub mod template;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use app::{App, AppContext, AppError, AppFactory};
pub use config::{Config, ConfigError};
pub use context::{Outcome, WebError, WebRequest};
pub use dispatcher::{DispatchError, Dispatcher};
pub use http::{Headers, Method, Request, Response, StatusCode};
pub use server::{Server, ServerError};
pub use session::{MemorySessionStore, SessionStore};
pub use template::{FileTemplates, RenderError, TemplateEngine};
