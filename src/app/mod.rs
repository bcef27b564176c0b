//! The application contract.
//!
//! An application implements [`App`]. The host builds it once at startup
//! through an [`AppFactory`], calls [`App::serve`] once per exchange and
//! [`App::destroy`] once at shutdown. Plain closures are applications too:
//!
//! ```
//! use webby::app::{App, AppError};
//! use webby::context::WebRequest;
//!
//! let app = |req: &mut WebRequest| -> Result<(), AppError> {
//!     let name = req.parameter_or("name", "world").to_owned();
//!     req.set_text_content(format!("hello {name}"));
//!     Ok(())
//! };
//! # fn assert_app(_: &impl App) {}
//! # assert_app(&app);
//! ```

use std::collections::HashMap;
use std::error::Error;
use std::fs::File;
use std::path::{Component, Path, PathBuf};

use crate::config::Config;
use crate::context::WebRequest;

/// Failure returned by an application. Any error type converts into it with `?`.
pub type AppError = Box<dyn Error + Send + Sync>;

/// Builds the application from the host context. Called once at startup.
pub type AppFactory = fn(&AppContext) -> Result<Box<dyn App>, AppError>;

/// A web application hosted by the dispatcher.
pub trait App: Send + Sync {
    /// Handles one exchange by inspecting `req` and setting its outcome.
    ///
    /// Returning `Err` (or panicking) makes the dispatcher answer 500.
    fn serve(&self, req: &mut WebRequest) -> Result<(), AppError>;

    /// Releases resources at shutdown.
    fn destroy(&self) {}
}

impl<F> App for F
where
    F: Fn(&mut WebRequest) -> Result<(), AppError> + Send + Sync,
{
    fn serve(&self, req: &mut WebRequest) -> Result<(), AppError> {
        self(req)
    }
}

/// Read-only view of the host handed to an [`AppFactory`].
#[derive(Debug, Clone, Default)]
pub struct AppContext {
    context_path: String,
    web_root: PathBuf,
    params: HashMap<String, String>,
}

impl AppContext {
    pub fn new(
        context_path: impl Into<String>,
        web_root: impl Into<PathBuf>,
        params: HashMap<String, String>,
    ) -> Self {
        Self {
            context_path: context_path.into(),
            web_root: web_root.into(),
            params,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.context_path(), config.web_root(), config.params().clone())
    }

    /// The URL prefix the application is published under, `""` at the root.
    pub fn context_path(&self) -> &str {
        &self.context_path
    }

    pub fn web_root(&self) -> &Path {
        &self.web_root
    }

    /// Maps a virtual path such as `/static/app.css` onto the web root.
    ///
    /// `None` if the path tries to leave the web root.
    pub fn real_path(&self, virtual_path: &str) -> Option<PathBuf> {
        let relative = Path::new(virtual_path.trim_start_matches('/'));
        let mut real = self.web_root.clone();
        for component in relative.components() {
            match component {
                Component::Normal(part) => real.push(part),
                Component::CurDir => {}
                _ => return None,
            }
        }
        Some(real)
    }

    /// Opens a file below the web root, `None` if it cannot be opened.
    pub fn open_resource(&self, virtual_path: &str) -> Option<File> {
        File::open(self.real_path(virtual_path)?).ok()
    }

    pub fn init_parameter(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }
}
