//! Template rendering boundary.
//!
//! The dispatcher only knows [`TemplateEngine`]: give it a template name and
//! a key/value context, get bytes back or a [`RenderError`]. [`FileTemplates`]
//! is the engine the host ships with: it reads UTF-8 files from a directory
//! and substitutes `{{ key }}` placeholders. Dotted keys (`{{ req.path }}`)
//! walk into JSON objects; values are HTML-escaped; unknown keys render as
//! nothing.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::context::Model;
use crate::escape::escape_html;

/// Errors produced while rendering a template.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("template \"{name}\" not found")]
    NotFound { name: String },

    #[error("cannot read template \"{name}\": {source}")]
    Io {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("unterminated placeholder in template \"{name}\" at byte {offset}")]
    Syntax { name: String, offset: usize },
}

/// Renders a named template with a key/value context.
pub trait TemplateEngine: Send + Sync {
    fn render(&self, name: &str, context: &Model) -> Result<Vec<u8>, RenderError>;
}

/// File-backed [`TemplateEngine`] with optional caching of parsed templates.
///
/// With caching off (the default) every render re-reads the file, which
/// suits development; with caching on, each template is parsed once.
pub struct FileTemplates {
    root: PathBuf,
    cache: Option<RwLock<HashMap<String, Arc<Template>>>>,
}

impl FileTemplates {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            cache: None,
        }
    }

    /// Enables or disables the parsed-template cache.
    #[must_use]
    pub fn with_cache(mut self, enabled: bool) -> Self {
        self.cache = enabled.then(|| RwLock::new(HashMap::new()));
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn load(&self, name: &str) -> Result<Arc<Template>, RenderError> {
        let Some(cache) = &self.cache else {
            return self.read(name).map(Arc::new);
        };

        if let Some(template) = cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
        {
            return Ok(Arc::clone(template));
        }

        let template = Arc::new(self.read(name)?);
        cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_owned(), Arc::clone(&template));
        debug!(template = name, "template cached");
        Ok(template)
    }

    fn read(&self, name: &str) -> Result<Template, RenderError> {
        // Names are relative paths below the root; anything else cannot exist.
        let relative = Path::new(name);
        if name.is_empty() || !relative.components().all(|c| matches!(c, Component::Normal(_))) {
            return Err(RenderError::NotFound {
                name: name.to_owned(),
            });
        }

        let source = fs::read_to_string(self.root.join(relative)).map_err(|source| {
            if source.kind() == io::ErrorKind::NotFound {
                RenderError::NotFound {
                    name: name.to_owned(),
                }
            } else {
                RenderError::Io {
                    name: name.to_owned(),
                    source,
                }
            }
        })?;

        Template::compile(name, &source)
    }
}

impl TemplateEngine for FileTemplates {
    fn render(&self, name: &str, context: &Model) -> Result<Vec<u8>, RenderError> {
        Ok(self.load(name)?.render(context).into_bytes())
    }
}

#[derive(Debug)]
struct Template {
    segments: Vec<Segment>,
}

#[derive(Debug)]
enum Segment {
    Text(String),
    Key(String),
}

impl Template {
    fn compile(name: &str, source: &str) -> Result<Self, RenderError> {
        let mut segments = Vec::new();
        let mut rest = source;
        let mut offset = 0;

        while let Some(start) = rest.find("{{") {
            if start > 0 {
                segments.push(Segment::Text(rest[..start].to_owned()));
            }
            let after_open = &rest[start + 2..];
            let end = after_open.find("}}").ok_or(RenderError::Syntax {
                name: name.to_owned(),
                offset: offset + start,
            })?;
            segments.push(Segment::Key(after_open[..end].trim().to_owned()));

            let consumed = start + 2 + end + 2;
            offset += consumed;
            rest = &rest[consumed..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Text(rest.to_owned()));
        }

        Ok(Self { segments })
    }

    fn render(&self, context: &Model) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Text(text) => out.push_str(text),
                Segment::Key(key) => match lookup(context, key) {
                    None | Some(Value::Null) => {}
                    Some(Value::String(s)) => out.push_str(&escape_html(s)),
                    Some(other) => out.push_str(&escape_html(&other.to_string())),
                },
            }
        }
        out
    }
}

fn lookup<'a>(context: &'a Model, key: &str) -> Option<&'a Value> {
    let mut segments = key.split('.');
    let mut value = context.get(segments.next()?)?;
    for segment in segments {
        value = match value {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(value)
}
