//! A small guest book served by webby.
//!
//! ```text
//! cargo run --example hello [config.toml]
//! curl 'http://127.0.0.1:8080/?name=Ann'
//! curl -d 'note=hi there' http://127.0.0.1:8080/sign
//! ```

use std::sync::{Arc, Mutex, PoisonError};

use serde_json::json;
use tracing::info;
use webby::app::{App, AppContext, AppError};
use webby::config::Config;
use webby::context::WebRequest;
use webby::dispatcher::Dispatcher;
use webby::escape::escape_html;
use webby::server::Server;

struct GuestBook {
    greeting: String,
    notes: Mutex<Vec<String>>,
}

impl App for GuestBook {
    fn serve(&self, req: &mut WebRequest) -> Result<(), AppError> {
        let method = req.method().to_owned();
        let path = req.path().to_owned();
        match (method.as_str(), path.as_str()) {
            ("GET", "") => {
                let visits = req.session_or("visits", 0).as_i64().unwrap_or(0) + 1;
                req.put_session("visits", visits);

                let name = escape_html(req.parameter_or("name", "stranger"));
                let notes = self.notes.lock().unwrap_or_else(PoisonError::into_inner);
                let items: String = notes
                    .iter()
                    .map(|note| format!("<li>{}</li>", escape_html(note)))
                    .collect();
                req.set_html_content(format!(
                    "<h1>{} {name}</h1><p>visit #{visits}</p><ul>{items}</ul>",
                    self.greeting
                ));
            }
            ("POST", "sign") => {
                let note = req.parameter("note")?.to_owned();
                self.notes
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(note);
                req.set_redirect("/");
            }
            (_, "notes.json") => {
                let notes = self.notes.lock().unwrap_or_else(PoisonError::into_inner);
                req.set_json(json!({ "notes": *notes }).to_string());
            }
            ("GET", "logout") => {
                req.kill_session();
                req.set_redirect("/");
            }
            _ => {}
        }
        Ok(())
    }

    fn destroy(&self) {
        let notes = self.notes.lock().unwrap_or_else(PoisonError::into_inner);
        info!(notes = notes.len(), "guest book closed");
    }
}

fn guest_book(ctx: &AppContext) -> Result<Box<dyn App>, AppError> {
    Ok(Box::new(GuestBook {
        greeting: ctx.init_parameter("greeting").unwrap_or("Hello").to_owned(),
        notes: Mutex::new(Vec::new()),
    }))
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,webby=debug")),
        )
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    let dispatcher = Dispatcher::from_config(&config, guest_book)?;
    let server = Server::bind(config.bind())
        .await?
        .with_max_request_bytes(config.max_request_bytes());

    server
        .run_until(Arc::new(dispatcher), async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}
