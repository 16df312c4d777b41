//! A form round-trip and file downloads.
//!
//! Run with:
//!   RUST_LOG=info cargo run --example form
//!
//! Try:
//!   curl http://localhost:8080/
//!   curl -d name=Ada http://localhost:8080/hello
//!   curl -OJ http://localhost:8080/download/Cargo.toml

use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};

use bridle::{Env, FileBody, Headers, IntoResponse, Response, Server};

const INDEX: &str = r#"<html><body>
<form method="post" action="./hello">
  <label for="name">Your name</label>
  <input id="name" name="name" type="text">
  <input type="submit" value="Say hello">
</form>
</body></html>"#;

#[tokio::main]
async fn main() -> Result<(), bridle::Error> {
    tracing_subscriber::fmt::init();
    Server::bind("0.0.0.0", 8080).serve(app).await
}

fn app(env: Env) -> Result<Response, std::io::Error> {
    let html = Headers::from([("Content-Type", "text/html; charset=utf-8")]);
    let response = match (env.method(), env.path()) {
        ("GET", "/") => (200, html, INDEX).into_response(),
        ("POST", "/hello") => {
            let mut form = String::new();
            env.input().read_to_string(&mut form)?;
            let name = field(&form, "name").unwrap_or("stranger");
            let page = format!("<p>Oh, so your name is {}. Nice to meet you!</p>", escape(name));
            (200, html, page).into_response()
        }
        ("GET", path) if path.starts_with("/download/") => {
            download(&env, &path["/download/".len()..])
        }
        _ => (404, Headers::new(), "not found").into_response(),
    };
    response.map_err(std::io::Error::other)
}

fn download(env: &Env, name: &str) -> Result<Response, bridle::Error> {
    let Some(path) = safe_join(Path::new("."), name) else {
        return (400, Headers::new(), "bad file name").into_response();
    };
    match FileBody::open(&path) {
        Ok(file) => {
            let headers = Headers::new()
                .with("Content-Type", "application/octet-stream")
                .with("Content-Disposition", format!("attachment; filename=\"{name}\""));
            (200, headers, file).into_response()
        }
        Err(e) => {
            let _ = writeln!(env.errors(), "download of {name} failed: {e}");
            (404, Headers::new(), "not found").into_response()
        }
    }
}

fn safe_join(root: &Path, name: &str) -> Option<PathBuf> {
    let rel = Path::new(name);
    rel.components()
        .all(|c| matches!(c, Component::Normal(_)))
        .then(|| root.join(rel))
}

fn field<'a>(form: &'a str, key: &str) -> Option<&'a str> {
    form.split('&')
        .filter_map(|pair| pair.split_once('='))
        .find_map(|(k, v)| (k == key).then_some(v))
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;").replace('+', " ")
}
