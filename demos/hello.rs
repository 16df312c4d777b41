//! Smallest possible bridle application.
//!
//! Run with:
//!   RUST_LOG=info cargo run --example hello
//!
//! Try:
//!   curl http://localhost:8080/hello
//!   curl -i http://localhost:8080/anything-else   # → 302 to /hello

use bridle::{Config, Env, Headers, Server};

fn main() -> Result<(), bridle::Error> {
    tracing_subscriber::fmt::init();
    Server::new(Config::default()).run(app)
}

fn app(env: Env) -> (u16, Headers, Vec<&'static str>) {
    match (env.method(), env.path()) {
        ("GET", "/hello") => {
            (200, Headers::from([("Content-Type", "text/plain")]), vec!["Hello world!"])
        }
        ("GET", _) => (302, Headers::from([("Location", "/hello")]), vec![]),
        _ => (405, Headers::from([("Allow", "GET")]), vec![]),
    }
}
