//! # bridle
//!
//! Serve synchronous `(env) -> (status, headers, body)` applications on
//! hyper.
//!
//! ## The contract
//!
//! hyper owns sockets, HTTP framing, keep-alive and HTTP/2. The application
//! owns everything about the answer. bridle only translates between them:
//!
//! - the request head becomes an [`Env`] with CGI-style keys
//!   (`REQUEST_METHOD`, `PATH_INFO`, `HTTP_ACCEPT`, …) and `rack.*` metadata
//! - the body is buffered in full, then exposed as `rack.input`
//! - the application is called once, on a blocking thread
//! - its body is streamed back chunk by chunk, and always closed
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use bridle::{Env, Headers, Server};
//!
//! fn app(env: Env) -> (u16, Headers, Vec<String>) {
//!     let greeting = format!("Hello from {}", env.path());
//!     (200, Headers::from([("Content-Type", "text/plain")]), vec![greeting])
//! }
//!
//! fn main() -> Result<(), bridle::Error> {
//!     Server::bind("0.0.0.0", 8080).run(app)
//! }
//! ```

mod adapter;
mod app;
mod body;
mod config;
mod error;
mod response;
mod server;

pub mod env;
pub mod pump;

#[cfg(test)]
mod testing;

pub use adapter::{Exchange, State, dispatch};
pub use app::Application;
pub use body::{BodyBuffer, Framing, Input};
pub use config::Config;
pub use env::{Env, Errors, RequestHead, Value};
pub use error::{BoxError, Error};
pub use pump::ResponseSink;
pub use response::{
    Body, Chunks, FileBody, Headers, IntoBody, IntoResponse, IntoStatus, IterBody, Response, Values,
    to_native_headers,
};
pub use server::{Running, Server};
