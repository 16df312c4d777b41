//! The application contract.
//!
//! # What counts as an application
//!
//! Anything that takes an [`Env`] and synchronously returns something
//! [`IntoResponse`]:
//!
//! ```text
//! fn app(env: Env) -> (u16, Headers, Vec<&'static str>)      ← plain function
//! |env: Env| -> Result<Response, MyError> { … }               ← closure that can fail
//! struct Site { … }  +  impl Application for Site             ← stateful application
//! ```
//!
//! Functions and closures are covered by the blanket impl below. Types that
//! carry state implement [`Application`] directly.
//!
//! The server shares one application across every request through an `Arc`,
//! and calls it from several threads at once, hence `Send + Sync`.

use crate::env::Env;
use crate::error::Error;
use crate::response::{IntoResponse, Response};

pub trait Application: Send + Sync + 'static {
    /// Handles one request. Blocking is fine here; it happens off the
    /// scheduler threads.
    fn call(&self, env: Env) -> Result<Response, Error>;
}

impl<F, R> Application for F
where
    F: Fn(Env) -> R + Send + Sync + 'static,
    R: IntoResponse,
{
    fn call(&self, env: Env) -> Result<Response, Error> {
        self(env).into_response()
    }
}
