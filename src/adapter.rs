//! One request's trip from native events to a single application call.
//!
//! The native server speaks in many small events: a head, any number of body
//! chunks, an end marker. The application wants exactly one call. An
//! [`Exchange`] absorbs the events, and once the body is complete it makes the
//! call and pumps the answer back out:
//!
//! ```text
//! Receiving ──on_end──▶ Buffered ──respond──▶ Processing ──▶ Responding ──▶ Complete
//!     └─────────────┴──────────────┴─────────────┴──────────▶ Failed
//! ```
//!
//! Nothing here is shared between requests; each exchange owns its head,
//! its body buffer and, later, its response.

use std::panic::{AssertUnwindSafe, catch_unwind};

use bytes::Bytes;
use http::StatusCode;
use tracing::{debug, warn};

use crate::app::Application;
use crate::body::{BodyBuffer, Framing, Input};
use crate::env::{RequestHead, to_environment};
use crate::error::Error;
use crate::pump::{self, ResponseSink};
use crate::response::Response;

/// Where an exchange is in its life.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum State {
    Receiving,
    Buffered,
    Processing,
    Responding,
    Complete,
    Failed,
}

/// Per-request state.
#[derive(Debug)]
pub struct Exchange {
    state: State,
    head: RequestHead,
    body: BodyBuffer,
    input: Option<Input>,
}

impl Exchange {
    /// Starts an exchange on arrival of the request head.
    pub fn new(head: RequestHead, framing: Framing) -> Self {
        let body = BodyBuffer::new(head.content_length(), framing);
        Self { state: State::Receiving, head, body, input: None }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn head(&self) -> &RequestHead {
        &self.head
    }

    /// Body-data event.
    pub fn on_body(&mut self, chunk: &[u8]) -> Result<(), Error> {
        self.require(State::Receiving, "body")?;
        self.body.write(chunk)
    }

    /// End-of-body event. Seals the body buffer.
    pub fn on_end(&mut self) -> Result<(), Error> {
        self.require(State::Receiving, "end")?;
        self.input = Some(self.body.finalize()?);
        self.state = State::Buffered;
        debug!(
            method = %self.head.method,
            target = %self.head.target,
            bytes = self.body_len(),
            "request buffered"
        );
        Ok(())
    }

    /// Marks the exchange failed, e.g. when the body stream broke.
    pub fn fail(&mut self, error: &Error) {
        warn!(
            method = %self.head.method,
            target = %self.head.target,
            state = ?self.state,
            "exchange failed: {error}"
        );
        self.state = State::Failed;
    }

    /// Calls the application and writes its answer to `sink`.
    ///
    /// Always finishes `sink`. An application error or panic is reported and
    /// answered with a 500; a failure while streaming leaves the exchange
    /// [`State::Failed`] with the partial output in place.
    pub fn respond<A, S>(mut self, app: &A, sink: &mut S) -> State
    where
        A: Application + ?Sized,
        S: ResponseSink + ?Sized,
    {
        let input = match (self.state, self.input.take()) {
            (State::Buffered, Some(input)) => input,
            // A failed exchange was reported when it failed.
            (State::Failed, _) => {
                let _ = pump::send(sink, Response::error(StatusCode::INTERNAL_SERVER_ERROR));
                return self.state;
            }
            (state, _) => {
                let err = Error::State { event: "respond", state };
                sink.report(&err);
                self.fail(&err);
                let _ = pump::send(sink, Response::error(StatusCode::INTERNAL_SERVER_ERROR));
                return self.state;
            }
        };

        let env = to_environment(&self.head, input);
        self.state = State::Processing;

        let outcome = catch_unwind(AssertUnwindSafe(|| app.call(env)))
            .unwrap_or_else(|p| Err(Error::from_panic(p)));
        let response = match outcome {
            Ok(response) => response,
            Err(err) => {
                sink.report(&err);
                self.fail(&err);
                let _ = pump::send(sink, Response::error(StatusCode::INTERNAL_SERVER_ERROR));
                return self.state;
            }
        };

        self.state = State::Responding;
        let status = response.status();
        match pump::send(sink, response) {
            Ok(()) => {
                self.state = State::Complete;
                debug!(
                    method = %self.head.method,
                    target = %self.head.target,
                    %status,
                    "response complete"
                );
            }
            Err(err) => self.fail(&err),
        }
        self.state
    }

    fn require(&self, state: State, event: &'static str) -> Result<(), Error> {
        if self.state == state {
            Ok(())
        } else {
            Err(Error::State { event, state: self.state })
        }
    }

    fn body_len(&self) -> usize {
        self.input.as_ref().map_or(0, Input::len)
    }
}

/// Feeds a complete request through an exchange in one go. Convenient for
/// driving an application without a socket.
pub fn dispatch<A, S>(
    app: &A,
    head: RequestHead,
    framing: Framing,
    chunks: &[Bytes],
    sink: &mut S,
) -> State
where
    A: Application + ?Sized,
    S: ResponseSink + ?Sized,
{
    let mut exchange = Exchange::new(head, framing);
    for chunk in chunks {
        if let Err(err) = exchange.on_body(chunk) {
            sink.report(&err);
            exchange.fail(&err);
            break;
        }
    }
    if exchange.state() == State::Receiving {
        if let Err(err) = exchange.on_end() {
            sink.report(&err);
            exchange.fail(&err);
        }
    }
    exchange.respond(app, sink)
}
