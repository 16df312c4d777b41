//! Test doubles shared by the unit tests.

use std::cell::Cell;
use std::rc::Rc;

use bytes::Bytes;
use http::{HeaderMap, StatusCode};

use crate::error::{BoxError, Error};
use crate::pump::ResponseSink;
use crate::response::{Body, IntoBody};

#[derive(Debug, Eq, PartialEq)]
pub(crate) enum Event {
    Start(u16, Vec<(String, String)>),
    Write(String),
    Finish,
}

/// Records every call made against it.
#[derive(Debug, Default)]
pub(crate) struct RecordingSink {
    pub events: Vec<Event>,
    pub reported: Vec<String>,
    /// Fail every write after this many succeeded, as a vanished client would.
    pub fail_after_writes: Option<usize>,
}

impl RecordingSink {
    pub fn starts(&self) -> usize {
        self.events.iter().filter(|e| matches!(e, Event::Start(..))).count()
    }

    pub fn finishes(&self) -> usize {
        self.events.iter().filter(|e| matches!(e, Event::Finish)).count()
    }

    pub fn writes(&self) -> Vec<String> {
        self.events
            .iter()
            .filter_map(|e| match e {
                Event::Write(chunk) => Some(chunk.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn status(&self) -> Option<u16> {
        self.events.iter().find_map(|e| match e {
            Event::Start(status, _) => Some(*status),
            _ => None,
        })
    }
}

impl ResponseSink for RecordingSink {
    fn start(&mut self, status: StatusCode, headers: HeaderMap) -> Result<(), Error> {
        let headers = headers
            .iter()
            .map(|(k, v)| (k.as_str().to_owned(), v.to_str().unwrap_or_default().to_owned()))
            .collect();
        self.events.push(Event::Start(status.as_u16(), headers));
        Ok(())
    }

    fn write(&mut self, chunk: Bytes) -> Result<(), Error> {
        if self.fail_after_writes.is_some_and(|n| self.writes().len() >= n) {
            return Err(Error::Disconnected);
        }
        self.events.push(Event::Write(String::from_utf8_lossy(&chunk).into_owned()));
        Ok(())
    }

    fn finish(&mut self) {
        self.events.push(Event::Finish);
    }

    fn report(&mut self, error: &Error) {
        self.reported.push(error.to_string());
    }
}

/// Wraps a body and counts how often it gets closed.
pub(crate) struct Tracked<B> {
    inner: B,
    closed: Rc<Cell<usize>>,
}

impl<B: Body + 'static> Tracked<B> {
    pub fn new(inner: B) -> (Self, Rc<Cell<usize>>) {
        let closed = Rc::new(Cell::new(0));
        (Self { inner, closed: Rc::clone(&closed) }, closed)
    }
}

impl<B: Body> Body for Tracked<B> {
    fn next_chunk(&mut self) -> Option<Result<Bytes, BoxError>> {
        self.inner.next_chunk()
    }

    fn close(&mut self) {
        self.inner.close();
        self.closed.set(self.closed.get() + 1);
    }
}

impl<B: Body + 'static> IntoBody for Tracked<B> {
    fn into_body(self) -> Box<dyn Body> {
        Box::new(self)
    }
}
