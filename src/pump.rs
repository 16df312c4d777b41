//! Writing a [`Response`] out to the native server.
//!
//! The pump is the only place that touches a [`ResponseSink`] once the
//! application has answered. It owns two promises: the sink hears
//! [`finish`](ResponseSink::finish) exactly once, and the body is
//! [`close`](Body::close)d exactly once, whatever happens in between.

use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use tracing::trace;

use crate::error::Error;
use crate::response::{Body, Headers, Response, to_native_headers};

/// The native server's output channel for one response.
pub trait ResponseSink {
    /// Sends the status line and headers. Called at most once, first.
    fn start(&mut self, status: StatusCode, headers: HeaderMap) -> Result<(), Error>;

    /// Sends one body chunk as a discrete write.
    fn write(&mut self, chunk: Bytes) -> Result<(), Error>;

    /// Signals end-of-response.
    fn finish(&mut self);

    /// Hands an error to the server's error channel.
    fn report(&mut self, error: &Error);
}

/// Writes `response` to `sink`.
///
/// Output already written stays written when the body or the sink fails
/// midway; the error is reported and returned, and the response is still
/// finished.
pub fn send<S: ResponseSink + ?Sized>(sink: &mut S, response: Response) -> Result<(), Error> {
    let (status, headers, body) = response.into_parts();
    let mut out = Outgoing { sink, body };
    let result = out.drive(status, &headers);
    if let Err(err) = &result {
        out.sink.report(err);
    }
    result
}

/// Releases the body and finishes the sink on drop, so unwinding out of a
/// body iterator still terminates the response.
struct Outgoing<'a, S: ResponseSink + ?Sized> {
    sink: &'a mut S,
    body: Box<dyn Body>,
}

impl<S: ResponseSink + ?Sized> Outgoing<'_, S> {
    fn drive(&mut self, status: StatusCode, headers: &Headers) -> Result<(), Error> {
        let headers = match to_native_headers(headers) {
            Ok(headers) => headers,
            Err(err) => {
                self.sink.start(StatusCode::INTERNAL_SERVER_ERROR, HeaderMap::new())?;
                return Err(err);
            }
        };
        self.sink.start(status, headers)?;

        let mut chunks = 0_usize;
        while let Some(chunk) = self.body.next_chunk() {
            let chunk = chunk.map_err(Error::Body)?;
            if chunk.is_empty() {
                continue;
            }
            self.sink.write(chunk)?;
            chunks += 1;
        }
        trace!(%status, chunks, "response body drained");
        Ok(())
    }
}

impl<S: ResponseSink + ?Sized> Drop for Outgoing<'_, S> {
    fn drop(&mut self) {
        self.body.close();
        self.sink.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::{Headers, IntoResponse, IterBody};
    use crate::testing::{Event, RecordingSink, Tracked};

    #[test]
    fn writes_head_then_each_chunk_then_finishes() {
        let mut sink = RecordingSink::default();
        let headers = Headers::from([("Content-Type", vec!["text/plain"])]);
        let response = (200, headers, vec!["Hello", " ", "world!"]).into_response().unwrap();

        send(&mut sink, response).unwrap();

        assert_eq!(sink.events, vec![
            Event::Start(200, vec![("content-type".to_owned(), "text/plain".to_owned())]),
            Event::Write("Hello".into()),
            Event::Write(" ".into()),
            Event::Write("world!".into()),
            Event::Finish,
        ]);
    }

    #[test]
    fn failing_body_still_finishes_once_and_reports() {
        let items: Vec<Result<&'static str, &'static str>> =
            vec![Ok("first"), Err("second blew up"), Ok("third")];
        let (body, closed) = Tracked::new(IterBody::new(items.into_iter()));
        let response = (200, Headers::new(), body).into_response().unwrap();
        let mut sink = RecordingSink::default();

        let err = send(&mut sink, response).unwrap_err();

        assert!(matches!(err, Error::Body(_)));
        assert_eq!(sink.starts(), 1);
        assert_eq!(sink.writes(), vec!["first".to_owned()]);
        assert_eq!(sink.finishes(), 1);
        assert_eq!(sink.reported, vec!["response body failed: second blew up".to_owned()]);
        assert_eq!(closed.get(), 1);
    }

    #[test]
    fn broken_client_stops_the_body_and_releases_it() {
        let chunks = crate::response::Chunks::new(vec!["a".into(), "b".into(), "c".into()]);
        let (body, closed) = Tracked::new(chunks);
        let response = (200, Headers::new(), body).into_response().unwrap();
        let mut sink = RecordingSink { fail_after_writes: Some(1), ..Default::default() };

        assert!(matches!(send(&mut sink, response), Err(Error::Disconnected)));
        assert_eq!(sink.writes(), vec!["a".to_owned()]);
        assert_eq!(sink.finishes(), 1);
        assert_eq!(sink.reported.len(), 1);
        assert_eq!(closed.get(), 1);
    }

    #[test]
    fn bad_headers_turn_into_a_bare_500() {
        let (body, closed) = Tracked::new(crate::response::Chunks::new(vec!["never".into()]));
        let response = (200, Headers::from([("Bad Name", "x")]), body).into_response().unwrap();
        let mut sink = RecordingSink::default();

        assert!(matches!(send(&mut sink, response), Err(Error::InvalidHeader(_))));
        assert_eq!(sink.events, vec![Event::Start(500, vec![]), Event::Finish]);
        assert_eq!(closed.get(), 1);
    }

    #[test]
    fn empty_chunks_are_skipped() {
        let mut sink = RecordingSink::default();
        let response = (204, Headers::new(), vec!["", ""]).into_response().unwrap();
        send(&mut sink, response).unwrap();
        assert_eq!(sink.events, vec![Event::Start(204, vec![]), Event::Finish]);
    }

    #[test]
    fn panicking_body_still_closes_and_finishes() {
        struct Explodes;
        impl Body for Explodes {
            fn next_chunk(&mut self) -> Option<Result<Bytes, crate::BoxError>> {
                panic!("kaboom")
            }
        }

        let (body, closed) = Tracked::new(Explodes);
        let response = (200, Headers::new(), body).into_response().unwrap();
        let mut sink = RecordingSink::default();

        let outcome =
            std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| send(&mut sink, response)));
        assert!(outcome.is_err());
        assert_eq!(sink.finishes(), 1);
        assert_eq!(closed.get(), 1);
    }
}
