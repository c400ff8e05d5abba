//! Wire types for list and watch responses, and the splitting of a streaming watch body into one
//! json document per line.
use super::Error;

use bytes::{Bytes, BytesMut};
use hyper::Body;
use lazy_static::lazy_static;
use regex::bytes::Regex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_stream::StreamExt;

use std::fmt;
use std::marker::PhantomData;

lazy_static! {
    static ref LINE_BREAK: Regex = Regex::new("[\\r\\n]+").expect("invalid line break regex");
}

/// Splits a response body into non-empty lines, regardless of how the chunks of the body happen
/// to line up with the line breaks. Runs of `\r` and `\n` count as a single break.
pub struct Lines {
    body: Body,
    pending: BytesMut,
    body_finished: bool,
}

impl Lines {
    pub fn from_body(body: Body) -> Lines {
        Lines {
            body,
            pending: BytesMut::new(),
            body_finished: false,
        }
    }

    pub async fn next(&mut self) -> Option<Result<Bytes, Error>> {
        loop {
            if let Some(line) = self.take_line() {
                return Some(Ok(line));
            }
            if self.body_finished {
                // whatever is left after the last break is the final line
                return if self.pending.is_empty() {
                    None
                } else {
                    Some(Ok(self.pending.split().freeze()))
                };
            }
            match self.body.next().await {
                Some(Ok(chunk)) => self.pending.extend_from_slice(&chunk),
                Some(Err(err)) => {
                    log::error!("Error reading response lines: {}", err);
                    return Some(Err(err.into()));
                }
                None => self.body_finished = true,
            }
        }
    }

    /// Removes complete lines from the front of the buffer until a non-empty one turns up
    fn take_line(&mut self) -> Option<Bytes> {
        while let Some((start, end)) = LINE_BREAK
            .find(&self.pending)
            .map(|found| (found.start(), found.end()))
        {
            let mut line = self.pending.split_to(end);
            line.truncate(start);
            // a break split across chunks leaves an empty line behind
            if !line.is_empty() {
                return Some(line.freeze());
            }
        }
        None
    }
}

/// Deserializes every line of a streaming response as a `T`
pub struct LineDeserializer<T> {
    lines: Lines,
    _type: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> LineDeserializer<T> {
    pub fn new(lines: Lines) -> Self {
        LineDeserializer {
            lines,
            _type: PhantomData,
        }
    }

    pub async fn next(&mut self) -> Option<Result<T, Error>> {
        let line = self.lines.next().await?;
        Some(line.and_then(|bytes| serde_json::from_slice(&bytes).map_err(Error::from)))
    }
}

#[derive(Deserialize, Serialize, Clone)]
#[serde(tag = "type", content = "object", rename_all = "UPPERCASE")]
pub enum WatchEvent {
    Added(Value),
    Modified(Value),
    Deleted(Value),
    Error(ApiError),
}

/// The `Status` object that the api server sends in place of a resource when a watch fails
#[derive(Deserialize, Serialize, Debug, Clone, Eq, PartialEq)]
pub struct ApiError {
    pub status: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub reason: String,
    pub code: u16,
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "api server returned {} ({}): {}",
            self.code, self.reason, self.message
        )
    }
}

impl std::error::Error for ApiError {}

#[derive(Debug, Deserialize, PartialEq, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ListMeta {
    pub resource_version: Option<String>,
}

#[derive(Debug, Deserialize, PartialEq, Clone)]
pub struct ObjectList<T> {
    pub metadata: ListMeta,
    pub items: Vec<T>,
}

#[cfg(test)]
mod test {
    use super::*;

    fn body_of(chunks: Vec<&'static [u8]>) -> Body {
        let stream = tokio_stream::iter(chunks)
            .map(|chunk| Ok::<_, std::io::Error>(Bytes::from_static(chunk)));
        Body::wrap_stream(stream)
    }

    fn collect_lines(chunks: Vec<&'static [u8]>) -> Vec<String> {
        let mut lines = Lines::from_body(body_of(chunks));
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        runtime.block_on(async move {
            let mut all = Vec::new();
            while let Some(line) = lines.next().await {
                let line = line.expect("line returned error");
                all.push(String::from_utf8(line.to_vec()).unwrap());
            }
            all
        })
    }

    #[test]
    fn lines_iterates_lines() {
        let lines = collect_lines(vec![
            &b"line1\nline2\r\nline3\r\n\r\n\r\n\rlong"[..],
            &b"line4\r\r"[..],
            &b"\r\nline5"[..],
        ]);
        assert_eq!(vec!["line1", "line2", "line3", "longline4", "line5"], lines);
    }

    #[test]
    fn chunk_ending_right_before_a_break_keeps_lines_apart() {
        let lines = collect_lines(vec![&b"{\"a\":1}"[..], &b"\n{\"b\":2}\n"[..]]);
        assert_eq!(vec!["{\"a\":1}", "{\"b\":2}"], lines);

        let lines = collect_lines(vec![
            &b"first\r"[..],
            &b"\nsecond"[..],
            &b""[..],
            &b"\n"[..],
            &b"third"[..],
        ]);
        assert_eq!(vec!["first", "second", "third"], lines);
    }

    #[test]
    fn body_without_content_has_no_lines() {
        assert!(collect_lines(vec![]).is_empty());
        assert!(collect_lines(vec![&b"\r\n"[..], &b"\n\n"[..]]).is_empty());
    }

    #[test]
    fn each_line_is_one_watch_event() {
        let body = body_of(vec![
            &b"{\"type\":\"ADDED\",\"object\":{\"metadata\":{\"name\":\"a\"}}}"[..],
            &b"\n{\"type\":\"ERROR\",\"object\":{\"status\":\"Failure\",\"code\":410,\"reason\":\"Expired\"}}\n"[..],
        ]);
        let mut events = LineDeserializer::<WatchEvent>::new(Lines::from_body(body));
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        runtime.block_on(async move {
            match events.next().await {
                Some(Ok(WatchEvent::Added(obj))) => assert_eq!("a", obj["metadata"]["name"]),
                _ => panic!("expected an added event"),
            }
            match events.next().await {
                Some(Ok(WatchEvent::Error(err))) => assert_eq!(410, err.code),
                _ => panic!("expected an error event"),
            }
            assert!(events.next().await.is_none());
        });
    }
}
