//! Scripted HTTP transport for tests.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use tokio::time::Instant;

use crate::transport::{HttpRequest, HttpResponse, HttpTransport, TransportError};

/// One scripted reply.
#[derive(Debug, Clone)]
pub enum MockReply {
    Status(u16, String),
    NetworkError,
    /// Wait, then reply.
    Delayed(Duration, Box<MockReply>),
}

impl MockReply {
    pub fn ok(body: impl Into<String>) -> Self {
        MockReply::Status(200, body.into())
    }

    pub fn status(status: u16) -> Self {
        MockReply::Status(status, String::new())
    }

    pub fn delayed(self, delay: Duration) -> Self {
        MockReply::Delayed(delay, Box::new(self))
    }
}

/// A request as seen by the mock, with the (possibly paused) clock reading.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: Method,
    pub url: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
    pub at: Instant,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

struct Script {
    path: String,
    replies: VecDeque<MockReply>,
}

/// Replies from per-path scripts in order; unscripted requests get the default
/// reply (200 with `{}` unless changed).
pub struct MockHttpTransport {
    scripts: Mutex<Vec<Script>>,
    default_reply: Mutex<MockReply>,
    requests: Mutex<Vec<RecordedRequest>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Path portion of a URL, without scheme, host or query.
fn path_of(url: &str) -> String {
    let without_query = url.split('?').next().unwrap_or(url);
    match without_query.split_once("://") {
        Some((_, rest)) => rest
            .find('/')
            .map(|i| rest[i..].to_string())
            .unwrap_or_else(|| "/".to_string()),
        None => without_query.to_string(),
    }
}

impl Default for MockHttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockHttpTransport {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(Vec::new()),
            default_reply: Mutex::new(MockReply::ok("{}")),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Queue a reply for requests whose path ends with `path`.
    pub fn push(&self, path: &str, reply: MockReply) -> &Self {
        let mut scripts = lock(&self.scripts);
        match scripts.iter_mut().find(|s| s.path == path) {
            Some(script) => script.replies.push_back(reply),
            None => scripts.push(Script {
                path: path.to_string(),
                replies: VecDeque::from([reply]),
            }),
        }
        self
    }

    /// Queue the same reply `n` times.
    pub fn push_n(&self, path: &str, reply: MockReply, n: usize) -> &Self {
        for _ in 0..n {
            self.push(path, reply.clone());
        }
        self
    }

    pub fn set_default(&self, reply: MockReply) {
        *lock(&self.default_reply) = reply;
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        lock(&self.requests).clone()
    }

    /// Requests whose path ends with `path`.
    pub fn requests_to(&self, path: &str) -> Vec<RecordedRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.path.ends_with(path))
            .collect()
    }

    pub fn count(&self, path: &str) -> usize {
        self.requests_to(path).len()
    }

    fn next_reply(&self, path: &str) -> MockReply {
        let mut scripts = lock(&self.scripts);
        scripts
            .iter_mut()
            .filter(|s| path.ends_with(&s.path))
            .find_map(|s| s.replies.pop_front())
            .unwrap_or_else(|| lock(&self.default_reply).clone())
    }
}

#[async_trait]
impl HttpTransport for MockHttpTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let path = path_of(&request.url);
        lock(&self.requests).push(RecordedRequest {
            method: request.method.clone(),
            url: request.url.clone(),
            path: path.clone(),
            headers: request.headers.clone(),
            body: request.body.clone(),
            at: Instant::now(),
        });

        let mut reply = self.next_reply(&path);
        loop {
            match reply {
                MockReply::Delayed(delay, inner) => {
                    tokio::time::sleep(delay).await;
                    reply = *inner;
                }
                MockReply::Status(status, body) => return Ok(HttpResponse { status, body }),
                MockReply::NetworkError => {
                    return Err(TransportError::Connect("connection refused".into()))
                }
            }
        }
    }
}
