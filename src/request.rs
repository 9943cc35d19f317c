use std::time::Duration;

use reqwest::Method;
use serde::Serialize;
use tokio::time::Instant;

use crate::{FetchError, Result};

/// Immutable description of one outbound HTTP request.
///
/// Built with the consuming `with_*` methods and then handed to
/// [`crate::Fetcher::fetch`]. Header order is preserved and names may repeat.
#[derive(Clone, Debug)]
pub struct RequestDescriptor {
    url: String,
    method: Method,
    headers: Vec<(String, String)>,
    body: Option<Vec<u8>>,
    timeout: Option<Duration>,
    deadline: Option<Instant>,
}

impl RequestDescriptor {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method,
            headers: Vec::new(),
            body: None,
            timeout: None,
            deadline: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn head(url: impl Into<String>) -> Self {
        Self::new(Method::HEAD, url)
    }

    pub fn post(url: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self::new(Method::POST, url).with_body(body)
    }

    /// POST with a JSON body and `Content-Type: application/json`.
    pub fn post_json<T: Serialize + ?Sized>(url: impl Into<String>, payload: &T) -> Result<Self> {
        let body = serde_json::to_vec(payload)
            .map_err(|err| FetchError::InvalidRequest(format!("unserializable body: {err}")))?;
        Ok(Self::post(url, body).with_header("Content-Type", "application/json;charset=utf-8"))
    }

    /// Appends a header; earlier values with the same name are kept.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Overrides the fetcher's per-attempt timeout for this request.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets an overall deadline, checked before every attempt.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Sets the overall deadline relative to now.
    pub fn with_deadline_in(self, budget: Duration) -> Self {
        self.with_deadline(Instant::now() + budget)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn body(&self) -> Option<&[u8]> {
        self.body.as_deref()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub(crate) fn deadline_passed(&self) -> bool {
        self.deadline
            .is_some_and(|deadline| Instant::now() >= deadline)
    }
}
