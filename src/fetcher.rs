use std::{fmt, sync::Arc, time::Duration};

use reqwest::header;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::{
    decode::JsonDecoder, AdmissionGate, Decode, FetchError, FetcherOptions, RequestDescriptor,
    Response, Result, RetryPolicy,
};

/// Availability report produced by [`Fetcher::probe`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResourceInfo {
    pub url: String,
    pub available: bool,
    pub status: Option<u16>,
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
    pub error: Option<String>,
}

/// Outcome of one attempt that may be retried.
enum AttemptFailure {
    Retryable(FetchError),
    Terminal(FetchError),
}

/// Resilient HTTP fetcher: bounded concurrency, retry with backoff and
/// deferred dual-path JSON decoding.
///
/// Clones share the HTTP connection pool, the admission gate, the decoder
/// statistics and the shutdown token.
#[derive(Clone)]
pub struct Fetcher {
    http: reqwest::Client,
    gate: AdmissionGate,
    decoder: Arc<JsonDecoder>,
    options: Arc<FetcherOptions>,
    shutdown: CancellationToken,
}

impl fmt::Debug for Fetcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fetcher")
            .field("options", &self.options)
            .field("capacity", &self.gate.capacity())
            .field("in_flight", &self.gate.in_flight())
            .field("shut_down", &self.shutdown.is_cancelled())
            .finish()
    }
}

impl Fetcher {
    /// Creates a fetcher with its own admission gate sized from `options`.
    pub fn new(options: FetcherOptions) -> Result<Self> {
        let gate = AdmissionGate::new(options.max_concurrency);
        Self::with_gate(options, gate)
    }

    /// Creates a fetcher that shares an existing admission gate.
    pub fn with_gate(options: FetcherOptions, gate: AdmissionGate) -> Result<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(agent) = options.user_agent.as_deref() {
            builder = builder.user_agent(agent);
        }
        let http = builder.build().map_err(FetchError::Transport)?;
        Ok(Self::from_parts(http, options, gate))
    }

    /// Wraps an already configured `reqwest` client.
    pub fn from_parts(http: reqwest::Client, options: FetcherOptions, gate: AdmissionGate) -> Self {
        let decoder = Arc::new(JsonDecoder::new(options.lenient_fallback));
        Self {
            http,
            gate,
            decoder,
            options: Arc::new(options),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn options(&self) -> &FetcherOptions {
        &self.options
    }

    pub fn gate(&self) -> &AdmissionGate {
        &self.gate
    }

    /// Decoder shared by every response this fetcher returns.
    pub fn decoder(&self) -> &JsonDecoder {
        &self.decoder
    }

    /// Closes the gate and cancels every fetch in progress.
    pub fn shutdown(&self) {
        self.gate.close();
        self.shutdown.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Fetches with the default retry policy from the options.
    pub async fn fetch(&self, request: &RequestDescriptor) -> Result<Response> {
        self.fetch_with(request, &self.options.retry).await
    }

    /// Fetches with a caller-provided retry policy.
    pub async fn fetch_with(
        &self,
        request: &RequestDescriptor,
        policy: &RetryPolicy,
    ) -> Result<Response> {
        self.fetch_cancellable(request, policy, &CancellationToken::new())
            .await
    }

    /// Fetches until success, a terminal failure, exhaustion, the deadline,
    /// or cancellation through `cancel` or [`Fetcher::shutdown`].
    ///
    /// One admission permit is held for the whole call, across retries. It is
    /// released on every exit path, including cancellation while waiting for
    /// the network or sleeping between attempts.
    pub async fn fetch_cancellable(
        &self,
        request: &RequestDescriptor,
        policy: &RetryPolicy,
        cancel: &CancellationToken,
    ) -> Result<Response> {
        if self.shutdown.is_cancelled() {
            return Err(FetchError::Disabled);
        }
        if cancel.is_cancelled() {
            return Err(FetchError::Cancelled);
        }

        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(FetchError::Cancelled),
            _ = self.shutdown.cancelled() => return Err(FetchError::Disabled),
            permit = self.gate.acquire() => permit?,
        };

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(FetchError::Cancelled),
            _ = self.shutdown.cancelled() => Err(FetchError::Cancelled),
            outcome = self.run_attempts(request, policy) => outcome,
        };

        drop(permit);
        outcome
    }

    /// GET `url` and decode the body into `T`.
    pub async fn get_json<T: Decode>(&self, url: &str) -> Result<Arc<T>> {
        let response = self
            .fetch(&RequestDescriptor::get(url).with_header("Accept", "application/json"))
            .await?;
        Ok(response.decode::<T>()?)
    }

    /// Sends a HEAD request and reports whether the resource is reachable.
    ///
    /// Never fails; transport and status errors are recorded in the report.
    pub async fn probe(&self, url: &str) -> ResourceInfo {
        let mut info = ResourceInfo {
            url: url.to_owned(),
            ..ResourceInfo::default()
        };

        match self.fetch(&RequestDescriptor::head(url)).await {
            Ok(response) => {
                info.available = true;
                info.status = Some(response.status().as_u16());
                info.content_type = response.header(header::CONTENT_TYPE.as_str()).map(str::to_owned);
                info.content_length = response
                    .header(header::CONTENT_LENGTH.as_str())
                    .and_then(|value| value.trim().parse().ok());
            }
            Err(err) => {
                info.status = err.status();
                info.error = Some(err.to_string());
            }
        }
        info
    }

    async fn run_attempts(
        &self,
        request: &RequestDescriptor,
        policy: &RetryPolicy,
    ) -> Result<Response> {
        let limit = policy.attempt_limit();
        let mut attempt = 0u32;
        loop {
            if request.deadline_passed() {
                return Err(FetchError::DeadlineExceeded { attempts: attempt });
            }
            if self.gate.is_closed() {
                return Err(FetchError::Disabled);
            }

            attempt += 1;
            let error = match self.send_once(request, policy, attempt).await {
                Ok(response) => return Ok(response),
                Err(AttemptFailure::Terminal(err)) => return Err(err),
                Err(AttemptFailure::Retryable(err)) => err,
            };

            if attempt >= limit {
                return Err(FetchError::RetryExhausted {
                    attempts: attempt,
                    last: Box::new(error),
                });
            }

            let delay = policy.delay_after(attempt);

            #[cfg(feature = "tracing")]
            tracing::debug!(
                url = request.url(),
                attempt,
                "retrying after {} ms: {error}",
                delay.as_millis()
            );

            sleep(delay).await;
        }
    }

    async fn send_once(
        &self,
        request: &RequestDescriptor,
        policy: &RetryPolicy,
        attempt: u32,
    ) -> std::result::Result<Response, AttemptFailure> {
        let timeout = request
            .timeout()
            .unwrap_or(Duration::from_millis(self.options.timeout_ms));

        let mut builder = self
            .http
            .request(request.method().clone(), request.url())
            .timeout(timeout);
        for (name, value) in self.options.default_headers.iter().chain(request.headers()) {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body() {
            builder = builder.body(body.to_vec());
        }

        let transport = |err: reqwest::Error| {
            if policy.is_retryable_transport(&err) {
                AttemptFailure::Retryable(FetchError::Transport(err))
            } else {
                AttemptFailure::Terminal(FetchError::Transport(err))
            }
        };

        let response = builder.send().await.map_err(transport)?;
        let status = response.status();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_owned(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();
        let body = response.bytes().await.map_err(transport)?.to_vec();

        if status.is_success() {
            return Ok(Response::new(
                status,
                headers,
                body,
                attempt,
                Arc::clone(&self.decoder),
            ));
        }

        let error = FetchError::Status {
            status: status.as_u16(),
            body: String::from_utf8_lossy(&body).into_owned(),
        };
        if policy.is_retryable_status(status) {
            Err(AttemptFailure::Retryable(error))
        } else {
            Err(AttemptFailure::Terminal(error))
        }
    }
}
