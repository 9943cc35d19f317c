use serde::Deserialize;

use crate::RetryPolicy;

/// Configures the fetcher: concurrency cap, timeouts, headers and retries.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct FetcherOptions {
    /// Maximum number of logical requests in flight at once.
    pub max_concurrency: usize,
    /// Per-attempt timeout in milliseconds, unless the request overrides it.
    pub timeout_ms: u64,
    /// Worker threads of the pool created by `FetchService::on_enable`.
    pub worker_threads: usize,
    /// `User-Agent` sent with every request.
    pub user_agent: Option<String>,
    /// Headers sent with every request, before the request's own headers.
    pub default_headers: Vec<(String, String)>,
    /// When false, a fast-path decode error is returned without trying the
    /// lenient parser.
    pub lenient_fallback: bool,
    /// Default retry policy for [`crate::Fetcher::fetch`].
    pub retry: RetryPolicy,
}

impl Default for FetcherOptions {
    fn default() -> Self {
        Self {
            max_concurrency: 8,
            timeout_ms: 10_000,
            worker_threads: 2,
            user_agent: None,
            default_headers: Vec::new(),
            lenient_fallback: true,
            retry: RetryPolicy::default(),
        }
    }
}

impl FetcherOptions {
    /// Reads overrides from the environment on top of the defaults.
    ///
    /// Reads (all optional):
    /// - `NEWBOY_FETCH_MAX_CONCURRENCY`
    /// - `NEWBOY_FETCH_TIMEOUT_MS`
    /// - `NEWBOY_FETCH_MAX_ATTEMPTS`
    /// - `NEWBOY_FETCH_BASE_DELAY_MS`
    /// - `NEWBOY_FETCH_USER_AGENT`
    ///
    /// Returns an error if a numeric variable is set but does not parse.
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut options = Self::default();
        if let Some(value) = parse_var(&lookup, "NEWBOY_FETCH_MAX_CONCURRENCY")? {
            options.max_concurrency = value;
        }
        if let Some(value) = parse_var(&lookup, "NEWBOY_FETCH_TIMEOUT_MS")? {
            options.timeout_ms = value;
        }
        if let Some(value) = parse_var(&lookup, "NEWBOY_FETCH_MAX_ATTEMPTS")? {
            options.retry.max_attempts = value;
        }
        if let Some(value) = parse_var(&lookup, "NEWBOY_FETCH_BASE_DELAY_MS")? {
            options.retry.base_delay_ms = value;
        }
        if let Some(agent) = lookup("NEWBOY_FETCH_USER_AGENT") {
            let agent = agent.trim();
            if !agent.is_empty() {
                options.user_agent = Some(agent.to_owned());
            }
        }
        if options.max_concurrency == 0 {
            return Err("NEWBOY_FETCH_MAX_CONCURRENCY must be at least 1".to_owned());
        }
        Ok(options)
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn with_default_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.default_headers.push((name.into(), value.into()));
        self
    }
}

fn parse_var<F, T>(lookup: &F, key: &str) -> Result<Option<T>, String>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|err| format!("{key} is not a valid number '{raw}': {err}")),
    }
}
