//! Binding between the plugin host's enable/disable hooks and the fetcher.

use std::future::Future;

use tokio::{runtime::Runtime, task::JoinHandle};

use crate::{FetchError, Fetcher, FetcherOptions, RequestDescriptor, Response, Result};

/// Hooks the host calls when it loads and unloads the plugin.
pub trait PluginLifecycle {
    fn on_enable(&mut self) -> Result<()>;
    fn on_disable(&mut self);
}

struct Active {
    runtime: Runtime,
    fetcher: Fetcher,
}

/// Owns the worker pool, admission gate and fetcher between `on_enable` and
/// `on_disable`.
///
/// Outside that window every entry point fails with [`FetchError::Disabled`],
/// so no network I/O happens before enable or after disable.
pub struct FetchService {
    options: FetcherOptions,
    active: Option<Active>,
}

impl std::fmt::Debug for FetchService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchService")
            .field("options", &self.options)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

impl FetchService {
    pub fn new(options: FetcherOptions) -> Self {
        Self {
            options,
            active: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.active.is_some()
    }

    pub fn options(&self) -> &FetcherOptions {
        &self.options
    }

    /// Handle to the live fetcher. Clones stop working once the service is
    /// disabled.
    pub fn fetcher(&self) -> Result<Fetcher> {
        self.active
            .as_ref()
            .map(|active| active.fetcher.clone())
            .ok_or(FetchError::Disabled)
    }

    /// Runs `future` on the service's worker pool.
    pub fn spawn<F>(&self, future: F) -> Result<JoinHandle<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let active = self.active.as_ref().ok_or(FetchError::Disabled)?;
        Ok(active.runtime.spawn(future))
    }

    /// Fetches `request` on the worker pool with the default retry policy.
    pub fn spawn_fetch(&self, request: RequestDescriptor) -> Result<JoinHandle<Result<Response>>> {
        let fetcher = self.fetcher()?;
        self.spawn(async move { fetcher.fetch(&request).await })
    }
}

impl PluginLifecycle for FetchService {
    fn on_enable(&mut self) -> Result<()> {
        if self.active.is_some() {
            return Ok(());
        }

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(self.options.worker_threads.max(1))
            .thread_name("fetch-worker")
            .enable_all()
            .build()?;
        let fetcher = Fetcher::new(self.options.clone())?;

        #[cfg(feature = "tracing")]
        tracing::info!(
            max_concurrency = fetcher.gate().capacity(),
            worker_threads = self.options.worker_threads.max(1),
            "fetch service enabled"
        );

        self.active = Some(Active { runtime, fetcher });
        Ok(())
    }

    fn on_disable(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };

        #[cfg(feature = "tracing")]
        {
            let in_flight = active.fetcher.gate().in_flight();
            if in_flight > 0 {
                tracing::warn!(in_flight, "fetch service disabled with requests in flight");
            }
        }

        active.fetcher.shutdown();
        // Does not block, so the host may call this from async context.
        active.runtime.shutdown_background();
    }
}

impl Drop for FetchService {
    fn drop(&mut self) {
        self.on_disable();
    }
}
