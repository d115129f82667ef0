//! Entry points for hosts.
//!
//! A [`Runtime`] binds the evaluator to a tokio worker pool. It can own that pool
//! ([`Runtime::new`]) or borrow one the host already runs ([`Runtime::with_handle`],
//! [`Runtime::current`]).

use std::sync::Arc;

use anyhow::Context;
use tokio::runtime::Handle;
use tracing::{debug, info};
use weft_types::Exit;

use crate::config::RuntimeConfig;
use crate::effect::Effect;
use crate::env::Env;
use crate::erased::Payload;
use crate::evaluator::spawn_fiber;
use crate::fiber::{Fiber, FiberContext};

/// State shared by every fiber started through one [`Runtime`].
pub(crate) struct RuntimeShared {
    pub(crate) handle: Handle,
    pub(crate) config: RuntimeConfig,
}

pub struct Runtime {
    shared: Arc<RuntimeShared>,
    owned: Option<tokio::runtime::Runtime>,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.shared.config)
            .field("owns_pool", &self.owned.is_some())
            .finish()
    }
}

impl Runtime {
    /// Build a runtime that owns a multi-threaded worker pool.
    ///
    /// # Errors
    /// Returns an error if `config` is invalid or the pool cannot be started.
    pub fn new(config: RuntimeConfig) -> anyhow::Result<Self> {
        config.validate()?;
        let pool = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.worker_threads)
            .thread_name(config.thread_name.clone())
            .enable_all()
            .build()
            .context("failed to start the fiber worker pool")?;
        info!(
            workers = config.worker_threads,
            yield_after_ops = config.yield_after_ops,
            "fiber runtime started"
        );
        Ok(Self {
            shared: Arc::new(RuntimeShared {
                handle: pool.handle().clone(),
                config,
            }),
            owned: Some(pool),
        })
    }

    /// [`Runtime::new`] with [`RuntimeConfig::from_env`].
    pub fn from_env() -> anyhow::Result<Self> {
        let config = RuntimeConfig::from_env().context("invalid runtime configuration in environment")?;
        Self::new(config)
    }

    /// Run fibers on a tokio runtime owned by the host.
    ///
    /// # Errors
    /// Returns an error if `config` is invalid. `worker_threads` is checked even
    /// though the host's pool decides the actual worker count.
    pub fn with_handle(handle: Handle, config: RuntimeConfig) -> anyhow::Result<Self> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(RuntimeShared { handle, config }),
            owned: None,
        })
    }

    /// Run fibers on the tokio runtime the caller is running in.
    pub fn current() -> anyhow::Result<Self> {
        let handle = Handle::try_current().context("Runtime::current called outside of a tokio runtime")?;
        Self::with_handle(handle, RuntimeConfig::default())
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.shared.config
    }

    pub fn handle(&self) -> &Handle {
        &self.shared.handle
    }

    /// Start `effect` on a new root fiber seeded with `env`.
    ///
    /// The fiber is scheduled before this returns; its exit is observed through
    /// the returned handle.
    pub fn run<A: Payload, E: Payload>(&self, effect: Effect<A, E>, env: Env) -> Fiber<A, E> {
        let fiber = FiberContext::root();
        debug!(fiber = %fiber.id(), refs = env.len(), "starting root fiber");
        spawn_fiber(&self.shared, fiber.clone(), env, effect.into_node());
        Fiber::new(fiber)
    }

    /// Run `effect` with an empty environment and wait for its exit.
    pub async fn run_to_exit<A: Payload, E: Payload>(&self, effect: Effect<A, E>) -> Exit<A, E> {
        self.run(effect, Env::empty()).wait().await
    }

    /// Run `effect` from synchronous code and block until it exits.
    ///
    /// # Notes
    /// - Inside a multi-threaded tokio runtime the current worker is handed off
    ///   with `block_in_place` while waiting.
    /// - Must not be called from a current-thread tokio runtime.
    pub fn block_on<A: Payload, E: Payload>(&self, effect: Effect<A, E>) -> Exit<A, E> {
        let fiber = self.run(effect, Env::empty());
        if Handle::try_current().is_ok() {
            tokio::task::block_in_place(|| self.shared.handle.block_on(fiber.wait()))
        } else {
            self.shared.handle.block_on(fiber.wait())
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if let Some(pool) = self.owned.take() {
            debug!("shutting down fiber worker pool");
            pool.shutdown_background();
        }
    }
}
