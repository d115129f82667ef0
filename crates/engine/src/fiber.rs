//! Fiber lifecycle.
//!
//! A [`FiberContext`] is the shared, runtime-side record of one fiber: its
//! identity, status, pending interrupt request, supervised children and, once it
//! terminates, its outcome. Only the fiber's own evaluator mutates its control
//! state and environment; other fibers can merely raise the interrupt flag and
//! wait for the outcome.
//!
//! [`Fiber<A, E>`] is the typed handle returned by `fork` and `Runtime::run`.

use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tracing::debug;
use weft_types::{Exit, FiberId, FiberStatus};

use crate::effect::{Effect, Resume};
use crate::env::Env;
use crate::erased::{ErasedExit, Payload, erase, unerase_exit};

static COMPLETIONS: AtomicU64 = AtomicU64::new(0);

/// Terminal state published by a fiber's evaluator.
pub(crate) struct FiberOutcome {
    pub(crate) exit: ErasedExit,
    /// The fiber's environment at the moment it terminated.
    pub(crate) env: Env,
    /// Process-wide completion stamp; lower finished earlier.
    pub(crate) completed: u64,
}

impl FiberOutcome {
    pub(crate) fn is_success(&self) -> bool {
        self.exit.is_ok()
    }
}

impl Resume {
    /// Continue with `outcome`'s exit, inheriting its environment on success only.
    pub(crate) fn inheriting(outcome: &FiberOutcome) -> Self {
        let inherit = if outcome.is_success() { vec![outcome.env.clone()] } else { Vec::new() };
        Self {
            exit: outcome.exit.clone(),
            inherit,
        }
    }
}

pub(crate) struct FiberContext {
    id: FiberId,
    parent: Option<FiberId>,
    daemon: bool,
    status: Mutex<FiberStatus>,
    interrupt: watch::Sender<Option<FiberId>>,
    outcome: watch::Sender<Option<Arc<FiberOutcome>>>,
    children: Mutex<Vec<Arc<FiberContext>>>,
}

impl fmt::Debug for FiberContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiberContext")
            .field("id", &self.id)
            .field("parent", &self.parent)
            .field("status", &self.status())
            .finish()
    }
}

impl FiberContext {
    /// A fiber started directly by the runtime.
    pub(crate) fn root() -> Arc<Self> {
        Self::create(None, false)
    }

    pub(crate) fn child(parent: FiberId, daemon: bool) -> Arc<Self> {
        Self::create(Some(parent), daemon)
    }

    fn create(parent: Option<FiberId>, daemon: bool) -> Arc<Self> {
        let (interrupt, _) = watch::channel(None);
        let (outcome, _) = watch::channel(None);
        Arc::new(Self {
            id: FiberId::next(),
            parent,
            daemon,
            status: Mutex::new(FiberStatus::Running),
            interrupt,
            outcome,
            children: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn id(&self) -> FiberId {
        self.id
    }

    pub(crate) fn parent(&self) -> Option<FiberId> {
        self.parent
    }

    /// Nobody is structurally obliged to observe this fiber's exit.
    pub(crate) fn is_unsupervised(&self) -> bool {
        self.parent.is_none() || self.daemon
    }

    pub(crate) fn status(&self) -> FiberStatus {
        *self.status.lock().expect("fiber status lock poisoned")
    }

    pub(crate) fn set_status(&self, status: FiberStatus) {
        *self.status.lock().expect("fiber status lock poisoned") = status;
    }

    pub(crate) fn is_done(&self) -> bool {
        self.outcome.borrow().is_some()
    }

    /// Raise the interrupt flag. Only the first request is recorded; requests
    /// against a finished fiber are ignored.
    pub(crate) fn request_interrupt(&self, by: FiberId) {
        if self.is_done() {
            return;
        }
        let recorded = self.interrupt.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(by);
            true
        });
        if recorded {
            debug!(fiber = %self.id, by = %by, "interrupt requested");
        }
    }

    pub(crate) fn subscribe_interrupt(&self) -> watch::Receiver<Option<FiberId>> {
        self.interrupt.subscribe()
    }

    pub(crate) fn poll_outcome(&self) -> Option<Arc<FiberOutcome>> {
        self.outcome.borrow().clone()
    }

    /// Wait until the fiber has published its outcome.
    pub(crate) async fn outcome(&self) -> Arc<FiberOutcome> {
        let mut receiver = self.outcome.subscribe();
        let published = receiver.wait_for(Option::is_some).await.ok().and_then(|outcome| outcome.clone());
        match published {
            Some(outcome) => outcome,
            // The sender lives as long as `self`, so the channel cannot close.
            None => std::future::pending().await,
        }
    }

    /// Request interruption and wait until the fiber, finalizers included, is done.
    pub(crate) async fn interrupt_as(&self, by: FiberId) -> Arc<FiberOutcome> {
        self.request_interrupt(by);
        self.outcome().await
    }

    pub(crate) fn complete(&self, exit: ErasedExit, env: Env) {
        let outcome = FiberOutcome {
            exit,
            env,
            completed: COMPLETIONS.fetch_add(1, Ordering::SeqCst),
        };
        self.set_status(FiberStatus::Done);
        self.outcome.send_replace(Some(Arc::new(outcome)));
    }

    pub(crate) fn adopt(&self, child: Arc<FiberContext>) {
        let mut children = self.children.lock().expect("fiber children lock poisoned");
        children.retain(|existing| !existing.is_done());
        children.push(child);
    }

    pub(crate) fn take_children(&self) -> Vec<Arc<FiberContext>> {
        std::mem::take(&mut *self.children.lock().expect("fiber children lock poisoned"))
    }
}

/// Request interruption of every fiber in `fibers` and wait for all of them.
pub(crate) async fn interrupt_all(fibers: Vec<Arc<FiberContext>>, by: FiberId) {
    for fiber in &fibers {
        fiber.request_interrupt(by);
    }
    for fiber in fibers {
        fiber.outcome().await;
    }
}

/// Typed handle to a running or finished fiber.
pub struct Fiber<A, E> {
    context: Arc<FiberContext>,
    _marker: PhantomData<fn() -> (A, E)>,
}

impl<A, E> Clone for Fiber<A, E> {
    fn clone(&self) -> Self {
        Self {
            context: self.context.clone(),
            _marker: PhantomData,
        }
    }
}

impl<A, E> fmt::Debug for Fiber<A, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber").field("id", &self.context.id).finish()
    }
}

impl<A: Payload, E: Payload> Fiber<A, E> {
    pub(crate) fn new(context: Arc<FiberContext>) -> Self {
        Self {
            context,
            _marker: PhantomData,
        }
    }

    pub fn id(&self) -> FiberId {
        self.context.id
    }

    pub fn status(&self) -> FiberStatus {
        self.context.status()
    }

    /// Wait for the fiber. On success its environment is merged into the joiner's
    /// and its value returned; on failure its cause is propagated unchanged and the
    /// joiner's environment is left alone.
    pub fn join(&self) -> Effect<A, E> {
        let context = self.context.clone();
        Effect::suspend(move |_joiner| {
            let context = context.clone();
            async move {
                let outcome = context.outcome().await;
                Resume::inheriting(&outcome)
            }
        })
    }

    /// Wait for the fiber and return its exit as a value. Never merges environments.
    pub fn await_exit<E2: Payload>(&self) -> Effect<Exit<A, E>, E2> {
        let context = self.context.clone();
        Effect::suspend(move |_waiter| {
            let context = context.clone();
            async move {
                let outcome = context.outcome().await;
                Resume::value(erase(unerase_exit::<A, E>(&outcome.exit)))
            }
        })
    }

    /// Interrupt the fiber on behalf of the running fiber and wait until it has
    /// finished, finalizers included.
    pub fn interrupt<E2: Payload>(&self) -> Effect<Exit<A, E>, E2> {
        let context = self.context.clone();
        Effect::suspend(move |interruptor| {
            let context = context.clone();
            async move {
                let outcome = context.interrupt_as(interruptor).await;
                Resume::value(erase(unerase_exit::<A, E>(&outcome.exit)))
            }
        })
    }

    /// Wait for the exit from outside the runtime.
    pub async fn wait(&self) -> Exit<A, E> {
        let outcome = self.context.outcome().await;
        unerase_exit(&outcome.exit)
    }

    /// The exit, if the fiber has already finished.
    pub fn poll(&self) -> Option<Exit<A, E>> {
        self.context.poll_outcome().map(|outcome| unerase_exit(&outcome.exit))
    }

    /// Ask the fiber to stop without waiting. The interruptor is [`FiberId::NONE`].
    pub fn request_interrupt(&self) {
        self.context.request_interrupt(FiberId::NONE);
    }
}
