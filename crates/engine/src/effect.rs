//! Workflow descriptions.
//!
//! An [`Effect<A, E>`] is an immutable value describing work that, when run by the
//! evaluator on some fiber, either succeeds with an `A` or fails with a
//! [`Cause<E>`]. Building an effect performs no work; the same effect may be run
//! any number of times, on any number of fibers.
//!
//! Internally an effect is a tree of [`Node`]s with type-erased payloads. The tree
//! never embeds a live fiber, only closures that may later receive one.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::oneshot;
use weft_types::{Cause, Defect, Exit, FiberId};

use crate::env::{Env, RefDef};
use crate::erased::{AnyValue, ErasedCause, ErasedExit, Payload, erase, erase_cause, erase_exit, unerase, unerase_cause, unit};
use crate::fiber::{Fiber, FiberContext};

pub(crate) type Continuation = Arc<dyn Fn(AnyValue) -> Arc<Node> + Send + Sync>;
pub(crate) type Recovery = Arc<dyn Fn(ErasedCause) -> Arc<Node> + Send + Sync>;
pub(crate) type AsyncRegister = Arc<dyn Fn(Resumer) -> Option<Arc<Node>> + Send + Sync>;
pub(crate) type SuspendStart = Arc<dyn Fn(FiberId) -> BoxFuture<'static, Resume> + Send + Sync>;
pub(crate) type EnvUpdate = Arc<dyn Fn(&AnyValue) -> (AnyValue, AnyValue) + Send + Sync>;

/// One instruction of a workflow description.
pub(crate) enum Node {
    Succeed(AnyValue),
    Fail(Arc<dyn Fn() -> ErasedCause + Send + Sync>),
    Sync(Arc<dyn Fn() -> ErasedExit + Send + Sync>),
    /// Suspend until the registered callback fires. The optional node returned by
    /// the registration runs if the fiber is interrupted while waiting.
    Async(AsyncRegister),
    FlatMap(Arc<Node>, Continuation),
    Fold {
        body: Arc<Node>,
        on_failure: Recovery,
        on_success: Continuation,
    },
    Ensuring(Arc<Node>, Arc<Node>),
    Fork {
        body: Arc<Node>,
        daemon: bool,
    },
    SetInterruptible(bool, Arc<Node>),
    InterruptStatus(Arc<dyn Fn(bool) -> Arc<Node> + Send + Sync>),
    ReadEnv(Arc<RefDef>),
    UpdateEnv(Arc<RefDef>, EnvUpdate),
    WithFiberId(Arc<dyn Fn(FiberId) -> Arc<Node> + Send + Sync>),
    Yield,
    /// Suspend on a runtime future (join, races, interrupt-await). The future
    /// is dropped if the fiber is interrupted while waiting.
    Suspend(SuspendStart),
}

/// Stand-in left behind when a child is detached from a node being dropped.
static DETACHED: LazyLock<Arc<Node>> = LazyLock::new(|| Arc::new(Node::Yield));

impl Node {
    fn detach_children(&mut self, into: &mut Vec<Arc<Node>>) {
        let mut detach = |child: &mut Arc<Node>| into.push(std::mem::replace(child, DETACHED.clone()));
        match self {
            Node::FlatMap(body, _)
            | Node::Fold { body, .. }
            | Node::Fork { body, .. }
            | Node::SetInterruptible(_, body) => detach(body),
            Node::Ensuring(body, finalizer) => {
                detach(body);
                detach(finalizer);
            }
            Node::Succeed(_)
            | Node::Fail(_)
            | Node::Sync(_)
            | Node::Async(_)
            | Node::InterruptStatus(_)
            | Node::ReadEnv(_)
            | Node::UpdateEnv(..)
            | Node::WithFiberId(_)
            | Node::Yield
            | Node::Suspend(_) => {}
        }
    }
}

/// Long descriptions are deep trees; release them with a worklist instead of
/// one native frame per node.
impl Drop for Node {
    fn drop(&mut self) {
        let mut pending = Vec::new();
        self.detach_children(&mut pending);
        while let Some(child) = pending.pop() {
            if let Some(mut node) = Arc::into_inner(child) {
                node.detach_children(&mut pending);
            }
        }
    }
}

/// Result of a suspension: the exit to continue with and the child environments
/// to merge, in order, before continuing.
pub(crate) struct Resume {
    pub(crate) exit: ErasedExit,
    pub(crate) inherit: Vec<Env>,
}

impl Resume {
    pub(crate) fn value(value: AnyValue) -> Self {
        Self {
            exit: Ok(value),
            inherit: Vec::new(),
        }
    }

    pub(crate) fn failed(cause: ErasedCause) -> Self {
        Self {
            exit: Err(cause),
            inherit: Vec::new(),
        }
    }
}

/// Single-use completion handle behind [`Callback`].
#[derive(Clone)]
pub(crate) struct Resumer {
    slot: Arc<Mutex<Option<oneshot::Sender<ErasedExit>>>>,
}

impl Resumer {
    pub(crate) fn channel() -> (Self, oneshot::Receiver<ErasedExit>) {
        let (sender, receiver) = oneshot::channel();
        (
            Self {
                slot: Arc::new(Mutex::new(Some(sender))),
            },
            receiver,
        )
    }

    fn resume(&self, exit: ErasedExit) {
        let sender = self.slot.lock().expect("async callback lock poisoned").take();
        if let Some(sender) = sender {
            // The fiber may have stopped waiting after an interruption.
            let _ = sender.send(exit);
        }
    }
}

/// Completion callback handed to [`Effect::async_callback`] registrations.
///
/// Only the first completion is delivered; later calls are ignored. Dropping every
/// copy without completing fails the waiting fiber with a defect.
pub struct Callback<A, E> {
    resumer: Resumer,
    _marker: PhantomData<fn(A, E)>,
}

impl<A, E> Clone for Callback<A, E> {
    fn clone(&self) -> Self {
        Self {
            resumer: self.resumer.clone(),
            _marker: PhantomData,
        }
    }
}

impl<A: Payload, E: Payload> Callback<A, E> {
    pub fn succeed(&self, value: A) {
        self.resumer.resume(Ok(erase(value)));
    }

    pub fn fail(&self, error: E) {
        self.resumer.resume(Err(erase_cause(Cause::fail(error))));
    }

    pub fn complete(&self, exit: Exit<A, E>) {
        self.resumer.resume(erase_exit(exit));
    }
}

/// Restores the interruptibility captured by a mask.
#[derive(Debug, Clone, Copy)]
pub struct InterruptRestore {
    interruptible: bool,
}

impl InterruptRestore {
    /// Run `effect` with the interruptibility that was in force outside the mask.
    pub fn apply<A: Payload, E: Payload>(&self, effect: Effect<A, E>) -> Effect<A, E> {
        Effect::from_node(Node::SetInterruptible(self.interruptible, effect.into_node()))
    }
}

/// Immutable description of a unit of work.
pub struct Effect<A, E> {
    node: Arc<Node>,
    _marker: PhantomData<fn() -> (A, E)>,
}

impl<A, E> Clone for Effect<A, E> {
    fn clone(&self) -> Self {
        Self {
            node: self.node.clone(),
            _marker: PhantomData,
        }
    }
}

fn continuation<A: Payload, B, E>(f: impl Fn(A) -> Effect<B, E> + Send + Sync + 'static) -> Continuation {
    Arc::new(move |value: AnyValue| f(unerase::<A>(&value)).node)
}

impl<A: Payload, E: Payload> Effect<A, E> {
    pub(crate) fn from_node(node: Node) -> Self {
        Self::from_arc(Arc::new(node))
    }

    pub(crate) fn from_arc(node: Arc<Node>) -> Self {
        Self {
            node,
            _marker: PhantomData,
        }
    }

    pub(crate) fn into_node(self) -> Arc<Node> {
        self.node
    }

    /// Suspend the running fiber on the future `start` returns for it.
    pub(crate) fn suspend<F, Fut>(start: F) -> Self
    where
        F: Fn(FiberId) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Resume> + Send + 'static,
    {
        Self::from_node(Node::Suspend(Arc::new(move |fiber: FiberId| -> BoxFuture<'static, Resume> {
            Box::pin(start(fiber))
        })))
    }

    pub fn succeed(value: A) -> Self {
        Self::from_node(Node::Succeed(erase(value)))
    }

    pub fn fail(error: E) -> Self {
        Self::fail_cause(Cause::fail(error))
    }

    pub fn fail_cause(cause: Cause<E>) -> Self {
        let cause = erase_cause(cause);
        Self::from_node(Node::Fail(Arc::new(move || cause.clone())))
    }

    /// Fail with a defect. Defects are never recovered by [`Effect::catch_all`].
    pub fn die(message: impl Into<String>) -> Self {
        Self::fail_cause(Cause::die(Defect::new(message)))
    }

    /// Suspend a side effect. A panic inside `f` becomes a `Die`.
    pub fn sync(f: impl Fn() -> A + Send + Sync + 'static) -> Self {
        Self::from_node(Node::Sync(Arc::new(move || Ok(erase(f())))))
    }

    /// Suspend a fallible side effect.
    pub fn try_sync(f: impl Fn() -> Result<A, E> + Send + Sync + 'static) -> Self {
        Self::from_node(Node::Sync(Arc::new(move || match f() {
            Ok(value) => Ok(erase(value)),
            Err(error) => Err(erase_cause(Cause::fail(error))),
        })))
    }

    /// Suspend the fiber until `register`'s callback is completed.
    pub fn async_callback(register: impl Fn(Callback<A, E>) + Send + Sync + 'static) -> Self {
        Self::from_node(Node::Async(Arc::new(move |resumer: Resumer| {
            register(Callback {
                resumer,
                _marker: PhantomData,
            });
            None
        })))
    }

    /// Like [`Effect::async_callback`], but `register` returns a canceler that
    /// runs, uninterruptibly, if the fiber is interrupted while waiting.
    pub fn async_interruptible(register: impl Fn(Callback<A, E>) -> Effect<(), E> + Send + Sync + 'static) -> Self {
        Self::from_node(Node::Async(Arc::new(move |resumer: Resumer| {
            let canceler = register(Callback {
                resumer,
                _marker: PhantomData,
            });
            Some(canceler.into_node())
        })))
    }

    /// Run a future produced by `make` on the worker pool. Interrupting the fiber
    /// aborts the future.
    pub fn from_future<F, Fut>(make: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<A, E>> + Send + 'static,
    {
        Self::async_interruptible(move |callback| {
            let future = make();
            let task = tokio::spawn(async move {
                match future.await {
                    Ok(value) => callback.succeed(value),
                    Err(error) => callback.fail(error),
                }
            });
            let abort = task.abort_handle();
            Effect::sync(move || abort.abort())
        })
    }

    pub fn flat_map<B: Payload>(self, f: impl Fn(A) -> Effect<B, E> + Send + Sync + 'static) -> Effect<B, E> {
        Effect::from_node(Node::FlatMap(self.node, continuation(f)))
    }

    pub fn map<B: Payload>(self, f: impl Fn(A) -> B + Send + Sync + 'static) -> Effect<B, E> {
        self.flat_map(move |value| Effect::succeed(f(value)))
    }

    /// Run `self`, discard its value, then run `next`.
    pub fn zip_right<B: Payload>(self, next: Effect<B, E>) -> Effect<B, E> {
        self.flat_map(move |_| next.clone())
    }

    pub fn as_value<B: Payload>(self, value: B) -> Effect<B, E> {
        self.map(move |_| value.clone())
    }

    pub fn as_unit(self) -> Effect<(), E> {
        self.map(|_| ())
    }

    /// Handle both outcomes. This is the only primitive through which a failure
    /// can be recovered; handlers are skipped while the fiber is being interrupted.
    pub fn fold_cause<B: Payload, E2: Payload>(
        self,
        on_failure: impl Fn(Cause<E>) -> Effect<B, E2> + Send + Sync + 'static,
        on_success: impl Fn(A) -> Effect<B, E2> + Send + Sync + 'static,
    ) -> Effect<B, E2> {
        Effect::from_node(Node::Fold {
            body: self.node,
            on_failure: Arc::new(move |cause: ErasedCause| on_failure(unerase_cause::<E>(cause)).node),
            on_success: continuation(on_success),
        })
    }

    /// Recover from a typed failure. Causes containing a defect or an interruption
    /// are re-raised untouched.
    pub fn catch_all(self, handler: impl Fn(E) -> Effect<A, E> + Send + Sync + 'static) -> Effect<A, E> {
        self.fold_cause(
            move |cause: Cause<E>| {
                let recoverable = !cause.contains_die() && !cause.contains_interrupt();
                match cause.first_failure().cloned() {
                    Some(error) if recoverable => handler(error),
                    _ => Effect::fail_cause(cause),
                }
            },
            Effect::succeed,
        )
    }

    pub fn map_error<E2: Payload>(self, f: impl Fn(E) -> E2 + Send + Sync + 'static) -> Effect<A, E2> {
        self.fold_cause(move |cause| Effect::fail_cause(cause.map(&f)), Effect::succeed)
    }

    /// Run `finalizer` once `self` finishes, however it finishes. The finalizer is
    /// uninterruptible; if it fails, its cause is sequenced after the original.
    pub fn ensuring(self, finalizer: Effect<(), E>) -> Self {
        Self::from_node(Node::Ensuring(self.node, finalizer.node))
    }

    /// Start `self` on a new child fiber and return its handle immediately.
    pub fn fork(self) -> Effect<Fiber<A, E>, E> {
        Self::fork_node(self.node, false)
    }

    /// Like [`Effect::fork`], but the child is not supervised by the parent and may
    /// outlive it.
    pub fn fork_daemon(self) -> Effect<Fiber<A, E>, E> {
        Self::fork_node(self.node, true)
    }

    fn fork_node(body: Arc<Node>, daemon: bool) -> Effect<Fiber<A, E>, E> {
        let fork = Effect::<Arc<FiberContext>, E>::from_node(Node::Fork { body, daemon });
        fork.map(Fiber::new)
    }

    pub fn interruptible(self) -> Self {
        Self::from_node(Node::SetInterruptible(true, self.node))
    }

    pub fn uninterruptible(self) -> Self {
        Self::from_node(Node::SetInterruptible(false, self.node))
    }

    /// Run `f` uninterruptibly; `f` receives a restore that re-enables the
    /// interruptibility in force outside the mask.
    pub fn uninterruptible_mask(f: impl Fn(InterruptRestore) -> Effect<A, E> + Send + Sync + 'static) -> Self {
        Self::from_node(Node::InterruptStatus(Arc::new(move |interruptible: bool| {
            let body = f(InterruptRestore { interruptible });
            Arc::new(Node::SetInterruptible(false, body.node))
        })))
    }

    /// Run `f` interruptibly; `f` receives a restore for the outer interruptibility.
    pub fn interruptible_mask(f: impl Fn(InterruptRestore) -> Effect<A, E> + Send + Sync + 'static) -> Self {
        Self::from_node(Node::InterruptStatus(Arc::new(move |interruptible: bool| {
            let body = f(InterruptRestore { interruptible });
            Arc::new(Node::SetInterruptible(true, body.node))
        })))
    }
}

impl<E: Payload> Effect<(), E> {
    pub fn unit() -> Self {
        Self::from_node(Node::Succeed(unit()))
    }

    /// Give other fibers a chance to run on this worker.
    pub fn yield_now() -> Self {
        Self::from_node(Node::Yield)
    }

    /// Suspend the fiber for `duration`. Interruptible.
    pub fn sleep(duration: Duration) -> Self {
        Self::from_future(move || async move {
            tokio::time::sleep(duration).await;
            Ok(())
        })
    }
}

impl<E: Payload> Effect<FiberId, E> {
    /// Identity of the fiber running this effect.
    pub fn fiber_id() -> Self {
        Self::from_node(Node::WithFiberId(Arc::new(|id: FiberId| Arc::new(Node::Succeed(erase(id))))))
    }
}
