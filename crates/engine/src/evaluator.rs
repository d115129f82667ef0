//! The trampoline evaluator.
//!
//! One [`Evaluator`] drives one fiber. It keeps its continuations on an explicit,
//! heap-allocated stack, so arbitrarily long `flat_map` chains never grow the
//! native stack. Each iteration of the loop either descends into a node, pops a
//! frame with a value, pops a frame with a cause, or suspends the fiber on a
//! future until a callback, a child fiber or an interrupt request wakes it.
//!
//! Interruption is cooperative. The flag raised by [`FiberContext::request_interrupt`]
//! is observed only at `flat_map` boundaries, at suspension points and when an
//! interruptible region is re-entered, and only while the fiber is interruptible.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, warn};
use weft_types::{Cause, Defect, FiberId, FiberStatus};

use crate::effect::{AsyncRegister, Continuation, Node, Recovery, Resume, Resumer, SuspendStart};
use crate::env::Env;
use crate::erased::{AnyValue, ErasedCause, ErasedExit, erase, guard, unit};
use crate::fiber::{FiberContext, interrupt_all};
use crate::runtime::RuntimeShared;

const DROPPED_CALLBACK: &str = "async callback dropped without being invoked";

enum Frame {
    Continue(Continuation),
    Fold {
        on_failure: Recovery,
        on_success: Continuation,
    },
    /// Finalizer registered by `ensuring`, not yet run.
    Finalizer(Arc<Node>),
    RestoreInterruptible(bool),
    /// A finalizer is running; `outcome` is what the protected body produced.
    FinalizerDone {
        restore: bool,
        outcome: ErasedExit,
    },
}

enum Step {
    Eval(Arc<Node>),
    Return(AnyValue),
    Unwind(ErasedCause),
}

impl From<ErasedExit> for Step {
    fn from(exit: ErasedExit) -> Self {
        match exit {
            Ok(value) => Step::Return(value),
            Err(cause) => Step::Unwind(cause),
        }
    }
}

/// Start `root` on `fiber` as a new task on the worker pool.
pub(crate) fn spawn_fiber(shared: &Arc<RuntimeShared>, fiber: Arc<FiberContext>, env: Env, root: Arc<Node>) {
    let evaluator = Evaluator::new(fiber, env, shared.clone());
    shared.handle.spawn(evaluator.run(root));
}

pub(crate) struct Evaluator {
    fiber: Arc<FiberContext>,
    env: Env,
    stack: Vec<Frame>,
    interruptible: bool,
    interrupt_rx: watch::Receiver<Option<FiberId>>,
    ops_since_yield: u32,
    shared: Arc<RuntimeShared>,
}

impl Evaluator {
    fn new(fiber: Arc<FiberContext>, env: Env, shared: Arc<RuntimeShared>) -> Self {
        let interrupt_rx = fiber.subscribe_interrupt();
        Self {
            fiber,
            env,
            stack: Vec::new(),
            interruptible: true,
            interrupt_rx,
            ops_since_yield: 0,
            shared,
        }
    }

    async fn run(mut self, root: Arc<Node>) {
        debug!(fiber = %self.fiber.id(), parent = ?self.fiber.parent(), "fiber started");
        let mut step = if self.should_interrupt() {
            Step::Unwind(self.begin_interruption())
        } else {
            Step::Eval(root)
        };

        let exit = loop {
            self.tick().await;
            step = match step {
                Step::Eval(node) => self.eval(node).await,
                Step::Return(value) => match self.stack.pop() {
                    Some(frame) => self.on_success(frame, value),
                    None => break Ok(value),
                },
                Step::Unwind(cause) => match self.stack.pop() {
                    Some(frame) => self.on_failure(frame, cause),
                    None => break Err(cause),
                },
            };
        };

        self.finish(exit).await;
    }

    async fn eval(&mut self, node: Arc<Node>) -> Step {
        match &*node {
            Node::Succeed(value) => Step::Return(value.clone()),
            Node::Fail(thunk) => match guard(|| thunk()) {
                Ok(cause) => Step::Unwind(cause),
                Err(defect) => Step::Unwind(defect),
            },
            Node::Sync(thunk) => match guard(|| thunk()) {
                Ok(exit) => exit.into(),
                Err(defect) => Step::Unwind(defect),
            },
            Node::FlatMap(inner, continuation) => {
                if self.should_interrupt() {
                    return Step::Unwind(self.begin_interruption());
                }
                self.stack.push(Frame::Continue(continuation.clone()));
                Step::Eval(inner.clone())
            }
            Node::Fold {
                body,
                on_failure,
                on_success,
            } => {
                self.stack.push(Frame::Fold {
                    on_failure: on_failure.clone(),
                    on_success: on_success.clone(),
                });
                Step::Eval(body.clone())
            }
            Node::Ensuring(body, finalizer) => {
                self.stack.push(Frame::Finalizer(finalizer.clone()));
                Step::Eval(body.clone())
            }
            Node::SetInterruptible(interruptible, body) => {
                if *interruptible == self.interruptible {
                    return Step::Eval(body.clone());
                }
                self.stack.push(Frame::RestoreInterruptible(self.interruptible));
                self.interruptible = *interruptible;
                if self.should_interrupt() {
                    return Step::Unwind(self.begin_interruption());
                }
                Step::Eval(body.clone())
            }
            Node::InterruptStatus(k) => self.descend(|| k(self.interruptible)),
            Node::WithFiberId(k) => self.descend(|| k(self.fiber.id())),
            Node::ReadEnv(def) => Step::Return(self.env.read(def)),
            Node::UpdateEnv(def, update) => {
                let current = self.env.read(def);
                match guard(|| update(&current)) {
                    Ok((output, next)) => {
                        self.env.write(def, next);
                        Step::Return(output)
                    }
                    Err(defect) => Step::Unwind(defect),
                }
            }
            Node::Yield => {
                self.ops_since_yield = 0;
                tokio::task::yield_now().await;
                Step::Return(unit())
            }
            Node::Fork { body, daemon } => self.fork(body.clone(), *daemon),
            Node::Async(register) => self.eval_async(register.clone()).await,
            Node::Suspend(start) => self.eval_suspend(start.clone()).await,
        }
    }

    fn descend(&self, next: impl FnOnce() -> Arc<Node>) -> Step {
        match guard(next) {
            Ok(node) => Step::Eval(node),
            Err(defect) => Step::Unwind(defect),
        }
    }

    fn on_success(&mut self, frame: Frame, value: AnyValue) -> Step {
        match frame {
            Frame::Continue(k) | Frame::Fold { on_success: k, .. } => self.descend(|| k(value)),
            Frame::Finalizer(finalizer) => self.run_finalizer(finalizer, Ok(value)),
            Frame::RestoreInterruptible(interruptible) => {
                self.interruptible = interruptible;
                if self.should_interrupt() {
                    return Step::Unwind(self.begin_interruption());
                }
                Step::Return(value)
            }
            Frame::FinalizerDone { restore, outcome } => {
                self.interruptible = restore;
                match outcome {
                    Ok(_) if self.should_interrupt() => Step::Unwind(self.begin_interruption()),
                    outcome => outcome.into(),
                }
            }
        }
    }

    fn on_failure(&mut self, frame: Frame, cause: ErasedCause) -> Step {
        match frame {
            Frame::Continue(_) => Step::Unwind(cause),
            Frame::Fold { on_failure, .. } => {
                if self.should_interrupt() {
                    return Step::Unwind(cause);
                }
                let recovered = cause.clone();
                match guard(|| on_failure(recovered)) {
                    Ok(node) => Step::Eval(node),
                    Err(defect) => Step::Unwind(cause.then(defect)),
                }
            }
            Frame::Finalizer(finalizer) => self.run_finalizer(finalizer, Err(cause)),
            Frame::RestoreInterruptible(interruptible) => {
                self.interruptible = interruptible;
                Step::Unwind(cause)
            }
            Frame::FinalizerDone { restore, outcome } => {
                self.interruptible = restore;
                match outcome {
                    Ok(_) => Step::Unwind(cause),
                    Err(original) => Step::Unwind(original.then(cause)),
                }
            }
        }
    }

    fn run_finalizer(&mut self, finalizer: Arc<Node>, outcome: ErasedExit) -> Step {
        self.stack.push(Frame::FinalizerDone {
            restore: self.interruptible,
            outcome,
        });
        self.interruptible = false;
        Step::Eval(finalizer)
    }

    fn fork(&mut self, body: Arc<Node>, daemon: bool) -> Step {
        let env = match self.env.fork() {
            Ok(env) => env,
            Err(defect) => return Step::Unwind(defect),
        };
        let child = FiberContext::child(self.fiber.id(), daemon);
        if !daemon {
            self.fiber.adopt(child.clone());
        }
        debug!(fiber = %self.fiber.id(), child = %child.id(), daemon, "fiber forked");
        spawn_fiber(&self.shared, child.clone(), env, body);
        Step::Return(erase(child))
    }

    async fn eval_async(&mut self, register: AsyncRegister) -> Step {
        if self.should_interrupt() {
            return Step::Unwind(self.begin_interruption());
        }
        let (resumer, receiver) = Resumer::channel();
        let canceler = match guard(|| register(resumer)) {
            Ok(canceler) => canceler,
            Err(defect) => return Step::Unwind(defect),
        };
        match self.wait_interruptibly(receiver).await {
            Some(Ok(exit)) => exit.into(),
            Some(Err(_)) => Step::Unwind(Cause::die(Defect::new(DROPPED_CALLBACK))),
            None => {
                let cause = self.begin_interruption();
                match canceler {
                    Some(canceler) => self.run_finalizer(canceler, Err(cause)),
                    None => Step::Unwind(cause),
                }
            }
        }
    }

    async fn eval_suspend(&mut self, start: SuspendStart) -> Step {
        if self.should_interrupt() {
            return Step::Unwind(self.begin_interruption());
        }
        let id = self.fiber.id();
        let wait = match guard(|| start(id)) {
            Ok(wait) => wait,
            Err(defect) => return Step::Unwind(defect),
        };
        match self.wait_interruptibly(wait).await {
            Some(resume) => self.resume(resume),
            None => Step::Unwind(self.begin_interruption()),
        }
    }

    fn resume(&mut self, resume: Resume) -> Step {
        let Resume { exit, inherit } = resume;
        if exit.is_ok() {
            for child in &inherit {
                if let Err(defect) = self.env.join_from(child) {
                    return Step::Unwind(defect);
                }
            }
        }
        exit.into()
    }

    /// Wait for `future`. Returns `None` if the fiber is interruptible and an
    /// interrupt request arrives first.
    async fn wait_interruptibly<T>(&mut self, future: impl Future<Output = T>) -> Option<T> {
        self.fiber.set_status(FiberStatus::Suspended);
        let result = if self.interruptible {
            let mut interrupt_rx = self.interrupt_rx.clone();
            tokio::select! {
                biased;
                value = future => Some(value),
                _ = wait_for_interrupt(&mut interrupt_rx) => None,
            }
        } else {
            Some(future.await)
        };
        self.fiber.set_status(FiberStatus::Running);
        result
    }

    fn should_interrupt(&self) -> bool {
        self.interruptible && self.interrupt_rx.borrow().is_some()
    }

    fn begin_interruption(&self) -> ErasedCause {
        let by = (*self.interrupt_rx.borrow()).unwrap_or(FiberId::NONE);
        debug!(fiber = %self.fiber.id(), by = %by, frames = self.stack.len(), "fiber interrupted");
        Cause::interrupt(by)
    }

    /// Hand the worker back to the scheduler every `yield_after_ops` steps.
    async fn tick(&mut self) {
        self.ops_since_yield += 1;
        if self.ops_since_yield >= self.shared.config.yield_after_ops {
            self.ops_since_yield = 0;
            tokio::task::yield_now().await;
        }
    }

    async fn finish(self, exit: ErasedExit) {
        let id = self.fiber.id();
        let children: Vec<_> = self.fiber.take_children().into_iter().filter(|child| !child.is_done()).collect();
        if !children.is_empty() {
            debug!(fiber = %id, children = children.len(), "interrupting supervised children");
            self.fiber.set_status(FiberStatus::Suspended);
            interrupt_all(children, id).await;
        }

        match &exit {
            Ok(_) => debug!(fiber = %id, "fiber succeeded"),
            Err(cause) if cause.contains_die() && self.fiber.is_unsupervised() => {
                let defects: Vec<&str> = cause.defects().iter().map(|defect| defect.message()).collect();
                warn!(fiber = %id, defects = ?defects, "fiber died");
            }
            Err(cause) => debug!(
                fiber = %id,
                interrupted = cause.contains_interrupt(),
                died = cause.contains_die(),
                "fiber failed"
            ),
        }

        self.fiber.complete(exit, self.env);
    }
}

/// Resolves once an interrupt has been requested; never resolves otherwise.
async fn wait_for_interrupt(interrupt_rx: &mut watch::Receiver<Option<FiberId>>) {
    let closed = interrupt_rx.wait_for(Option::is_some).await.is_err();
    if closed {
        std::future::pending::<()>().await;
    }
}
