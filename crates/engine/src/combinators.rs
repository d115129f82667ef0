//! Structured-concurrency combinators.
//!
//! Every combinator here forks its contestants as supervised children of the
//! requesting fiber, then suspends on a runtime future that decides the outcome.
//! Forking happens inside an uninterruptible region so an interrupt can never
//! leave a contestant running unobserved; the wait itself restores the caller's
//! interruptibility, and interrupting the waiting fiber interrupts and awaits
//! every contestant.
//!
//! Environment inheritance is success-only throughout: a combinator merges the
//! winning or completing children's environments only when it succeeds.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use futures_util::future::BoxFuture;
use futures_util::stream::FuturesUnordered;
use weft_types::{Cause, FiberId};

use crate::effect::{Effect, Node, Resume};
use crate::erased::{AnyValue, ErasedCause, Payload, erase, unerase, unit};
use crate::fiber::{FiberContext, FiberOutcome, interrupt_all};

type Settle = Arc<dyn Fn(FiberId, Vec<Arc<FiberContext>>) -> BoxFuture<'static, Resume> + Send + Sync>;

impl<A: Payload, E: Payload> Effect<A, E> {
    /// Run `self` and `other` concurrently and keep the first success.
    ///
    /// A failure never wins on its own: if one side fails first, the race waits
    /// for the other. Only when both fail does the race fail, with the causes
    /// sequenced in completion order.
    pub fn race(self, other: Effect<A, E>) -> Effect<A, E> {
        let settle = settler(|me, fibers| async move {
            let (_, first, loser) = first_done(&fibers[0], &fibers[1]).await;
            if first.is_success() {
                loser.interrupt_as(me).await;
                return Resume::inheriting(&first);
            }
            let second = loser.outcome().await;
            if second.is_success() {
                return Resume::inheriting(&second);
            }
            Resume::failed(cause_of(&first).then(cause_of(&second)))
        });
        supervise(vec![self.into_node(), other.into_node()], settle)
    }

    /// Run `self` and `other` concurrently; the first to finish wins, whether it
    /// succeeded or failed, and the other is interrupted.
    pub fn race_first(self, other: Effect<A, E>) -> Effect<A, E> {
        let settle = settler(|me, fibers| async move {
            let (_, first, loser) = first_done(&fibers[0], &fibers[1]).await;
            loser.interrupt_as(me).await;
            Resume::inheriting(&first)
        });
        supervise(vec![self.into_node(), other.into_node()], settle)
    }

    /// Race `self` against every effect in `others`; the first success wins. If
    /// all fail, their causes are combined in parallel.
    pub fn race_all(self, others: impl IntoIterator<Item = Effect<A, E>>) -> Effect<A, E> {
        let contestants: Vec<_> = std::iter::once(self).chain(others).map(Effect::into_node).collect();
        let settle = settler(|me, fibers| async move {
            let mut pending: FuturesUnordered<_> = fibers
                .iter()
                .cloned()
                .map(|fiber| async move { fiber.outcome().await })
                .collect();
            let mut failures = Cause::empty();
            while let Some(outcome) = pending.next().await {
                if outcome.is_success() {
                    let winner = earliest_success(&fibers).unwrap_or(outcome);
                    let losers = fibers.iter().filter(|fiber| !fiber.is_done()).cloned().collect();
                    interrupt_all(losers, me).await;
                    return Resume::inheriting(&winner);
                }
                failures = failures.both(cause_of(&outcome));
            }
            Resume::failed(failures)
        });
        supervise(contestants, settle)
    }

    /// Run `self` and `other` concurrently and pair their values.
    ///
    /// The first failure interrupts the other side and the result fails with both
    /// causes in parallel. When both succeed, their environments are merged in
    /// completion order, so the side that finished last has the final word.
    pub fn zip_par<B: Payload>(self, other: Effect<B, E>) -> Effect<(A, B), E> {
        let settle = settler(|me, fibers| async move {
            let left_id = fibers[0].id();
            let (first_id, first, other) = first_done(&fibers[0], &fibers[1]).await;
            if let Err(cause) = &first.exit {
                let interrupted = other.interrupt_as(me).await;
                let rest = cause_of(&interrupted).without_interrupts_by(me);
                return Resume::failed(cause.clone().both(rest));
            }
            let second = other.outcome().await;
            let (Some(first_value), Some(second_value)) = (value_of(&first), value_of(&second)) else {
                return Resume::failed(cause_of(&second));
            };
            let pair = if first_id == left_id {
                (unerase::<A>(&first_value), unerase::<B>(&second_value))
            } else {
                (unerase::<A>(&second_value), unerase::<B>(&first_value))
            };
            Resume {
                exit: Ok(erase(pair)),
                inherit: vec![first.env.clone(), second.env.clone()],
            }
        });
        supervise(vec![self.into_node(), other.into_node()], settle)
    }

    /// Succeed with `Some` if `self` finishes within `duration`, or `None` once the
    /// timer fires first. A failure of `self` before the deadline is propagated.
    pub fn timeout(self, duration: Duration) -> Effect<Option<A>, E> {
        self.map(Some).race_first(Effect::sleep(duration).as_value(None))
    }

    /// Acquire a resource uninterruptibly, use it, and release it exactly once
    /// however `use_resource` ends. Only the use phase can be interrupted.
    pub fn acquire_release<R: Payload>(
        acquire: Effect<R, E>,
        release: impl Fn(R) -> Effect<(), E> + Send + Sync + 'static,
        use_resource: impl Fn(R) -> Effect<A, E> + Send + Sync + 'static,
    ) -> Effect<A, E> {
        let release = Arc::new(release);
        let use_resource = Arc::new(use_resource);
        Effect::uninterruptible_mask(move |restore| {
            let release = release.clone();
            let use_resource = use_resource.clone();
            acquire.clone().flat_map(move |resource: R| {
                restore.apply(use_resource(resource.clone())).ensuring(release(resource))
            })
        })
    }
}

fn settler<F, Fut>(f: F) -> Settle
where
    F: Fn(FiberId, Vec<Arc<FiberContext>>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Resume> + Send + 'static,
{
    Arc::new(move |me: FiberId, fibers: Vec<Arc<FiberContext>>| -> BoxFuture<'static, Resume> { Box::pin(f(me, fibers)) })
}

/// Fork `contestants`, then wait on `settle`. However the wait ends, every
/// contestant still running is interrupted and awaited before control returns.
fn supervise<A: Payload, E: Payload>(contestants: Vec<Arc<Node>>, settle: Settle) -> Effect<A, E> {
    Effect::uninterruptible_mask(move |restore| {
        let settle = settle.clone();
        fork_all::<E>(contestants.clone()).flat_map(move |fibers: Vec<Arc<FiberContext>>| {
            let wait = Effect::<A, E>::suspend({
                let settle = settle.clone();
                let fibers = fibers.clone();
                move |me| settle(me, fibers.clone())
            });
            let cleanup = Effect::<(), E>::suspend(move |me| {
                let fibers = fibers.clone();
                async move {
                    interrupt_all(fibers, me).await;
                    Resume::value(unit())
                }
            });
            restore.apply(wait).ensuring(cleanup)
        })
    })
}

fn fork_all<E: Payload>(nodes: Vec<Arc<Node>>) -> Effect<Vec<Arc<FiberContext>>, E> {
    nodes.into_iter().fold(Effect::succeed(Vec::new()), |forked, body| {
        forked.flat_map(move |fibers: Vec<Arc<FiberContext>>| {
            let fork = Effect::<Arc<FiberContext>, E>::from_node(Node::Fork {
                body: body.clone(),
                daemon: false,
            });
            fork.map(move |fiber| {
                let mut fibers = fibers.clone();
                fibers.push(fiber);
                fibers
            })
        })
    })
}

/// Wait for whichever of `left` and `right` finishes first. Returns the id of the
/// finished fiber, its outcome and the other fiber.
///
/// Both may have finished by the time either is noticed; the completion stamps
/// decide, not the order of observation.
async fn first_done(
    left: &Arc<FiberContext>,
    right: &Arc<FiberContext>,
) -> (FiberId, Arc<FiberOutcome>, Arc<FiberContext>) {
    let (first, outcome, other) = tokio::select! {
        outcome = left.outcome() => (left, outcome, right),
        outcome = right.outcome() => (right, outcome, left),
    };
    if let Some(earlier) = other.poll_outcome() {
        if earlier.completed < outcome.completed {
            return (other.id(), earlier, first.clone());
        }
    }
    (first.id(), outcome, other.clone())
}

/// The successful outcome among `fibers` that completed earliest.
fn earliest_success(fibers: &[Arc<FiberContext>]) -> Option<Arc<FiberOutcome>> {
    fibers
        .iter()
        .filter_map(|fiber| fiber.poll_outcome())
        .filter(|outcome| outcome.is_success())
        .min_by_key(|outcome| outcome.completed)
}

fn cause_of(outcome: &FiberOutcome) -> ErasedCause {
    match &outcome.exit {
        Ok(_) => Cause::empty(),
        Err(cause) => cause.clone(),
    }
}

fn value_of(outcome: &FiberOutcome) -> Option<AnyValue> {
    outcome.exit.as_ref().ok().cloned()
}
