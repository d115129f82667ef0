//! Composable failure values.
//!
//! A [`Cause`] records *why* a computation failed without losing information when
//! several concurrent branches fail at once. Expected domain errors (`Fail`),
//! unexpected defects (`Die`) and cancellation (`Interrupt`) are leaves; `Then`
//! and `Both` compose them sequentially and in parallel.
//!
//! Equality is not structural: two causes are equal when
//! their [flattened](Cause::flatten) forms are equal, so `Then` is compared as an
//! associative sequence and `Both` as an unordered multiset, with `Empty` dropped.

use std::any::Any;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::FiberId;

/// An unexpected failure, typically a panic captured inside user code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Defect {
    message: String,
}

impl Defect {
    /// Create a defect with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }

    /// Build a defect from a panic payload returned by `catch_unwind`.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(text) = payload.downcast_ref::<&str>() {
            (*text).to_string()
        } else if let Some(text) = payload.downcast_ref::<String>() {
            text.clone()
        } else {
            "panic with non-string payload".to_string()
        };
        Self { message }
    }

    /// Human-readable description of the defect.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for Defect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Why a computation failed.
///
/// Cloning, comparing, mapping and dropping a cause never recurse, so arbitrarily
/// long `Then` chains are safe to build and discard.
#[derive(Debug, Serialize, Deserialize)]
pub enum Cause<E> {
    /// No failure. The identity of both compositions.
    Empty,
    /// An expected, typed domain error.
    Fail(E),
    /// An unexpected defect. Never recovered by this runtime.
    Die(Defect),
    /// Cancellation, carrying the identity of the interrupting fiber.
    Interrupt(FiberId),
    /// `left` happened, then `right` happened (for example a finalizer failing
    /// after the body failed).
    Then(Box<Cause<E>>, Box<Cause<E>>),
    /// `left` and `right` happened concurrently; no order is implied.
    Both(Box<Cause<E>>, Box<Cause<E>>),
}

/// Canonical view of a [`Cause`]: nested `Then`/`Both` chains are flattened into
/// sequences and sets and `Empty` leaves are removed.
#[derive(Debug, Clone)]
pub enum FlatCause<'a, E> {
    Empty,
    Fail(&'a E),
    Die(&'a Defect),
    Interrupt(FiberId),
    /// Ordered, at least two elements, none of them `Sequential`.
    Sequential(Vec<FlatCause<'a, E>>),
    /// Unordered, at least two elements, none of them `Parallel`.
    Parallel(Vec<FlatCause<'a, E>>),
}

impl<E> Cause<E> {
    pub fn empty() -> Self {
        Cause::Empty
    }

    pub fn fail(error: E) -> Self {
        Cause::Fail(error)
    }

    pub fn die(defect: Defect) -> Self {
        Cause::Die(defect)
    }

    pub fn interrupt(by: FiberId) -> Self {
        Cause::Interrupt(by)
    }

    /// Sequential composition. Composing with an empty cause returns the other side.
    pub fn then(self, next: Cause<E>) -> Cause<E> {
        match (&self, &next) {
            (Cause::Empty, _) => next,
            (_, Cause::Empty) => self,
            _ => Cause::Then(Box::new(self), Box::new(next)),
        }
    }

    /// Parallel composition. Composing with an empty cause returns the other side.
    pub fn both(self, other: Cause<E>) -> Cause<E> {
        match (&self, &other) {
            (Cause::Empty, _) => other,
            (_, Cause::Empty) => self,
            _ => Cause::Both(Box::new(self), Box::new(other)),
        }
    }

    /// True when the cause carries no failure at all.
    pub fn is_empty(&self) -> bool {
        let mut empty = true;
        self.visit_leaves(&mut |leaf| empty &= matches!(leaf, Cause::Empty));
        empty
    }

    /// Canonical flattened form used for equality and rendering.
    pub fn flatten(&self) -> FlatCause<'_, E> {
        enum Task<'a, E> {
            Visit(&'a Cause<E>),
            Close { sequential: bool, start: usize },
        }

        let mut tasks = vec![Task::Visit(self)];
        let mut parts: Vec<FlatCause<'_, E>> = Vec::new();
        while let Some(task) = tasks.pop() {
            match task {
                Task::Visit(Cause::Empty) => {}
                Task::Visit(Cause::Fail(error)) => parts.push(FlatCause::Fail(error)),
                Task::Visit(Cause::Die(defect)) => parts.push(FlatCause::Die(defect)),
                Task::Visit(Cause::Interrupt(id)) => parts.push(FlatCause::Interrupt(*id)),
                Task::Visit(Cause::Then(left, right)) => {
                    tasks.push(Task::Close {
                        sequential: true,
                        start: parts.len(),
                    });
                    tasks.push(Task::Visit(&**right));
                    tasks.push(Task::Visit(&**left));
                }
                Task::Visit(Cause::Both(left, right)) => {
                    tasks.push(Task::Close {
                        sequential: false,
                        start: parts.len(),
                    });
                    tasks.push(Task::Visit(&**right));
                    tasks.push(Task::Visit(&**left));
                }
                Task::Close { sequential, start } => {
                    let children = parts.split_off(start);
                    if let Some(flat) = splice(children, sequential) {
                        parts.push(flat);
                    }
                }
            }
        }
        parts.pop().unwrap_or(FlatCause::Empty)
    }

    /// The flattened cause is a single `Fail`.
    pub fn is_fail(&self) -> bool {
        matches!(self.flatten(), FlatCause::Fail(_))
    }

    /// The flattened cause is a single `Die`.
    pub fn is_die(&self) -> bool {
        matches!(self.flatten(), FlatCause::Die(_))
    }

    /// The flattened cause is a single `Interrupt`.
    pub fn is_interrupt(&self) -> bool {
        matches!(self.flatten(), FlatCause::Interrupt(_))
    }

    /// A `Fail` leaf appears anywhere in the cause.
    pub fn contains_fail(&self) -> bool {
        !self.failures().is_empty()
    }

    /// A `Die` leaf appears anywhere in the cause.
    pub fn contains_die(&self) -> bool {
        !self.defects().is_empty()
    }

    /// An `Interrupt` leaf appears anywhere in the cause.
    pub fn contains_interrupt(&self) -> bool {
        !self.interruptors().is_empty()
    }

    /// All typed errors, left to right.
    pub fn failures(&self) -> Vec<&E> {
        let mut out = Vec::new();
        self.visit_leaves(&mut |leaf| {
            if let Cause::Fail(error) = leaf {
                out.push(error);
            }
        });
        out
    }

    /// All defects, left to right.
    pub fn defects(&self) -> Vec<&Defect> {
        let mut out = Vec::new();
        self.visit_leaves(&mut |leaf| {
            if let Cause::Die(defect) = leaf {
                out.push(defect);
            }
        });
        out
    }

    /// Identities of every interrupting fiber, left to right.
    pub fn interruptors(&self) -> Vec<FiberId> {
        let mut out = Vec::new();
        self.visit_leaves(&mut |leaf| {
            if let Cause::Interrupt(id) = leaf {
                out.push(*id);
            }
        });
        out
    }

    /// The leftmost typed error, if any.
    pub fn first_failure(&self) -> Option<&E> {
        self.failures().into_iter().next()
    }

    fn visit_leaves<'a>(&'a self, visit: &mut dyn FnMut(&'a Cause<E>)) {
        let mut pending = vec![self];
        while let Some(cause) = pending.pop() {
            match cause {
                Cause::Then(left, right) | Cause::Both(left, right) => {
                    pending.push(&**right);
                    pending.push(&**left);
                }
                leaf => visit(leaf),
            }
        }
    }

    /// Rebuild the tree bottom-up: leaves through `leaf`, inner nodes through
    /// `sequential` and `parallel`.
    fn rebuild<F>(
        &self,
        leaf: &mut dyn FnMut(&Cause<E>) -> Cause<F>,
        sequential: fn(Cause<F>, Cause<F>) -> Cause<F>,
        parallel: fn(Cause<F>, Cause<F>) -> Cause<F>,
    ) -> Cause<F> {
        enum Task<'a, E> {
            Visit(&'a Cause<E>),
            Then,
            Both,
        }

        let mut tasks = vec![Task::Visit(self)];
        let mut built: Vec<Cause<F>> = Vec::new();
        while let Some(task) = tasks.pop() {
            match task {
                Task::Visit(Cause::Then(left, right)) => {
                    tasks.push(Task::Then);
                    tasks.push(Task::Visit(&**right));
                    tasks.push(Task::Visit(&**left));
                }
                Task::Visit(Cause::Both(left, right)) => {
                    tasks.push(Task::Both);
                    tasks.push(Task::Visit(&**right));
                    tasks.push(Task::Visit(&**left));
                }
                Task::Visit(other) => built.push(leaf(other)),
                Task::Then => {
                    let (left, right) = pop_pair(&mut built);
                    built.push(sequential(left, right));
                }
                Task::Both => {
                    let (left, right) = pop_pair(&mut built);
                    built.push(parallel(left, right));
                }
            }
        }
        built.pop().unwrap_or(Cause::Empty)
    }
}

impl<E: Clone> Cause<E> {
    /// Transform every typed error, keeping the shape of the cause.
    pub fn map<F>(self, f: impl Fn(E) -> F) -> Cause<F> {
        self.rebuild(
            &mut |leaf| match leaf {
                Cause::Fail(error) => Cause::Fail(f(error.clone())),
                other => other.map_leaf(),
            },
            raw_then,
            raw_both,
        )
    }

    /// Remove `Interrupt` leaves raised by `by`. Other leaves are untouched.
    pub fn without_interrupts_by(self, by: FiberId) -> Cause<E> {
        self.rebuild(
            &mut |leaf| match leaf {
                Cause::Interrupt(id) if *id == by => Cause::Empty,
                Cause::Fail(error) => Cause::Fail(error.clone()),
                other => other.map_leaf(),
            },
            Cause::then,
            Cause::both,
        )
    }

    /// Collapse to a single representative leaf for display: the first `Fail`,
    /// else the first `Die`, else the first `Interrupt`, else `Empty`.
    ///
    /// Never use the result for control flow; it discards information.
    pub fn squash(&self) -> Cause<E> {
        if let Some(error) = self.first_failure() {
            return Cause::Fail(error.clone());
        }
        if let Some(defect) = self.defects().into_iter().next() {
            return Cause::Die(defect.clone());
        }
        if let Some(id) = self.interruptors().into_iter().next() {
            return Cause::Interrupt(id);
        }
        Cause::Empty
    }
}

impl<E> Cause<E> {
    /// Copy a leaf that carries no typed error. `Fail` and composite nodes are
    /// handled by the caller.
    fn map_leaf<F>(&self) -> Cause<F> {
        match self {
            Cause::Die(defect) => Cause::Die(defect.clone()),
            Cause::Interrupt(id) => Cause::Interrupt(*id),
            _ => Cause::Empty,
        }
    }
}

impl<E: Clone> Clone for Cause<E> {
    fn clone(&self) -> Self {
        self.rebuild(
            &mut |leaf| match leaf {
                Cause::Fail(error) => Cause::Fail(error.clone()),
                other => other.map_leaf(),
            },
            raw_then,
            raw_both,
        )
    }
}

impl<E> Drop for Cause<E> {
    fn drop(&mut self) {
        let mut pending = Vec::new();
        detach_children(self, &mut pending);
        while let Some(mut cause) = pending.pop() {
            detach_children(&mut cause, &mut pending);
        }
    }
}

fn detach_children<E>(cause: &mut Cause<E>, into: &mut Vec<Cause<E>>) {
    if let Cause::Then(left, right) | Cause::Both(left, right) = cause {
        into.push(std::mem::replace(&mut **left, Cause::Empty));
        into.push(std::mem::replace(&mut **right, Cause::Empty));
    }
}

fn raw_then<E>(left: Cause<E>, right: Cause<E>) -> Cause<E> {
    Cause::Then(Box::new(left), Box::new(right))
}

fn raw_both<E>(left: Cause<E>, right: Cause<E>) -> Cause<E> {
    Cause::Both(Box::new(left), Box::new(right))
}

fn pop_pair<E>(built: &mut Vec<Cause<E>>) -> (Cause<E>, Cause<E>) {
    let right = built.pop().unwrap_or(Cause::Empty);
    let left = built.pop().unwrap_or(Cause::Empty);
    (left, right)
}

/// Merge the flattened children of one `Then` or `Both` node, splicing in
/// children of the same kind and dropping the node when nothing is left.
fn splice<E>(children: Vec<FlatCause<'_, E>>, sequential: bool) -> Option<FlatCause<'_, E>> {
    let mut merged: Vec<FlatCause<'_, E>> = Vec::new();
    for child in children {
        match child {
            FlatCause::Sequential(inner) if sequential => extend_or_adopt(&mut merged, inner),
            FlatCause::Parallel(inner) if !sequential => extend_or_adopt(&mut merged, inner),
            other => merged.push(other),
        }
    }
    match merged.len() {
        0 => None,
        1 => merged.pop(),
        _ if sequential => Some(FlatCause::Sequential(merged)),
        _ => Some(FlatCause::Parallel(merged)),
    }
}

fn extend_or_adopt<T>(merged: &mut Vec<T>, inner: Vec<T>) {
    if merged.is_empty() {
        *merged = inner;
    } else {
        merged.extend(inner);
    }
}

impl<E: PartialEq> PartialEq for FlatCause<'_, E> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (FlatCause::Empty, FlatCause::Empty) => true,
            (FlatCause::Fail(left), FlatCause::Fail(right)) => left == right,
            (FlatCause::Die(left), FlatCause::Die(right)) => left == right,
            (FlatCause::Interrupt(left), FlatCause::Interrupt(right)) => left == right,
            (FlatCause::Sequential(left), FlatCause::Sequential(right)) => left == right,
            (FlatCause::Parallel(left), FlatCause::Parallel(right)) => same_multiset(left, right),
            _ => false,
        }
    }
}

fn same_multiset<E: PartialEq>(left: &[FlatCause<'_, E>], right: &[FlatCause<'_, E>]) -> bool {
    if left.len() != right.len() {
        return false;
    }
    let mut used = vec![false; right.len()];
    left.iter().all(|candidate| {
        let found = right.iter().enumerate().find(|(index, item)| !used[*index] && *item == candidate);
        match found {
            Some((index, _)) => {
                used[index] = true;
                true
            }
            None => false,
        }
    })
}

impl<E: PartialEq> PartialEq for Cause<E> {
    fn eq(&self, other: &Self) -> bool {
        self.flatten() == other.flatten()
    }
}

impl<E: fmt::Display> fmt::Display for FlatCause<'_, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlatCause::Empty => f.write_str("Empty"),
            FlatCause::Fail(error) => write!(f, "Fail({error})"),
            FlatCause::Die(defect) => write!(f, "Die({defect})"),
            FlatCause::Interrupt(id) => write!(f, "Interrupt({id})"),
            FlatCause::Sequential(parts) => write_joined(f, parts, " then "),
            FlatCause::Parallel(parts) => write_joined(f, parts, " | "),
        }
    }
}

fn write_joined<E: fmt::Display>(f: &mut fmt::Formatter<'_>, parts: &[FlatCause<'_, E>], separator: &str) -> fmt::Result {
    f.write_str("(")?;
    for (index, part) in parts.iter().enumerate() {
        if index > 0 {
            f.write_str(separator)?;
        }
        write!(f, "{part}")?;
    }
    f.write_str(")")
}

impl<E: fmt::Display> fmt::Display for Cause<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.flatten())
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for Cause<E> {}

#[cfg(test)]
mod tests {
    use super::*;

    fn fail(tag: &'static str) -> Cause<&'static str> {
        Cause::fail(tag)
    }

    #[test]
    fn then_is_associative_under_equality() {
        let left_nested = fail("a").then(fail("b")).then(fail("c"));
        let right_nested = fail("a").then(fail("b").then(fail("c")));
        assert_eq!(left_nested, right_nested);
    }

    #[test]
    fn then_is_not_commutative() {
        assert_ne!(fail("a").then(fail("b")), fail("b").then(fail("a")));
    }

    #[test]
    fn both_is_commutative_and_associative() {
        assert_eq!(fail("a").both(fail("b")), fail("b").both(fail("a")));
        assert_eq!(
            fail("a").both(fail("b")).both(fail("c")),
            fail("c").both(fail("a").both(fail("b")))
        );
    }

    #[test]
    fn both_compares_as_multiset() {
        let twice = fail("a").both(fail("a")).both(fail("b"));
        let unbalanced = fail("a").both(fail("b")).both(fail("b"));
        assert_ne!(twice, unbalanced);
    }

    #[test]
    fn empty_is_dropped_when_flattening() {
        let raw: Cause<&str> = Cause::Then(Box::new(Cause::Empty), Box::new(fail("x")));
        assert_eq!(raw, fail("x"));
        assert!(raw.is_fail());

        let nested: Cause<&str> = Cause::Both(Box::new(Cause::Empty), Box::new(Cause::Empty));
        assert!(nested.is_empty());
        assert_eq!(nested, Cause::Empty);
    }

    #[test]
    fn composition_keeps_every_branch() {
        let cause = fail("a").both(Cause::die(Defect::new("boom"))).then(Cause::interrupt(FiberId::NONE));
        assert_eq!(cause.failures(), vec![&"a"]);
        assert_eq!(cause.defects().len(), 1);
        assert_eq!(cause.interruptors(), vec![FiberId::NONE]);
    }

    #[test]
    fn predicates_inspect_outermost_node() {
        let composite = fail("a").then(Cause::die(Defect::new("late")));
        assert!(!composite.is_fail());
        assert!(!composite.is_die());
        assert!(composite.contains_fail());
        assert!(composite.contains_die());
        assert!(Cause::<()>::interrupt(FiberId::NONE).is_interrupt());
    }

    #[test]
    fn squash_prefers_failures_then_defects() {
        let id = FiberId::next();
        let cause = Cause::interrupt(id).both(Cause::die(Defect::new("d"))).then(fail("e"));
        assert_eq!(cause.squash(), fail("e"));

        let no_fail: Cause<&str> = Cause::interrupt(id).both(Cause::die(Defect::new("d")));
        assert_eq!(no_fail.squash(), Cause::die(Defect::new("d")));
        assert_eq!(Cause::<&str>::Empty.squash(), Cause::Empty);
    }

    #[test]
    fn strips_only_matching_interrupts() {
        let parent = FiberId::next();
        let other = FiberId::next();
        let cause = fail("x").both(Cause::interrupt(parent)).both(Cause::interrupt(other));
        let stripped = cause.without_interrupts_by(parent);
        assert_eq!(stripped, fail("x").both(Cause::interrupt(other)));
    }

    #[test]
    fn renders_flattened_form() {
        let cause = fail("a").then(fail("b").then(Cause::die(Defect::new("c"))));
        assert_eq!(cause.to_string(), "(Fail(a) then Fail(b) then Die(c))");
        assert_eq!(fail("a").both(fail("b")).to_string(), "(Fail(a) | Fail(b))");
    }

    #[test]
    fn defect_from_panic_payload() {
        let payload = std::panic::catch_unwind(|| panic!("kaboom {}", 7)).expect_err("closure panics");
        assert_eq!(Defect::from_panic(payload).message(), "kaboom 7");
    }

    #[test]
    fn map_preserves_shape() {
        let cause = fail("a").both(Cause::die(Defect::new("d")));
        let mapped = cause.map(|error| error.len());
        assert_eq!(mapped, Cause::fail(1).both(Cause::die(Defect::new("d"))));
    }

    #[test]
    fn long_sequential_chains_are_stack_safe() {
        let chain = (0..200_000u32).fold(Cause::empty(), |cause, index| cause.then(Cause::fail(index)));
        let copy = chain.clone();
        assert_eq!(copy.failures().len(), 200_000);
        assert_eq!(chain, copy);
        assert!(!chain.is_empty());

        let shifted = copy.map(|index| index + 1);
        assert_eq!(shifted.first_failure(), Some(&1));
        let stripped = shifted.without_interrupts_by(FiberId::NONE);
        assert_eq!(stripped.failures().len(), 200_000);
        assert!(stripped.to_string().starts_with("(Fail(1) then Fail(2)"));
        drop(stripped);
        drop(chain);
    }

    #[test]
    fn composing_with_empty_is_constant_time_identity() {
        let deep = (0..1_000u32).fold(Cause::empty(), |cause, index| cause.both(Cause::fail(index)));
        let composed = Cause::empty().then(deep.clone()).then(Cause::empty());
        assert_eq!(composed, deep);
        assert!(matches!(composed, Cause::Both(..)));
    }

    #[test]
    fn serializes_to_json() {
        let cause: Cause<String> = Cause::fail("nope".to_string());
        let json = serde_json::to_value(&cause).expect("serialize cause");
        assert_eq!(json, serde_json::json!({ "Fail": "nope" }));
    }
}
