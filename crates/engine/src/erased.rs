//! Type-erased payloads flowing through the evaluator.
//!
//! The evaluator interprets descriptions whose success and error types change at
//! every `flat_map`, so internally every value travels as an
//! `Arc<dyn Any + Send + Sync>`. The typed [`Effect`](crate::Effect) API erases on
//! the way in and restores on the way out; a mismatch can only arise from a bug in
//! this crate, never from user code.

use std::any::Any;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use weft_types::{Cause, Defect, Exit};

const TYPE_MISMATCH: &str = "erased payload does not match the effect's declared type";

/// Bound for every value or error carried by an effect.
///
/// Values may be observed by several fibers (for example two joiners of the same
/// fiber), so they must be cheap to clone and shareable across workers.
pub trait Payload: Any + Clone + Send + Sync {}

impl<T: Any + Clone + Send + Sync> Payload for T {}

pub(crate) type AnyValue = Arc<dyn Any + Send + Sync>;

/// An error whose concrete type has been erased.
#[derive(Clone)]
pub(crate) struct ErasedError(AnyValue);

impl fmt::Debug for ErasedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ErasedError(..)")
    }
}

pub(crate) type ErasedCause = Cause<ErasedError>;

/// Internal form of an [`Exit`].
pub(crate) type ErasedExit = Result<AnyValue, ErasedCause>;

pub(crate) fn erase<A: Payload>(value: A) -> AnyValue {
    Arc::new(value)
}

pub(crate) fn unerase<A: Payload>(value: &AnyValue) -> A {
    (**value).downcast_ref::<A>().cloned().expect(TYPE_MISMATCH)
}

pub(crate) fn unit() -> AnyValue {
    erase(())
}

pub(crate) fn erase_cause<E: Payload>(cause: Cause<E>) -> ErasedCause {
    cause.map(|error| ErasedError(erase(error)))
}

pub(crate) fn unerase_cause<E: Payload>(cause: ErasedCause) -> Cause<E> {
    cause.map(|error| unerase::<E>(&error.0))
}

pub(crate) fn unerase_exit<A: Payload, E: Payload>(exit: &ErasedExit) -> Exit<A, E> {
    match exit {
        Ok(value) => Exit::Success(unerase(value)),
        Err(cause) => Exit::Failure(unerase_cause(cause.clone())),
    }
}

pub(crate) fn erase_exit<A: Payload, E: Payload>(exit: Exit<A, E>) -> ErasedExit {
    match exit {
        Exit::Success(value) => Ok(erase(value)),
        Exit::Failure(cause) => Err(erase_cause(cause)),
    }
}

/// Run user code, turning a panic into a `Die` cause.
pub(crate) fn guard<T>(f: impl FnOnce() -> T) -> Result<T, ErasedCause> {
    catch_unwind(AssertUnwindSafe(f)).map_err(|payload| Cause::die(Defect::from_panic(payload)))
}
