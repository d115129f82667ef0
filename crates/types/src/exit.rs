//! Terminal outcome of a fiber.

use serde::{Deserialize, Serialize};

use crate::Cause;

/// How a fiber ended: with a value or with a [`Cause`].
///
/// An exit is produced exactly once per fiber and never changes afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Exit<A, E> {
    Success(A),
    Failure(Cause<E>),
}

impl<A, E> Exit<A, E> {
    pub fn succeed(value: A) -> Self {
        Exit::Success(value)
    }

    pub fn fail(error: E) -> Self {
        Exit::Failure(Cause::fail(error))
    }

    pub fn fail_cause(cause: Cause<E>) -> Self {
        Exit::Failure(cause)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Exit::Success(_))
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Exit::Failure(_))
    }

    /// The success value, if any.
    pub fn value(&self) -> Option<&A> {
        match self {
            Exit::Success(value) => Some(value),
            Exit::Failure(_) => None,
        }
    }

    /// The failure cause, if any.
    pub fn cause(&self) -> Option<&Cause<E>> {
        match self {
            Exit::Success(_) => None,
            Exit::Failure(cause) => Some(cause),
        }
    }

    /// Transform the success value.
    pub fn map<B>(self, f: impl FnOnce(A) -> B) -> Exit<B, E> {
        match self {
            Exit::Success(value) => Exit::Success(f(value)),
            Exit::Failure(cause) => Exit::Failure(cause),
        }
    }

    /// Convert into a `Result`, keeping the whole cause on the error side.
    pub fn into_result(self) -> Result<A, Cause<E>> {
        match self {
            Exit::Success(value) => Ok(value),
            Exit::Failure(cause) => Err(cause),
        }
    }
}

impl<A, E> From<Result<A, E>> for Exit<A, E> {
    fn from(result: Result<A, E>) -> Self {
        match result {
            Ok(value) => Exit::Success(value),
            Err(error) => Exit::fail(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Defect, FiberId};

    #[test]
    fn accessors() {
        let ok: Exit<i32, String> = Exit::succeed(3);
        assert!(ok.is_success());
        assert_eq!(ok.value(), Some(&3));
        assert!(ok.cause().is_none());

        let failed: Exit<i32, String> = Exit::fail("bad".into());
        assert!(failed.is_failure());
        assert_eq!(failed.cause(), Some(&Cause::fail("bad".to_string())));
    }

    #[test]
    fn map_leaves_failures_alone() {
        let failed: Exit<i32, ()> = Exit::fail_cause(Cause::die(Defect::new("x")));
        assert_eq!(failed.clone().map(|value| value + 1), failed);
        assert_eq!(Exit::<i32, ()>::succeed(1).map(|value| value + 1), Exit::succeed(2));
    }

    #[test]
    fn into_result_keeps_full_cause() {
        let id = FiberId::next();
        let failed: Exit<(), &str> = Exit::fail_cause(Cause::fail("a").both(Cause::interrupt(id)));
        let error = failed.into_result().expect_err("failure");
        assert_eq!(error.interruptors(), vec![id]);
        assert_eq!(error.failures(), vec![&"a"]);
    }
}
