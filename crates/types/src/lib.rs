//! # Weft Types
//!
//! Value types shared between the Weft runtime and the collaborators that consume
//! its results: fiber identity, the [`Cause`] failure algebra and [`Exit`].
//!
//! Everything here is immutable and safe to send between fibers by value.

pub mod cause;
pub mod exit;
pub mod fiber;

pub use cause::{Cause, Defect, FlatCause};
pub use exit::Exit;
pub use fiber::{FiberId, FiberStatus};
