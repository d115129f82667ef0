//! # Weft Engine
//!
//! The Weft Engine runs declarative workflow descriptions on cooperatively
//! scheduled fibers. It provides structured concurrency, fiber-local state with
//! well-defined inheritance rules, and failure reporting through the [`Cause`]
//! algebra, which never drops a branch when concurrent work fails.
//!
//! ## Key Features
//!
//! - **Descriptions as values**: an [`Effect`] is an immutable, reusable description;
//!   nothing runs until it is handed to a [`Runtime`]
//! - **Stack-safe evaluation**: a trampoline with an explicit continuation stack
//! - **Structured concurrency**: `fork`, `join`, `race`, `race_first`, `race_all`,
//!   `zip_par` and `timeout`, with supervised children
//! - **Fiber-local environment**: [`EnvRef`]s with per-ref fork and join functions,
//!   inherited only from children that succeed
//! - **Safe cancellation**: interrupts are observed at defined checkpoints and never
//!   inside uninterruptible regions or finalizers
//!
//! ## Usage
//!
//! ```rust
//! use weft_engine::{Effect, EnvRef, Exit, Runtime, RuntimeConfig};
//!
//! let runtime = Runtime::new(RuntimeConfig::default())?;
//! let visits = EnvRef::new(0u32);
//!
//! let program = visits
//!     .update::<String>(|count| count + 1)
//!     .zip_right(visits.update(|count| count + 1).fork())
//!     .flat_map(|child| child.join())
//!     .zip_right(visits.get());
//!
//! assert_eq!(runtime.block_on(program), Exit::Success(2));
//! # Ok::<(), anyhow::Error>(())
//! ```
//!
//! ## Architecture
//!
//! - **`effect`**: the description language and its typed constructors
//! - **`evaluator`**: the per-fiber trampoline loop
//! - **`fiber`**: fiber lifecycle, interruption and the [`Fiber`] handle
//! - **`env`**: the copy-on-write fiber-local environment
//! - **`combinators`**: races, parallel zips, timeouts and resource safety
//! - **`runtime`** / **`config`**: the host-facing entry points

pub mod combinators;
pub mod config;
pub mod effect;
pub mod env;
mod erased;
mod evaluator;
pub mod fiber;
pub mod runtime;

pub use config::{ConfigError, RuntimeConfig, WORKER_THREADS_ENV, YIELD_AFTER_OPS_ENV};
pub use effect::{Callback, Effect, InterruptRestore};
pub use env::{Env, EnvKey, EnvRef};
pub use erased::Payload;
pub use fiber::Fiber;
pub use runtime::Runtime;
pub use weft_types::{Cause, Defect, Exit, FiberId, FiberStatus, FlatCause};
