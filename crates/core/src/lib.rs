//! `fediq-core` — foundation types shared by the job queue crates.
//!
//! Pure building blocks (no infrastructure concerns): identifiers, queue names,
//! the clock abstraction and the domain error type.

pub mod clock;
pub mod error;
pub mod id;
pub mod queue;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{DomainError, DomainResult};
pub use id::JobId;
pub use queue::QueueName;
