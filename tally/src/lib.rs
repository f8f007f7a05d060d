//! Interval counters reported to a time series backend.
//!
//! Application code creates counters through a [`Reporter`] and calls
//! [`Counter::count`] from any thread, as often as it likes. Each counter
//! buckets its increments into fixed windows aligned to the Unix epoch. A
//! background loop wakes once per refresh interval, drains every window that
//! has fully elapsed and submits one cumulative point per window. Stopping the
//! reporter flushes the window still open before the loop exits.
//!
//! ```text
//! count() -> bucket -> [tick] -> drain -> points -> batches -> backend
//!                                                       \-> error handler
//! ```
//!
//! Delivery is best effort. A failed submission is passed to the configured
//! error handler and its points are dropped.

#![deny(clippy::all)]
#![deny(clippy::cargo)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_copy_implementations)]
#![deny(missing_debug_implementations)]
#![allow(clippy::multiple_crate_versions)]

pub mod backend;
pub mod clock;
pub mod config;
pub mod counter;
pub mod metadata;
pub mod reporter;
pub mod resource;
pub mod scheduler;
pub mod series;
pub mod validate;

#[cfg(test)]
mod test;

pub use clock::{Clock, ManualClock, RealClock};
pub use config::{Config, Settings};
pub use counter::Counter;
pub use reporter::Reporter;
pub use resource::Resource;
pub use scheduler::Scope;
