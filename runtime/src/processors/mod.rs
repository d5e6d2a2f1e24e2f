//! Built-in processors.
//!
//! Routes are trees of these processors. Composite processors ([`Pipeline`],
//! [`Choice`], [`Multicast`], [`Enricher`]) delegate to children through
//! [`capture`](crate::scheduler::capture), so a failing child leaves its
//! failure on the exchange instead of unwinding the composite.

mod choice;
mod enricher;
mod multicast;
mod pipeline;
mod send;
mod simple;

pub use choice::Choice;
pub use enricher::Enricher;
pub use multicast::Multicast;
pub use pipeline::{Pipeline, should_continue};
pub use send::SendProcessor;
pub use simple::{LogProcessor, SetBody, SetHeader};
