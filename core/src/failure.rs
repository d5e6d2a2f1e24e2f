//! Captured processing failures.
//!
//! A [`Failure`] is what a processor leaves on an [`Exchange`](crate::exchange::Exchange)
//! when it cannot complete its work. Failures travel with the exchange as data
//! rather than unwinding the caller, so error handlers and aggregation strategies
//! can inspect them and decide what to do.
//!
//! Failures wrap the original error behind an `Arc`, which makes them cheap to
//! clone when an aggregation strategy copies a failure from one exchange onto
//! another. The concrete error type is still available through
//! [`Failure::is`] and [`Failure::downcast_ref`], which is how `on_exception`
//! clauses select the failures they handle.

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

/// A cloneable, type-erased processing failure.
///
/// # Example
///
/// ```
/// use conduit_core::Failure;
///
/// #[derive(Debug, thiserror::Error)]
/// #[error("inventory service rejected the order")]
/// struct InventoryRejected;
///
/// let failure = Failure::new(InventoryRejected);
/// assert!(failure.is::<InventoryRejected>());
/// assert_eq!(failure.to_string(), "inventory service rejected the order");
/// ```
#[derive(Clone)]
pub struct Failure {
    inner: Arc<dyn StdError + Send + Sync + 'static>,
}

impl Failure {
    /// Wrap a concrete error.
    #[must_use]
    pub fn new<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(error),
        }
    }

    /// Create a failure from a plain message.
    #[must_use]
    pub fn msg(message: impl Into<String>) -> Self {
        Self::new(MessageError(message.into()))
    }

    /// Check whether the wrapped error is of type `E`.
    #[must_use]
    pub fn is<E>(&self) -> bool
    where
        E: StdError + 'static,
    {
        self.inner.is::<E>()
    }

    /// Borrow the wrapped error as `E`, if it is one.
    #[must_use]
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: StdError + 'static,
    {
        self.inner.downcast_ref::<E>()
    }

    /// Whether both failures are the very same captured error.
    ///
    /// Copies produced by [`Clone`] share identity, so this answers "was this
    /// failure propagated from there" rather than "do the messages match".
    #[must_use]
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Borrow the wrapped error as a trait object.
    #[must_use]
    pub fn as_error(&self) -> &(dyn StdError + Send + Sync + 'static) {
        &*self.inner
    }
}

impl fmt::Debug for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Failure").field(&self.inner).finish()
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.inner, f)
    }
}

impl StdError for Failure {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner.source()
    }
}

impl From<String> for Failure {
    fn from(message: String) -> Self {
        Self::msg(message)
    }
}

impl From<&str> for Failure {
    fn from(message: &str) -> Self {
        Self::msg(message)
    }
}

/// Error used by [`Failure::msg`].
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct MessageError(pub String);
