//! Validation of monotonic data-set indices.
//!
//! Producers replaying a data set number their messages through the
//! `ConduitDataSetIndex` header. A [`DataSetIndexValidator`] keeps the expected
//! next index and checks each exchange against it according to an
//! [`IndexValidation`] mode.

use crate::error::RoutingError;
use conduit_core::exchange::header;
use conduit_core::processor::ProcessFuture;
use conduit_core::{Exchange, Failure, Processor};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};

/// How strictly the index header is checked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexValidation {
    /// Ignore any incoming header and stamp the counter.
    Off,
    /// Check the header when present, stamp the counter when absent.
    #[default]
    Lenient,
    /// Require the header and check it.
    Strict,
}

/// Checks `ConduitDataSetIndex` against a running counter.
///
/// The counter starts at `0` and advances after every accepted exchange. A
/// rejected exchange fails without advancing it.
///
/// # Example
///
/// ```
/// use conduit_core::prelude::*;
/// use conduit_runtime::dataset::{DataSetIndexValidator, IndexValidation};
///
/// # futures::executor::block_on(async {
/// let validator = DataSetIndexValidator::new(IndexValidation::Strict);
/// let mut first = Exchange::new();
/// first.message_mut().set_header(header::DATASET_INDEX, 0);
///
/// validator.process(&mut first).await.unwrap();
/// assert!(validator.process(&mut Exchange::new()).await.is_err());
/// assert_eq!(validator.expected_index(), 1);
/// # });
/// ```
#[derive(Debug)]
pub struct DataSetIndexValidator {
    mode: IndexValidation,
    next: AtomicI64,
}

impl DataSetIndexValidator {
    /// Create a validator starting at index `0`.
    #[must_use]
    pub const fn new(mode: IndexValidation) -> Self {
        Self {
            mode,
            next: AtomicI64::new(0),
        }
    }

    /// The validation mode.
    #[must_use]
    pub const fn mode(&self) -> IndexValidation {
        self.mode
    }

    /// The index the next exchange must carry.
    #[must_use]
    pub fn expected_index(&self) -> i64 {
        self.next.load(Ordering::Acquire)
    }

    fn stamp(&self, exchange: &mut Exchange) {
        let index = self.next.fetch_add(1, Ordering::AcqRel);
        exchange.message_mut().set_header(header::DATASET_INDEX, index);
    }

    fn check(&self, exchange: &Exchange) -> Result<(), RoutingError> {
        let missing = || RoutingError::MissingDataSetIndex {
            header: header::DATASET_INDEX.to_string(),
        };
        let actual = exchange
            .header(header::DATASET_INDEX)
            .and_then(serde_json::Value::as_i64)
            .ok_or_else(missing)?;

        self.next
            .compare_exchange(actual, actual + 1, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|expected| RoutingError::DataSetIndexMismatch {
                header: header::DATASET_INDEX.to_string(),
                expected,
                actual,
            })
    }

    fn validate(&self, exchange: &mut Exchange) -> Result<(), RoutingError> {
        match self.mode {
            IndexValidation::Off => {
                self.stamp(exchange);
                Ok(())
            },
            IndexValidation::Lenient if exchange.header(header::DATASET_INDEX).is_none() => {
                self.stamp(exchange);
                Ok(())
            },
            IndexValidation::Lenient | IndexValidation::Strict => self.check(exchange),
        }
    }
}

impl Processor for DataSetIndexValidator {
    fn process<'a>(&'a self, exchange: &'a mut Exchange) -> ProcessFuture<'a> {
        let outcome = self.validate(exchange).map_err(|error| {
            tracing::warn!(exchange_id = %exchange.id(), mode = ?self.mode, error = %error, "Data set index rejected");
            Failure::from(error)
        });
        Box::pin(std::future::ready(outcome))
    }

    fn name(&self) -> &str {
        "dataSetIndex"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn indexed(index: impl Into<serde_json::Value>) -> Exchange {
        let mut exchange = Exchange::new();
        exchange.message_mut().set_header(header::DATASET_INDEX, index);
        exchange
    }

    #[tokio::test]
    async fn test_off_overwrites_incoming_header() {
        let validator = DataSetIndexValidator::new(IndexValidation::Off);
        let mut exchange = indexed(42);

        validator.process(&mut exchange).await.unwrap();

        assert_eq!(exchange.header(header::DATASET_INDEX), Some(&json!(0)));
    }

    #[tokio::test]
    async fn test_lenient_mixes_stamped_and_checked() {
        let validator = DataSetIndexValidator::new(IndexValidation::Lenient);

        for n in 0..6 {
            let mut exchange = if n % 2 == 0 { indexed(n) } else { Exchange::new() };
            validator.process(&mut exchange).await.unwrap();
            assert_eq!(exchange.header(header::DATASET_INDEX), Some(&json!(n)));
        }
        assert_eq!(validator.expected_index(), 6);
    }

    #[tokio::test]
    async fn test_strict_requires_header() {
        let validator = DataSetIndexValidator::new(IndexValidation::Strict);

        let failure = validator.process(&mut Exchange::new()).await.unwrap_err();

        assert_eq!(failure.to_string(), "No 'ConduitDataSetIndex' header available of type: i64");
        assert_eq!(validator.expected_index(), 0);
    }

    #[tokio::test]
    async fn test_mismatch_does_not_advance() {
        let validator = DataSetIndexValidator::new(IndexValidation::Strict);
        validator.process(&mut indexed(0)).await.unwrap();

        let failure = validator.process(&mut indexed(5)).await.unwrap_err();

        assert_eq!(
            failure.downcast_ref::<RoutingError>(),
            Some(&RoutingError::DataSetIndexMismatch {
                header: header::DATASET_INDEX.to_string(),
                expected: 1,
                actual: 5,
            })
        );
        validator.process(&mut indexed(1)).await.unwrap();
        assert_eq!(validator.expected_index(), 2);
    }

    #[tokio::test]
    async fn test_non_numeric_header_counts_as_missing() {
        let validator = DataSetIndexValidator::new(IndexValidation::Lenient);

        let failure = validator.process(&mut indexed("first")).await.unwrap_err();

        assert!(matches!(
            failure.downcast_ref::<RoutingError>(),
            Some(RoutingError::MissingDataSetIndex { .. })
        ));
    }

    #[test]
    fn test_mode_deserializes_lowercase() {
        let mode: IndexValidation = serde_json::from_value(json!("strict")).unwrap();
        assert_eq!(mode, IndexValidation::Strict);
    }
}
