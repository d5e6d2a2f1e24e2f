//! The exchange: the unit of work flowing through a route.
//!
//! An [`Exchange`] carries an inbound [`Message`] (body plus headers), a bag of
//! named properties, and the processing outcome. Processors mutate the
//! exchange in place; the scheduler owns it between steps.
//!
//! # Outcome
//!
//! The outcome of processing lives on the exchange itself:
//!
//! - [`Exchange::failure`] holds the captured [`Failure`], if any
//! - [`Exchange::exception_caught`] remembers a failure that an error handler
//!   or fallback has handled
//! - rollback flags and the tri-state error-handler-handled flag
//!
//! Well-known property and header names are listed in [`property`] and
//! [`header`].
//!
//! # Example
//!
//! ```
//! use conduit_core::exchange::{Exchange, property};
//! use serde_json::json;
//!
//! let mut exchange = Exchange::with_body(json!("Hello"));
//! exchange.message_mut().set_header("customerId", json!(123));
//! exchange.set_property(property::TO_ENDPOINT, json!("mock:result"));
//!
//! assert_eq!(exchange.body(), &json!("Hello"));
//! assert_eq!(exchange.header_as::<i64>("customerId"), Some(123));
//! ```

use crate::failure::Failure;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Well-known exchange property names.
pub mod property {
    /// The last endpoint the exchange was sent to.
    pub const TO_ENDPOINT: &str = "ConduitToEndpoint";
    /// The endpoint the exchange was being sent to when it failed.
    pub const FAILURE_ENDPOINT: &str = "ConduitFailureEndpoint";
    /// Set to `true` once a failure has been handled by a fallback or error handler.
    pub const EXCEPTION_HANDLED: &str = "ConduitExceptionHandled";
    /// Set to `true` when redelivery gave up.
    pub const REDELIVERY_EXHAUSTED: &str = "ConduitRedeliveryExhausted";
    /// Marks that the exchange is inside a guarded block (resilience, scheduler step).
    pub const TRY_ROUTE_BLOCK: &str = "ConduitTryRouteBlock";
    /// Set to `true` to stop routing the exchange any further.
    pub const ROUTE_STOP: &str = "ConduitRouteStop";
    /// Id of the route currently processing the exchange.
    pub const ROUTE_ID: &str = "ConduitRouteId";
}

/// Well-known message header names.
pub mod header {
    /// Redelivery attempt number set by the error handler.
    pub const REDELIVERY_COUNTER: &str = "ConduitRedeliveryCounter";
    /// Whether the current attempt is a redelivery.
    pub const REDELIVERED: &str = "ConduitRedelivered";
    /// Name of the service a service call targets.
    pub const SERVICE_CALL_SERVICE_NAME: &str = "ConduitServiceCallServiceName";
    /// Host chosen by the service call load balancer.
    pub const SERVICE_CALL_SERVICE_HOST: &str = "ConduitServiceCallServiceHost";
    /// Port chosen by the service call load balancer.
    pub const SERVICE_CALL_SERVICE_PORT: &str = "ConduitServiceCallServicePort";
    /// Prefix for metadata entries of the chosen service.
    pub const SERVICE_CALL_SERVICE_META: &str = "ConduitServiceCallServiceMeta.";
    /// Sequence index checked by the data set validator.
    pub const DATASET_INDEX: &str = "ConduitDataSetIndex";
}

/// Unique identifier of an exchange.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExchangeId(String);

impl ExchangeId {
    /// Generate a new random id.
    #[must_use]
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Borrow the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ExchangeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ExchangeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// A message: a JSON body plus named headers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    body: Value,
    headers: BTreeMap<String, Value>,
}

impl Message {
    /// Create a message with the given body and no headers.
    #[must_use]
    pub fn new(body: impl Into<Value>) -> Self {
        Self {
            body: body.into(),
            headers: BTreeMap::new(),
        }
    }

    /// The message body.
    #[must_use]
    pub const fn body(&self) -> &Value {
        &self.body
    }

    /// Mutable access to the body.
    pub fn body_mut(&mut self) -> &mut Value {
        &mut self.body
    }

    /// Replace the body.
    pub fn set_body(&mut self, body: impl Into<Value>) {
        self.body = body.into();
    }

    /// Take the body, leaving `null` behind.
    pub fn take_body(&mut self) -> Value {
        std::mem::take(&mut self.body)
    }

    /// Look up a header.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&Value> {
        self.headers.get(name)
    }

    /// Look up a header and convert it to `T`.
    ///
    /// Returns `None` when the header is absent or does not convert.
    #[must_use]
    pub fn header_as<T: DeserializeOwned>(&self, name: &str) -> Option<T> {
        self.headers
            .get(name)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    /// Set a header, returning the previous value.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.headers.insert(name.into(), value.into())
    }

    /// Remove a header.
    pub fn remove_header(&mut self, name: &str) -> Option<Value> {
        self.headers.remove(name)
    }

    /// All headers, ordered by name.
    #[must_use]
    pub const fn headers(&self) -> &BTreeMap<String, Value> {
        &self.headers
    }
}

/// The unit of work flowing through a route.
#[derive(Debug, Clone)]
pub struct Exchange {
    id: ExchangeId,
    created: DateTime<Utc>,
    message: Message,
    properties: BTreeMap<String, Value>,
    failure: Option<Failure>,
    exception_caught: Option<Failure>,
    rollback_only: bool,
    rollback_only_last: bool,
    error_handler_handled: Option<bool>,
}

impl Exchange {
    /// Create an exchange with an empty (`null`) body.
    #[must_use]
    pub fn new() -> Self {
        Self::with_message(Message::default())
    }

    /// Create an exchange carrying `body`.
    #[must_use]
    pub fn with_body(body: impl Into<Value>) -> Self {
        Self::with_message(Message::new(body))
    }

    /// Create an exchange carrying `message`.
    #[must_use]
    pub fn with_message(message: Message) -> Self {
        Self {
            id: ExchangeId::new(),
            created: Utc::now(),
            message,
            properties: BTreeMap::new(),
            failure: None,
            exception_caught: None,
            rollback_only: false,
            rollback_only_last: false,
            error_handler_handled: None,
        }
    }

    /// Copy this exchange under a fresh id.
    ///
    /// The copy keeps message, properties and outcome. Used by multicast and
    /// enrichment to hand each branch its own exchange.
    #[must_use]
    pub fn copy_with_new_id(&self) -> Self {
        let mut copy = self.clone();
        copy.id = ExchangeId::new();
        copy
    }

    /// Take over the results of `other` while keeping this exchange's id.
    ///
    /// Message, properties and outcome are replaced wholesale.
    pub fn copy_results_from(&mut self, other: Self) {
        self.message = other.message;
        self.properties = other.properties;
        self.failure = other.failure;
        self.exception_caught = other.exception_caught;
        self.rollback_only = other.rollback_only;
        self.rollback_only_last = other.rollback_only_last;
        self.error_handler_handled = other.error_handler_handled;
    }

    /// The exchange id.
    #[must_use]
    pub const fn id(&self) -> &ExchangeId {
        &self.id
    }

    /// When the exchange was created.
    #[must_use]
    pub const fn created(&self) -> DateTime<Utc> {
        self.created
    }

    /// The inbound message.
    #[must_use]
    pub const fn message(&self) -> &Message {
        &self.message
    }

    /// Mutable access to the inbound message.
    pub fn message_mut(&mut self) -> &mut Message {
        &mut self.message
    }

    /// Replace the inbound message.
    pub fn set_message(&mut self, message: Message) {
        self.message = message;
    }

    /// Shorthand for `message().body()`.
    #[must_use]
    pub const fn body(&self) -> &Value {
        self.message.body()
    }

    /// Shorthand for `message_mut().set_body(..)`.
    pub fn set_body(&mut self, body: impl Into<Value>) {
        self.message.set_body(body);
    }

    /// Shorthand for `message().header(..)`.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&Value> {
        self.message.header(name)
    }

    /// Shorthand for `message().header_as(..)`.
    #[must_use]
    pub fn header_as<T: DeserializeOwned>(&self, name: &str) -> Option<T> {
        self.message.header_as(name)
    }

    /// Look up a property.
    #[must_use]
    pub fn property(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }

    /// Look up a property and convert it to `T`.
    #[must_use]
    pub fn property_as<T: DeserializeOwned>(&self, name: &str) -> Option<T> {
        self.properties
            .get(name)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    /// Set a property, returning the previous value.
    pub fn set_property(&mut self, name: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.properties.insert(name.into(), value.into())
    }

    /// Set or remove a property.
    ///
    /// `None` removes the property, mirroring "set to absent".
    pub fn replace_property(&mut self, name: &str, value: Option<Value>) {
        match value {
            Some(value) => {
                self.properties.insert(name.to_string(), value);
            },
            None => {
                self.properties.remove(name);
            },
        }
    }

    /// Remove a property.
    pub fn remove_property(&mut self, name: &str) -> Option<Value> {
        self.properties.remove(name)
    }

    /// Whether a property is present.
    #[must_use]
    pub fn has_property(&self, name: &str) -> bool {
        self.properties.contains_key(name)
    }

    /// Read a boolean property, treating absent or non-boolean as `false`.
    #[must_use]
    pub fn property_flag(&self, name: &str) -> bool {
        self.properties
            .get(name)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// All properties, ordered by name.
    #[must_use]
    pub const fn properties(&self) -> &BTreeMap<String, Value> {
        &self.properties
    }

    /// The captured failure, if processing failed.
    #[must_use]
    pub const fn failure(&self) -> Option<&Failure> {
        self.failure.as_ref()
    }

    /// Whether a failure is recorded.
    #[must_use]
    pub const fn is_failed(&self) -> bool {
        self.failure.is_some()
    }

    /// Record a failure, replacing any previous one.
    pub fn set_failure(&mut self, failure: Failure) {
        self.failure = Some(failure);
    }

    /// Remove and return the failure.
    ///
    /// Clearing the failure also clears the redelivery-exhausted flag, which
    /// only has meaning while a failure is present.
    pub fn take_failure(&mut self) -> Option<Failure> {
        self.properties.remove(property::REDELIVERY_EXHAUSTED);
        self.failure.take()
    }

    /// Clear the failure along with its dependent flags.
    pub fn clear_failure(&mut self) {
        let _ = self.take_failure();
    }

    /// A failure that was handled but is kept for inspection.
    #[must_use]
    pub const fn exception_caught(&self) -> Option<&Failure> {
        self.exception_caught.as_ref()
    }

    /// Remember a handled failure.
    pub fn set_exception_caught(&mut self, failure: Option<Failure>) {
        self.exception_caught = failure;
    }

    /// Whether the exchange is marked rollback-only.
    #[must_use]
    pub const fn is_rollback_only(&self) -> bool {
        self.rollback_only
    }

    /// Mark the exchange rollback-only.
    pub fn set_rollback_only(&mut self, value: bool) {
        self.rollback_only = value;
    }

    /// Whether the exchange is marked rollback-only for the last transaction only.
    #[must_use]
    pub const fn is_rollback_only_last(&self) -> bool {
        self.rollback_only_last
    }

    /// Mark the exchange rollback-only-last.
    pub fn set_rollback_only_last(&mut self, value: bool) {
        self.rollback_only_last = value;
    }

    /// Tri-state: `None` means no error handler ran.
    #[must_use]
    pub const fn error_handler_handled(&self) -> Option<bool> {
        self.error_handler_handled
    }

    /// Record whether an error handler handled the failure.
    pub fn set_error_handler_handled(&mut self, value: Option<bool>) {
        self.error_handler_handled = value;
    }

    /// Whether the exchange is inside a guarded try block.
    #[must_use]
    pub fn in_try_block(&self) -> bool {
        self.property_flag(property::TRY_ROUTE_BLOCK)
    }

    /// Whether routing was asked to stop.
    #[must_use]
    pub fn is_route_stop(&self) -> bool {
        self.property_flag(property::ROUTE_STOP)
    }

    /// Whether redelivery gave up on this exchange.
    #[must_use]
    pub fn is_redelivery_exhausted(&self) -> bool {
        self.property_flag(property::REDELIVERY_EXHAUSTED)
    }
}

impl Default for Exchange {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_exchange_has_unique_id() {
        let a = Exchange::new();
        let b = Exchange::new();

        assert_ne!(a.id(), b.id());
        assert!(!a.is_failed());
        assert_eq!(a.error_handler_handled(), None);
    }

    #[test]
    fn test_header_conversion() {
        let mut exchange = Exchange::with_body(json!({"order": 7}));
        exchange.message_mut().set_header("count", json!(5));
        exchange.message_mut().set_header("name", json!("five"));

        assert_eq!(exchange.header_as::<i64>("count"), Some(5));
        assert_eq!(exchange.header_as::<i64>("name"), None);
        assert_eq!(exchange.header_as::<String>("missing"), None);
    }

    #[test]
    fn test_clearing_failure_clears_redelivery_exhausted() {
        let mut exchange = Exchange::new();
        exchange.set_failure(Failure::msg("boom"));
        exchange.set_property(property::REDELIVERY_EXHAUSTED, true);
        assert!(exchange.is_redelivery_exhausted());

        exchange.clear_failure();

        assert!(!exchange.is_failed());
        assert!(!exchange.is_redelivery_exhausted());
    }

    #[test]
    fn test_replace_property_none_removes() {
        let mut exchange = Exchange::new();
        exchange.set_property(property::FAILURE_ENDPOINT, json!("mock:a"));

        exchange.replace_property(property::FAILURE_ENDPOINT, None);

        assert!(!exchange.has_property(property::FAILURE_ENDPOINT));
    }

    #[test]
    fn test_copy_with_new_id_keeps_content() {
        let mut exchange = Exchange::with_body(json!("payload"));
        exchange.set_property("k", json!(1));

        let copy = exchange.copy_with_new_id();

        assert_ne!(copy.id(), exchange.id());
        assert_eq!(copy.body(), exchange.body());
        assert_eq!(copy.property("k"), Some(&json!(1)));
    }
}
