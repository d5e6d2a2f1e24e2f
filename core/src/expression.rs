//! Expressions and predicates evaluated against an exchange.
//!
//! The simple template language understands `${...}` tokens:
//!
//! | Token                      | Value                          |
//! |----------------------------|--------------------------------|
//! | `${body}`                  | message body                   |
//! | `${header.name}`           | header `name` (`headers.` too) |
//! | `${exchangeProperty.name}` | exchange property `name`       |
//! | `${exchangeId}`            | exchange id                    |
//!
//! Absent values interpolate as the empty string.

use crate::error::ConfigError;
use crate::exchange::Exchange;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Body,
    Header(String),
    Property(String),
    ExchangeId,
}

/// A parsed `${...}` template.
///
/// # Example
///
/// ```
/// use conduit_core::expression::SimpleTemplate;
/// use conduit_core::exchange::Exchange;
/// use serde_json::json;
///
/// let template = SimpleTemplate::parse("scall/api/${header.customerId}").unwrap();
/// let mut exchange = Exchange::new();
/// exchange.message_mut().set_header("customerId", json!(123));
///
/// assert_eq!(template.render(&exchange), "scall/api/123");
/// assert_eq!(template.to_string(), "scall/api/${header.customerId}");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimpleTemplate {
    source: String,
    segments: Vec<Segment>,
}

impl SimpleTemplate {
    /// Parse a template.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidExpression`] for an unterminated token or
    /// an unknown function.
    pub fn parse(source: &str) -> Result<Self, ConfigError> {
        let mut segments = Vec::new();
        let mut rest = source;

        while let Some(start) = rest.find("${") {
            if start > 0 {
                segments.push(Segment::Literal(rest[..start].to_string()));
            }
            let after = &rest[start + 2..];
            let end = after.find('}').ok_or_else(|| ConfigError::InvalidExpression {
                expression: source.to_string(),
                reason: "unterminated ${ token".to_string(),
            })?;
            segments.push(parse_token(source, after[..end].trim())?);
            rest = &after[end + 1..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }

        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    /// Whether the template contains any `${...}` token.
    #[must_use]
    pub fn is_dynamic(&self) -> bool {
        self.segments
            .iter()
            .any(|segment| !matches!(segment, Segment::Literal(_)))
    }

    /// Render the template against an exchange.
    #[must_use]
    pub fn render(&self, exchange: &Exchange) -> String {
        let mut out = String::with_capacity(self.source.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Body => push_value(&mut out, Some(exchange.body())),
                Segment::Header(name) => push_value(&mut out, exchange.header(name)),
                Segment::Property(name) => push_value(&mut out, exchange.property(name)),
                Segment::ExchangeId => out.push_str(exchange.id().as_str()),
            }
        }
        out
    }
}

impl fmt::Display for SimpleTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn parse_token(source: &str, token: &str) -> Result<Segment, ConfigError> {
    if token == "body" || token == "in.body" {
        return Ok(Segment::Body);
    }
    if token == "exchangeId" {
        return Ok(Segment::ExchangeId);
    }
    for prefix in ["header.", "headers.", "in.header.", "in.headers."] {
        if let Some(name) = token.strip_prefix(prefix) {
            return Ok(Segment::Header(name.to_string()));
        }
    }
    if let Some(name) = token.strip_prefix("exchangeProperty.") {
        return Ok(Segment::Property(name.to_string()));
    }
    Err(ConfigError::InvalidExpression {
        expression: source.to_string(),
        reason: format!("unknown function: {token}"),
    })
}

/// Render a JSON value the way it reads in a URI or log line.
#[must_use]
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn push_value(out: &mut String, value: Option<&Value>) {
    if let Some(value) = value {
        out.push_str(&value_to_string(value));
    }
}

/// A value computed from an exchange.
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    /// A fixed value.
    Constant(Value),
    /// The message body.
    Body,
    /// A header, `null` when absent.
    Header(String),
    /// An exchange property, `null` when absent.
    Property(String),
    /// A simple template, always evaluating to a string.
    Simple(SimpleTemplate),
}

impl Expression {
    /// Parse a simple template expression.
    ///
    /// # Errors
    ///
    /// See [`SimpleTemplate::parse`].
    pub fn simple(source: &str) -> Result<Self, ConfigError> {
        SimpleTemplate::parse(source).map(Self::Simple)
    }

    /// A constant expression.
    #[must_use]
    pub fn constant(value: impl Into<Value>) -> Self {
        Self::Constant(value.into())
    }

    /// Evaluate against the exchange.
    #[must_use]
    pub fn evaluate(&self, exchange: &Exchange) -> Value {
        match self {
            Self::Constant(value) => value.clone(),
            Self::Body => exchange.body().clone(),
            Self::Header(name) => exchange.header(name).cloned().unwrap_or(Value::Null),
            Self::Property(name) => exchange.property(name).cloned().unwrap_or(Value::Null),
            Self::Simple(template) => Value::String(template.render(exchange)),
        }
    }

    /// Evaluate and render as a string.
    #[must_use]
    pub fn evaluate_string(&self, exchange: &Exchange) -> String {
        match self {
            Self::Simple(template) => template.render(exchange),
            other => value_to_string(&other.evaluate(exchange)),
        }
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Constant(value) => write!(f, "{value}"),
            Self::Body => f.write_str("${body}"),
            Self::Header(name) => write!(f, "${{header.{name}}}"),
            Self::Property(name) => write!(f, "${{exchangeProperty.{name}}}"),
            Self::Simple(template) => fmt::Display::fmt(template, f),
        }
    }
}

/// A boolean test over an exchange.
#[derive(Clone)]
pub struct Predicate {
    description: String,
    test: Arc<dyn Fn(&Exchange) -> bool + Send + Sync>,
}

impl Predicate {
    /// Build a predicate from a closure.
    #[must_use]
    pub fn new<F>(description: impl Into<String>, test: F) -> Self
    where
        F: Fn(&Exchange) -> bool + Send + Sync + 'static,
    {
        Self {
            description: description.into(),
            test: Arc::new(test),
        }
    }

    /// True when header `name` equals `value`.
    #[must_use]
    pub fn header_equals(name: impl Into<String>, value: impl Into<Value>) -> Self {
        let name = name.into();
        let value = value.into();
        let description = format!("${{header.{name}}} == {value}");
        Self::new(description, move |exchange| exchange.header(&name) == Some(&value))
    }

    /// True when the body equals `value`.
    #[must_use]
    pub fn body_equals(value: impl Into<Value>) -> Self {
        let value = value.into();
        let description = format!("${{body}} == {value}");
        Self::new(description, move |exchange| exchange.body() == &value)
    }

    /// Always true.
    #[must_use]
    pub fn always() -> Self {
        Self::new("true", |_| true)
    }

    /// Evaluate the predicate.
    #[must_use]
    pub fn matches(&self, exchange: &Exchange) -> bool {
        (self.test)(exchange)
    }
}

impl fmt::Debug for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Predicate").field(&self.description).finish()
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.description)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::header;
    use serde_json::json;

    #[test]
    fn test_renders_service_call_template() {
        let template = SimpleTemplate::parse(
            "file:${header.ConduitServiceCallServiceHost}:${header.ConduitServiceCallServicePort}",
        )
        .unwrap();
        let mut exchange = Exchange::new();
        exchange
            .message_mut()
            .set_header(header::SERVICE_CALL_SERVICE_HOST, json!("127.0.0.1"));
        exchange
            .message_mut()
            .set_header(header::SERVICE_CALL_SERVICE_PORT, json!(8080));

        assert_eq!(template.render(&exchange), "file:127.0.0.1:8080");
        assert!(template.is_dynamic());
    }

    #[test]
    fn test_absent_header_renders_empty() {
        let template = SimpleTemplate::parse("a-${header.missing}-b").unwrap();

        assert_eq!(template.render(&Exchange::new()), "a--b");
    }

    #[test]
    fn test_rejects_unknown_function_and_unterminated_token() {
        assert!(SimpleTemplate::parse("${bogus}").is_err());
        assert!(SimpleTemplate::parse("${header.x").is_err());
    }

    #[test]
    fn test_literal_template_is_static() {
        let template = SimpleTemplate::parse("mock:result").unwrap();

        assert!(!template.is_dynamic());
        assert_eq!(template.render(&Exchange::new()), "mock:result");
    }

    #[test]
    fn test_predicate_header_equals() {
        let predicate = Predicate::header_equals("kind", json!("gold"));
        let mut exchange = Exchange::new();
        assert!(!predicate.matches(&exchange));

        exchange.message_mut().set_header("kind", json!("gold"));
        assert!(predicate.matches(&exchange));
    }
}
