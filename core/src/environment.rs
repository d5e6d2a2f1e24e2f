//! Injected collaborators.
//!
//! Routes depend on the outside world only through these traits: a property
//! source for `{{key}}` placeholders and an endpoint resolver turning URIs
//! into processors.

use crate::error::ConfigError;
use crate::processor::SharedProcessor;
use std::collections::HashMap;

/// Source of `{{key}}` placeholder values.
pub trait PropertyResolver: Send + Sync {
    /// Look up a single property.
    fn property(&self, key: &str) -> Option<String>;

    /// Replace every `{{key}}` in `input`.
    ///
    /// `{{key:fallback}}` uses `fallback` when the key is unknown. Resolved
    /// values are not scanned again.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnresolvedPlaceholder`] for an unknown key
    /// without fallback, and [`ConfigError::InvalidExpression`] for an
    /// unterminated placeholder.
    fn resolve(&self, input: &str) -> Result<String, ConfigError> {
        let mut out = String::with_capacity(input.len());
        let mut rest = input;

        while let Some(start) = rest.find("{{") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let end = after.find("}}").ok_or_else(|| ConfigError::InvalidExpression {
                expression: input.to_string(),
                reason: "unterminated {{ placeholder".to_string(),
            })?;
            let token = after[..end].trim();
            let (key, fallback) = match token.split_once(':') {
                Some((key, fallback)) => (key, Some(fallback)),
                None => (token, None),
            };
            let value = self
                .property(key)
                .or_else(|| fallback.map(str::to_string))
                .ok_or_else(|| ConfigError::UnresolvedPlaceholder(key.to_string()))?;
            out.push_str(&value);
            rest = &after[end + 2..];
        }
        out.push_str(rest);

        Ok(out)
    }
}

/// Properties held in memory.
///
/// # Example
///
/// ```
/// use conduit_core::environment::{MapPropertyResolver, PropertyResolver};
///
/// let properties = MapPropertyResolver::new()
///     .with("scall.servers1", "hello-service@localhost:8081,hello-service@localhost:8082");
///
/// assert_eq!(
///     properties.resolve("{{scall.servers1}}").unwrap(),
///     "hello-service@localhost:8081,hello-service@localhost:8082"
/// );
/// assert!(properties.resolve("{{unknown}}").is_err());
/// ```
#[derive(Debug, Clone, Default)]
pub struct MapPropertyResolver {
    properties: HashMap<String, String>,
}

impl MapPropertyResolver {
    /// Create an empty resolver.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a property.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Add a property in place.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.properties.insert(key.into(), value.into());
    }
}

impl PropertyResolver for MapPropertyResolver {
    fn property(&self, key: &str) -> Option<String> {
        self.properties.get(key).cloned()
    }
}

/// Reads properties from environment variables.
///
/// `a.b-c` is looked up as `A_B_C`.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvPropertyResolver;

impl PropertyResolver for EnvPropertyResolver {
    fn property(&self, key: &str) -> Option<String> {
        let name: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
            .collect();
        std::env::var(name).ok()
    }
}

/// Turns endpoint URIs into processors.
pub trait EndpointResolver: Send + Sync {
    /// Resolve `uri`, or `None` when no component handles it.
    fn resolve_endpoint(&self, uri: &str) -> Option<SharedProcessor>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_mixes_literals_and_fallbacks() {
        let properties = MapPropertyResolver::new().with("host", "localhost");

        let resolved = properties
            .resolve("http://{{host}}:{{port:8080}}/api")
            .unwrap();

        assert_eq!(resolved, "http://localhost:8080/api");
    }

    #[test]
    fn test_resolve_reports_missing_key() {
        let properties = MapPropertyResolver::new();

        let err = properties.resolve("{{scall.servers2}}").unwrap_err();

        assert_eq!(err, ConfigError::UnresolvedPlaceholder("scall.servers2".to_string()));
    }

    #[test]
    fn test_unterminated_placeholder() {
        assert!(MapPropertyResolver::new().resolve("{{oops").is_err());
    }
}
