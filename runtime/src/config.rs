//! File-based configuration.
//!
//! A [`ConduitConfig`] is read from TOML and installed into a
//! [`RouteContext`]: the redelivery section becomes the default error handler,
//! the circuit breaker section sets registry defaults, and the service-call
//! sections register the default and named service-call configurations.
//!
//! String values in service-call sections may contain `{{placeholders}}`;
//! they are resolved against the context properties when a route using them
//! is compiled, not when the file is loaded.
//!
//! # Example
//!
//! ```
//! use conduit_runtime::config::ConduitConfig;
//!
//! let config = ConduitConfig::from_toml_str(
//!     r#"
//!     [redelivery]
//!     max_redeliveries = 3
//!     initial_delay_ms = 100
//!
//!     [service_call.default]
//!     component = "http"
//!
//!     [service_call.default.discovery]
//!     type = "static"
//!     servers = ["hello-service@localhost:8081", "hello-service@localhost:8082"]
//!     "#,
//! )
//! .unwrap();
//!
//! assert_eq!(config.redelivery.max_redeliveries, 3);
//! assert!(config.service_call.default.is_some());
//! ```

use crate::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerRegistry};
use crate::cloud::{
    DEFAULT_COMPONENT, ServiceCallConfiguration, ServiceChooserDefinition, ServiceDiscoveryDefinition,
    ServiceFilterDefinition,
};
use crate::context::RouteContext;
use crate::dead_letter::DeadLetterQueue;
use crate::error_handler::{ErrorHandler, RedeliveryPolicy};
use conduit_core::ConfigError;
use conduit_core::environment::EndpointResolver;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Logging and metrics settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log filter used when `RUST_LOG` is not set (e.g. `info`, `conduit_runtime=debug`)
    pub log_level: String,
    /// Address for the Prometheus exporter, if any
    pub metrics_address: Option<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_address: None,
        }
    }
}

impl ObservabilityConfig {
    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for an unparsable log filter or
    /// metrics address.
    pub fn validate(&self) -> Result<(), ConfigError> {
        EnvFilter::try_new(&self.log_level)
            .map_err(|e| ConfigError::Invalid(format!("invalid log_level {}: {e}", self.log_level)))?;
        if let Some(address) = &self.metrics_address {
            address
                .parse::<std::net::SocketAddr>()
                .map_err(|e| ConfigError::Invalid(format!("invalid metrics_address {address}: {e}")))?;
        }
        Ok(())
    }

    /// Install a global `fmt` subscriber.
    ///
    /// `RUST_LOG` takes precedence over `log_level`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if the filter does not parse or a
    /// global subscriber is already installed.
    pub fn init_tracing(&self) -> Result<(), ConfigError> {
        let filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&self.log_level))
            .map_err(|e| ConfigError::Invalid(format!("invalid log_level {}: {e}", self.log_level)))?;

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init()
            .map_err(|e| ConfigError::Invalid(format!("failed to install tracing subscriber: {e}")))
    }
}

/// Default redelivery settings for routes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedeliveryConfig {
    /// Redelivery attempts after the first failure
    pub max_redeliveries: u32,
    /// Delay before the first redelivery, in milliseconds
    pub initial_delay_ms: u64,
    /// Cap on the back-off delay, in milliseconds
    pub max_delay_ms: u64,
    /// Back-off multiplier (1.0 = constant delay)
    pub backoff_multiplier: f64,
    /// Randomise delays
    pub jitter: bool,
    /// Capacity of the dead letter queue; no dead letter channel when unset
    pub dead_letter_queue_size: Option<usize>,
}

impl Default for RedeliveryConfig {
    fn default() -> Self {
        Self {
            max_redeliveries: 0,
            initial_delay_ms: 1000,
            max_delay_ms: 60_000,
            backoff_multiplier: 1.0,
            jitter: false,
            dead_letter_queue_size: None,
        }
    }
}

impl RedeliveryConfig {
    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when delays or sizes are inconsistent.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backoff_multiplier < 1.0 {
            return Err(ConfigError::Invalid("backoff_multiplier must be >= 1.0".to_string()));
        }
        if self.initial_delay_ms > self.max_delay_ms {
            return Err(ConfigError::Invalid(
                "initial_delay_ms must not exceed max_delay_ms".to_string(),
            ));
        }
        if self.dead_letter_queue_size == Some(0) {
            return Err(ConfigError::Invalid("dead_letter_queue_size must be > 0".to_string()));
        }
        Ok(())
    }

    /// The equivalent policy.
    #[must_use]
    pub const fn policy(&self) -> RedeliveryPolicy {
        RedeliveryPolicy::new()
            .with_max_redeliveries(self.max_redeliveries)
            .with_initial_delay(Duration::from_millis(self.initial_delay_ms))
            .with_max_delay(Duration::from_millis(self.max_delay_ms))
            .with_backoff_multiplier(self.backoff_multiplier)
            .with_jitter(self.jitter)
    }
}

/// Registry defaults for circuit breakers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    /// Failures before opening
    pub failure_threshold: usize,
    /// How long the circuit stays open, in milliseconds
    pub timeout_ms: u64,
    /// Half-open successes before closing
    pub success_threshold: usize,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        let config = CircuitBreakerConfig::default();
        Self {
            failure_threshold: config.failure_threshold,
            timeout_ms: u64::try_from(config.timeout.as_millis()).unwrap_or(u64::MAX),
            success_threshold: config.success_threshold,
        }
    }
}

impl CircuitBreakerSettings {
    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for zero thresholds or timeout.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::Invalid("failure_threshold must be > 0".to_string()));
        }
        if self.success_threshold == 0 {
            return Err(ConfigError::Invalid("success_threshold must be > 0".to_string()));
        }
        if self.timeout_ms == 0 {
            return Err(ConfigError::Invalid("circuit breaker timeout_ms must be > 0".to_string()));
        }
        Ok(())
    }

    /// The equivalent breaker configuration.
    #[must_use]
    pub fn config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig::builder()
            .failure_threshold(self.failure_threshold)
            .timeout(Duration::from_millis(self.timeout_ms))
            .success_threshold(self.success_threshold)
            .build()
    }
}

/// One service-call configuration as written in the file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceCallSection {
    /// Scheme of the target endpoint
    pub component: Option<String>,
    /// Uri template overriding `scheme:host:port`
    pub expression: Option<String>,
    /// Chooser
    pub chooser: Option<ServiceChooserDefinition>,
    /// Discovery
    pub discovery: Option<ServiceDiscoveryDefinition>,
    /// Filter
    pub filter: Option<ServiceFilterDefinition>,
}

impl ServiceCallSection {
    /// Build the configuration tier.
    #[must_use]
    pub fn configuration(&self) -> ServiceCallConfiguration {
        let mut configuration = ServiceCallConfiguration::new();
        if let Some(discovery) = &self.discovery {
            configuration = configuration.service_discovery_definition(discovery.clone());
        }
        if let Some(filter) = &self.filter {
            configuration = configuration.service_filter_definition(filter.clone());
        }
        if let Some(chooser) = self.chooser {
            configuration = configuration.service_chooser_definition(chooser);
        }
        if let Some(component) = &self.component {
            configuration = configuration.component(component.clone());
        }
        if let Some(expression) = &self.expression {
            configuration = configuration.expression(expression.clone());
        }
        configuration
    }

    fn validate(&self, id: &str) -> Result<(), ConfigError> {
        if self.component.as_deref().is_some_and(|c| c.trim().is_empty()) {
            return Err(ConfigError::Invalid(format!("service call {id}: component cannot be empty")));
        }
        Ok(())
    }
}

/// The `[service_call]` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceCallSettings {
    /// Used by service calls without a configuration reference
    pub default: Option<ServiceCallSection>,
    /// Referenced by id
    pub named: BTreeMap<String, ServiceCallSection>,
}

/// Complete configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConduitConfig {
    /// `[observability]`
    pub observability: ObservabilityConfig,
    /// `[redelivery]`
    pub redelivery: RedeliveryConfig,
    /// `[circuit_breaker]`
    pub circuit_breaker: CircuitBreakerSettings,
    /// `[service_call]`
    pub service_call: ServiceCallSettings,
}

impl ConduitConfig {
    /// Parse a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed TOML or unknown values.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        toml::from_str(source).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Read and parse a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Parse(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&source)
    }

    /// Validate every section.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError::Invalid`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.observability.validate()?;
        self.redelivery.validate()?;
        self.circuit_breaker.validate()?;
        if let Some(default) = &self.service_call.default {
            default.validate("default")?;
        }
        for (id, section) in &self.service_call.named {
            section.validate(id)?;
        }
        Ok(())
    }

    /// Install the error handler and service-call configurations into `context`.
    ///
    /// Circuit breaker defaults only apply to contexts created by
    /// [`build_context`](Self::build_context).
    ///
    /// # Errors
    ///
    /// Returns a validation error; nothing is installed in that case.
    pub fn apply(&self, context: &RouteContext) -> Result<(), ConfigError> {
        self.validate()?;

        let policy = self.redelivery.policy();
        let handler = match self.redelivery.dead_letter_queue_size {
            Some(size) => {
                let queue = DeadLetterQueue::new(size);
                context.watch_dead_letters(queue.clone());
                ErrorHandler::dead_letter_channel(queue).with_redelivery(policy)
            },
            None => ErrorHandler::new().with_redelivery(policy),
        };
        context.set_error_handler(handler);

        let configurations = context.service_call_configurations();
        if let Some(default) = &self.service_call.default {
            configurations.set_default(default.configuration());
        }
        for (id, section) in &self.service_call.named {
            configurations.add(id.clone(), section.configuration());
        }

        tracing::info!(
            max_redeliveries = self.redelivery.max_redeliveries,
            dead_letter_channel = self.redelivery.dead_letter_queue_size.is_some(),
            named_service_calls = self.service_call.named.len(),
            default_component = self
                .service_call
                .default
                .as_ref()
                .and_then(|d| d.component.as_deref())
                .unwrap_or(DEFAULT_COMPONENT),
            "Configuration applied"
        );
        Ok(())
    }

    /// Create a context configured by this document.
    ///
    /// # Errors
    ///
    /// Returns a validation error.
    pub fn build_context(&self, endpoints: Arc<dyn EndpointResolver>) -> Result<RouteContext, ConfigError> {
        self.validate()?;
        let context = RouteContext::new(endpoints)
            .with_circuit_breakers(CircuitBreakerRegistry::new(self.circuit_breaker.config()));
        self.apply(&context)?;
        Ok(context)
    }
}
