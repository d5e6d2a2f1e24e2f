use crate::cloud::ServiceCallDefinition;
use crate::dataset::IndexValidation;
use crate::error_handler::ErrorHandler;
use conduit_core::aggregation::AggregationStrategy;
use conduit_core::expression::Predicate;
use conduit_core::{Exchange, SharedProcessor};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Route property set on routes created from a template.
pub const TEMPLATE_PROPERTY: &str = "template";

/// One step of a route, before compilation.
///
/// Strings are resolved through `{{placeholder}}` substitution when the
/// route is compiled; `${...}` tokens are evaluated per exchange.
#[derive(Clone)]
pub enum StepDefinition {
    /// A ready-made processor.
    Process(SharedProcessor),
    /// A processor looked up in the bean registry by name.
    Bean(String),
    /// Send to an endpoint uri.
    To(String),
    /// Set the body from a simple template.
    SetBody(String),
    /// Set a header from a simple template.
    SetHeader {
        /// Header name.
        name: String,
        /// Value template.
        value: String,
    },
    /// Log a simple template.
    Log(String),
    /// Content-based routing.
    Choice(ChoiceDefinition),
    /// Send a copy to several branches.
    Multicast(MulticastDefinition),
    /// Merge the result of another endpoint into the exchange.
    Enrich {
        /// Resource endpoint uri.
        uri: String,
        /// Merge policy, the resource message by default.
        strategy: Option<Arc<dyn AggregationStrategy>>,
    },
    /// Call a logical service.
    ServiceCall(ServiceCallDefinition),
    /// Run steps under a circuit breaker.
    CircuitBreaker(CircuitBreakerDefinition),
    /// Record exchanges in a browse endpoint shared by name.
    Browse {
        /// Endpoint name.
        name: String,
        /// Buffer limit, `0` for unlimited.
        limit: usize,
    },
    /// Validate the data-set index header.
    ValidateIndex(IndexValidation),
}

impl StepDefinition {
    /// A [`StepDefinition::To`] step.
    #[must_use]
    pub fn to(uri: impl Into<String>) -> Self {
        Self::To(uri.into())
    }

    /// A [`StepDefinition::Bean`] step.
    #[must_use]
    pub fn bean(name: impl Into<String>) -> Self {
        Self::Bean(name.into())
    }

    /// A [`StepDefinition::SetBody`] step.
    #[must_use]
    pub fn set_body(template: impl Into<String>) -> Self {
        Self::SetBody(template.into())
    }

    /// A [`StepDefinition::SetHeader`] step.
    #[must_use]
    pub fn set_header(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::SetHeader {
            name: name.into(),
            value: value.into(),
        }
    }

    /// A [`StepDefinition::Log`] step.
    #[must_use]
    pub fn log(template: impl Into<String>) -> Self {
        Self::Log(template.into())
    }
}

/// Branches of a content-based router.
#[derive(Clone, Default)]
pub struct ChoiceDefinition {
    pub(crate) whens: Vec<(Predicate, Vec<StepDefinition>)>,
    pub(crate) otherwise: Option<Vec<StepDefinition>>,
}

impl ChoiceDefinition {
    /// A router without branches.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `steps` when `predicate` matches.
    #[must_use]
    pub fn when(mut self, predicate: Predicate, steps: Vec<StepDefinition>) -> Self {
        self.whens.push((predicate, steps));
        self
    }

    /// Run `steps` when nothing matches.
    #[must_use]
    pub fn otherwise(mut self, steps: Vec<StepDefinition>) -> Self {
        self.otherwise = Some(steps);
        self
    }
}

/// Branches of a multicast.
#[derive(Clone, Default)]
pub struct MulticastDefinition {
    pub(crate) branches: Vec<Vec<StepDefinition>>,
    pub(crate) parallel: bool,
    pub(crate) stop_on_exception: bool,
    pub(crate) strategy: Option<Arc<dyn AggregationStrategy>>,
}

impl MulticastDefinition {
    /// A multicast without branches.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a branch.
    #[must_use]
    pub fn branch(mut self, steps: Vec<StepDefinition>) -> Self {
        self.branches.push(steps);
        self
    }

    /// Run branches concurrently.
    #[must_use]
    pub const fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Stop at the first failed branch.
    #[must_use]
    pub const fn stop_on_exception(mut self, stop: bool) -> Self {
        self.stop_on_exception = stop;
        self
    }

    /// Merge branch results with `strategy` instead of keeping the latest.
    #[must_use]
    pub fn strategy(mut self, strategy: Arc<dyn AggregationStrategy>) -> Self {
        self.strategy = Some(strategy);
        self
    }
}

/// Steps guarded by a circuit breaker.
#[derive(Clone)]
pub struct CircuitBreakerDefinition {
    pub(crate) id: String,
    pub(crate) steps: Vec<StepDefinition>,
    pub(crate) fallback: Option<Vec<StepDefinition>>,
    pub(crate) fallback_enabled: Option<bool>,
    pub(crate) timeout: Option<Duration>,
}

impl CircuitBreakerDefinition {
    /// Guard `steps` with the breaker registered as `id`.
    #[must_use]
    pub fn new(id: impl Into<String>, steps: Vec<StepDefinition>) -> Self {
        Self {
            id: id.into(),
            steps,
            fallback: None,
            fallback_enabled: None,
            timeout: None,
        }
    }

    /// Run `steps` when the guarded steps fail or the circuit is open.
    #[must_use]
    pub fn fallback(mut self, steps: Vec<StepDefinition>) -> Self {
        self.fallback = Some(steps);
        self
    }

    /// Set the fallback-enabled flag.
    #[must_use]
    pub const fn fallback_enabled(mut self, enabled: Option<bool>) -> Self {
        self.fallback_enabled = enabled;
        self
    }

    /// Fail runs taking longer than `timeout`.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A route as written: a source uri and its steps.
///
/// # Example
///
/// ```
/// use conduit_runtime::context::{RouteDefinition, StepDefinition};
///
/// let route = RouteDefinition::new("direct:start")
///     .route_id("orders")
///     .set_header("source", "orders")
///     .to("mock:result");
///
/// assert_eq!(route.id(), Some("orders"));
/// assert_eq!(route.steps().len(), 2);
/// # let _ = StepDefinition::to("mock:other");
/// ```
#[derive(Clone)]
pub struct RouteDefinition {
    pub(crate) id: Option<String>,
    pub(crate) from: String,
    pub(crate) steps: Vec<StepDefinition>,
    pub(crate) error_handler: Option<ErrorHandler>,
    pub(crate) properties: BTreeMap<String, String>,
}

impl RouteDefinition {
    /// A route consuming from `from`.
    #[must_use]
    pub fn new(from: impl Into<String>) -> Self {
        Self {
            id: None,
            from: from.into(),
            steps: Vec::new(),
            error_handler: None,
            properties: BTreeMap::new(),
        }
    }

    /// Set the route id. Without one, the context assigns `routeN`.
    #[must_use]
    pub fn route_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// The explicit route id.
    #[must_use]
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// The source uri.
    #[must_use]
    pub fn from_uri(&self) -> &str {
        &self.from
    }

    /// The steps.
    #[must_use]
    pub fn steps(&self) -> &[StepDefinition] {
        &self.steps
    }

    /// Use `handler` instead of the context's error handler.
    #[must_use]
    pub fn error_handler(mut self, handler: ErrorHandler) -> Self {
        self.error_handler = Some(handler);
        self
    }

    /// Attach a route property.
    #[must_use]
    pub fn property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Append a step.
    #[must_use]
    pub fn step(mut self, step: StepDefinition) -> Self {
        self.steps.push(step);
        self
    }

    /// Append a ready-made processor.
    #[must_use]
    pub fn process(self, processor: SharedProcessor) -> Self {
        self.step(StepDefinition::Process(processor))
    }

    /// Append a registry processor.
    #[must_use]
    pub fn bean(self, name: impl Into<String>) -> Self {
        self.step(StepDefinition::bean(name))
    }

    /// Append a send.
    #[must_use]
    pub fn to(self, uri: impl Into<String>) -> Self {
        self.step(StepDefinition::to(uri))
    }

    /// Append a body assignment.
    #[must_use]
    pub fn set_body(self, template: impl Into<String>) -> Self {
        self.step(StepDefinition::set_body(template))
    }

    /// Append a header assignment.
    #[must_use]
    pub fn set_header(self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.step(StepDefinition::set_header(name, value))
    }

    /// Append a log statement.
    #[must_use]
    pub fn log(self, template: impl Into<String>) -> Self {
        self.step(StepDefinition::log(template))
    }

    /// Append a content-based router.
    #[must_use]
    pub fn choice(self, choice: ChoiceDefinition) -> Self {
        self.step(StepDefinition::Choice(choice))
    }

    /// Append a multicast.
    #[must_use]
    pub fn multicast(self, multicast: MulticastDefinition) -> Self {
        self.step(StepDefinition::Multicast(multicast))
    }

    /// Append an enricher using the default merge.
    #[must_use]
    pub fn enrich(self, uri: impl Into<String>) -> Self {
        self.step(StepDefinition::Enrich {
            uri: uri.into(),
            strategy: None,
        })
    }

    /// Append a service call.
    #[must_use]
    pub fn service_call(self, definition: ServiceCallDefinition) -> Self {
        self.step(StepDefinition::ServiceCall(definition))
    }

    /// Append a circuit breaker block.
    #[must_use]
    pub fn circuit_breaker(self, definition: CircuitBreakerDefinition) -> Self {
        self.step(StepDefinition::CircuitBreaker(definition))
    }

    /// Append a browse endpoint.
    #[must_use]
    pub fn browse(self, name: impl Into<String>, limit: usize) -> Self {
        self.step(StepDefinition::Browse {
            name: name.into(),
            limit,
        })
    }

    /// Append data-set index validation.
    #[must_use]
    pub fn validate_index(self, mode: IndexValidation) -> Self {
        self.step(StepDefinition::ValidateIndex(mode))
    }
}

/// Route lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteStatus {
    /// Compiled, not yet started.
    Stopped,
    /// Accepting exchanges.
    Started,
}

impl RouteStatus {
    const fn from_u8(value: u8) -> Self {
        if value == 1 { Self::Started } else { Self::Stopped }
    }
}

/// A compiled route.
pub struct Route {
    id: String,
    from: String,
    processor: SharedProcessor,
    properties: BTreeMap<String, String>,
    status: AtomicU8,
}

impl Route {
    pub(crate) fn new(id: String, from: String, processor: SharedProcessor, properties: BTreeMap<String, String>) -> Self {
        Self {
            id,
            from,
            processor,
            properties,
            status: AtomicU8::new(RouteStatus::Stopped as u8),
        }
    }

    /// Route id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Source uri.
    #[must_use]
    pub fn from_uri(&self) -> &str {
        &self.from
    }

    /// Route properties.
    #[must_use]
    pub const fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> RouteStatus {
        RouteStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// The compiled processor.
    #[must_use]
    pub const fn processor(&self) -> &SharedProcessor {
        &self.processor
    }

    pub(crate) fn start(&self) -> Result<(), conduit_core::ConfigError> {
        if self.status() == RouteStatus::Started {
            return Ok(());
        }
        self.processor.start()?;
        self.status.store(RouteStatus::Started as u8, Ordering::Release);
        tracing::info!(route_id = %self.id, from = %self.from, "Route started");
        Ok(())
    }

    pub(crate) fn stop(&self) {
        if self.status() == RouteStatus::Stopped {
            return;
        }
        self.status.store(RouteStatus::Stopped as u8, Ordering::Release);
        self.processor.stop();
        tracing::info!(route_id = %self.id, "Route stopped");
    }

    pub(crate) fn prepare(&self, exchange: &mut Exchange) {
        exchange.set_property(conduit_core::exchange::property::ROUTE_ID, self.id.as_str());
    }
}
