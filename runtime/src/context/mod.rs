//! Route context: the container that owns routes and their collaborators.
//!
//! A [`RouteContext`] compiles [`RouteDefinition`]s into processor trees,
//! assigns route ids, drives the route lifecycle and dispatches exchanges. It
//! also holds the bean registry, the service-call configurations, the circuit
//! breaker registry, route templates and the shared browse endpoints.
//!
//! # Example
//!
//! ```
//! use conduit_core::prelude::*;
//! use conduit_runtime::context::{RouteContext, RouteDefinition};
//! use conduit_testing::MockEndpoints;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), ConfigError> {
//! let endpoints = MockEndpoints::new();
//! let context = RouteContext::new(Arc::new(endpoints.clone()));
//!
//! let id = context.add_route(
//!     RouteDefinition::new("direct:start")
//!         .set_body("Hello ${body}")
//!         .to("mock:result"),
//! )?;
//! context.start()?;
//!
//! let exchange = context.send(&id, Exchange::with_body(json!("World"))).await?;
//! assert_eq!(exchange.body(), &json!("Hello World"));
//! assert_eq!(endpoints.endpoint("mock:result").received_count(), 1);
//! # Ok(())
//! # }
//! ```

mod endpoint_cache;
mod route;
mod template;
pub mod verifier;

pub use endpoint_cache::EndpointCache;
pub use route::{
    ChoiceDefinition, CircuitBreakerDefinition, MulticastDefinition, Route, RouteDefinition, RouteStatus,
    StepDefinition, TEMPLATE_PROPERTY,
};
pub use template::{RouteTemplate, TemplateParameter};

use crate::browse::BrowseEndpoint;
use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::cloud::ServiceCallConfigurations;
use crate::dataset::DataSetIndexValidator;
use crate::dead_letter::DeadLetterQueue;
use crate::error_handler::ErrorHandler;
use crate::health::{HealthCheck, HealthReport};
use crate::processors::{Choice, Enricher, LogProcessor, Multicast, Pipeline, SendProcessor, SetBody, SetHeader};
use crate::resilience::CircuitBreakerProcessor;
use crate::scheduler::Scheduler;
use arc_swap::{ArcSwap, ArcSwapOption};
use conduit_core::environment::{EndpointResolver, MapPropertyResolver, PropertyResolver};
use conduit_core::expression::Expression;
use conduit_core::{ConfigError, Exchange, SharedProcessor};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use template::TemplateProperties;

/// Owns routes and everything they are compiled against.
pub struct RouteContext {
    beans: DashMap<String, SharedProcessor>,
    service_calls: ServiceCallConfigurations,
    properties: Arc<dyn PropertyResolver>,
    endpoints: Arc<dyn EndpointResolver>,
    breakers: CircuitBreakerRegistry,
    error_handler: ArcSwap<ErrorHandler>,
    dead_letters: ArcSwapOption<DeadLetterQueue>,
    routes: DashMap<String, Arc<Route>>,
    templates: DashMap<String, RouteTemplate>,
    browse_endpoints: EndpointCache<BrowseEndpoint>,
    route_counter: AtomicUsize,
    started: AtomicBool,
}

impl RouteContext {
    /// A context sending to endpoints resolved by `endpoints`.
    #[must_use]
    pub fn new(endpoints: Arc<dyn EndpointResolver>) -> Self {
        Self {
            beans: DashMap::new(),
            service_calls: ServiceCallConfigurations::new(),
            properties: Arc::new(MapPropertyResolver::new()),
            endpoints,
            breakers: CircuitBreakerRegistry::default(),
            error_handler: ArcSwap::from_pointee(ErrorHandler::new()),
            dead_letters: ArcSwapOption::empty(),
            routes: DashMap::new(),
            templates: DashMap::new(),
            browse_endpoints: EndpointCache::new(),
            route_counter: AtomicUsize::new(0),
            started: AtomicBool::new(false),
        }
    }

    /// Resolve `{{placeholders}}` through `properties`.
    #[must_use]
    pub fn with_properties(mut self, properties: Arc<dyn PropertyResolver>) -> Self {
        self.properties = properties;
        self
    }

    /// Use `registry` for circuit breaker blocks.
    #[must_use]
    pub fn with_circuit_breakers(mut self, registry: CircuitBreakerRegistry) -> Self {
        self.breakers = registry;
        self
    }

    /// Use `handler` for routes without their own error handler.
    #[must_use]
    pub fn with_error_handler(self, handler: ErrorHandler) -> Self {
        self.set_error_handler(handler);
        self
    }

    /// Replace the default error handler. Routes added later pick it up.
    pub fn set_error_handler(&self, handler: ErrorHandler) {
        self.error_handler.store(Arc::new(handler));
    }

    /// Report `queue` in [`health`](Self::health).
    pub fn watch_dead_letters(&self, queue: DeadLetterQueue) {
        self.dead_letters.store(Some(Arc::new(queue)));
    }

    /// The default error handler.
    #[must_use]
    pub fn error_handler(&self) -> ErrorHandler {
        ErrorHandler::clone(&self.error_handler.load())
    }

    /// Property resolver used at compile time.
    #[must_use]
    pub fn properties(&self) -> &Arc<dyn PropertyResolver> {
        &self.properties
    }

    /// Endpoint resolver used by sends and service calls.
    #[must_use]
    pub fn endpoints(&self) -> &Arc<dyn EndpointResolver> {
        &self.endpoints
    }

    /// Service-call configurations.
    #[must_use]
    pub const fn service_call_configurations(&self) -> &ServiceCallConfigurations {
        &self.service_calls
    }

    /// Circuit breaker registry.
    #[must_use]
    pub const fn circuit_breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    /// Register `processor` in the bean registry.
    pub fn bind(&self, name: impl Into<String>, processor: SharedProcessor) {
        self.beans.insert(name.into(), processor);
    }

    /// Look up a registry processor.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NoSuchBean`] if nothing is bound under `name`.
    pub fn lookup_processor(&self, name: &str) -> Result<SharedProcessor, ConfigError> {
        self.beans
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| ConfigError::NoSuchBean {
                name: name.to_string(),
                kind: "Processor".to_string(),
            })
    }

    /// Compile and register a route, returning its id.
    ///
    /// Routes added to a started context start immediately.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::DuplicateRoute`] if the id is taken
    /// - any error raised while compiling or starting the steps
    pub fn add_route(&self, definition: RouteDefinition) -> Result<String, ConfigError> {
        let properties = Arc::clone(&self.properties);
        self.install(&definition, definition.id.clone(), properties.as_ref(), BTreeMap::new())
    }

    /// Register a route template.
    pub fn add_route_template(&self, template: RouteTemplate) {
        tracing::debug!(template_id = template.id(), "Route template added");
        self.templates.insert(template.id().to_string(), template);
    }

    /// Create a route from a template.
    ///
    /// Template parameters take precedence over context properties when
    /// placeholders are resolved. The new route carries the
    /// [`TEMPLATE_PROPERTY`] property.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::NoSuchTemplate`] if `template_id` is unknown
    /// - [`ConfigError::MissingTemplateParameters`] naming every missing mandatory parameter
    /// - any error [`add_route`](Self::add_route) can return
    pub fn add_route_from_template(
        &self,
        route_id: Option<&str>,
        template_id: &str,
        parameters: &HashMap<String, String>,
    ) -> Result<String, ConfigError> {
        let template = self
            .templates
            .get(template_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ConfigError::NoSuchTemplate(template_id.to_string()))?;
        let bound = template.bind(parameters)?;
        let properties = TemplateProperties {
            parameters: bound,
            fallback: self.properties.as_ref(),
        };

        let route_id = route_id.map(str::to_string).or_else(|| template.route().id.clone());
        let extra = BTreeMap::from([
            (TEMPLATE_PROPERTY.to_string(), "true".to_string()),
            ("templateId".to_string(), template_id.to_string()),
        ]);
        self.install(template.route(), route_id, &properties, extra)
    }

    fn install(
        &self,
        definition: &RouteDefinition,
        route_id: Option<String>,
        properties: &dyn PropertyResolver,
        extra: BTreeMap<String, String>,
    ) -> Result<String, ConfigError> {
        let id = match route_id {
            Some(id) => {
                let id = properties.resolve(&id)?;
                if self.routes.contains_key(&id) {
                    return Err(ConfigError::DuplicateRoute(id));
                }
                id
            },
            None => self.next_route_id(),
        };

        let from = properties.resolve(&definition.from)?;
        let handler = definition
            .error_handler
            .clone()
            .unwrap_or_else(|| self.error_handler());
        let processor = self.compile_route(&id, &definition.steps, properties, &handler)?;

        let mut route_properties = definition.properties.clone();
        route_properties.extend(extra);
        let route = Arc::new(Route::new(id.clone(), from, processor, route_properties));

        match self.routes.entry(id.clone()) {
            Entry::Occupied(_) => return Err(ConfigError::DuplicateRoute(id)),
            Entry::Vacant(entry) => {
                entry.insert(Arc::clone(&route));
            },
        }
        tracing::debug!(route_id = %id, from = route.from_uri(), "Route added");

        if self.started.load(Ordering::Acquire) {
            if let Err(error) = route.start() {
                self.routes.remove(&id);
                return Err(error);
            }
        }
        Ok(id)
    }

    fn next_route_id(&self) -> String {
        loop {
            let n = self.route_counter.fetch_add(1, Ordering::Relaxed) + 1;
            let id = format!("route{n}");
            if !self.routes.contains_key(&id) {
                return id;
            }
        }
    }

    fn compile_route(
        &self,
        id: &str,
        steps: &[StepDefinition],
        properties: &dyn PropertyResolver,
        handler: &ErrorHandler,
    ) -> Result<SharedProcessor, ConfigError> {
        let steps = steps
            .iter()
            .map(|step| Ok(handler.wrap(self.compile_step(step, properties)?)))
            .collect::<Result<Vec<_>, ConfigError>>()?;
        Ok(Arc::new(Pipeline::new(format!("route({id})"), steps)))
    }

    fn compile_steps(
        &self,
        name: &str,
        steps: &[StepDefinition],
        properties: &dyn PropertyResolver,
    ) -> Result<SharedProcessor, ConfigError> {
        let steps = steps
            .iter()
            .map(|step| self.compile_step(step, properties))
            .collect::<Result<Vec<_>, ConfigError>>()?;
        Ok(Arc::new(Pipeline::new(name, steps)))
    }

    fn compile_step(&self, step: &StepDefinition, properties: &dyn PropertyResolver) -> Result<SharedProcessor, ConfigError> {
        let processor: SharedProcessor = match step {
            StepDefinition::Process(processor) => Arc::clone(processor),
            StepDefinition::Bean(name) => self.lookup_processor(&properties.resolve(name)?)?,
            StepDefinition::To(uri) => Arc::new(SendProcessor::new(
                &properties.resolve(uri)?,
                Arc::clone(&self.endpoints),
            )?),
            StepDefinition::SetBody(template) => {
                Arc::new(SetBody::new(Expression::simple(&properties.resolve(template)?)?))
            },
            StepDefinition::SetHeader { name, value } => Arc::new(SetHeader::new(
                properties.resolve(name)?,
                Expression::simple(&properties.resolve(value)?)?,
            )),
            StepDefinition::Log(template) => {
                Arc::new(LogProcessor::new(Expression::simple(&properties.resolve(template)?)?))
            },
            StepDefinition::Choice(definition) => {
                let mut choice = Choice::new();
                for (predicate, steps) in &definition.whens {
                    choice = choice.when(predicate.clone(), self.compile_steps("when", steps, properties)?);
                }
                if let Some(steps) = &definition.otherwise {
                    choice = choice.otherwise(self.compile_steps("otherwise", steps, properties)?);
                }
                Arc::new(choice)
            },
            StepDefinition::Multicast(definition) => {
                let branches = definition
                    .branches
                    .iter()
                    .map(|steps| self.compile_steps("branch", steps, properties))
                    .collect::<Result<Vec<_>, ConfigError>>()?;
                let mut multicast = Multicast::new(branches)
                    .parallel(definition.parallel)
                    .stop_on_exception(definition.stop_on_exception);
                if let Some(strategy) = &definition.strategy {
                    multicast = multicast.with_strategy(Arc::clone(strategy));
                }
                Arc::new(multicast)
            },
            StepDefinition::Enrich { uri, strategy } => {
                let resource = SendProcessor::new(&properties.resolve(uri)?, Arc::clone(&self.endpoints))?;
                let mut enricher = Enricher::new(Arc::new(resource));
                if let Some(strategy) = strategy {
                    enricher = enricher.with_strategy(Arc::clone(strategy));
                }
                Arc::new(enricher)
            },
            StepDefinition::ServiceCall(definition) => {
                Arc::new(definition.build(&self.service_calls, properties, Arc::clone(&self.endpoints))?)
            },
            StepDefinition::CircuitBreaker(definition) => {
                let id = properties.resolve(&definition.id)?;
                let guarded = self.compile_steps("circuitBreaker", &definition.steps, properties)?;
                let mut processor = CircuitBreakerProcessor::new(id.clone(), guarded, self.breakers.get_or_create(&id))
                    .with_fallback_enabled(definition.fallback_enabled);
                if let Some(steps) = &definition.fallback {
                    processor = processor.with_fallback(self.compile_steps("onFallback", steps, properties)?);
                }
                if let Some(timeout) = definition.timeout {
                    processor = processor.with_timeout(timeout);
                }
                Arc::new(processor)
            },
            StepDefinition::Browse { name, limit } => {
                let name = properties.resolve(name)?;
                let params = BTreeMap::from([("limit".to_string(), limit.to_string())]);
                self.browse_endpoints
                    .get_or_create(&format!("browse:{name}"), &params, || BrowseEndpoint::new(name.clone(), *limit))?
            },
            StepDefinition::ValidateIndex(mode) => Arc::new(DataSetIndexValidator::new(*mode)),
        };
        Ok(processor)
    }

    /// A registered route.
    #[must_use]
    pub fn route(&self, id: &str) -> Option<Arc<Route>> {
        self.routes.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Ids of all routes, sorted.
    #[must_use]
    pub fn route_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.routes.iter().map(|entry| entry.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Status of a route.
    #[must_use]
    pub fn route_status(&self, id: &str) -> Option<RouteStatus> {
        self.route(id).map(|route| route.status())
    }

    /// A browse endpoint created by a route.
    #[must_use]
    pub fn browse_endpoint(&self, name: &str) -> Option<Arc<BrowseEndpoint>> {
        self.browse_endpoints.get(&format!("browse:{name}"))
    }

    /// Start the context and every route.
    ///
    /// # Errors
    ///
    /// Returns the first error raised by a route's processors.
    pub fn start(&self) -> Result<(), ConfigError> {
        self.started.store(true, Ordering::Release);
        for route in self.all_routes() {
            route.start()?;
        }
        tracing::info!(routes = self.routes.len(), "Route context started");
        Ok(())
    }

    /// Stop every route and the context.
    pub fn stop(&self) {
        self.started.store(false, Ordering::Release);
        for route in self.all_routes() {
            route.stop();
        }
        tracing::info!("Route context stopped");
    }

    /// Whether [`start`](Self::start) was called and [`stop`](Self::stop) was not.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Start one route.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NoSuchRoute`] for an unknown id, or the route's
    /// start error.
    pub fn start_route(&self, id: &str) -> Result<(), ConfigError> {
        self.route(id)
            .ok_or_else(|| ConfigError::NoSuchRoute(id.to_string()))?
            .start()
    }

    /// Stop one route.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NoSuchRoute`] for an unknown id.
    pub fn stop_route(&self, id: &str) -> Result<(), ConfigError> {
        self.route(id)
            .ok_or_else(|| ConfigError::NoSuchRoute(id.to_string()))?
            .stop();
        Ok(())
    }

    /// Remove a stopped or running route, stopping it first.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NoSuchRoute`] for an unknown id.
    pub fn remove_route(&self, id: &str) -> Result<(), ConfigError> {
        let (_, route) = self
            .routes
            .remove(id)
            .ok_or_else(|| ConfigError::NoSuchRoute(id.to_string()))?;
        route.stop();
        Ok(())
    }

    fn all_routes(&self) -> Vec<Arc<Route>> {
        let mut routes: Vec<Arc<Route>> = self.routes.iter().map(|entry| Arc::clone(entry.value())).collect();
        routes.sort_by(|a, b| a.id().cmp(b.id()));
        routes
    }

    fn started_route(&self, id: &str) -> Result<Arc<Route>, ConfigError> {
        let route = self.route(id).ok_or_else(|| ConfigError::NoSuchRoute(id.to_string()))?;
        if route.status() != RouteStatus::Started {
            return Err(ConfigError::RouteNotStarted(id.to_string()));
        }
        Ok(route)
    }

    /// Drive `exchange` through a route and return it.
    ///
    /// Processing failures stay on the returned exchange.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NoSuchRoute`] or [`ConfigError::RouteNotStarted`].
    #[tracing::instrument(skip(self, exchange), fields(exchange_id = %exchange.id()))]
    pub async fn send(&self, route_id: &str, mut exchange: Exchange) -> Result<Exchange, ConfigError> {
        let route = self.started_route(route_id)?;
        route.prepare(&mut exchange);
        Ok(Scheduler::run(exchange, Arc::clone(route.processor())).await)
    }

    /// Drive `exchange` through a route with a completion continuation.
    ///
    /// See [`Scheduler::execute`] for the continuation contract. Returns
    /// whether the route completed synchronously.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NoSuchRoute`] or [`ConfigError::RouteNotStarted`];
    /// the continuation is not called in that case.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime, since deferred work is
    /// spawned on the current one.
    pub fn execute<C>(&self, route_id: &str, mut exchange: Exchange, continuation: C) -> Result<bool, ConfigError>
    where
        C: FnOnce(Exchange, bool) + Send + 'static,
    {
        let route = self.started_route(route_id)?;
        route.prepare(&mut exchange);
        Ok(Scheduler::current().execute(exchange, Arc::clone(route.processor()), continuation))
    }

    /// Current health.
    ///
    /// Stopped routes in a started context, open circuit breakers and queued
    /// dead letters each degrade the report.
    #[must_use]
    pub fn health(&self) -> HealthReport {
        let started = self.is_started();
        let mut checks: Vec<HealthCheck> = self
            .all_routes()
            .iter()
            .map(|route| {
                let component = format!("route:{}", route.id());
                if started && route.status() == RouteStatus::Stopped {
                    HealthCheck::degraded(component, "route is stopped")
                } else {
                    HealthCheck::healthy(component)
                }
            })
            .collect();

        let open = self.breakers.open_breakers();
        checks.push(if open.is_empty() {
            HealthCheck::healthy("circuit_breakers")
        } else {
            HealthCheck::degraded("circuit_breakers", format!("open: {}", open.join(", ")))
                .with_metadata("open_count", open.len().to_string())
        });

        if let Some(queue) = self.dead_letters.load_full() {
            let size = queue.len();
            checks.push(if size == 0 {
                HealthCheck::healthy("dead_letter_queue")
            } else {
                HealthCheck::degraded("dead_letter_queue", format!("{size} dead letters"))
                    .with_metadata("size", size.to_string())
            });
        }

        HealthReport::new(checks)
    }
}
