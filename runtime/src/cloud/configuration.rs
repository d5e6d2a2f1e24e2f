//! Service-call configuration and its three-tier resolution.
//!
//! A service call draws every setting from up to three places, the first one
//! that has it wins:
//!
//! 1. the call itself ([`ServiceCallDefinition`] overrides),
//! 2. the named configuration it references,
//! 3. the default configuration.
//!
//! Resolution is per field: a call overriding only the discovery still takes
//! its filter from the named or default configuration. All strings go through
//! `{{placeholder}}` substitution before use.

use crate::cloud::{
    BlacklistServiceFilter, DEFAULT_COMPONENT, HealthyServiceFilter, PassThroughServiceFilter,
    RandomServiceChooser, RoundRobinServiceChooser, ServiceCallProcessor, ServiceLoadBalancer,
    StaticServiceDiscovery,
};
use arc_swap::ArcSwapOption;
use conduit_core::ConfigError;
use conduit_core::cloud::{ServiceChooser, ServiceDiscovery, ServiceFilter};
use conduit_core::environment::{EndpointResolver, PropertyResolver};
use conduit_core::expression::SimpleTemplate;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Registry id under which a default configuration may be stored.
pub const DEFAULT_SERVICE_CALL_CONFIG_ID: &str = "service-call-configuration";

/// Declarative service discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServiceDiscoveryDefinition {
    /// A fixed list of servers. Each entry may itself be a comma separated list.
    Static {
        /// `name@host:port` entries, placeholders allowed.
        servers: Vec<String>,
    },
}

impl ServiceDiscoveryDefinition {
    /// Build the discovery, substituting placeholders.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] for unresolved placeholders or malformed servers.
    pub fn build(&self, properties: &dyn PropertyResolver) -> Result<Arc<dyn ServiceDiscovery>, ConfigError> {
        match self {
            Self::Static { servers } => {
                let discovery = StaticServiceDiscovery::new();
                for servers in servers {
                    discovery.add_servers(&properties.resolve(servers)?)?;
                }
                Ok(Arc::new(discovery))
            },
        }
    }
}

/// Declarative service filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServiceFilterDefinition {
    /// Drop the listed servers.
    Blacklist {
        /// `name@host:port` entries, `*` as name matches any.
        servers: Vec<String>,
    },
    /// Drop unhealthy instances.
    Healthy,
    /// Keep everything.
    PassThrough,
}

impl ServiceFilterDefinition {
    /// Build the filter, substituting placeholders.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] for unresolved placeholders or malformed servers.
    pub fn build(&self, properties: &dyn PropertyResolver) -> Result<Arc<dyn ServiceFilter>, ConfigError> {
        Ok(match self {
            Self::Blacklist { servers } => {
                let mut filter = BlacklistServiceFilter::new();
                for servers in servers {
                    filter = filter.with_servers(&properties.resolve(servers)?)?;
                }
                Arc::new(filter)
            },
            Self::Healthy => Arc::new(HealthyServiceFilter),
            Self::PassThrough => Arc::new(PassThroughServiceFilter),
        })
    }
}

/// Declarative chooser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceChooserDefinition {
    /// Rotate through candidates.
    RoundRobin,
    /// Pick at random.
    Random,
}

impl ServiceChooserDefinition {
    /// Build a fresh chooser.
    #[must_use]
    pub fn build(self) -> Arc<dyn ServiceChooser> {
        match self {
            Self::RoundRobin => Arc::new(RoundRobinServiceChooser::new()),
            Self::Random => Arc::new(RandomServiceChooser),
        }
    }
}

/// One tier of service-call settings. Unset fields defer to the next tier.
///
/// Instances take precedence over definitions within the same tier.
#[derive(Debug, Clone, Default)]
pub struct ServiceCallConfiguration {
    discovery: Option<Arc<dyn ServiceDiscovery>>,
    discovery_definition: Option<ServiceDiscoveryDefinition>,
    filter: Option<Arc<dyn ServiceFilter>>,
    filter_definition: Option<ServiceFilterDefinition>,
    chooser: Option<Arc<dyn ServiceChooser>>,
    chooser_definition: Option<ServiceChooserDefinition>,
    component: Option<String>,
    expression: Option<String>,
}

impl ServiceCallConfiguration {
    /// An empty tier.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Use this discovery instance.
    #[must_use]
    pub fn service_discovery(mut self, discovery: Arc<dyn ServiceDiscovery>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    /// Use a declarative discovery.
    #[must_use]
    pub fn service_discovery_definition(mut self, definition: ServiceDiscoveryDefinition) -> Self {
        self.discovery_definition = Some(definition);
        self
    }

    /// Add servers to a static discovery definition, creating it if needed.
    #[must_use]
    pub fn static_servers(mut self, servers: impl Into<String>) -> Self {
        match &mut self.discovery_definition {
            Some(ServiceDiscoveryDefinition::Static { servers: existing }) => existing.push(servers.into()),
            None => {
                self.discovery_definition = Some(ServiceDiscoveryDefinition::Static {
                    servers: vec![servers.into()],
                });
            },
        }
        self
    }

    /// Use this filter instance.
    #[must_use]
    pub fn service_filter(mut self, filter: Arc<dyn ServiceFilter>) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Use a declarative filter.
    #[must_use]
    pub fn service_filter_definition(mut self, definition: ServiceFilterDefinition) -> Self {
        self.filter_definition = Some(definition);
        self
    }

    /// Add servers to a blacklist filter definition, replacing any other
    /// filter definition.
    #[must_use]
    pub fn blacklist_servers(mut self, servers: impl Into<String>) -> Self {
        match &mut self.filter_definition {
            Some(ServiceFilterDefinition::Blacklist { servers: existing }) => existing.push(servers.into()),
            _ => {
                self.filter_definition = Some(ServiceFilterDefinition::Blacklist {
                    servers: vec![servers.into()],
                });
            },
        }
        self
    }

    /// Use this chooser instance.
    #[must_use]
    pub fn service_chooser(mut self, chooser: Arc<dyn ServiceChooser>) -> Self {
        self.chooser = Some(chooser);
        self
    }

    /// Use a declarative chooser.
    #[must_use]
    pub const fn service_chooser_definition(mut self, definition: ServiceChooserDefinition) -> Self {
        self.chooser_definition = Some(definition);
        self
    }

    /// Scheme for built target uris.
    #[must_use]
    pub fn component(mut self, component: impl Into<String>) -> Self {
        self.component = Some(component.into());
        self
    }

    /// Template building the whole target uri.
    #[must_use]
    pub fn expression(mut self, expression: impl Into<String>) -> Self {
        self.expression = Some(expression.into());
        self
    }

    fn resolve_discovery(
        &self,
        properties: &dyn PropertyResolver,
    ) -> Result<Option<Arc<dyn ServiceDiscovery>>, ConfigError> {
        match (&self.discovery, &self.discovery_definition) {
            (Some(discovery), _) => Ok(Some(Arc::clone(discovery))),
            (None, Some(definition)) => definition.build(properties).map(Some),
            (None, None) => Ok(None),
        }
    }

    fn resolve_filter(&self, properties: &dyn PropertyResolver) -> Result<Option<Arc<dyn ServiceFilter>>, ConfigError> {
        match (&self.filter, &self.filter_definition) {
            (Some(filter), _) => Ok(Some(Arc::clone(filter))),
            (None, Some(definition)) => definition.build(properties).map(Some),
            (None, None) => Ok(None),
        }
    }

    fn resolve_chooser(&self) -> Option<Arc<dyn ServiceChooser>> {
        self.chooser
            .clone()
            .or_else(|| self.chooser_definition.map(ServiceChooserDefinition::build))
    }
}

/// Default and named configurations. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct ServiceCallConfigurations {
    default: Arc<ArcSwapOption<ServiceCallConfiguration>>,
    named: Arc<DashMap<String, ServiceCallConfiguration>>,
}

impl ServiceCallConfigurations {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the default configuration.
    pub fn set_default(&self, configuration: ServiceCallConfiguration) {
        self.default.store(Some(Arc::new(configuration)));
    }

    /// Register a named configuration, replacing any with the same id.
    pub fn add(&self, id: impl Into<String>, configuration: ServiceCallConfiguration) {
        self.named.insert(id.into(), configuration);
    }

    /// A named configuration.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<ServiceCallConfiguration> {
        self.named.get(id).map(|entry| entry.value().clone())
    }

    /// The effective default.
    ///
    /// The explicitly set default, else the one registered under
    /// [`DEFAULT_SERVICE_CALL_CONFIG_ID`], else the only registered one.
    #[must_use]
    pub fn default_configuration(&self) -> Option<ServiceCallConfiguration> {
        if let Some(default) = self.default.load_full() {
            return Some(default.as_ref().clone());
        }
        if let Some(configuration) = self.get(DEFAULT_SERVICE_CALL_CONFIG_ID) {
            return Some(configuration);
        }
        if self.named.len() == 1 {
            return self.named.iter().next().map(|entry| entry.value().clone());
        }
        None
    }
}

/// One service call as written in a route.
///
/// # Example
///
/// ```
/// use conduit_core::environment::MapPropertyResolver;
/// use conduit_runtime::cloud::{ServiceCallConfigurations, ServiceCallDefinition};
/// use conduit_testing::MockEndpoints;
/// use std::sync::Arc;
///
/// let properties = MapPropertyResolver::new().with("scall.servers", "scall@127.0.0.1:8080");
/// let definition = ServiceCallDefinition::new("scall")
///     .component("mock")
///     .static_servers("{{scall.servers}}");
///
/// let processor = definition
///     .build(&ServiceCallConfigurations::new(), &properties, Arc::new(MockEndpoints::new()))
///     .unwrap();
/// assert_eq!(processor.scheme(), "mock");
/// ```
#[derive(Debug, Clone)]
pub struct ServiceCallDefinition {
    name: String,
    uri: Option<String>,
    configuration_ref: Option<String>,
    overrides: ServiceCallConfiguration,
}

impl ServiceCallDefinition {
    /// Call the service `name`. Placeholders and `${...}` tokens are allowed.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uri: None,
            configuration_ref: None,
            overrides: ServiceCallConfiguration::default(),
        }
    }

    /// Target uri template.
    #[must_use]
    pub fn uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = Some(uri.into());
        self
    }

    /// Take settings from the named configuration `id`.
    #[must_use]
    pub fn configuration(mut self, id: impl Into<String>) -> Self {
        self.configuration_ref = Some(id.into());
        self
    }

    /// Override the scheme.
    #[must_use]
    pub fn component(mut self, component: impl Into<String>) -> Self {
        self.overrides = self.overrides.component(component);
        self
    }

    /// Override the target uri expression.
    #[must_use]
    pub fn expression(mut self, expression: impl Into<String>) -> Self {
        self.overrides = self.overrides.expression(expression);
        self
    }

    /// Override the discovery.
    #[must_use]
    pub fn service_discovery(mut self, discovery: Arc<dyn ServiceDiscovery>) -> Self {
        self.overrides = self.overrides.service_discovery(discovery);
        self
    }

    /// Override the discovery with static servers.
    #[must_use]
    pub fn static_servers(mut self, servers: impl Into<String>) -> Self {
        self.overrides = self.overrides.static_servers(servers);
        self
    }

    /// Override the filter.
    #[must_use]
    pub fn service_filter(mut self, filter: Arc<dyn ServiceFilter>) -> Self {
        self.overrides = self.overrides.service_filter(filter);
        self
    }

    /// Override the filter with a blacklist.
    #[must_use]
    pub fn blacklist_servers(mut self, servers: impl Into<String>) -> Self {
        self.overrides = self.overrides.blacklist_servers(servers);
        self
    }

    /// Override the chooser.
    #[must_use]
    pub fn service_chooser(mut self, chooser: Arc<dyn ServiceChooser>) -> Self {
        self.overrides = self.overrides.service_chooser(chooser);
        self
    }

    /// Resolve every setting and build the processor.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::MissingServiceName`] if the name resolves to nothing
    /// - [`ConfigError::NoSuchBean`] if the referenced configuration is unknown
    /// - [`ConfigError::MissingServiceDiscovery`] if no tier provides a discovery
    /// - placeholder, server and template errors from the individual settings
    pub fn build(
        &self,
        configurations: &ServiceCallConfigurations,
        properties: &dyn PropertyResolver,
        endpoints: Arc<dyn EndpointResolver>,
    ) -> Result<ServiceCallProcessor, ConfigError> {
        let name = properties.resolve(&self.name)?;
        if name.trim().is_empty() {
            return Err(ConfigError::MissingServiceName);
        }

        let named = self
            .configuration_ref
            .as_deref()
            .map(|id| {
                configurations.get(id).ok_or_else(|| ConfigError::NoSuchBean {
                    name: id.to_string(),
                    kind: "ServiceCallConfiguration".to_string(),
                })
            })
            .transpose()?;
        let default = configurations.default_configuration();
        let tiers: Vec<&ServiceCallConfiguration> =
            [Some(&self.overrides), named.as_ref(), default.as_ref()].into_iter().flatten().collect();

        let mut discovery = None;
        for tier in &tiers {
            discovery = tier.resolve_discovery(properties)?;
            if discovery.is_some() {
                break;
            }
        }
        let discovery = discovery.ok_or_else(|| ConfigError::MissingServiceDiscovery { service: name.clone() })?;

        let mut filter = None;
        for tier in &tiers {
            filter = tier.resolve_filter(properties)?;
            if filter.is_some() {
                break;
            }
        }

        let mut load_balancer = ServiceLoadBalancer::new(discovery);
        if let Some(filter) = filter {
            load_balancer = load_balancer.with_filter(filter);
        }
        if let Some(chooser) = tiers.iter().find_map(|tier| tier.resolve_chooser()) {
            load_balancer = load_balancer.with_chooser(chooser);
        }

        let component = match tiers.iter().find_map(|tier| tier.component.as_deref()) {
            Some(component) => properties.resolve(component)?,
            None => DEFAULT_COMPONENT.to_string(),
        };

        let mut processor = ServiceCallProcessor::new(SimpleTemplate::parse(&name)?, component, load_balancer, endpoints);
        if let Some(uri) = &self.uri {
            processor = processor.with_uri(SimpleTemplate::parse(&properties.resolve(uri)?)?);
        }
        if let Some(expression) = tiers.iter().find_map(|tier| tier.expression.as_deref()) {
            processor = processor.with_expression(SimpleTemplate::parse(&properties.resolve(expression)?)?);
        }

        tracing::debug!(service = %name, scheme = processor.scheme(), "Built service call");
        Ok(processor)
    }
}
