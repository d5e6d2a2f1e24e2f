//! Service call: discovery, filtering, load balancing and dispatch.
//!
//! Strategies implement the traits from [`conduit_core::cloud`]. A
//! [`ServiceLoadBalancer`] chains one of each, and a [`ServiceCallProcessor`]
//! turns the chosen instance into a target uri. Routes normally build the
//! processor from a [`ServiceCallDefinition`], which resolves its settings
//! against the context's [`ServiceCallConfigurations`].

mod chooser;
pub mod configuration;
mod discovery;
mod filter;
mod load_balancer;
mod service_call;

pub use chooser::{RandomServiceChooser, RoundRobinServiceChooser};
pub use configuration::{
    DEFAULT_SERVICE_CALL_CONFIG_ID, ServiceCallConfiguration, ServiceCallConfigurations, ServiceCallDefinition,
    ServiceChooserDefinition, ServiceDiscoveryDefinition, ServiceFilterDefinition,
};
pub use discovery::{CachingServiceDiscovery, CombinedServiceDiscovery, StaticServiceDiscovery};
pub use filter::{BlacklistServiceFilter, CombinedServiceFilter, HealthyServiceFilter, PassThroughServiceFilter};
pub use load_balancer::ServiceLoadBalancer;
pub use service_call::{DEFAULT_COMPONENT, ServiceCallProcessor};
