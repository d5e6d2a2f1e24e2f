//! Configuration-time errors.
//!
//! [`ConfigError`] is raised while building or starting routes, never while an
//! exchange is being processed. Processing problems are captured on the
//! exchange as a [`Failure`](crate::Failure) instead.

use thiserror::Error;

/// Errors raised while assembling routes, resolving configuration or starting services.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A route template was instantiated without its mandatory parameters.
    #[error("Route template {template} the following mandatory parameters must be provided: {parameters}")]
    MissingTemplateParameters {
        /// Template id.
        template: String,
        /// Comma separated list of missing parameter names.
        parameters: String,
    },

    /// No route template is registered under the given id.
    #[error("Cannot find route template with id {0}")]
    NoSuchTemplate(String),

    /// A registry lookup found nothing under the name.
    #[error("No bean could be found in the registry for: {name} of type: {kind}")]
    NoSuchBean {
        /// Registry name.
        name: String,
        /// Expected kind of the registered value.
        kind: String,
    },

    /// Two endpoint URIs share a bean id but disagree on parameters.
    #[error(
        "Different URI refer to the same Bean instance with ID : {id} but with different parameters. Please use the proper Bean scope"
    )]
    BeanScopeConflict {
        /// The shared bean id.
        id: String,
    },

    /// A route id is already taken.
    #[error("Route with id {0} already exists")]
    DuplicateRoute(String),

    /// No route with the given id.
    #[error("No route with id {0}")]
    NoSuchRoute(String),

    /// The route exists but is not started.
    #[error("Route {0} is not started")]
    RouteNotStarted(String),

    /// A service call could not find any discovery strategy.
    #[error("No service discovery configured for service {service}")]
    MissingServiceDiscovery {
        /// The service being called.
        service: String,
    },

    /// A service call has no service name.
    #[error("Service call has no service name")]
    MissingServiceName,

    /// A server string is not of the form `[name@]host:port`.
    #[error("Invalid server definition: {0}")]
    InvalidServer(String),

    /// A `{{key}}` placeholder has no value.
    #[error("Property with key [{0}] not found in properties")]
    UnresolvedPlaceholder(String),

    /// A `${...}` expression could not be parsed.
    #[error("Invalid expression {expression}: {reason}")]
    InvalidExpression {
        /// The offending expression.
        expression: String,
        /// What is wrong with it.
        reason: String,
    },

    /// A configuration value failed validation.
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    /// A configuration document could not be parsed.
    #[error("Failed to parse configuration: {0}")]
    Parse(String),
}
