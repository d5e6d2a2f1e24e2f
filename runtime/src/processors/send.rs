use crate::error::RoutingError;
use crate::scheduler::capture;
use conduit_core::environment::EndpointResolver;
use conduit_core::exchange::property;
use conduit_core::expression::SimpleTemplate;
use conduit_core::processor::ProcessFuture;
use conduit_core::{ConfigError, Exchange, Failure, Processor};
use std::sync::Arc;

/// Sends the exchange to an endpoint.
///
/// The uri may contain `${...}` tokens, in which case it is rendered per
/// exchange. The resolved uri is recorded in the to-endpoint property before
/// dispatch.
pub struct SendProcessor {
    uri: SimpleTemplate,
    label: String,
    endpoints: Arc<dyn EndpointResolver>,
}

impl SendProcessor {
    /// Send to `uri` resolved through `endpoints`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidExpression`] if the uri template is malformed.
    pub fn new(uri: &str, endpoints: Arc<dyn EndpointResolver>) -> Result<Self, ConfigError> {
        Ok(Self {
            uri: SimpleTemplate::parse(uri)?,
            label: format!("to({uri})"),
            endpoints,
        })
    }

    /// The uri template.
    #[must_use]
    pub const fn uri(&self) -> &SimpleTemplate {
        &self.uri
    }
}

impl Processor for SendProcessor {
    fn process<'a>(&'a self, exchange: &'a mut Exchange) -> ProcessFuture<'a> {
        Box::pin(async move {
            let uri = self.uri.render(exchange);
            let endpoint = self
                .endpoints
                .resolve_endpoint(&uri)
                .ok_or_else(|| Failure::from(RoutingError::NoSuchEndpoint(uri.clone())))?;

            exchange.set_property(property::TO_ENDPOINT, uri.as_str());
            tracing::debug!(exchange_id = %exchange.id(), uri = %uri, "Sending to endpoint");
            capture(endpoint.as_ref(), exchange).await;
            Ok(())
        })
    }

    fn name(&self) -> &str {
        &self.label
    }
}
