use conduit_core::expression::Expression;
use conduit_core::processor::ProcessFuture;
use conduit_core::{Exchange, Processor};

/// Replaces the body with an evaluated expression.
#[derive(Debug, Clone)]
pub struct SetBody {
    expression: Expression,
}

impl SetBody {
    /// Set the body to `expression`.
    #[must_use]
    pub const fn new(expression: Expression) -> Self {
        Self { expression }
    }
}

impl Processor for SetBody {
    fn process<'a>(&'a self, exchange: &'a mut Exchange) -> ProcessFuture<'a> {
        let body = self.expression.evaluate(exchange);
        exchange.set_body(body);
        Box::pin(std::future::ready(Ok(())))
    }

    fn name(&self) -> &str {
        "setBody"
    }
}

/// Sets a header to an evaluated expression.
#[derive(Debug, Clone)]
pub struct SetHeader {
    name: String,
    expression: Expression,
}

impl SetHeader {
    /// Set header `name` to `expression`.
    #[must_use]
    pub fn new(name: impl Into<String>, expression: Expression) -> Self {
        Self {
            name: name.into(),
            expression,
        }
    }
}

impl Processor for SetHeader {
    fn process<'a>(&'a self, exchange: &'a mut Exchange) -> ProcessFuture<'a> {
        let value = self.expression.evaluate(exchange);
        exchange.message_mut().set_header(self.name.clone(), value);
        Box::pin(std::future::ready(Ok(())))
    }

    fn name(&self) -> &str {
        "setHeader"
    }
}

/// Logs a rendered message at info level.
#[derive(Debug, Clone)]
pub struct LogProcessor {
    message: Expression,
}

impl LogProcessor {
    /// Log `message`, typically a simple template.
    #[must_use]
    pub const fn new(message: Expression) -> Self {
        Self { message }
    }
}

impl Processor for LogProcessor {
    fn process<'a>(&'a self, exchange: &'a mut Exchange) -> ProcessFuture<'a> {
        let rendered = self.message.evaluate_string(exchange);
        tracing::info!(exchange_id = %exchange.id(), "{rendered}");
        Box::pin(std::future::ready(Ok(())))
    }

    fn name(&self) -> &str {
        "log"
    }
}
