//! Circuit breaker steps with fallbacks, driven through whole routes.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use conduit_core::prelude::*;
use conduit_runtime::RoutingError;
use conduit_runtime::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState};
use conduit_runtime::context::{CircuitBreakerDefinition, RouteContext, RouteDefinition, StepDefinition};
use conduit_runtime::error_handler::{ErrorHandler, OnException};
use conduit_testing::{DelayProcessor, FailingProcessor, MockEndpoints, TestError, assertions, test_context};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn context_with_threshold(endpoints: &MockEndpoints, threshold: usize) -> RouteContext {
    test_context(endpoints).with_circuit_breakers(CircuitBreakerRegistry::new(
        CircuitBreakerConfig::builder()
            .failure_threshold(threshold)
            .timeout(Duration::from_secs(60))
            .build(),
    ))
}

#[tokio::test]
async fn test_fallback_replaces_failed_endpoint_call() {
    let endpoints = MockEndpoints::new();
    endpoints.endpoint("mock:down").fail_with("connection refused");
    let result = endpoints.endpoint("mock:result");
    result.expect_bodies_received(vec![json!("Fallback response")]);
    let context = test_context(&endpoints);

    let id = context
        .add_route(
            RouteDefinition::new("direct:start")
                .circuit_breaker(
                    CircuitBreakerDefinition::new("downstream", vec![StepDefinition::to("mock:down")])
                        .fallback(vec![StepDefinition::set_body("Fallback response")]),
                )
                .to("mock:result"),
        )
        .unwrap();
    context.start().unwrap();

    let exchange = context.send(&id, Exchange::with_body(json!("request"))).await.unwrap();

    assertions::assert_not_failed(&exchange);
    result.assert_is_satisfied();
    assert_eq!(exchange.property(property::FAILURE_ENDPOINT), Some(&json!("mock:down")));
    assert_eq!(exchange.property(property::EXCEPTION_HANDLED), Some(&json!(true)));
    assert_eq!(exchange.exception_caught().map(ToString::to_string), Some("connection refused".to_string()));
    assert!(!exchange.has_property(property::TRY_ROUTE_BLOCK));
}

#[tokio::test]
async fn test_successful_guarded_steps_skip_fallback() {
    let endpoints = MockEndpoints::new();
    let fallback = endpoints.endpoint("mock:fallback");
    let context = test_context(&endpoints);

    let id = context
        .add_route(RouteDefinition::new("direct:start").circuit_breaker(
            CircuitBreakerDefinition::new("downstream", vec![StepDefinition::set_body("ok")])
                .fallback(vec![StepDefinition::to("mock:fallback")]),
        ))
        .unwrap();
    context.start().unwrap();

    let exchange = context.send(&id, Exchange::new()).await.unwrap();

    assert_eq!(exchange.body(), &json!("ok"));
    assert_eq!(fallback.received_count(), 0);
    assert!(exchange.exception_caught().is_none());
    assert!(!exchange.has_property(property::FAILURE_ENDPOINT));
}

#[tokio::test]
async fn test_open_breaker_short_circuits_to_fallback() {
    let endpoints = MockEndpoints::new();
    let failing = Arc::new(FailingProcessor::new("boom"));
    let context = context_with_threshold(&endpoints, 2);

    let id = context
        .add_route(RouteDefinition::new("direct:start").circuit_breaker(
            CircuitBreakerDefinition::new("fragile", vec![StepDefinition::Process(failing.clone())])
                .fallback(vec![StepDefinition::set_body("fallback")]),
        ))
        .unwrap();
    context.start().unwrap();

    for _ in 0..3 {
        let exchange = context.send(&id, Exchange::new()).await.unwrap();
        assert_eq!(exchange.body(), &json!("fallback"));
    }

    assert_eq!(failing.calls(), 2);
    assert_eq!(context.circuit_breakers().get("fragile").unwrap().state(), CircuitState::Open);
    assert!(context.health().is_degraded());
}

#[tokio::test]
async fn test_rejected_call_records_circuit_open() {
    let endpoints = MockEndpoints::new();
    let context = context_with_threshold(&endpoints, 1);

    let id = context
        .add_route(RouteDefinition::new("direct:start").circuit_breaker(
            CircuitBreakerDefinition::new("fragile", vec![StepDefinition::Process(Arc::new(FailingProcessor::new("boom")))])
                .fallback(vec![StepDefinition::set_body("fallback")]),
        ))
        .unwrap();
    context.start().unwrap();

    let first = context.send(&id, Exchange::new()).await.unwrap();
    let second = context.send(&id, Exchange::new()).await.unwrap();

    assert!(first.exception_caught().unwrap().is::<TestError>());
    assert_eq!(
        second.exception_caught().unwrap().downcast_ref::<RoutingError>(),
        Some(&RoutingError::CircuitOpen {
            name: "fragile".to_string()
        })
    );
}

#[tokio::test]
async fn test_timeout_falls_back() {
    let endpoints = MockEndpoints::new();
    let context = test_context(&endpoints);

    let id = context
        .add_route(
            RouteDefinition::new("direct:start").circuit_breaker(
                CircuitBreakerDefinition::new(
                    "slow",
                    vec![StepDefinition::Process(Arc::new(DelayProcessor::new("late", Duration::from_millis(500))))],
                )
                .timeout(Duration::from_millis(20))
                .fallback(vec![StepDefinition::set_body("fallback")]),
            ),
        )
        .unwrap();
    context.start().unwrap();

    let exchange = context.send(&id, Exchange::new()).await.unwrap();

    assert_eq!(exchange.body(), &json!("fallback"));
    assert!(matches!(
        exchange.exception_caught().unwrap().downcast_ref::<RoutingError>(),
        Some(RoutingError::CommandTimeout { .. })
    ));
}

#[tokio::test]
async fn test_failure_without_fallback_reaches_error_handler() {
    let endpoints = MockEndpoints::new();
    let errors = endpoints.endpoint("mock:errors");
    let context = test_context(&endpoints).with_error_handler(
        ErrorHandler::new().on_exception(
            OnException::of::<TestError>()
                .handled(true)
                .to(Arc::new(errors.clone())),
        ),
    );

    let id = context
        .add_route(RouteDefinition::new("direct:start").circuit_breaker(CircuitBreakerDefinition::new(
            "unguarded",
            vec![StepDefinition::Process(Arc::new(FailingProcessor::new("boom")))],
        )))
        .unwrap();
    context.start().unwrap();

    let exchange = context.send(&id, Exchange::new()).await.unwrap();

    assertions::assert_handled(&exchange);
    assert_eq!(errors.received_count(), 1);
}

#[tokio::test]
async fn test_disabled_fallback_keeps_failure_and_breaker_closed() {
    let endpoints = MockEndpoints::new();
    let fallback = endpoints.endpoint("mock:fallback");
    let context = context_with_threshold(&endpoints, 1);

    let id = context
        .add_route(
            RouteDefinition::new("direct:start").circuit_breaker(
                CircuitBreakerDefinition::new(
                    "lenient",
                    vec![StepDefinition::Process(Arc::new(FailingProcessor::new("boom")))],
                )
                .fallback_enabled(Some(false))
                .fallback(vec![StepDefinition::to("mock:fallback")]),
            ),
        )
        .unwrap();
    context.start().unwrap();

    let exchange = context.send(&id, Exchange::new()).await.unwrap();

    assertions::assert_failed_with::<TestError>(&exchange);
    assert_eq!(fallback.received_count(), 0);
    assert_eq!(context.circuit_breakers().get("lenient").unwrap().state(), CircuitState::Closed);
}
