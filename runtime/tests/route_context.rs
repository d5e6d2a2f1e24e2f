//! Whole routes in a `RouteContext`: error handling, templates, buffers and
//! asynchronous completion.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use conduit_core::prelude::*;
use conduit_runtime::RoutingError;
use conduit_runtime::config::ConduitConfig;
use conduit_runtime::context::{
    ChoiceDefinition, MulticastDefinition, RouteDefinition, RouteStatus, RouteTemplate, StepDefinition,
    TEMPLATE_PROPERTY,
};
use conduit_runtime::dataset::IndexValidation;
use conduit_runtime::dead_letter::DeadLetterQueue;
use conduit_runtime::error_handler::{ErrorHandler, OnException, RedeliveryPolicy};
use conduit_testing::{
    DelayProcessor, FailingProcessor, MockEndpoints, RouteTest, TestError, assertions, init_tracing, test_context,
};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

fn quick_retries(max: u32) -> RedeliveryPolicy {
    RedeliveryPolicy::new()
        .with_max_redeliveries(max)
        .with_initial_delay(Duration::from_millis(1))
}

#[tokio::test]
async fn test_exception_clause_handles_failure_inside_choice() {
    init_tracing();
    let endpoints = MockEndpoints::new();
    let errors = endpoints.endpoint("mock:errors");
    let other = endpoints.endpoint("mock:other");
    let context = test_context(&endpoints).with_error_handler(
        ErrorHandler::new().on_exception(OnException::of::<TestError>().handled(true).to(Arc::new(errors.clone()))),
    );

    let id = context
        .add_route(
            RouteDefinition::new("direct:start").choice(
                ChoiceDefinition::new()
                    .when(
                        Predicate::header_equals("kind", "bad"),
                        vec![StepDefinition::Process(Arc::new(FailingProcessor::new("rejected")))],
                    )
                    .otherwise(vec![StepDefinition::to("mock:other")]),
            ),
        )
        .unwrap();
    context.start().unwrap();

    let mut bad = Exchange::new();
    bad.message_mut().set_header("kind", "bad");
    let handled = context.send(&id, bad).await.unwrap();
    let passed = context.send(&id, Exchange::new()).await.unwrap();

    assertions::assert_handled(&handled);
    assertions::assert_not_failed(&passed);
    assert_eq!(errors.received_count(), 1);
    assert_eq!(other.received_count(), 1);
    assert!(handled.exception_caught().unwrap().is::<TestError>());
}

#[tokio::test]
async fn test_redelivery_recovers_transient_failure() {
    let endpoints = MockEndpoints::new();
    let flaky = Arc::new(FailingProcessor::new("transient").times(2));
    let context = test_context(&endpoints).with_error_handler(ErrorHandler::new().with_redelivery(quick_retries(3)));

    let id = context
        .add_route(RouteDefinition::new("direct:start").process(flaky.clone()).to("mock:result"))
        .unwrap();
    context.start().unwrap();

    let exchange = context.send(&id, Exchange::new()).await.unwrap();

    assertions::assert_not_failed(&exchange);
    assert_eq!(flaky.calls(), 3);
    assert_eq!(exchange.header(header::REDELIVERY_COUNTER), Some(&json!(2)));
    assert_eq!(exchange.header(header::REDELIVERED), Some(&json!(true)));
    assert_eq!(endpoints.endpoint("mock:result").received_count(), 1);
}

#[tokio::test]
async fn test_exhausted_redelivery_dead_letters_the_exchange() {
    let endpoints = MockEndpoints::new();
    let always = Arc::new(FailingProcessor::new("down"));
    let queue = DeadLetterQueue::new(8);
    let context = test_context(&endpoints)
        .with_error_handler(ErrorHandler::dead_letter_channel(queue.clone()).with_redelivery(quick_retries(2)));
    context.watch_dead_letters(queue.clone());

    let id = context
        .add_route(RouteDefinition::new("direct:start").process(always.clone()).to("mock:result"))
        .unwrap();
    context.start().unwrap();

    let exchange = context.send(&id, Exchange::with_body(json!("order-1"))).await.unwrap();

    assertions::assert_handled(&exchange);
    assert_eq!(always.calls(), 3);
    assert_eq!(exchange.property(property::REDELIVERY_EXHAUSTED), Some(&json!(true)));
    assert_eq!(endpoints.endpoint("mock:result").received_count(), 0);

    let letter = queue.peek().unwrap();
    assert_eq!(letter.redeliveries, 2);
    assert_eq!(letter.error_message, "down");
    assert_eq!(letter.exchange.body(), &json!("order-1"));
    assert!(context.health().check("dead_letter_queue").unwrap().status.is_degraded());
}

#[tokio::test]
async fn test_configuration_file_drives_error_handling() {
    let config = ConduitConfig::from_toml_str(
        r#"
        [redelivery]
        max_redeliveries = 1
        initial_delay_ms = 1
        dead_letter_queue_size = 4
        "#,
    )
    .unwrap();
    let endpoints = MockEndpoints::new();
    let context = config.build_context(Arc::new(endpoints.clone())).unwrap();
    let always = Arc::new(FailingProcessor::new("down"));

    let id = context
        .add_route(RouteDefinition::new("direct:start").process(always.clone()))
        .unwrap();
    context.start().unwrap();

    let exchange = context.send(&id, Exchange::new()).await.unwrap();

    assertions::assert_handled(&exchange);
    assert_eq!(always.calls(), 2);
    assert!(context.health().is_degraded());
}

#[tokio::test]
async fn test_template_parameters_shape_the_route() -> anyhow::Result<()> {
    let endpoints = MockEndpoints::new();
    let properties = MapPropertyResolver::new().with("greeting", "Hello");
    let context = test_context(&endpoints).with_properties(Arc::new(properties));
    context.add_route_template(
        RouteTemplate::new(
            "greeter",
            RouteDefinition::new("direct:{{name}}")
                .set_body("{{greeting}} ${body}")
                .to("mock:{{target}}"),
        )
        .parameter("name")
        .parameter_with_default("target", "greetings"),
    );

    let id = context.add_route_from_template(None, "greeter", &HashMap::from([("name".to_string(), "en".to_string())]))?;
    context.start()?;

    let exchange = context.send(&id, Exchange::with_body(json!("World"))).await?;

    assert_eq!(exchange.body(), &json!("Hello World"));
    assert_eq!(endpoints.endpoint("mock:greetings").received_bodies(), vec![json!("Hello World")]);
    let route = context.route(&id).ok_or_else(|| anyhow::anyhow!("route {id} not registered"))?;
    assert_eq!(route.from_uri(), "direct:en");
    assert_eq!(route.properties().get(TEMPLATE_PROPERTY).map(String::as_str), Some("true"));
    assert_eq!(route.properties().get("templateId").map(String::as_str), Some("greeter"));
    Ok(())
}

#[test]
fn test_template_reports_every_missing_parameter() {
    let endpoints = MockEndpoints::new();
    let context = test_context(&endpoints);
    context.add_route_template(
        RouteTemplate::new("pair", RouteDefinition::new("direct:{{first}}").to("mock:{{second}}"))
            .parameter("first")
            .parameter("second"),
    );

    let error = context
        .add_route_from_template(Some("pair-route"), "pair", &HashMap::new())
        .unwrap_err();

    assert_eq!(
        error,
        ConfigError::MissingTemplateParameters {
            template: "pair".to_string(),
            parameters: "first,second".to_string(),
        }
    );
    assert!(context.route("pair-route").is_none());
}

#[tokio::test]
async fn test_enrich_merges_resource_reply() {
    let endpoints = MockEndpoints::new();
    endpoints.endpoint("mock:lookup").set_reply_body(json!({"customer": "ACME"}));

    RouteTest::new(RouteDefinition::new("direct:start").enrich("mock:lookup").to("mock:result"))
        .with_context(test_context(&endpoints), endpoints.clone())
        .given_body(json!("order"))
        .then_exchange(|exchange| {
            assert_eq!(exchange.body(), &json!({"customer": "ACME"}));
        })
        .then_endpoints(|endpoints| {
            assert_eq!(endpoints.endpoint("mock:lookup").received_bodies(), vec![json!("order")]);
            assert_eq!(endpoints.endpoint("mock:result").received_count(), 1);
        })
        .run()
        .await;
}

#[tokio::test]
async fn test_enrich_failure_fails_the_exchange() {
    let endpoints = MockEndpoints::new();
    endpoints.endpoint("mock:lookup").fail_with("lookup unavailable");

    RouteTest::new(RouteDefinition::new("direct:start").enrich("mock:lookup").to("mock:result"))
        .with_context(test_context(&endpoints), endpoints.clone())
        .then_exchange(|exchange| {
            assert_eq!(exchange.failure().map(ToString::to_string), Some("lookup unavailable".to_string()));
        })
        .then_endpoints(|endpoints| {
            assert_eq!(endpoints.endpoint("mock:result").received_count(), 0);
        })
        .run()
        .await;
}

#[tokio::test]
async fn test_parallel_multicast_keeps_latest_branch_result() {
    RouteTest::new(
        RouteDefinition::new("direct:start").multicast(
            MulticastDefinition::new()
                .parallel(true)
                .branch(vec![
                    StepDefinition::Process(Arc::new(DelayProcessor::new("slow", Duration::from_millis(30)))),
                    StepDefinition::to("mock:a"),
                ])
                .branch(vec![StepDefinition::set_body("fast"), StepDefinition::to("mock:b")]),
        ),
    )
    .given_body(json!("input"))
    .then_exchange(|exchange| {
        assertions::assert_not_failed(exchange);
        assert_eq!(exchange.body(), &json!("fast"));
    })
    .then_endpoints(|endpoints| {
        assert_eq!(endpoints.endpoint("mock:a").received_bodies(), vec![json!("slow")]);
        assert_eq!(endpoints.endpoint("mock:b").received_bodies(), vec![json!("fast")]);
    })
    .run()
    .await;
}

#[tokio::test]
async fn test_browse_keeps_most_recent_exchanges() {
    let endpoints = MockEndpoints::new();
    let context = test_context(&endpoints);
    let id = context
        .add_route(RouteDefinition::new("direct:start").browse("audit", 3))
        .unwrap();
    context.start().unwrap();

    for body in ["A", "B", "C", "D", "E"] {
        context.send(&id, Exchange::with_body(json!(body))).await.unwrap();
    }

    let audit = context.browse_endpoint("audit").unwrap();
    let bodies: Vec<Value> = audit.exchanges().iter().map(|exchange| exchange.body().clone()).collect();
    assert_eq!(bodies, vec![json!("C"), json!("D"), json!("E")]);
    assert_eq!(audit.exchanges_matching(0, Some(&Predicate::body_equals("D"))).len(), 1);

    context.stop();
    assert!(audit.is_empty());
}

#[tokio::test]
async fn test_strict_index_validation_rejects_gaps() {
    let endpoints = MockEndpoints::new();
    let context = test_context(&endpoints);
    let id = context
        .add_route(
            RouteDefinition::new("direct:start")
                .validate_index(IndexValidation::Strict)
                .to("mock:result"),
        )
        .unwrap();
    context.start().unwrap();

    let indexed = |index: i64| {
        let mut exchange = Exchange::new();
        exchange.message_mut().set_header(header::DATASET_INDEX, index);
        exchange
    };

    assertions::assert_not_failed(&context.send(&id, indexed(0)).await.unwrap());
    assertions::assert_not_failed(&context.send(&id, indexed(1)).await.unwrap());
    let gap = context.send(&id, indexed(5)).await.unwrap();
    let missing = context.send(&id, Exchange::new()).await.unwrap();

    assert_eq!(
        gap.failure().unwrap().downcast_ref::<RoutingError>(),
        Some(&RoutingError::DataSetIndexMismatch {
            header: header::DATASET_INDEX.to_string(),
            expected: 2,
            actual: 5,
        })
    );
    assert!(matches!(
        missing.failure().unwrap().downcast_ref::<RoutingError>(),
        Some(RoutingError::MissingDataSetIndex { .. })
    ));
    assert_eq!(endpoints.endpoint("mock:result").received_count(), 2);
}

#[tokio::test]
async fn test_execute_completes_asynchronous_route_once() {
    let endpoints = MockEndpoints::new();
    let context = test_context(&endpoints);
    let id = context
        .add_route(
            RouteDefinition::new("direct:start")
                .process(Arc::new(DelayProcessor::new("done", Duration::from_millis(10))))
                .to("mock:result"),
        )
        .unwrap();
    context.start().unwrap();

    let (tx, rx) = oneshot::channel();
    let sync = context
        .execute(&id, Exchange::new(), move |exchange, sync| {
            let _ = tx.send((exchange, sync));
        })
        .unwrap();

    let (exchange, reported_sync) = rx.await.unwrap();
    assert!(!sync);
    assert!(!reported_sync);
    assert_eq!(exchange.body(), &json!("done"));
    assert_eq!(exchange.property(property::ROUTE_ID), Some(&json!(id)));
}

#[tokio::test]
async fn test_execute_completes_synchronous_route_inline() {
    let endpoints = MockEndpoints::new();
    let context = test_context(&endpoints);
    let id = context
        .add_route(RouteDefinition::new("direct:start").set_body("inline"))
        .unwrap();
    context.start().unwrap();

    let (tx, rx) = oneshot::channel();
    let sync = context
        .execute(&id, Exchange::new(), move |exchange, sync| {
            let _ = tx.send((exchange, sync));
        })
        .unwrap();

    let (exchange, reported_sync) = rx.await.unwrap();
    assert!(sync);
    assert!(reported_sync);
    assert_eq!(exchange.body(), &json!("inline"));
}

#[test]
#[should_panic(expected = "Tokio 1.x runtime")]
fn test_execute_outside_runtime_panics() {
    let endpoints = MockEndpoints::new();
    let context = test_context(&endpoints);
    let id = context
        .add_route(RouteDefinition::new("direct:start").set_body("inline"))
        .unwrap();
    context.start().unwrap();

    let _ = context.execute(&id, Exchange::new(), |_, _| {});
}

#[tokio::test]
async fn test_stopped_route_refuses_exchanges() {
    let endpoints = MockEndpoints::new();
    let context = test_context(&endpoints);
    let first = context.add_route(RouteDefinition::new("direct:a")).unwrap();
    let second = context.add_route(RouteDefinition::new("direct:b")).unwrap();
    context.start().unwrap();

    context.stop_route(&second).unwrap();

    assert_eq!(first, "route1");
    assert_eq!(second, "route2");
    assert_eq!(context.route_status(&second), Some(RouteStatus::Stopped));
    assert_eq!(
        context.send(&second, Exchange::new()).await.unwrap_err(),
        ConfigError::RouteNotStarted(second.clone())
    );
    assert!(context.health().check("route:route2").unwrap().status.is_degraded());

    context.remove_route(&second).unwrap();
    assert_eq!(context.route_ids(), vec![first]);
}
