mod common;

use common::*;
use querylite_engine::connectors::ConnectorError;
use querylite_engine::{AskRequest, EngineConfig, EngineError, FailureKind, QueryEngine};
use std::sync::Arc;

const BAD_QUERY: &str = "SELECT regoin, SUM(total) AS total FROM orders GROUP BY regoin";
const GOOD_QUERY: &str = "SELECT region, SUM(total) AS total FROM orders GROUP BY region";

fn failing_on_typo() -> FakeConnector {
    FakeConnector::new(Box::new(|query: &str| {
        if query.contains("regoin") {
            Err(unknown_column("regoin"))
        } else {
            Ok(region_totals())
        }
    }))
}

#[tokio::test]
async fn test_unknown_column_is_healed() {
    let connector = Arc::new(failing_on_typo());
    let provider = Arc::new(ScriptedProvider::new([answer(BAD_QUERY, 0.9), answer(GOOD_QUERY, 0.9)]));
    let engine = QueryEngine::new(test_config(), provider.clone()).unwrap();

    let response = engine
        .ask(&handle(Arc::clone(&connector)), AskRequest::new("revenue by region"))
        .await
        .unwrap();

    assert!(response.healed);
    assert_eq!(response.attempts, 2);
    assert_eq!(response.row_count, 2);
    assert_eq!(connector.executions(), 2);

    let retry_prompt = &provider.prompts()[1];
    assert!(retry_prompt.contains("The previous query failed."));
    assert!(retry_prompt.contains(BAD_QUERY));
    assert!(retry_prompt.contains("column \"regoin\" does not exist"));
}

#[tokio::test]
async fn test_healing_stops_at_bound() {
    let connector = Arc::new(failing_on_typo());
    let provider = Arc::new(ScriptedProvider::new([
        answer(BAD_QUERY, 0.9),
        answer(BAD_QUERY, 0.9),
        answer(GOOD_QUERY, 0.9),
    ]));
    let engine = QueryEngine::new(test_config(), provider.clone()).unwrap();

    let err = engine
        .ask(&handle(Arc::clone(&connector)), AskRequest::new("revenue by region"))
        .await
        .unwrap_err();

    match &err {
        EngineError::ExecutionFailed {
            attempts,
            healing_exhausted,
            kind,
            ..
        } => {
            assert_eq!(*attempts, 2);
            assert!(*healing_exhausted);
            assert_eq!(*kind, FailureKind::UnknownColumn);
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert!(err.to_string().contains("auto-correction exhausted"));
    assert_eq!(provider.calls(), 2);
    assert_eq!(connector.executions(), 2);
}

#[tokio::test]
async fn test_configured_bound_counts_every_generation() {
    let connector = Arc::new(failing_on_typo());
    let provider = Arc::new(ScriptedProvider::new(vec![answer(BAD_QUERY, 0.9); 5]));
    let config = EngineConfig {
        max_healing_attempts: 3,
        ..test_config()
    };
    let engine = QueryEngine::new(config, provider.clone()).unwrap();

    let err = engine
        .ask(&handle(Arc::clone(&connector)), AskRequest::new("revenue by region"))
        .await
        .unwrap_err();

    assert!(err.healing_exhausted());
    assert_eq!(provider.calls(), 3);
    assert_eq!(connector.executions(), 3);
}

#[tokio::test]
async fn test_unrecoverable_failure_is_not_retried() {
    let connector = Arc::new(FakeConnector::new(Box::new(|_: &str| {
        Err(ConnectorError::Execution {
            reason: "permission denied for table orders".into(),
            kind: FailureKind::Permission,
        })
    })));
    let provider = Arc::new(ScriptedProvider::new([answer(GOOD_QUERY, 0.9), answer(GOOD_QUERY, 0.9)]));
    let engine = QueryEngine::new(test_config(), provider.clone()).unwrap();

    let err = engine
        .ask(&handle(connector), AskRequest::new("revenue by region"))
        .await
        .unwrap_err();

    match err {
        EngineError::ExecutionFailed {
            attempts,
            healing_exhausted,
            ..
        } => {
            assert_eq!(attempts, 1);
            assert!(!healing_exhausted);
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert_eq!(provider.calls(), 1);
}

#[tokio::test]
async fn test_unsafe_healing_attempt_is_rejected() {
    let connector = Arc::new(failing_on_typo());
    let provider = Arc::new(ScriptedProvider::new([
        answer(BAD_QUERY, 0.9),
        answer("DELETE FROM orders WHERE region IS NULL", 0.9),
    ]));
    let engine = QueryEngine::new(test_config(), provider).unwrap();

    let err = engine
        .ask(&handle(Arc::clone(&connector)), AskRequest::new("revenue by region"))
        .await
        .unwrap_err();

    assert_eq!(err.tag(), "validation_rejected");
    assert_eq!(connector.executions(), 1);
}

#[tokio::test]
async fn test_malformed_model_output_gets_one_stricter_retry() {
    let connector = Arc::new(FakeConnector::returning(region_totals()));
    let provider = Arc::new(ScriptedProvider::new([
        "Sure! Here is the query you wanted.".to_string(),
        format!("```json\n{}\n```", answer(GOOD_QUERY, 0.9)),
    ]));
    let engine = QueryEngine::new(test_config(), provider.clone()).unwrap();

    let response = engine
        .ask(&handle(connector), AskRequest::new("revenue by region"))
        .await
        .unwrap();
    assert_eq!(response.row_count, 2);
    assert_eq!(provider.calls(), 2);

    let provider = Arc::new(ScriptedProvider::new(["nope", "still nope"]));
    let engine = QueryEngine::new(test_config(), provider.clone()).unwrap();
    let err = engine
        .ask(
            &handle(Arc::new(FakeConnector::returning(vec![]))),
            AskRequest::new("revenue by region"),
        )
        .await
        .unwrap_err();
    assert_eq!(err.tag(), "generation_failed");
    assert_eq!(provider.calls(), 2);
}
