//! # Integration Tests
//!
//! End-to-end flows across crates:
//! - config file -> dispatcher -> every dispatch path
//! - user transformations backed by a code store
//! - shadow comparison around a dispatch call
//! - credential cache under concurrent load

#[cfg(test)]
mod config_tests {
    use config_loader::{ConfigFormat, ConfigLoader};

    #[test]
    fn test_config_round_trips_through_toml() {
        let config = ConfigLoader::load_from_str(super::e2e_tests::PIPELINE_TOML, ConfigFormat::Toml)
            .unwrap();
        let rendered = ConfigLoader::to_toml(&config).unwrap();
        let reparsed = ConfigLoader::load_from_str(&rendered, ConfigFormat::Toml).unwrap();

        assert_eq!(reparsed.dispatch.max_concurrency, 8);
        assert_eq!(reparsed.registry.aliases["amplitude"], "am");
        assert_eq!(reparsed.shadow.rules, config.shadow.rules);
    }
}

#[cfg(test)]
mod e2e_tests {
    use std::sync::Arc;
    use std::time::Duration;

    use config_loader::{ConfigFormat, ConfigLoader};
    use contracts::{
        Destination, Event, EventMetadata, PipelineConfig, RequestContext, RequestDescriptor,
        TransformationRef,
    };
    use credential_cache::AccountTokenCache;
    use custom_transform::{
        CodeEngine, CustomTransformExecutor, RuntimeExecutionError, StoreBackedRuntime,
        TransformationCode, TransformationStore, UserTransformOutput, VERSION_NOT_FOUND,
    };
    use dispatcher::{create_dispatcher, Dispatcher};
    use handler_registry::{DestinationHandler, HandlerRegistry, MockBehavior, MockHandler};
    use httpmock::{Method::GET, Method::POST, MockServer};
    use serde_json::{json, Value};
    use shadow_compare::{MirroredRequest, Normalizer, ShadowComparison};

    pub(super) const PIPELINE_TOML: &str = r#"
[dispatch]
max_concurrency = 8
proxy_timeout_ms = 2000

[registry]
aliases = { amplitude = "am" }

[shadow]
legacy_url = "http://127.0.0.1:9"

[[shadow.rules]]
route = "/v0/am"
strip = ["output.config"]
"#;

    fn load_config() -> PipelineConfig {
        ConfigLoader::load_from_str(PIPELINE_TOML, ConfigFormat::Toml).unwrap()
    }

    fn event(message_id: &str, destination_id: &str, message: Value) -> Event {
        Event {
            message,
            destination: Destination {
                id: destination_id.into(),
                ..Default::default()
            },
            metadata: EventMetadata {
                message_id: message_id.into(),
                source_id: "src".into(),
                destination_id: destination_id.into(),
                ..Default::default()
            },
            libraries: Vec::new(),
            request: None,
        }
    }

    fn dispatcher(behavior: MockBehavior) -> (Arc<MockHandler>, Dispatcher) {
        let mock = Arc::new(MockHandler::with_behavior(behavior));
        let registry = HandlerRegistry::builder().register(
            DestinationHandler::builder("am")
                .processor(mock.clone())
                .router(mock.clone())
                .batcher(mock.clone())
                .build(),
        );
        (mock, create_dispatcher(&load_config(), registry).unwrap())
    }

    /// Every event yields either its payloads or one failure record
    #[tokio::test]
    async fn test_processor_batch_keeps_one_record_per_failed_event() {
        let (mock, dispatcher) = dispatcher(MockBehavior {
            fail_message_ids: vec!["m2".into()],
            panic_message_ids: vec!["m3".into()],
            ..Default::default()
        });
        let events = vec![
            event("m1", "d1", json!({"userId": 0})),
            event("m2", "d1", json!({"userId": "u2"})),
            event("m3", "d1", json!({"userId": "u3"})),
            event("m4", "d1", json!({"userId": 42, "fanout": 2})),
        ];

        let results = dispatcher
            .process("AMPLITUDE", events, RequestContext::default())
            .await
            .unwrap();

        assert_eq!(results.len(), 5);
        assert_eq!(results.iter().filter(|r| !r.is_success()).count(), 2);
        for ok in results.iter().filter(|r| r.is_success()) {
            let user_id = &ok.output.as_ref().unwrap()["userId"];
            assert!(user_id == &json!("") || user_id == &json!("42"), "{user_id}");
        }
        let stages: Vec<_> = results
            .iter()
            .filter_map(|r| r.stat_tags.as_ref())
            .map(|tags| tags["stage"].clone())
            .collect();
        assert_eq!(stages, vec!["transform", "transform"]);
        assert_eq!(mock.process_calls(), 4);
    }

    #[tokio::test]
    async fn test_router_failure_in_one_group_spares_the_other() {
        let (_, dispatcher) = dispatcher(MockBehavior {
            fail_destination_ids: vec!["A".into()],
            ..Default::default()
        });
        let events = vec![
            event("m1", "A", json!({})),
            event("m2", "A", json!({})),
            event("m3", "B", json!({})),
        ];

        let results = dispatcher.route("am", events).await.unwrap();

        assert_eq!(results.len(), 2);
        assert!(!results[0].is_success());
        assert_eq!(results[0].message_ids(), vec!["m1", "m2"]);
        assert!(results[1].is_success());
        assert_eq!(results[1].output.as_ref().unwrap()["batch"], json!(["m3"]));
        assert_eq!(dispatcher.metrics().groups, 2);
    }

    #[tokio::test]
    async fn test_proxy_over_http_fallback_tags_response_stage() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/collect");
            then.status(500).json_body(json!({"error": "upstream down"}));
        });
        let (_, dispatcher) = dispatcher(MockBehavior::default());

        let request: RequestDescriptor = serde_json::from_value(json!({
            "endpoint": server.url("/collect"),
            "body": {"JSON": {"events": [1]}}
        }))
        .unwrap();
        let envelope = dispatcher.proxy("webhook", request).await;

        assert_eq!(envelope.status(), 500);
        assert!(!envelope.is_success());
        let tags = envelope.output.stat_tags.as_ref().unwrap();
        assert_eq!(tags["stage"], "responseTransform");
        assert_eq!(
            envelope.output.destination_response,
            Some(json!({"error": "upstream down"}))
        );
    }

    /// Returns each event's message tagged with the version that ran
    struct VersionEngine;

    impl CodeEngine for VersionEngine {
        async fn evaluate(
            &self,
            code: &TransformationCode,
            events: Vec<Event>,
            _library_version_ids: &[String],
        ) -> Result<Vec<UserTransformOutput>, RuntimeExecutionError> {
            if code.code.contains("throw") {
                return Err(RuntimeExecutionError::new("Error: thrown by user code"));
            }
            Ok(events
                .into_iter()
                .map(|e| {
                    let mut message = e.message.clone();
                    message["version"] = json!(code.version_id);
                    UserTransformOutput::transformed(message, e.metadata)
                })
                .collect())
        }
    }

    fn versioned(message_id: &str, source_id: &str, version: Option<&str>) -> Event {
        let mut e = event(message_id, "d1", json!({"messageId": message_id}));
        e.metadata.source_id = source_id.into();
        e.destination.transformations = vec![TransformationRef {
            version_id: version.map(String::from),
            ..Default::default()
        }];
        e
    }

    #[tokio::test]
    async fn test_custom_transform_with_store_backed_runtime() {
        let server = MockServer::start();
        let good = server.mock(|when, then| {
            when.method(GET)
                .path("/transformation/getByVersionId")
                .query_param("versionId", "v1");
            then.status(200)
                .json_body(json!({"versionId": "v1", "code": "return event;"}));
        });
        server.mock(|when, then| {
            when.method(GET).query_param("versionId", "v2");
            then.status(200)
                .json_body(json!({"versionId": "v2", "code": "throw new Error()"}));
        });

        let store = TransformationStore::new(&server.base_url(), Duration::from_secs(60)).unwrap();
        let executor = CustomTransformExecutor::from_config(
            &load_config().custom_transform,
            StoreBackedRuntime::new(store, VersionEngine),
        )
        .unwrap();
        let events = vec![
            versioned("m1", "s1", Some("v1")),
            versioned("m2", "s2", Some("v2")),
            versioned("m3", "s1", Some("v1")),
            versioned("m4", "s3", None),
        ];

        let results = executor.execute(events, false).await.unwrap();

        assert_eq!(results.len(), 4);
        assert_eq!(results[0].output.as_ref().unwrap()["version"], json!("v1"));
        assert_eq!(results[1].output.as_ref().unwrap()["version"], json!("v1"));
        assert_eq!(results[2].error.as_deref(), Some("Error: thrown by user code"));
        assert_eq!(results[3].error.as_deref(), Some(VERSION_NOT_FOUND));
        assert_eq!(good.hits(), 1);
    }

    #[tokio::test]
    async fn test_shadow_comparison_around_processor_dispatch() {
        let (_, dispatcher) = dispatcher(MockBehavior::default());
        let config = load_config();
        let events = || vec![event("m1", "d1", json!({"userId": "u1"}))];
        let primary = dispatcher
            .process("am", events(), RequestContext::default())
            .await
            .unwrap();
        let mut legacy_body = serde_json::to_value(&primary).unwrap();
        legacy_body[0]["output"]["config"] = json!({"apiKey": "legacy"});

        let server = MockServer::start();
        let legacy = server.mock(|when, then| {
            when.method(POST).path("/v0/am");
            then.status(200).json_body(legacy_body.clone());
        });

        let shadow = ShadowComparison::new(
            shadow_compare::HttpLegacyTarget::new(&server.base_url(), Duration::from_secs(2))
                .unwrap(),
            Normalizer::from_config(&config.shadow),
        );
        let request = MirroredRequest::post("/v0/am", serde_json::to_value(events()).unwrap());
        let response = shadow
            .wrap(request, async {
                dispatcher
                    .process("am", events(), RequestContext::default())
                    .await
                    .map(|results| serde_json::to_value(results).unwrap_or_default())
            })
            .await
            .unwrap();
        shadow.drain().await;

        legacy.assert();
        assert_eq!(response, serde_json::to_value(&primary).unwrap());
        let stats = shadow.stats();
        assert_eq!(stats.matched, 1);
        assert_eq!(stats.mismatched, 0);
    }

    #[tokio::test]
    async fn test_account_token_fetched_once_under_concurrent_load() {
        let server = MockServer::start();
        let issuer = server.mock(|when, then| {
            when.method(POST)
                .path("/dest/workspaces/w1/accounts/a1/token");
            then.status(200)
                .json_body(json!({"accessToken": "t-1"}))
                .delay(Duration::from_millis(50));
        });

        let cache = AccountTokenCache::new(&server.base_url(), Duration::from_secs(60)).unwrap();
        let calls = (0..8).map(|_| cache.get_token("w1", "a1"));
        let tokens = futures::future::join_all(calls).await;

        assert_eq!(issuer.hits(), 1);
        for token in tokens {
            assert_eq!(token.unwrap(), json!({"accessToken": "t-1"}));
        }
        let stats = cache.stats();
        assert_eq!(stats.refreshes, 1);
        assert_eq!(stats.coalesced + stats.hits, 7);
    }
}
