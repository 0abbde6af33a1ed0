//! Integration tests for the proxy lifecycle engine over mock backends.

mod common;

use std::collections::HashMap;
use std::sync::Arc;

use common::{Harness, drain_events};
use portico::core::errors::ProxyError;
use portico::core::events::ProxyEventKind;
use portico::core::proxy::ProxyStatus;
use portico::core::spec::{
    AccessControlSpec, ContainerSpec, ParameterSpec, PortMapping, ProxySpec,
};
use portico::core::{AuthContext, RuntimeValue};

fn app_spec(id: &str, users: &[&str], groups: &[&str]) -> ProxySpec {
    let access_control = if users.is_empty() && groups.is_empty() {
        None
    } else {
        Some(AccessControlSpec {
            users: users.iter().map(|s| (*s).to_owned()).collect(),
            groups: groups.iter().map(|s| (*s).to_owned()).collect(),
        })
    };
    ProxySpec {
        id: id.to_owned(),
        display_name: Some(format!("App {id}")),
        container_specs: vec![ContainerSpec {
            image: "registry/app:latest".to_owned(),
            port_mappings: vec![PortMapping {
                name: "default".to_owned(),
                port: 3838,
            }],
            ..ContainerSpec::default()
        }],
        access_control,
        ..ProxySpec::default()
    }
}

fn alice() -> AuthContext {
    AuthContext::user("alice", vec!["science".to_owned()])
}

#[tokio::test]
async fn test_happy_start() {
    let h = Harness::new();
    let spec = h.registry.register(app_spec("s1", &["alice"], &[])).unwrap();
    let mut rx = h.events.subscribe();

    let command = h
        .service
        .start_proxy(&alice(), spec, vec![], "p-1", None)
        .await
        .expect("reservation must succeed");
    let proxy = command.run().await.expect("start must succeed");

    assert_eq!(proxy.status, ProxyStatus::Up);
    assert!(proxy.startup_timestamp.is_some());

    // Retrievable by id and by listing
    let stored = h.service.get_proxy("p-1").await.unwrap().unwrap();
    assert_eq!(stored.status, ProxyStatus::Up);
    assert_eq!(h.service.get_proxies().await.unwrap().len(), 1);

    // Route registered against the container target
    assert_eq!(
        h.mapping.target_for("p-1/default").as_deref(),
        Some("http://127.0.0.1:3838")
    );

    // Exactly one start event with the right identities
    let events = drain_events(&mut rx);
    let starts: Vec<_> = events
        .iter()
        .filter_map(|e| match &e.kind {
            ProxyEventKind::ProxyStart {
                proxy_id,
                user_id,
                spec_id,
                ..
            } => Some((proxy_id.clone(), user_id.clone(), spec_id.clone())),
            _ => None,
        })
        .collect();
    assert_eq!(
        starts,
        vec![(
            "p-1".to_owned(),
            Some("alice".to_owned()),
            "s1".to_owned()
        )]
    );
}

#[tokio::test]
async fn test_unauthorized_start_leaves_no_trace() {
    let h = Harness::new();
    let spec = h.registry.register(app_spec("s1", &[], &["g"])).unwrap();
    let mut rx = h.events.subscribe();

    let bob = AuthContext::user("bob", vec!["other".to_owned()]);
    let err = h
        .service
        .start_proxy(&bob, spec, vec![], "p-2", None)
        .await
        .unwrap_err();

    assert!(matches!(err, ProxyError::AccessDenied { .. }));
    assert!(h.service.get_proxies().await.unwrap().is_empty());
    assert!(drain_events(&mut rx).is_empty());
    assert!(h.backend.running().await.is_empty());
}

#[tokio::test]
async fn test_probe_failure_rolls_back() {
    let h = Harness::new();
    let spec = h.registry.register(app_spec("s1", &["alice"], &[])).unwrap();
    h.probe.script_results(std::iter::repeat_n(false, 8)).await;
    let mut rx = h.events.subscribe();

    let command = h
        .service
        .start_proxy(&alice(), spec, vec![], "p-3", None)
        .await
        .unwrap();
    let err = command.run().await.unwrap_err();

    assert!(matches!(err, ProxyError::NotResponding { .. }));
    assert!(h.backend.stop_calls().await.contains(&"p-3".to_owned()));
    assert!(h.service.get_proxy("p-3").await.unwrap().is_none());
    assert!(!h.mapping.contains("p-3/default"));

    let failures = drain_events(&mut rx)
        .iter()
        .filter(|e| matches!(e.kind, ProxyEventKind::ProxyStartFailed { .. }))
        .count();
    assert_eq!(failures, 1);
}

#[tokio::test]
async fn test_backend_failure_stops_partial_container() {
    let h = Harness::new();
    let spec = h.registry.register(app_spec("s1", &["alice"], &[])).unwrap();
    h.backend.set_should_fail(true);
    h.backend.set_fail_with_partial(true);
    let mut rx = h.events.subscribe();

    let command = h
        .service
        .start_proxy(&alice(), spec, vec![], "p-4", None)
        .await
        .unwrap();
    let err = command.run().await.unwrap_err();

    assert!(matches!(err, ProxyError::ContainerStartFailed { .. }));
    // The partially started container was stopped best-effort
    assert!(h.backend.stop_calls().await.contains(&"p-4".to_owned()));
    assert!(h.service.get_proxy("p-4").await.unwrap().is_none());

    let failures = drain_events(&mut rx)
        .iter()
        .filter(|e| matches!(e.kind, ProxyEventKind::ProxyStartFailed { .. }))
        .count();
    assert_eq!(failures, 1);
}

#[tokio::test]
async fn test_stop_removes_routes_before_command_runs() {
    let h = Harness::new();
    let spec = h.registry.register(app_spec("s1", &["alice"], &[])).unwrap();

    let start = h
        .service
        .start_proxy(&alice(), spec, vec![], "p-5", None)
        .await
        .unwrap();
    start.run().await.unwrap();
    assert!(h.mapping.contains("p-5/default"));

    let stop = h
        .service
        .stop_proxy(Some(&alice()), "p-5", false)
        .await
        .unwrap();

    // Synchronous phase already unmapped and transitioned
    assert!(!h.mapping.contains("p-5/default"));
    assert_eq!(
        h.service.get_proxy("p-5").await.unwrap().unwrap().status,
        ProxyStatus::Stopping
    );

    let mut rx = h.events.subscribe();
    stop.run().await.unwrap();

    assert!(h.service.get_proxy("p-5").await.unwrap().is_none());
    assert!(h.backend.stop_calls().await.contains(&"p-5".to_owned()));

    let events = drain_events(&mut rx);
    let stop_event = events
        .iter()
        .find_map(|e| match &e.kind {
            ProxyEventKind::ProxyStop { usage_duration, .. } => Some(*usage_duration),
            _ => None,
        })
        .expect("stop event must be published");
    assert!(stop_event.is_some(), "usage duration present once Up");
}

#[tokio::test]
async fn test_stop_removes_record_even_when_backend_fails() {
    let h = Harness::new();
    let spec = h.registry.register(app_spec("s1", &["alice"], &[])).unwrap();

    let start = h
        .service
        .start_proxy(&alice(), spec, vec![], "p-6", None)
        .await
        .unwrap();
    start.run().await.unwrap();

    h.backend.set_should_fail(true);
    let stop = h
        .service
        .stop_proxy(Some(&alice()), "p-6", false)
        .await
        .unwrap();
    stop.run().await.unwrap();

    // In-memory truth converges even though the cluster said no
    assert!(h.service.get_proxy("p-6").await.unwrap().is_none());
}

#[tokio::test]
async fn test_stop_gate_owner_admin_ignore() {
    let h = Harness::new();
    let spec = h.registry.register(app_spec("s1", &["alice"], &[])).unwrap();

    for (id, stopper, ignore, allowed) in [
        ("p-7", Some(AuthContext::user("mallory", vec![])), false, false),
        ("p-7", Some(AuthContext::admin("root")), false, true),
        ("p-8", None, true, true),
        ("p-9", Some(alice()), false, true),
    ] {
        if h.service.get_proxy(id).await.unwrap().is_none() {
            let start = h
                .service
                .start_proxy(&alice(), Arc::clone(&spec), vec![], id, None)
                .await
                .unwrap();
            start.run().await.unwrap();
        }

        let result = h.service.stop_proxy(stopper.as_ref(), id, ignore).await;
        if allowed {
            result.unwrap().run().await.unwrap();
        } else {
            assert!(matches!(result.unwrap_err(), ProxyError::AccessDenied { .. }));
        }
    }
}

#[tokio::test]
async fn test_idempotent_start_single_record() {
    let h = Harness::new();
    let spec = h.registry.register(app_spec("s1", &["alice"], &[])).unwrap();

    let first = h
        .service
        .start_proxy(&alice(), Arc::clone(&spec), vec![], "p-10", None)
        .await
        .unwrap();
    first.run().await.unwrap();

    let err = h
        .service
        .start_proxy(&alice(), spec, vec![], "p-10", None)
        .await
        .unwrap_err();
    assert!(matches!(err, ProxyError::IllegalState { .. }));
    assert_eq!(h.service.get_proxies().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_pause_resume_preserves_id_and_routes() {
    let h = Harness::new();
    let mut spec = app_spec("s1", &["alice"], &[]);
    spec.parameters = vec![ParameterSpec {
        id: "memory".to_owned(),
        display_name: None,
        values: vec!["2g".to_owned(), "8g".to_owned()],
    }];
    let spec = h.registry.register(spec).unwrap();

    let start = h
        .service
        .start_proxy(&alice(), Arc::clone(&spec), vec![], "p-11", None)
        .await
        .unwrap();
    let started = start.run().await.unwrap();
    assert_eq!(
        started.runtime_value("parameter.memory").unwrap().value_as_string(),
        "2g"
    );

    let mut rx = h.events.subscribe();

    // Pause: routes go away, status walks Up -> Pausing -> Paused
    let pause = h
        .service
        .pause_proxy(Some(&alice()), "p-11", false)
        .await
        .unwrap();
    assert_eq!(
        h.service.get_proxy("p-11").await.unwrap().unwrap().status,
        ProxyStatus::Pausing
    );
    assert!(!h.mapping.contains("p-11/default"));
    let paused = pause.run().await.unwrap();
    assert_eq!(paused.status, ProxyStatus::Paused);

    // Resume with changed parameters: Paused -> Resuming -> Up, routes back
    let params: HashMap<String, String> = [("memory".to_owned(), "8g".to_owned())].into();
    let resume = h
        .service
        .resume_proxy(Some(&alice()), "p-11", Some(params), false)
        .await
        .unwrap();
    assert_eq!(
        h.service.get_proxy("p-11").await.unwrap().unwrap().status,
        ProxyStatus::Resuming
    );
    let resumed = resume.run().await.unwrap();

    assert_eq!(resumed.id, "p-11");
    assert_eq!(resumed.status, ProxyStatus::Up);
    assert!(h.mapping.contains("p-11/default"));
    assert_eq!(
        resumed.runtime_value("parameter.memory").unwrap().value_as_string(),
        "8g"
    );

    // Pause then resume events, in that order
    let kinds: Vec<&'static str> = drain_events(&mut rx)
        .iter()
        .filter_map(|e| match e.kind {
            ProxyEventKind::ProxyPause { .. } => Some("pause"),
            ProxyEventKind::ProxyResume { .. } => Some("resume"),
            _ => None,
        })
        .collect();
    assert_eq!(kinds, vec!["pause", "resume"]);
}

#[tokio::test]
async fn test_pause_requires_backend_support() {
    let h = Harness::new();
    h.backend.set_supports_pause(false);
    let spec = h.registry.register(app_spec("s1", &["alice"], &[])).unwrap();

    let start = h
        .service
        .start_proxy(&alice(), spec, vec![], "p-12", None)
        .await
        .unwrap();
    start.run().await.unwrap();

    let err = h
        .service
        .pause_proxy(Some(&alice()), "p-12", false)
        .await
        .unwrap_err();
    assert!(matches!(err, ProxyError::NotSupported { .. }));
}

#[tokio::test]
async fn test_pause_while_stopping_is_illegal() {
    let h = Harness::new();
    let spec = h.registry.register(app_spec("s1", &["alice"], &[])).unwrap();

    let start = h
        .service
        .start_proxy(&alice(), spec, vec![], "p-13", None)
        .await
        .unwrap();
    start.run().await.unwrap();

    // Reserve the stop but do not run it: status is Stopping
    let _stop = h
        .service
        .stop_proxy(Some(&alice()), "p-13", false)
        .await
        .unwrap();

    let err = h
        .service
        .pause_proxy(Some(&alice()), "p-13", false)
        .await
        .unwrap_err();
    assert!(matches!(err, ProxyError::IllegalState { .. }));
}

#[tokio::test]
async fn test_expressions_resolve_against_user_context() {
    let h = Harness::new();
    let mut spec = app_spec("s1", &["alice"], &[]);
    spec.display_name = Some("App for {{ user.user_id }}".to_owned());
    spec.container_specs[0].env.insert(
        "PUBLIC_PATH".to_owned(),
        "{{ runtime_values.public_path }}".to_owned(),
    );
    let spec = h.registry.register(spec).unwrap();

    let start = h
        .service
        .start_proxy(&alice(), spec, vec![], "p-14", None)
        .await
        .unwrap();
    let proxy = start.run().await.unwrap();

    assert_eq!(proxy.display_name, "App for alice");
    let public_path = proxy
        .runtime_value("public_path")
        .expect("public path runtime value")
        .value_as_string();
    assert!(public_path.ends_with("p-14"));
}

#[tokio::test]
async fn test_caller_runtime_values_survive_start() {
    let h = Harness::new();
    let spec = h.registry.register(app_spec("s1", &["alice"], &[])).unwrap();

    let start = h
        .service
        .start_proxy(
            &alice(),
            spec,
            vec![RuntimeValue::custom(
                "ticket",
                Some("TICKET".to_owned()),
                "abc-123",
                true,
            )],
            "p-15",
            None,
        )
        .await
        .unwrap();
    let proxy = start.run().await.unwrap();

    assert_eq!(
        proxy.runtime_value("ticket").unwrap().value_as_string(),
        "abc-123"
    );
    assert_eq!(
        proxy.env_values().get("TICKET").map(String::as_str),
        Some("abc-123")
    );
}

#[tokio::test]
async fn test_add_existing_proxy_publishes_nothing() {
    let h = Harness::new();
    let mut rx = h.events.subscribe();

    let mut proxy = portico::core::Proxy::new(portico::core::ProxyInit {
        id: "recovered-1".to_owned(),
        spec_id: "s1".to_owned(),
        user_id: Some("alice".to_owned()),
        display_name: "App s1".to_owned(),
    });
    proxy.status = ProxyStatus::Up;
    proxy
        .targets
        .insert("recovered-1/default".to_owned(), "http://127.0.0.1:3838".to_owned());

    h.service.add_existing_proxy(proxy).await.unwrap();

    assert!(h.service.get_proxy("recovered-1").await.unwrap().is_some());
    assert!(h.mapping.contains("recovered-1/default"));
    assert!(drain_events(&mut rx).is_empty());
}
