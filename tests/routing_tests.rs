//! End-to-end tests for the request pipeline: listeners, rewriting,
//! identity blobs, workers with sub-request channels, and the registry's
//! failure behavior.

mod common;

use bytes::Bytes;
use common::{get, http_request, EchoScriptFactory, TestOrigin, TestServer};
use gatehouse::config::{
    BindingConfig, Config, ExternalConfig, HeaderInjection, HttpOptions, HttpStyle,
    ScriptSourceConfig, ServiceConfig, ServiceKind, ServiceRef, SocketConfig, WorkerConfig,
};
use http::{Method, StatusCode};

fn socket_to(service: ServiceRef) -> SocketConfig {
    SocketConfig {
        name: "main".into(),
        address: None,
        service,
        http: None,
        https: None,
    }
}

fn external_to(origin: &TestOrigin, options: HttpOptions) -> ServiceKind {
    ServiceKind::External(ExternalConfig {
        address: Some(origin.address_string()),
        http: Some(options),
        https: None,
    })
}

fn worker(bindings: Vec<BindingConfig>) -> ServiceKind {
    ServiceKind::Worker(WorkerConfig {
        compatibility_date: Some("2024-05-01".into()),
        compatibility_flags: Vec::new(),
        script: ScriptSourceConfig {
            code: Some("export default {}".into()),
            ..Default::default()
        },
        bindings,
        global_outbound: None,
    })
}

#[tokio::test]
async fn test_host_style_external_with_injection() {
    // External HTTPS-less variant of the classic front-door setup: the
    // socket terminates host-style HTTP, the external origin gets
    // host-style HTTP back, plus an injected API key.
    let origin = TestOrigin::start().await;
    let config = Config {
        services: vec![ServiceConfig {
            name: "api".into(),
            kind: external_to(
                &origin,
                HttpOptions {
                    style: HttpStyle::Host,
                    inject_request_headers: vec![HeaderInjection {
                        name: "X-Api-Key".into(),
                        value: Some("secret".into()),
                    }],
                    ..Default::default()
                },
            ),
        }],
        sockets: vec![socket_to(ServiceRef::new("api"))],
    };
    let server = TestServer::start(config, EchoScriptFactory::new()).await;

    let (status, body) = get(server.addr, "/path", "srv").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, Bytes::from_static(b"origin-ok"));

    let seen = origin.last_request();
    assert_eq!(seen.method, "GET");
    assert_eq!(seen.target, "/path", "origin gets an origin-form target");
    assert_eq!(seen.header("host"), Some("srv"));
    assert_eq!(seen.header("x-api-key"), Some("secret"));
    assert!(server.reporter.is_empty(), "{:?}", server.reporter.errors());
}

#[tokio::test]
async fn test_response_header_injection() {
    let origin = TestOrigin::start().await;
    let config = Config {
        services: vec![ServiceConfig {
            name: "api".into(),
            kind: external_to(&origin, HttpOptions::default()),
        }],
        sockets: vec![SocketConfig {
            name: "main".into(),
            address: None,
            service: ServiceRef::new("api"),
            http: Some(HttpOptions {
                inject_response_headers: vec![
                    HeaderInjection {
                        name: "Server".into(),
                        value: Some("gatehouse".into()),
                    },
                    HeaderInjection {
                        name: "X-Origin".into(),
                        value: None,
                    },
                ],
                ..Default::default()
            }),
            https: None,
        }],
    };
    let server = TestServer::start(config, EchoScriptFactory::new()).await;

    let (status, headers, _) = http_request(
        server.addr,
        Method::GET,
        "/",
        &[("host", "srv")],
        Bytes::new(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers.get("server").unwrap(), "gatehouse");
    assert!(
        headers.get("x-origin").is_none(),
        "response injection strips the origin marker"
    );
}

#[tokio::test]
async fn test_worker_subrequest_through_service_binding() {
    // A worker bound to an external service reaches it through channel 2
    // (0 and 1 are reserved for the global outbound).
    let origin = TestOrigin::start().await;
    let config = Config {
        services: vec![
            ServiceConfig {
                name: "api".into(),
                kind: external_to(&origin, HttpOptions::default()),
            },
            ServiceConfig {
                name: "w".into(),
                kind: worker(vec![BindingConfig {
                    name: "out".into(),
                    service: Some(ServiceRef::new("api")),
                    ..Default::default()
                }]),
            },
        ],
        sockets: vec![socket_to(ServiceRef::new("w"))],
    };
    let server = TestServer::start(config, EchoScriptFactory::new()).await;

    let (status, _, body) = http_request(
        server.addr,
        Method::GET,
        "/",
        &[
            ("host", "w"),
            ("x-call-binding", "out"),
            ("x-sub-url", "http://api.internal/sub/path"),
        ],
        Bytes::new(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, Bytes::from_static(b"origin-ok"));

    let seen = origin.last_request();
    assert_eq!(seen.target, "/sub/path");
    assert_eq!(seen.header("host"), Some("api.internal"));
    assert!(server.reporter.is_empty(), "{:?}", server.reporter.errors());
}

#[tokio::test]
async fn test_listener_synthesizes_client_ip_blob() {
    let config = Config {
        services: vec![ServiceConfig {
            name: "w".into(),
            kind: worker(Vec::new()),
        }],
        sockets: vec![socket_to(ServiceRef::new("w"))],
    };
    let server = TestServer::start(config, EchoScriptFactory::new()).await;

    let (status, body) = get(server.addr, "/", "w").await;
    assert_eq!(status, StatusCode::OK);
    let echo: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(echo["cfBlob"], "{\"clientIp\":\"127.0.0.1\"}");
    assert_eq!(echo["url"], "http://w/");
}

#[tokio::test]
async fn test_configured_blob_header_wins_and_is_consumed() {
    // With cfBlobHeader configured the listener must not synthesize a
    // blob; the inbound header value is extracted instead.
    let config = Config {
        services: vec![ServiceConfig {
            name: "w".into(),
            kind: worker(Vec::new()),
        }],
        sockets: vec![SocketConfig {
            name: "main".into(),
            address: None,
            service: ServiceRef::new("w"),
            http: Some(HttpOptions {
                cf_blob_header: Some("CF-Blob".into()),
                ..Default::default()
            }),
            https: None,
        }],
    };
    let server = TestServer::start(config, EchoScriptFactory::new()).await;

    let (_, _, body) = http_request(
        server.addr,
        Method::GET,
        "/",
        &[("host", "w"), ("cf-blob", "{\"custom\":1}")],
        Bytes::new(),
    )
    .await;
    let echo: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(echo["cfBlob"], "{\"custom\":1}");

    // Without the header there is no blob at all.
    let (_, body) = get(server.addr, "/", "w").await;
    let echo: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(echo["cfBlob"], serde_json::Value::Null);
}

#[tokio::test]
async fn test_blob_propagates_to_external_blob_header() {
    // The listener-synthesized blob rides the configured header on the way
    // to the origin.
    let origin = TestOrigin::start().await;
    let config = Config {
        services: vec![ServiceConfig {
            name: "api".into(),
            kind: external_to(
                &origin,
                HttpOptions {
                    cf_blob_header: Some("CF-Blob".into()),
                    ..Default::default()
                },
            ),
        }],
        sockets: vec![socket_to(ServiceRef::new("api"))],
    };
    let server = TestServer::start(config, EchoScriptFactory::new()).await;

    let (status, _) = get(server.addr, "/", "srv").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        origin.last_request().header("cf-blob"),
        Some("{\"clientIp\":\"127.0.0.1\"}")
    );
}

#[tokio::test]
async fn test_unknown_service_reference_still_binds_socket() {
    let config = Config {
        services: Vec::new(),
        sockets: vec![socket_to(ServiceRef::new("ghost"))],
    };
    let server = TestServer::start(config, EchoScriptFactory::new()).await;

    let errors = server.reporter.errors();
    assert_eq!(errors.len(), 1, "{errors:?}");
    assert!(errors[0].contains("Socket \"main\" refers to a service \"ghost\""));

    // The socket still answers; every request fails loudly.
    let (status, _) = get(server.addr, "/", "srv").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn test_duplicate_service_names_report_once_and_first_wins() {
    let origin = TestOrigin::start().await;
    let config = Config {
        services: vec![
            ServiceConfig {
                name: "dup".into(),
                kind: external_to(&origin, HttpOptions::default()),
            },
            ServiceConfig {
                name: "dup".into(),
                kind: worker(Vec::new()),
            },
        ],
        sockets: vec![socket_to(ServiceRef::new("dup"))],
    };
    let server = TestServer::start(config, EchoScriptFactory::new()).await;

    let duplicate_errors: Vec<_> = server
        .reporter
        .errors()
        .into_iter()
        .filter(|e| e.contains("multiple services named \"dup\""))
        .collect();
    assert_eq!(duplicate_errors.len(), 1);

    // First insertion (the external service) wins.
    let (status, body) = get(server.addr, "/", "srv").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, Bytes::from_static(b"origin-ok"));
}

#[tokio::test]
async fn test_socket_override_suppresses_config_address() {
    // The config names a port that is not actually bound; the override
    // (the test harness listener) wins and no unused-override complaint is
    // raised.
    let origin = TestOrigin::start().await;
    let config = Config {
        services: vec![ServiceConfig {
            name: "api".into(),
            kind: external_to(&origin, HttpOptions::default()),
        }],
        sockets: vec![SocketConfig {
            name: "main".into(),
            address: Some("*:1".into()),
            service: ServiceRef::new("api"),
            http: None,
            https: None,
        }],
    };
    let server = TestServer::start(config, EchoScriptFactory::new()).await;

    let (status, _) = get(server.addr, "/", "srv").await;
    assert_eq!(status, StatusCode::OK);
    assert!(server.reporter.is_empty(), "{:?}", server.reporter.errors());
}

#[tokio::test]
async fn test_unmatched_overrides_are_reported() {
    let config = Config {
        services: vec![ServiceConfig {
            name: "w".into(),
            kind: worker(Vec::new()),
        }],
        sockets: vec![socket_to(ServiceRef::new("w"))],
    };
    let server = TestServer::start_with(config, |server| {
        server
            .override_external_addr("nosuch-external", "127.0.0.1:1")
            .override_directory_path("nosuch-dir", "/tmp")
            .override_socket_addr("nosuch-socket", "*:1")
    })
    .await;

    let errors = server.reporter.errors();
    assert!(errors
        .iter()
        .any(|e| e.contains("any socket named \"nosuch-socket\"")));
    assert!(errors
        .iter()
        .any(|e| e.contains("any external service named \"nosuch-external\"")));
    assert!(errors
        .iter()
        .any(|e| e.contains("any disk service named \"nosuch-dir\"")));
}

#[tokio::test]
async fn test_named_entrypoint_reaches_worker() {
    let config = Config {
        services: vec![ServiceConfig {
            name: "w".into(),
            kind: worker(Vec::new()),
        }],
        sockets: vec![socket_to(ServiceRef::with_entrypoint("w", "admin"))],
    };
    let server = TestServer::start(
        config,
        EchoScriptFactory::with_entrypoints(vec!["admin"]),
    )
    .await;

    let (status, body) = get(server.addr, "/", "w").await;
    assert_eq!(status, StatusCode::OK);
    let echo: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(echo["entrypoint"], "admin");
    assert!(server.reporter.is_empty(), "{:?}", server.reporter.errors());
}

#[tokio::test]
async fn test_unknown_entrypoint_is_a_config_error() {
    let config = Config {
        services: vec![ServiceConfig {
            name: "w".into(),
            kind: worker(Vec::new()),
        }],
        sockets: vec![socket_to(ServiceRef::with_entrypoint("w", "missing"))],
    };
    let server = TestServer::start(config, EchoScriptFactory::new()).await;

    assert!(server
        .reporter
        .errors()
        .iter()
        .any(|e| e.contains("has no such named entrypoint")));
    let (status, _) = get(server.addr, "/", "w").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn test_implicit_internet_service_allows_public_only() {
    // "internet" resolves without being declared, and loopback peers are
    // outside its allow rules.
    let config = Config {
        services: Vec::new(),
        sockets: vec![SocketConfig {
            name: "main".into(),
            address: None,
            service: ServiceRef::new("internet"),
            http: Some(HttpOptions {
                style: HttpStyle::Proxy,
                ..Default::default()
            }),
            https: None,
        }],
    };
    let server = TestServer::start(config, EchoScriptFactory::new()).await;
    assert!(server.reporter.is_empty(), "{:?}", server.reporter.errors());

    let (status, _, _) = http_request(
        server.addr,
        Method::GET,
        "http://127.0.0.1:39999/",
        &[("host", "127.0.0.1:39999")],
        Bytes::new(),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_worker_global_outbound_defaults_to_internet() {
    // A worker with no explicit globalOutbound builds cleanly against the
    // implicit service.
    let config = Config {
        services: vec![ServiceConfig {
            name: "w".into(),
            kind: worker(Vec::new()),
        }],
        sockets: vec![socket_to(ServiceRef::new("w"))],
    };
    let server = TestServer::start(config, EchoScriptFactory::new()).await;
    assert!(server.reporter.is_empty(), "{:?}", server.reporter.errors());

    let (status, _) = get(server.addr, "/", "w").await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_missing_host_header_is_400() {
    let config = Config {
        services: vec![ServiceConfig {
            name: "w".into(),
            kind: worker(Vec::new()),
        }],
        sockets: vec![socket_to(ServiceRef::new("w"))],
    };
    let server = TestServer::start(config, EchoScriptFactory::new()).await;

    let (status, _, _) =
        http_request(server.addr, Method::GET, "/", &[], Bytes::new()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_external_without_address_is_poisoned() {
    let config = Config {
        services: vec![ServiceConfig {
            name: "api".into(),
            kind: ServiceKind::External(ExternalConfig::default()),
        }],
        sockets: vec![socket_to(ServiceRef::new("api"))],
    };
    let server = TestServer::start(config, EchoScriptFactory::new()).await;

    assert!(server.reporter.errors().iter().any(|e| {
        e.contains("External service \"api\" has no address")
            && e.contains("--external-addr")
    }));
    let (status, _) = get(server.addr, "/", "srv").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
}
