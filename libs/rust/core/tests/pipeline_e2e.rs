/// End-to-end runs against an in-process HTTP gateway and registry.
/// Run with: cargo test --test pipeline_e2e

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use parking_lot::Mutex;

use fedagg_core::config::GatewayConfig;
use fedagg_core::crypto::{seal, KEY_LEN};
use fedagg_core::package::encode_package;
use fedagg_core::*;

#[derive(Clone, Default)]
struct Gateway {
    blobs: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    unavailable_first: Arc<Mutex<HashMap<String, usize>>>,
    stalled: Arc<Mutex<HashSet<String>>>,
    endless: Arc<Mutex<HashSet<String>>>,
    registry: Arc<Mutex<HashMap<String, Vec<ParticipantReference>>>>,
    hits: Arc<AtomicUsize>,
}

async fn ipfs(State(gw): State<Gateway>, Path(hash): Path<String>) -> Response {
    gw.hits.fetch_add(1, Ordering::SeqCst);
    let stalled = gw.stalled.lock().contains(&hash);
    if stalled {
        tokio::time::sleep(Duration::from_secs(5)).await;
    }
    let endless = gw.endless.lock().contains(&hash);
    if endless {
        // chunked, no Content-Length, never ends
        let chunks = futures::stream::repeat_with(|| Ok::<_, std::io::Error>(vec![0u8; 64 * 1024]));
        return Body::from_stream(chunks).into_response();
    }
    {
        let mut pending = gw.unavailable_first.lock();
        if let Some(n) = pending.get_mut(&hash) {
            if *n > 0 {
                *n -= 1;
                return StatusCode::SERVICE_UNAVAILABLE.into_response();
            }
        }
    }
    match gw.blobs.lock().get(&hash) {
        Some(bytes) => (StatusCode::OK, bytes.clone()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn participants(State(gw): State<Gateway>, Path(model): Path<String>) -> Response {
    match gw.registry.lock().get(&model) {
        Some(refs) => Json(refs.clone()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn serve(gw: Gateway) -> String {
    let app = Router::new()
        .route("/ipfs/:hash", get(ipfs))
        .route("/models/:model/participants", get(participants))
        .with_state(gw);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn package(predictions: Vec<f64>, n_estimators: u32, max_depth: MaxDepth) -> ModelParameterPackage {
    ModelParameterPackage {
        predictions,
        feature_importances: vec![0.4, 0.3, 0.3],
        n_estimators,
        max_features: MaxFeatures::Named("sqrt".into()),
        max_depth,
    }
}

fn publish(gw: &Gateway, id: &str, pkg: &ModelParameterPackage) -> ParticipantReference {
    let mut raw = [0u8; KEY_LEN];
    for (i, b) in id.bytes().cycle().take(KEY_LEN).enumerate() {
        raw[i] = b.wrapping_add(i as u8);
    }
    let key = SymmetricKey::from_bytes(raw);
    let blob = seal(&encode_package(pkg).unwrap(), &key).unwrap();
    let hash = format!("bafy{id}");
    gw.blobs.lock().insert(hash.clone(), blob);
    ParticipantReference {
        participant_id: id.to_string(),
        content_hash: ContentHash::parse(&hash).unwrap(),
        key_material: key.to_material(),
    }
}

fn dataset() -> Arc<LabeledDataset> {
    let mut csv = String::from("V1,V2,Amount,Class\n");
    for i in 0..100 {
        csv.push_str(&format!("{},{},{}.5,{}\n", i % 10, (i * 7) % 13, i, u8::from(i % 10 >= 7)));
    }
    Arc::new(LabeledDataset::from_reader(csv.as_bytes(), "Class").unwrap())
}

fn gateway_config(base_url: &str) -> GatewayConfig {
    GatewayConfig {
        base_url: base_url.to_string(),
        timeout_secs: 1,
        retry_attempts: 2,
        retry_base_delay_ms: 10,
        retry_max_delay_ms: 50,
        ..GatewayConfig::default()
    }
}

fn pipeline(base_url: &str, refs: Vec<ParticipantReference>) -> FederationPipeline {
    let gateway = HttpGateway::new(&gateway_config(base_url)).unwrap();
    let locator = Arc::new(StaticRegistry::from_entries([("fraud-rf".to_string(), refs)]));
    FederationPipeline::new(locator, SecureRetriever::new(Arc::new(gateway)), Evaluator::default())
}

// Policy under test: participants with an unbounded max_depth are excluded from
// the depth mean, so [10, 20, unbounded] aggregates to 15.
#[tokio::test]
async fn test_three_participants_aggregate_with_unbounded_depth_excluded() {
    let gw = Gateway::default();
    let refs = vec![
        publish(&gw, "bank1", &package(vec![0.1, 0.9], 100, MaxDepth::Limited(10))),
        publish(&gw, "bank2", &package(vec![0.3, 0.7], 150, MaxDepth::Limited(20))),
        publish(&gw, "bank3", &package(vec![0.2, 0.8], 200, MaxDepth::Unbounded)),
    ];
    let base = serve(gw).await;

    let report = pipeline(&base, refs).run("fraud-rf", dataset()).await.unwrap();
    assert_eq!(report.spec.n_estimators, 150);
    assert_eq!(report.spec.max_depth, MaxDepth::Limited(15));
    assert!((report.spec.predictions[0] - 0.2).abs() < 1e-12);
    assert!((report.spec.predictions[1] - 0.8).abs() < 1e-12);
    assert_eq!(report.spec.participants, vec!["bank1", "bank2", "bank3"]);
    assert_eq!(report.metrics.test_samples, 20);
    assert_eq!(report.history.last().map(|t| t.state), Some(RunState::Evaluated));

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["spec"]["max_depth"], 15);
    assert!(json["run_id"].is_string());
    assert!(json["metrics"]["f1"].is_number());
}

#[tokio::test]
async fn test_missing_blob_is_bad_status_without_retry() {
    let gw = Gateway::default();
    let known = publish(&gw, "bank1", &package(vec![0.5], 10, MaxDepth::Limited(4)));
    let refs = vec![ParticipantReference {
        participant_id: "bank9".into(),
        content_hash: ContentHash::parse("bafymissing").unwrap(),
        key_material: known.key_material,
    }];
    let hits = gw.hits.clone();
    let base = serve(gw).await;

    let failure = pipeline(&base, refs).run("fraud-rf", dataset()).await.unwrap_err();
    assert_eq!(failure.stage, Stage::Fetch);
    assert_eq!(failure.kind, "bad-status");
    assert_eq!(failure.participant.as_deref(), Some("bank9"));
    // 404 is final, no retry
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_transient_unavailability_is_retried() {
    let gw = Gateway::default();
    let refs = vec![publish(&gw, "bank1", &package(vec![0.5], 10, MaxDepth::Limited(4)))];
    gw.unavailable_first.lock().insert("bafybank1".into(), 2);
    let hits = gw.hits.clone();
    let base = serve(gw).await;

    let report = pipeline(&base, refs).run("fraud-rf", dataset()).await.unwrap();
    assert_eq!(report.spec.participants, vec!["bank1"]);
    assert_eq!(hits.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_stalled_gateway_times_out() {
    let gw = Gateway::default();
    let refs = vec![publish(&gw, "slow", &package(vec![0.5], 10, MaxDepth::Limited(4)))];
    gw.stalled.lock().insert("bafyslow".into());
    let base = serve(gw).await;

    let mut cfg = gateway_config(&base);
    cfg.retry_attempts = 0;
    let gateway = HttpGateway::new(&cfg).unwrap();
    let locator = Arc::new(StaticRegistry::from_entries([("fraud-rf".to_string(), refs)]));
    let p = FederationPipeline::new(locator, SecureRetriever::new(Arc::new(gateway)), Evaluator::default());

    let failure = p.run("fraud-rf", dataset()).await.unwrap_err();
    assert_eq!((failure.stage, failure.kind), (Stage::Fetch, "timeout"));
}

#[tokio::test]
async fn test_oversized_blob_is_rejected() {
    let gw = Gateway::default();
    let refs = vec![publish(&gw, "big", &package(vec![0.5; 64], 10, MaxDepth::Limited(4)))];
    let base = serve(gw).await;

    let mut cfg = gateway_config(&base);
    cfg.max_blob_bytes = 32;
    let gateway = HttpGateway::new(&cfg).unwrap();
    let err = SecureRetriever::new(Arc::new(gateway)).retrieve(&refs[0]).await.unwrap_err();
    assert_eq!(err.kind(), "too-large");
}

#[tokio::test]
async fn test_unbounded_chunked_body_is_cut_off_at_the_limit() {
    let gw = Gateway::default();
    let refs = vec![publish(&gw, "flood", &package(vec![0.5], 10, MaxDepth::Limited(4)))];
    gw.endless.lock().insert("bafyflood".into());
    let base = serve(gw).await;

    let mut cfg = gateway_config(&base);
    cfg.max_blob_bytes = 1024;
    cfg.timeout_secs = 5;
    cfg.retry_attempts = 0;
    let gateway = HttpGateway::new(&cfg).unwrap();
    let started = std::time::Instant::now();
    let err = SecureRetriever::new(Arc::new(gateway)).retrieve(&refs[0]).await.unwrap_err();
    assert_eq!(err.kind(), "too-large");
    assert!(started.elapsed() < Duration::from_secs(5), "took {:?}", started.elapsed());
}

#[tokio::test]
async fn test_quorum_mode_drops_unreachable_participant() {
    let gw = Gateway::default();
    let mut refs = vec![
        publish(&gw, "bank1", &package(vec![0.2], 100, MaxDepth::Limited(8))),
        publish(&gw, "bank2", &package(vec![0.6], 300, MaxDepth::Limited(12))),
    ];
    refs.insert(1, ParticipantReference {
        participant_id: "bank-gone".into(),
        content_hash: ContentHash::parse("bafygone").unwrap(),
        key_material: refs[0].key_material.clone(),
    });
    let base = serve(gw).await;

    let report = pipeline(&base, refs.clone()).with_quorum(Some(2)).run("fraud-rf", dataset()).await.unwrap();
    assert_eq!(report.spec.participants, vec!["bank1", "bank2"]);
    assert_eq!(report.spec.n_estimators, 200);
    assert_eq!(report.excluded.len(), 1);
    assert_eq!(report.excluded[0].participant_id, "bank-gone");
    assert_eq!(report.excluded[0].kind, "bad-status");

    let failure = pipeline(&base, refs).with_quorum(Some(3)).run("fraud-rf", dataset()).await.unwrap_err();
    assert_eq!(failure.kind, "quorum-not-met");
}

#[tokio::test]
async fn test_http_registry_lists_participants_in_order() {
    let gw = Gateway::default();
    let refs = vec![
        publish(&gw, "zeta", &package(vec![0.4], 50, MaxDepth::Limited(6))),
        publish(&gw, "alpha", &package(vec![0.6], 70, MaxDepth::Limited(6))),
    ];
    gw.registry.lock().insert("fraud-rf".into(), refs);
    let base = serve(gw).await;

    let registry = Arc::new(HttpRegistry::new(base.as_str(), Duration::from_secs(2)).unwrap());
    let located: Vec<_> = registry.locate("fraud-rf").await.unwrap().into_iter().map(|r| r.participant_id).collect();
    assert_eq!(located, vec!["zeta", "alpha"]);
    assert!(matches!(registry.locate("nope").await, Err(fedagg_core::error::LocatorFailure::UnknownModel(_))));

    let gateway = HttpGateway::new(&gateway_config(&base)).unwrap();
    let p = FederationPipeline::new(registry, SecureRetriever::new(Arc::new(gateway)), Evaluator::default());
    let report = p.run("fraud-rf", dataset()).await.unwrap();
    assert_eq!(report.spec.n_estimators, 60);
}
