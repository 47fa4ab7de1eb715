use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
};
use chrono::Utc;
use serde_json::{json, Value};
use tower::ServiceExt;

use asset_recon::{
    models::{HostFacts, HostObservation, Port, SourceName},
    repositories::AssetRepository,
};

mod common;
use common::{create_test_app, extract_body, wait_for_run, SCAN_REPORT};

async fn seed(state: &asset_recon::AppState, org: &str, domain: &str, port: u16) {
    let observation = HostObservation::new(
        org,
        domain,
        SourceName::Shodan,
        Utc::now(),
        HostFacts {
            ip: Some("10.0.0.1".into()),
            ports: vec![Port::new("tcp", port).with_state("open")],
            ..Default::default()
        },
    );
    let report = state.ingestion.ingest_observations(org, vec![observation]).await;
    assert_eq!(report.hosts_created, 1);
}

fn json_request(method: Method, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_health_endpoint() {
    let (app, _, _) = create_test_app();

    let response = app
        .oneshot(Request::builder().uri("/api/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-request-id"));
    let json: Value = serde_json::from_slice(&extract_body(response).await).unwrap();
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["checks"]["store"]["backend"], "memory");
}

#[tokio::test]
async fn test_list_assets_is_scoped_to_organization() {
    let (app, state, _) = create_test_app();
    seed(&state, "org1", "a.example.com", 80).await;
    seed(&state, "org2", "b.example.org", 80).await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/organizations/org1/assets")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json: Value = serde_json::from_slice(&extract_body(response).await).unwrap();
    assert_eq!(json["total_count"], 1);
    assert_eq!(json["assets"][0]["domain"], "a.example.com");
}

#[tokio::test]
async fn test_update_asset_records_manual_edit() {
    let (app, state, repo) = create_test_app();
    seed(&state, "org1", "a.example.com", 80).await;
    let asset = repo.find_by_key("org1", "a.example.com").await.unwrap().unwrap();

    let response = app
        .oneshot(json_request(
            Method::PUT,
            &format!("/api/organizations/org1/assets/{}", asset.id),
            json!({ "ip": "192.0.2.10" }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let stored = repo.find_by_key("org1", "a.example.com").await.unwrap().unwrap();
    assert_eq!(stored.ip_value(), Some("192.0.2.10"));
    assert_eq!(stored.ip.as_ref().map(|t| t.source), Some(SourceName::Manual));
    assert!(stored.port("tcp", 80).is_some());
}

#[tokio::test]
async fn test_update_asset_rejects_empty_and_unknown() {
    let (app, state, repo) = create_test_app();
    seed(&state, "org1", "a.example.com", 80).await;
    let asset = repo.find_by_key("org1", "a.example.com").await.unwrap().unwrap();

    let empty = app
        .clone()
        .oneshot(json_request(
            Method::PUT,
            &format!("/api/organizations/org1/assets/{}", asset.id),
            json!({}),
        ))
        .await
        .unwrap();
    assert_eq!(empty.status(), StatusCode::BAD_REQUEST);

    // another organization cannot see the asset
    let foreign = app
        .oneshot(json_request(
            Method::PUT,
            &format!("/api/organizations/org2/assets/{}", asset.id),
            json!({ "ip": "192.0.2.10" }),
        ))
        .await
        .unwrap();
    assert_eq!(foreign.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_rename_onto_existing_domain_conflicts() {
    let (app, state, repo) = create_test_app();
    seed(&state, "org1", "a.example.com", 80).await;
    seed(&state, "org1", "b.example.com", 443).await;
    let asset = repo.find_by_key("org1", "a.example.com").await.unwrap().unwrap();

    let response = app
        .oneshot(json_request(
            Method::PUT,
            &format!("/api/organizations/org1/assets/{}", asset.id),
            json!({ "domain": "b.example.com" }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_delete_assets() {
    let (app, state, repo) = create_test_app();
    seed(&state, "org1", "a.example.com", 80).await;
    let asset = repo.find_by_key("org1", "a.example.com").await.unwrap().unwrap();

    let response = app
        .oneshot(json_request(
            Method::DELETE,
            "/api/organizations/org1/assets",
            json!({ "ids": [asset.id, uuid::Uuid::new_v4()] }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json: Value = serde_json::from_slice(&extract_body(response).await).unwrap();
    assert_eq!(json["deleted"], 1);
    assert!(repo.list_by_organization("org1").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_upload_scan_report() {
    let (app, _, repo) = create_test_app();

    let response = app
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri("/api/organizations/org1/scan-reports?domain=example.com")
                .header("content-type", "application/xml")
                .body(Body::from(SCAN_REPORT))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json: Value = serde_json::from_slice(&extract_body(response).await).unwrap();
    assert_eq!(json["hosts_created"], 1);

    let asset = repo.find_by_key("org1", "sub.example.com").await.unwrap().unwrap();
    assert_eq!(asset.ports.len(), 2);
    assert_eq!(asset.os_value(), Some("Linux"));
    assert!(asset.sources.contains_key(&SourceName::Nmap));
}

#[tokio::test]
async fn test_upload_unparseable_report_is_unprocessable() {
    let (app, _, repo) = create_test_app();

    let response = app
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri("/api/organizations/org1/scan-reports?domain=example.com")
                .body(Body::from("this is not xml"))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert!(repo.list_by_organization("org1").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_discovery_lifecycle() {
    let (app, state, _) = create_test_app();

    let idle = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/organizations/org1/discovery")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let json: Value = serde_json::from_slice(&extract_body(idle).await).unwrap();
    assert_eq!(json["status"], "idle");

    let started = app
        .clone()
        .oneshot(json_request(
            Method::POST,
            "/api/organizations/org1/discovery",
            json!({ "root_domain": "example.com" }),
        ))
        .await
        .unwrap();
    assert_eq!(started.status(), StatusCode::OK);

    let status = wait_for_run(&state, "org1").await;
    assert_eq!(status.hosts_probed, 1);

    let stop = app
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri("/api/organizations/org1/discovery/stop")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(stop.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_start_discovery_requires_root_domain() {
    let (app, _, _) = create_test_app();

    let response = app
        .oneshot(json_request(
            Method::POST,
            "/api/organizations/org1/discovery",
            json!({ "root_domain": "  " }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
