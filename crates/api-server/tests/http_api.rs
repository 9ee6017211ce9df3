use adserve_api::{router, AppState};
use adserve_core::types::{
    Campaign, CampaignStatus, DeliveryStats, Placement, PlacementLink, PlacementStatus,
};
use adserve_core::TargetingRules;
use adserve_engine::{EngineParts, EngineSettings, ServingEngine};
use adserve_store::MemoryStore;
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tower::ServiceExt;

fn campaign(id: i64, remaining: f64) -> Campaign {
    Campaign {
        id,
        advertiser_id: 1,
        creative_payload: r#"{"type":"html","content":{"markup":"<b>Spring sale</b>"}}"#.to_string(),
        target_url: "https://shop.example.com/spring".to_string(),
        status: CampaignStatus::Approved,
        starts_at: None,
        ends_at: None,
        total_budget: 10.0,
        daily_budget: None,
        remaining_budget: remaining,
        cost_per_impression: 0.01,
        cost_per_click: 0.1,
        targeting: TargetingRules::default(),
        stats: DeliveryStats::default(),
    }
}

fn app() -> (Arc<MemoryStore>, Router) {
    let store = Arc::new(MemoryStore::new());
    for (id, remaining) in [(1, 10.0), (2, 0.0)] {
        store.upsert_placement(Placement {
            id,
            publisher_id: 7,
            width: 728,
            height: 90,
            status: PlacementStatus::Active,
        });
        store.upsert_campaign(campaign(id, remaining));
        store.link(PlacementLink {
            campaign_id: id,
            placement_id: id,
            active: true,
        });
    }

    let engine = ServingEngine::with_rng(
        EngineParts::from_store(store.clone()),
        EngineSettings {
            click_base_url: "http://ads.test".to_string(),
            ..Default::default()
        },
        StdRng::seed_from_u64(5),
    );
    let state = AppState {
        engine: Arc::new(engine),
        node_id: "test-node".to_string(),
        start_time: Instant::now(),
    };
    (store, router(state))
}

async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_serve_returns_creative_and_click_url() {
    let (store, app) = app();
    let (status, body) = send(app, get("/v1/serve?position=1")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "success");
    let data = &body["data"];
    assert_eq!(data["id"], 1);
    assert_eq!(data["type"], "html");
    assert_eq!(data["content"]["markup"], "<b>Spring sale</b>");
    assert_eq!(data["position"]["width"], 728);

    let impression_id = data["impression_id"].as_str().unwrap();
    assert_eq!(
        data["click_url"],
        format!("http://ads.test/v1/track?ad_id=1&impression_id={impression_id}&type=click")
    );
    assert!((store.campaign_snapshot(1).unwrap().remaining_budget - 9.99).abs() < 1e-9);
}

#[tokio::test]
async fn test_serve_body_overrides_position() {
    let (_store, app) = app();
    let request = Request::builder()
        .method("POST")
        .uri("/v1/serve?position=2")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(r#"{"position_id": 1, "context": {"device": "mobile"}}"#))
        .unwrap();
    let (status, body) = send(app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["position"]["id"], 1);
}

#[tokio::test]
async fn test_serve_error_statuses() {
    let (_store, app) = app();

    let (status, body) = send(app.clone(), get("/v1/serve")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status"], "error");

    // Exhausted campaign: normal "no ad" outcome.
    let (status, body) = send(app.clone(), get("/v1/serve?position=2")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["message"], "No eligible ad available");

    let (status, _) = send(app.clone(), get("/v1/serve?position=99")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let request = Request::builder()
        .method("POST")
        .uri("/v1/serve")
        .body(Body::from("{not json"))
        .unwrap();
    let (status, _) = send(app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_click_redirects_with_tracking_params() {
    let (store, app) = app();
    let (_, body) = send(app.clone(), get("/v1/serve?position=1")).await;
    let impression_id = body["data"]["impression_id"].as_str().unwrap().to_string();

    let response = app
        .oneshot(get(&format!(
            "/v1/track?ad_id=1&impression_id={impression_id}&type=click"
        )))
        .await
        .unwrap();
    assert!(response.status().is_redirection());
    let location = response.headers()[header::LOCATION].to_str().unwrap();
    assert!(location.starts_with("https://shop.example.com/spring?"));
    assert!(location.contains("utm_campaign=1"));
    assert!(location.contains(&format!("ad_click_id={impression_id}")));

    let snapshot = store.campaign_snapshot(1).unwrap();
    assert_eq!(snapshot.stats.clicks, 1);
    assert!((snapshot.remaining_budget - 9.89).abs() < 1e-9);
}

#[tokio::test]
async fn test_click_with_unknown_impression_still_redirects() {
    let (store, app) = app();
    let response = app
        .oneshot(get(
            "/v1/track?ad_id=1&impression_id=7f1c3e2a-9d6b-4c1e-8a55-0b2f6d9e4c11&type=click",
        ))
        .await
        .unwrap();
    assert!(response.status().is_redirection());
    assert_eq!(store.event_count(), 0);
}

#[tokio::test]
async fn test_conversion_requires_known_impression() {
    let (_store, app) = app();

    let (status, _) = send(app.clone(), get("/v1/track?ad_id=1&type=conversion")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        app.clone(),
        get("/v1/track?ad_id=1&impression_id=7f1c3e2a-9d6b-4c1e-8a55-0b2f6d9e4c11&type=conversion"),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, served) = send(app.clone(), get("/v1/serve?position=1")).await;
    let impression_id = served["data"]["impression_id"].as_str().unwrap();
    let (status, body) = send(
        app,
        get(&format!("/v1/track?ad_id=1&impression_id={impression_id}&type=conversion")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["type"], "conversion");
}

#[tokio::test]
async fn test_unknown_tracking_type_is_rejected() {
    let (_store, app) = app();
    let (status, body) = send(app, get("/v1/track?ad_id=1&type=hover")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status"], "error");
}

#[tokio::test]
async fn test_eligible_query_does_not_charge() {
    let (store, app) = app();
    let (status, body) = send(app, get("/v1/placements/1/eligible")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["id"], 1);
    assert_eq!(store.event_count(), 0);
    assert!((store.campaign_snapshot(1).unwrap().remaining_budget - 10.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_operational_endpoints() {
    let (_store, app) = app();
    let (status, body) = send(app.clone(), get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["node_id"], "test-node");

    let (status, _) = send(app.clone(), get("/ready")).await;
    assert_eq!(status, StatusCode::OK);

    let (status, doc) = send(app, get("/api-docs/openapi.json")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(doc["paths"]["/v1/serve"].is_object());
}
