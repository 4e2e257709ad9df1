use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::{Duration as ChronoDuration, Utc};
use route_tracker::api::rest::router;
use route_tracker::cache::MemoryCache;
use route_tracker::models::route::{Route, RouteStatus};
use route_tracker::remote::{InMemoryRemote, RemoteOp};
use route_tracker::sensor::{ChannelSensor, WatchOptions};
use route_tracker::state::{AppState, StateOptions};
use serde_json::{json, Value};
use tower::ServiceExt;

struct TestApp {
    app: axum::Router,
    state: Arc<AppState>,
    remote: Arc<InMemoryRemote>,
    sensor: Arc<ChannelSensor>,
}

fn setup() -> TestApp {
    let remote = Arc::new(InMemoryRemote::new());
    let sensor = Arc::new(ChannelSensor::new(64));
    let options = StateOptions {
        watch: WatchOptions {
            high_accuracy: true,
            maximum_age: Duration::from_secs(5),
            timeout: Duration::from_millis(50),
        },
        ..StateOptions::default()
    };
    let state = Arc::new(AppState::new(
        remote.clone(),
        Arc::new(MemoryCache::new()),
        sensor.clone(),
        options,
    ));

    TestApp {
        app: router(state.clone()),
        state,
        remote,
        sensor,
    }
}

fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_string(&body).unwrap()))
        .unwrap()
}

fn get_request(uri: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

fn post_empty(uri: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn body_string(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

async fn create_route(app: &axum::Router, id: &str, vehicle: Option<&str>) -> Value {
    let res = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/routes",
            json!({
                "id": id,
                "origin": "Hamburg Depot",
                "destination": "Berlin Hub",
                "distance_km": 289.5,
                "price": 740.0,
                "vehicle_id": vehicle
            }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    body_json(res).await
}

fn fix_at(offset_secs: i64, lat: f64) -> Value {
    json!({
        "latitude": lat,
        "longitude": 9.99,
        "heading": 45.0,
        "speed": null,
        "timestamp": (Utc::now() + ChronoDuration::seconds(offset_secs)).to_rfc3339()
    })
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not met in time");
}

#[tokio::test]
async fn health_returns_ok() {
    let t = setup();
    let response = t.app.oneshot(get_request("/health")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["routes"], 0);
    assert_eq!(body["pending_writes"], 0);
    assert!(body["active_route"].is_null());
    assert_eq!(body["tracking"], false);
}

#[tokio::test]
async fn metrics_returns_prometheus_format() {
    let t = setup();
    let response = t.app.oneshot(get_request("/metrics")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let content_type = response
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(content_type.contains("text/plain"));

    let body = body_string(response).await;
    assert!(body.contains("pending_writes"));
}

#[tokio::test]
async fn create_route_returns_pending() {
    let t = setup();
    let body = create_route(&t.app, "R1", None).await;

    assert_eq!(body["id"], "R1");
    assert_eq!(body["status"], "Pending");
    assert!(body["start_location"].is_null());
    assert!(body["proof"].is_null());
    assert_eq!(t.remote.route("R1").unwrap().status, RouteStatus::Pending);
}

#[tokio::test]
async fn create_route_generates_id_when_missing() {
    let t = setup();
    let res = t
        .app
        .oneshot(json_request(
            "POST",
            "/routes",
            json!({ "origin": "A", "destination": "B" }),
        ))
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::OK);
    let body = body_json(res).await;
    assert_eq!(body["id"].as_str().unwrap().len(), 36);
}

#[tokio::test]
async fn create_route_empty_origin_returns_400() {
    let t = setup();
    let response = t
        .app
        .oneshot(json_request(
            "POST",
            "/routes",
            json!({ "origin": "  ", "destination": "Berlin" }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn failed_remote_create_is_rolled_back() {
    let t = setup();
    t.remote.fail_on(RemoteOp::CreateRoute);

    let response = t
        .app
        .clone()
        .oneshot(json_request(
            "POST",
            "/routes",
            json!({ "id": "R1", "origin": "A", "destination": "B" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

    let res = t.app.oneshot(get_request("/routes")).await.unwrap();
    let routes = body_json(res).await;
    assert_eq!(routes.as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn start_unknown_route_returns_404() {
    let t = setup();
    let response = t.app.oneshot(post_empty("/routes/ghost/start")).await.unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn finishing_a_pending_route_returns_409() {
    let t = setup();
    create_route(&t.app, "R1", None).await;

    let response = t
        .app
        .oneshot(json_request(
            "POST",
            "/routes/R1/finish",
            json!({ "signature": "AAAA" }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn start_without_gps_fix_still_moves_to_in_progress() {
    let t = setup();
    create_route(&t.app, "R1", None).await;

    let res = t
        .app
        .clone()
        .oneshot(post_empty("/routes/R1/start"))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body = body_json(res).await;
    assert_eq!(body["status"], "InProgress");
    assert!(body["start_location"].is_null());

    let res = t.app.oneshot(get_request("/session")).await.unwrap();
    let session = body_json(res).await;
    assert_eq!(session["active_route"]["id"], "R1");
    assert!(session["last_error"].is_string());
}

#[tokio::test]
async fn full_delivery_flow() {
    let t = setup();
    create_route(&t.app, "R1", Some("truck-1")).await;

    let res = t
        .app
        .clone()
        .oneshot(json_request("POST", "/sensor/fixes", fix_at(0, 53.55)))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let res = t
        .app
        .clone()
        .oneshot(post_empty("/routes/R1/start"))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let started = body_json(res).await;
    assert_eq!(started["status"], "InProgress");
    assert_eq!(started["start_location"]["lat"], 53.55);
    assert!(t.state.session.snapshot().tracking_enabled);

    for (offset, lat) in [(1, 53.550), (2, 53.551), (11, 53.551), (12, 53.552)] {
        let res = t
            .app
            .clone()
            .oneshot(json_request("POST", "/sensor/fixes", fix_at(offset, lat)))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }

    let remote = t.remote.clone();
    wait_for(move || remote.track("R1").len() == 2).await;
    assert_eq!(t.remote.vehicle("truck-1").unwrap().route_id, "R1");

    let res = t
        .app
        .clone()
        .oneshot(get_request("/routes/R1/track"))
        .await
        .unwrap();
    let track = body_json(res).await;
    assert_eq!(track["state"], "available");
    assert_eq!(track["entries"].as_array().unwrap().len(), 2);

    let res = t
        .app
        .clone()
        .oneshot(post_empty("/routes/R1/request-finish"))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(body_json(res).await["status"], "InProgress");

    let res = t
        .app
        .clone()
        .oneshot(json_request(
            "POST",
            "/routes/R1/finish",
            json!({ "signature": "iVBORw0KGgo=", "client_name": "Berlin Hub" }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let finished = body_json(res).await;
    assert_eq!(finished["status"], "Completed");
    assert_eq!(finished["proof"]["client_name"], "Berlin Hub");

    let res = t.app.clone().oneshot(get_request("/session")).await.unwrap();
    let session = body_json(res).await;
    assert!(session["active_route"].is_null());
    assert_eq!(session["tracking_enabled"], false);
    assert_eq!(t.sensor.watcher_count(), 0);

    let res = t
        .app
        .oneshot(json_request("PATCH", "/routes/R1/rating", json!({ "rating": 5 })))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(body_json(res).await["rating"], 5);
}

#[tokio::test]
async fn reconcile_adopts_remote_in_progress_route() {
    let t = setup();
    let mut route = Route::new("R7", "Bremen", "Hannover");
    route.status = RouteStatus::InProgress;
    route.started_at = Some(Utc::now() - ChronoDuration::minutes(15));
    t.remote.seed_route(route);

    let res = t.app.clone().oneshot(post_empty("/reconcile")).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let outcome = body_json(res).await;
    assert_eq!(outcome["outcome"], "adopted");
    assert_eq!(outcome["route_id"], "R7");
    assert!(outcome["elapsed_secs"].as_u64().unwrap() >= 899);

    let res = t.app.oneshot(get_request("/routes")).await.unwrap();
    let routes = body_json(res).await;
    assert_eq!(routes.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn reconcile_with_remote_down_returns_502() {
    let t = setup();
    t.remote.set_offline(true);

    let res = t.app.oneshot(post_empty("/reconcile")).await.unwrap();
    assert_eq!(res.status(), StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn toggle_tracking_without_active_route_returns_409() {
    let t = setup();
    let res = t.app.oneshot(post_empty("/tracking/toggle")).await.unwrap();

    assert_eq!(res.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn gps_preference_is_stored_in_session() {
    let t = setup();
    let res = t
        .app
        .oneshot(json_request("PATCH", "/session/gps", json!({ "enabled": false })))
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(body_json(res).await["gps_enabled"], false);
    assert!(!t.state.session.snapshot().gps_enabled);
}

#[tokio::test]
async fn delete_route_is_accepted_and_hidden() {
    let t = setup();
    create_route(&t.app, "R1", None).await;
    t.remote.fail_on(RemoteOp::DeleteRoute);

    let res = t
        .app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/routes/R1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::ACCEPTED);

    let res = t.app.oneshot(get_request("/routes")).await.unwrap();
    assert_eq!(body_json(res).await.as_array().unwrap().len(), 0);

    let outbox = t.state.outbox.clone();
    wait_for(move || outbox.has_pending_delete("R1")).await;
}

#[tokio::test]
async fn track_without_history_is_unavailable() {
    let t = setup();
    create_route(&t.app, "R1", None).await;

    let res = t.app.oneshot(get_request("/routes/R1/track")).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(body_json(res).await["state"], "unavailable");
}

#[tokio::test]
async fn out_of_range_fix_returns_400() {
    let t = setup();
    let res = t
        .app
        .oneshot(json_request("POST", "/sensor/fixes", fix_at(0, 123.0)))
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}
