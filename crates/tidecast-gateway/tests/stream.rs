//! End-to-end tests for the event stream routes.

use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, BodyDataStream};
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use futures::StreamExt;
use serde_json::json;
use tidecast_core::{
    encode_event, BrokerConfig, ChangeEvent, ChannelConnection, FeedSender, Filter, Op,
    TailOptions,
};
use tidecast_gateway::{Playback, Playlist};
use tokio::time::{sleep, timeout};
use tower::ServiceExt;

fn expected_frame(op: &Op) -> Vec<u8> {
    let event = ChangeEvent::from_op(op).unwrap();
    encode_event(&event).unwrap().to_vec()
}

fn play(playlist: Playlist) -> (Playback, FeedSender, Arc<ChannelConnection>) {
    let (connection, feed) = ChannelConnection::new(16);
    let connection = Arc::new(connection);
    let playback = playlist.play(
        connection.clone(),
        TailOptions::default(),
        BrokerConfig::default(),
    );
    (playback, feed, connection)
}

async fn open(router: &Router, path: &str) -> BodyDataStream {
    let response = router
        .clone()
        .oneshot(Request::get(path).body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers();
    assert_eq!(headers[header::CONTENT_TYPE], "text/event-stream");
    assert_eq!(headers[header::CACHE_CONTROL], "no-cache");
    assert_eq!(headers[header::CONNECTION], "keep-alive");

    response.into_body().into_data_stream()
}

async fn next_frame(body: &mut BodyDataStream) -> Vec<u8> {
    timeout(Duration::from_secs(5), body.next())
        .await
        .expect("timed out waiting for a frame")
        .expect("stream ended")
        .expect("body error")
        .to_vec()
}

#[tokio::test]
async fn test_stream_delivers_frames() {
    let (playback, feed, _connection) = play(Playlist::new().add("/events", Filter::allow_all()));
    let mut body = open(&playback.router, "/events").await;

    let first = Op::insert("app.users", "u1", json!({"name": "Ada"}));
    let second = Op::delete("app.users", "u1");
    feed.send(first.clone()).await.unwrap();
    feed.send(second.clone()).await.unwrap();

    assert_eq!(next_frame(&mut body).await, expected_frame(&first));
    assert_eq!(next_frame(&mut body).await, expected_frame(&second));
}

#[tokio::test]
async fn test_routes_apply_their_filters() {
    let playlist = Playlist::new()
        .add("/users", Filter::namespace("app.users"))
        .add("/all", Filter::allow_all());
    let (playback, feed, _connection) = play(playlist);

    let mut users = open(&playback.router, "/users").await;
    let mut all = open(&playback.router, "/all").await;

    let post = Op::insert("app.posts", "p1", json!({"title": "hello"}));
    let user = Op::insert("app.users", "u1", json!({"name": "Ada"}));
    feed.send(post.clone()).await.unwrap();
    feed.send(user.clone()).await.unwrap();

    assert_eq!(next_frame(&mut users).await, expected_frame(&user));
    assert_eq!(next_frame(&mut all).await, expected_frame(&post));
    assert_eq!(next_frame(&mut all).await, expected_frame(&user));
}

#[tokio::test]
async fn test_disconnect_deregisters_and_releases_copy() {
    let (playback, _feed, connection) = play(Playlist::new().add("/events", Filter::allow_all()));
    let body = open(&playback.router, "/events").await;

    assert_eq!(playback.broker.stats().await.unwrap().subscribers, 1);
    assert_eq!(connection.open_copies(), 1);

    drop(body);

    timeout(Duration::from_secs(5), async {
        loop {
            let stats = playback.broker.stats().await.unwrap();
            if stats.subscribers == 0 && connection.open_copies() == 0 {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("session was not cleaned up");
}

#[tokio::test]
async fn test_later_add_replaces_filter() {
    let playlist = Playlist::new()
        .add("/events", Filter::namespace("app.users"))
        .add("/events", Filter::namespace("app.posts"));
    let (playback, feed, _connection) = play(playlist);
    let mut body = open(&playback.router, "/events").await;

    let user = Op::insert("app.users", "u1", json!({}));
    let post = Op::insert("app.posts", "p1", json!({}));
    feed.send(user).await.unwrap();
    feed.send(post.clone()).await.unwrap();

    assert_eq!(next_frame(&mut body).await, expected_frame(&post));
}

#[tokio::test]
async fn test_unknown_route_is_404() {
    let (playback, _feed, _connection) = play(Playlist::new().add("/events", Filter::allow_all()));

    let response = playback
        .router
        .oneshot(Request::get("/nope").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_stream_routes_only_accept_get() {
    let (playback, _feed, _connection) = play(Playlist::new().add("/events", Filter::allow_all()));

    let response = playback
        .router
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri("/events")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn test_route_can_claim_health_path() {
    let (playback, _feed, _connection) = play(Playlist::new().add("/health", Filter::allow_all()));

    let body = open(&playback.router, "/health").await;
    drop(body);
}
