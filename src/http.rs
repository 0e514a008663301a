//! [`ChatApi`] over HTTP using `reqwest`.
//!
//! The session credential lives in HttpOnly cookies set by the auth flow, so
//! the client keeps a cookie store. When a request comes back `401`, the
//! client posts to the refresh endpoint once and replays the request. A failed
//! refresh, or a second `401` on the replay, is reported as
//! [`ChatSyncError::SessionExpired`].
//!
//! # Feature gate
//!
//! This module is only available when the `http-api` feature is enabled
//! (it is enabled by default).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::api::ChatApi;
use crate::error::{ChatSyncError, Result};
use crate::protocol::{
    encode_component, CreateRoomRequest, Identity, Message, ProfileResponse, Room, RoomList,
    UserId,
};

const ROOMS_PATH: &str = "/msg/room";
const PROFILE_PATH: &str = "/auth/profile";
const REFRESH_PATH: &str = "/auth/refresh";

fn messages_path(room_id: &str) -> String {
    format!("{ROOMS_PATH}/{}/messages", encode_component(room_id))
}

fn request_error(e: reqwest::Error) -> ChatSyncError {
    if e.is_timeout() {
        ChatSyncError::Timeout
    } else {
        ChatSyncError::Request(e.to_string())
    }
}

/// Cookie-authenticated client for the chat service's HTTP endpoints.
#[derive(Debug, Clone)]
pub struct HttpApi {
    client: reqwest::Client,
    base_url: String,
}

impl HttpApi {
    /// Create a client with its own cookie store.
    ///
    /// # Errors
    ///
    /// Returns [`ChatSyncError::Request`] if the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .cookie_store(true)
            .build()
            .map_err(request_error)?;
        Ok(Self::with_client(client, base_url))
    }

    /// Like [`new`](Self::new), with a bound on connection setup time.
    ///
    /// # Errors
    ///
    /// Returns [`ChatSyncError::Request`] if the HTTP client cannot be built.
    pub fn with_connect_timeout(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .cookie_store(true)
            .connect_timeout(timeout)
            .build()
            .map_err(request_error)?;
        Ok(Self::with_client(client, base_url))
    }

    /// Use an existing `reqwest` client, e.g. one that shares its cookie store
    /// with the login flow.
    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// Exchange the refresh cookie for a new access cookie.
    async fn refresh(&self) -> Result<()> {
        let response = self
            .client
            .post(self.url(REFRESH_PATH))
            .send()
            .await
            .map_err(request_error)?;
        if response.status().is_success() {
            debug!("session refreshed");
            Ok(())
        } else {
            warn!(status = %response.status(), "session refresh rejected");
            Err(ChatSyncError::SessionExpired)
        }
    }

    /// Send a request, replaying it once after a silent refresh on `401`.
    async fn send_authenticated<F>(&self, build: F) -> Result<reqwest::Response>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder + Send + Sync,
    {
        let response = build(&self.client).send().await.map_err(request_error)?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        debug!("credential rejected, attempting silent refresh");
        self.refresh().await?;

        let response = build(&self.client).send().await.map_err(request_error)?;
        if response.status() == StatusCode::UNAUTHORIZED {
            warn!("credential rejected again after refresh");
            return Err(ChatSyncError::SessionExpired);
        }
        Ok(response)
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ChatSyncError::Http {
                status: status.as_u16(),
                message,
            });
        }
        response.json::<T>().await.map_err(request_error)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.url(path);
        let response = self.send_authenticated(|client| client.get(&url)).await?;
        Self::decode(response).await
    }
}

#[async_trait]
impl ChatApi for HttpApi {
    async fn fetch_profile(&self) -> Result<Identity> {
        let profile: ProfileResponse = self.get_json(PROFILE_PATH).await?;
        Ok(profile.user)
    }

    async fn fetch_rooms(&self) -> Result<RoomList> {
        self.get_json(ROOMS_PATH).await
    }

    async fn fetch_messages(&self, room_id: &str) -> Result<Vec<Message>> {
        self.get_json(&messages_path(room_id)).await
    }

    async fn create_room(&self, other_user_id: UserId) -> Result<Room> {
        let url = self.url(ROOMS_PATH);
        let body = CreateRoomRequest { other_user_id };
        let response = self
            .send_authenticated(|client| client.post(&url).json(&body))
            .await?;
        Self::decode(response).await
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use axum::extract::{Path, State};
    use axum::http::StatusCode as AxumStatus;
    use axum::response::IntoResponse;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct Backend {
        authorized: AtomicBool,
        refresh_allowed: AtomicBool,
        refreshes: AtomicUsize,
        room_requests: AtomicUsize,
    }

    type Shared = State<Arc<Backend>>;

    fn rooms_body() -> serde_json::Value {
        json!({
            "rooms": [{
                "id": "r1", "user1Id": 1, "user2Id": 2,
                "messages": [{
                    "id": "m1", "roomId": "r1", "senderId": 2,
                    "content": "hi", "createdAt": "2026-01-01T00:00:00Z"
                }]
            }],
            "token": "ws-token"
        })
    }

    async fn rooms(State(backend): Shared) -> impl IntoResponse {
        backend.room_requests.fetch_add(1, Ordering::SeqCst);
        if backend.authorized.load(Ordering::SeqCst) {
            (AxumStatus::OK, Json(rooms_body())).into_response()
        } else {
            AxumStatus::UNAUTHORIZED.into_response()
        }
    }

    async fn create(State(backend): Shared, Json(body): Json<serde_json::Value>) -> impl IntoResponse {
        if !backend.authorized.load(Ordering::SeqCst) {
            return AxumStatus::UNAUTHORIZED.into_response();
        }
        match body["otherUserId"].as_i64() {
            Some(2) => Json(json!({ "id": "r-new", "user1Id": 1, "user2Id": 2 })).into_response(),
            _ => (AxumStatus::NOT_FOUND, "user not found").into_response(),
        }
    }

    async fn messages(State(backend): Shared, Path(room_id): Path<String>) -> impl IntoResponse {
        if !backend.authorized.load(Ordering::SeqCst) {
            return AxumStatus::UNAUTHORIZED.into_response();
        }
        Json(json!([{
            "id": "m1", "roomId": room_id, "senderId": 2,
            "content": "hi", "createdAt": "2026-01-01T00:00:00Z"
        }]))
        .into_response()
    }

    async fn profile(State(backend): Shared) -> impl IntoResponse {
        if !backend.authorized.load(Ordering::SeqCst) {
            return AxumStatus::UNAUTHORIZED.into_response();
        }
        Json(json!({ "user": {
            "id": 1, "email": "a@example.com", "isVerified": true,
            "createdAt": "2025-12-31T00:00:00Z"
        }}))
        .into_response()
    }

    async fn refresh(State(backend): Shared) -> impl IntoResponse {
        backend.refreshes.fetch_add(1, Ordering::SeqCst);
        if backend.refresh_allowed.load(Ordering::SeqCst) {
            backend.authorized.store(true, Ordering::SeqCst);
            AxumStatus::OK
        } else {
            AxumStatus::UNAUTHORIZED
        }
    }

    async fn start_backend(backend: Arc<Backend>) -> String {
        let app = Router::new()
            .route("/msg/room", get(rooms).post(create))
            .route("/msg/room/{room_id}/messages", get(messages))
            .route("/auth/profile", get(profile))
            .route("/auth/refresh", post(refresh))
            .with_state(backend);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/")
    }

    fn authorized_backend() -> Arc<Backend> {
        let backend = Backend::default();
        backend.authorized.store(true, Ordering::SeqCst);
        Arc::new(backend)
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let api = HttpApi::new("http://localhost:4000/").unwrap();
        assert_eq!(api.base_url(), "http://localhost:4000");
        assert_eq!(messages_path("r1"), "/msg/room/r1/messages");
        assert_eq!(messages_path("a/b c"), "/msg/room/a%2Fb%20c/messages");
    }

    #[tokio::test]
    async fn fetch_rooms_decodes_list_and_token() {
        let url = start_backend(authorized_backend()).await;
        let api = HttpApi::new(url).unwrap();

        let list = api.fetch_rooms().await.unwrap();
        assert_eq!(list.token, "ws-token");
        assert_eq!(list.rooms.len(), 1);
        assert_eq!(list.rooms[0].messages[0].content, "hi");
    }

    #[tokio::test]
    async fn fetch_messages_and_profile() {
        let url = start_backend(authorized_backend()).await;
        let api = HttpApi::new(url).unwrap();

        let history = api.fetch_messages("r9").await.unwrap();
        assert_eq!(history[0].room_id, "r9");

        let me = api.fetch_profile().await.unwrap();
        assert_eq!(me.email, "a@example.com");
        assert!(me.is_verified);
    }

    #[tokio::test]
    async fn unauthorized_request_is_replayed_once_after_refresh() {
        let backend = Arc::new(Backend::default());
        backend.refresh_allowed.store(true, Ordering::SeqCst);
        let url = start_backend(Arc::clone(&backend)).await;
        let api = HttpApi::new(url).unwrap();

        let list = api.fetch_rooms().await.unwrap();
        assert_eq!(list.token, "ws-token");
        assert_eq!(backend.refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(backend.room_requests.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn rejected_refresh_expires_session() {
        let backend = Arc::new(Backend::default());
        let url = start_backend(Arc::clone(&backend)).await;
        let api = HttpApi::new(url).unwrap();

        let err = api.fetch_rooms().await.unwrap_err();
        assert!(matches!(err, ChatSyncError::SessionExpired));
        assert!(err.is_session_fatal());
        assert_eq!(backend.refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(backend.room_requests.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn create_room_failure_is_http_error() {
        let url = start_backend(authorized_backend()).await;
        let api = HttpApi::new(url).unwrap();

        let room = api.create_room(2).await.unwrap();
        assert_eq!(room.id, "r-new");
        assert!(room.messages.is_empty());

        let err = api.create_room(99).await.unwrap_err();
        match err {
            ChatSyncError::Http { status, message } => {
                assert_eq!(status, 404);
                assert_eq!(message, "user not found");
            }
            other => panic!("expected Http error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unreachable_service_is_request_error() {
        let api = HttpApi::new("http://127.0.0.1:1").unwrap();
        let err = api.fetch_rooms().await.unwrap_err();
        assert!(matches!(err, ChatSyncError::Request(_)));
    }
}
