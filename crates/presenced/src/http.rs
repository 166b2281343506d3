//! HTTP surface: the MJPEG video feed plus JSON polling endpoints.
//!
//! Authentication happens upstream; a reverse proxy puts the authenticated
//! user name in a request header and every route rejects requests without
//! it.

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, HeaderName, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

use crate::engine::{EngineError, StreamDriver};
use crate::metrics::{MetricsBoard, MetricsSnapshot, SessionId};
use crate::store::{AttendanceRecord, AttendanceStore, StoreError};

pub const BOUNDARY: &str = "frame";
pub const SESSION_HEADER: &str = "x-presence-session";
const DEFAULT_HISTORY_LIMIT: usize = 10;
const MAX_HISTORY_LIMIT: usize = 100;

pub struct AppState {
    pub driver: StreamDriver,
    pub metrics: Arc<MetricsBoard>,
    pub store: AttendanceStore,
    pub identity_header: HeaderName,
    pub camera_device: String,
    pub detector: &'static str,
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("missing or empty {0} header")]
    Unauthenticated(HeaderName),
    #[error("unknown session")]
    UnknownSession,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("failed to build response: {0}")]
    Response(#[from] axum::http::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            ApiError::UnknownSession => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/video_feed", get(video_feed))
        .route("/metrics", get(metrics))
        .route("/attendance", get(attendance))
        .route("/status", get(status))
        .with_state(state)
}

fn identity(state: &AppState, headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get(&state.identity_header)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|user| !user.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ApiError::Unauthenticated(state.identity_header.clone()))
}

/// One multipart part carrying a JPEG frame.
pub fn multipart_part(jpeg: &[u8]) -> Vec<u8> {
    let head = format!("--{BOUNDARY}\r\nContent-Type: image/jpeg\r\n\r\n");
    let mut part = Vec::with_capacity(head.len() + jpeg.len() + 2);
    part.extend_from_slice(head.as_bytes());
    part.extend_from_slice(jpeg);
    part.extend_from_slice(b"\r\n");
    part
}

async fn video_feed(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let user = identity(&state, &headers)?;
    let stream = state.driver.start(&user)?;
    let session = stream.session();

    // Dropping the body drops the FrameStream, which stops the driver
    let parts = futures::stream::unfold(stream, |mut stream| async move {
        let jpeg = stream.next().await?;
        Some((Ok::<_, Infallible>(multipart_part(&jpeg)), stream))
    });

    let response = Response::builder()
        .header(
            header::CONTENT_TYPE,
            format!("multipart/x-mixed-replace; boundary={BOUNDARY}"),
        )
        .header(header::CACHE_CONTROL, "no-cache")
        .header(SESSION_HEADER, session.to_string())
        .body(Body::from_stream(parts))?;
    Ok(response)
}

#[derive(Debug, Deserialize)]
struct MetricsQuery {
    session: Option<SessionId>,
}

async fn metrics(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<MetricsQuery>,
) -> Result<Json<MetricsSnapshot>, ApiError> {
    let user = identity(&state, &headers)?;
    let snapshot = match query.session {
        Some(session) => state
            .metrics
            .read_owned(&user, session)
            .ok_or(ApiError::UnknownSession)?,
        None => state.metrics.read_for_user(&user),
    };
    Ok(Json(snapshot))
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
}

async fn attendance(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<AttendanceRecord>>, ApiError> {
    let user = identity(&state, &headers)?;
    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT);
    Ok(Json(state.store.recent_for_user(&user, limit).await?))
}

async fn status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user = identity(&state, &headers)?;
    Ok(Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "camera_device": state.camera_device,
        "camera_idle": state.driver.camera_idle(),
        "detector": state.detector,
        "sessions": state.metrics.session_count(),
        "session": state.metrics.session_for_user(&user),
        "records_total": state.store.count_all().await?,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{DriverSettings, Rig};
    use presence_core::{BrightRegionDetector, FrameRenderer, LivenessPolicy};
    use presence_hw::{AcquirePolicy, CameraConfig};
    use std::net::SocketAddr;
    use std::path::Path;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn serve(device: &str) -> (SocketAddr, AttendanceStore) {
        let store = AttendanceStore::open(Path::new(":memory:")).await.unwrap();
        let metrics = Arc::new(MetricsBoard::new());
        let camera = presence_hw::opener_for(CameraConfig {
            device: device.to_string(),
            ..CameraConfig::default()
        })
        .unwrap();
        let driver = StreamDriver::new(
            Rig {
                camera,
                detector: Box::new(BrightRegionDetector::default()),
            },
            FrameRenderer::default(),
            Arc::clone(&metrics),
            Arc::new(store.clone()),
            DriverSettings {
                liveness: LivenessPolicy::default(),
                acquire: AcquirePolicy::FailFast,
                buffer_frames: 2,
            },
        );
        let state = Arc::new(AppState {
            driver,
            metrics,
            store: store.clone(),
            identity_header: HeaderName::from_static("x-authenticated-user"),
            camera_device: device.to_string(),
            detector: "bright-region",
        });

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(state)).await.unwrap();
        });
        (addr, store)
    }

    async fn get_raw(addr: SocketAddr, path: &str, user: Option<&str>) -> Vec<u8> {
        let mut conn = tokio::net::TcpStream::connect(addr).await.unwrap();
        let mut request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n");
        if let Some(user) = user {
            request.push_str(&format!("x-authenticated-user: {user}\r\n"));
        }
        request.push_str("\r\n");
        conn.write_all(request.as_bytes()).await.unwrap();

        let mut response = Vec::new();
        conn.read_to_end(&mut response).await.unwrap();
        response
    }

    fn count(haystack: &[u8], needle: &[u8]) -> usize {
        haystack.windows(needle.len()).filter(|w| *w == needle).count()
    }

    #[test]
    fn test_multipart_part_framing() {
        let part = multipart_part(&[0xFF, 0xD8, 0xFF, 0xD9]);
        let mut expected = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n".to_vec();
        expected.extend_from_slice(&[0xFF, 0xD8, 0xFF, 0xD9]);
        expected.extend_from_slice(b"\r\n");
        assert_eq!(part, expected);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_requests_without_identity_are_rejected() {
        let (addr, _store) = serve("stub://").await;
        for path in ["/video_feed", "/metrics", "/attendance", "/status"] {
            let response = String::from_utf8_lossy(&get_raw(addr, path, None).await).into_owned();
            assert!(response.starts_with("HTTP/1.1 401"), "{path}: {response}");
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_metrics_for_user_without_stream() {
        let (addr, _store) = serve("stub://").await;
        let response =
            String::from_utf8_lossy(&get_raw(addr, "/metrics", Some("alice")).await).into_owned();
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains(r#""liveness_step":1"#));
        assert!(response.contains(r#""status":"Starting...""#));

        let unknown = format!("/metrics?session={}", SessionId::new_v4());
        let response =
            String::from_utf8_lossy(&get_raw(addr, &unknown, Some("alice")).await).into_owned();
        assert!(response.starts_with("HTTP/1.1 404"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_video_feed_streams_multipart_jpegs() {
        let (addr, _store) = serve("stub://?frames=5").await;
        let response = get_raw(addr, "/video_feed", Some("alice")).await;
        let text = String::from_utf8_lossy(&response);

        assert!(text.starts_with("HTTP/1.1 200"));
        assert!(text.contains("multipart/x-mixed-replace; boundary=frame"));
        assert!(text.contains(SESSION_HEADER));
        assert_eq!(
            count(&response, b"--frame\r\nContent-Type: image/jpeg\r\n\r\n\xFF\xD8"),
            5
        );

        let metrics =
            String::from_utf8_lossy(&get_raw(addr, "/metrics", Some("alice")).await).into_owned();
        assert!(metrics.contains(r#""status":"Stream ended""#));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_attendance_history_is_per_user() {
        let (addr, store) = serve("stub://").await;
        store.insert("alice", chrono::Local::now()).await.unwrap();

        let alice =
            String::from_utf8_lossy(&get_raw(addr, "/attendance", Some("alice")).await).into_owned();
        assert!(alice.starts_with("HTTP/1.1 200"));
        assert!(alice.contains(r#""user":"alice""#));

        let bob =
            String::from_utf8_lossy(&get_raw(addr, "/attendance", Some("bob")).await).into_owned();
        assert!(bob.contains("[]"));
    }
}
