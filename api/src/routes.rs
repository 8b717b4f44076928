use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path as AxumPath, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use bytes::Bytes;
use camrelay_common::cache::FrameCache;
use camrelay_common::camera::ReaderState;
use camrelay_common::frame::NO_SEQUENCE;
use camrelay_ingest::HealthView;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use crate::fanout::{self, ClientSession, FanoutSettings};

// ---------------------------------------------------------------------------
// App state
// ---------------------------------------------------------------------------

pub struct AppState {
    cache: Arc<FrameCache>,
    health: HealthView,
    placeholder: Bytes,
    placeholder_part: Bytes,
    fanout: FanoutSettings,
    shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        cache: Arc<FrameCache>,
        health: HealthView,
        placeholder: Bytes,
        fanout: FanoutSettings,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            placeholder_part: fanout::encode_part(&placeholder),
            cache,
            health,
            placeholder,
            fanout,
            shutdown,
        }
    }
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct CameraStatus {
    pub index: usize,
    pub enabled: bool,
    #[serde(flatten)]
    pub state: ReaderState,
    pub last_frame_at: Option<DateTime<Utc>>,
    pub sequence: u64,
    pub viewers: usize,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/video_feed/:camera_index", get(video_feed))
        .route("/video_feed/:camera_index/frame", get(latest_frame))
        .route("/cameras", get(list_cameras))
        .route("/cameras/:camera_index", get(get_camera))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Accept only plain decimal indexes inside the configured range.
fn parse_index(raw: &str, len: usize) -> Option<usize> {
    if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    raw.parse::<usize>().ok().filter(|&index| index < len)
}

fn camera_status(state: &AppState, index: usize) -> Option<CameraStatus> {
    let reader_state = state.health.status(index)?;
    let snapshot = state.cache.read(index);
    Some(CameraStatus {
        index,
        enabled: reader_state != ReaderState::Disabled,
        state: reader_state,
        last_frame_at: state.health.latest_timestamp(index),
        sequence: snapshot.map_or(NO_SEQUENCE, |s| s.sequence),
        viewers: state.cache.watcher_count(index),
    })
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// GET /video_feed/:camera_index
/// Endless multipart JPEG stream; the placeholder stands in while there is no live frame.
pub async fn video_feed(
    State(state): State<Arc<AppState>>,
    AxumPath(raw_index): AxumPath<String>,
) -> Response {
    let Some(index) = parse_index(&raw_index, state.cache.len()) else {
        debug!(camera = %raw_index, "stream requested for unknown camera");
        return StatusCode::NOT_FOUND.into_response();
    };

    let watcher = match state.cache.subscribe(index) {
        Ok(watcher) => watcher,
        Err(e) => {
            warn!(camera = index, error = %e, "failed to register viewer");
            return StatusCode::NOT_FOUND.into_response();
        }
    };

    let session = ClientSession::new(
        watcher,
        state.placeholder_part.clone(),
        state.fanout.clone(),
        state.shutdown.child_token(),
    );

    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, fanout::CONTENT_TYPE),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(session.into_stream()),
    )
        .into_response()
}

/// GET /video_feed/:camera_index/frame
/// Latest frame as a single JPEG.
pub async fn latest_frame(
    State(state): State<Arc<AppState>>,
    AxumPath(raw_index): AxumPath<String>,
) -> Response {
    let Some(index) = parse_index(&raw_index, state.cache.len()) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let jpeg = state
        .cache
        .read(index)
        .map(|snapshot| snapshot.payload.clone())
        .unwrap_or_else(|| state.placeholder.clone());

    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "image/jpeg"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        jpeg,
    )
        .into_response()
}

/// GET /cameras
pub async fn list_cameras(State(state): State<Arc<AppState>>) -> Json<Vec<CameraStatus>> {
    let cameras = (0..state.health.len())
        .filter_map(|index| camera_status(&state, index))
        .collect();
    Json(cameras)
}

/// GET /cameras/:camera_index
pub async fn get_camera(
    State(state): State<Arc<AppState>>,
    AxumPath(raw_index): AxumPath<String>,
) -> Response {
    parse_index(&raw_index, state.health.len())
        .and_then(|index| camera_status(&state, index))
        .map_or_else(
            || StatusCode::NOT_FOUND.into_response(),
            |status| Json(status).into_response(),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use camrelay_common::camera::CameraSource;
    use camrelay_ingest::testing::{jpeg, Attempt, ScriptedConnector};
    use camrelay_ingest::{ReaderSettings, SourceSupervisor};
    use futures_util::StreamExt;
    use std::time::Duration;

    const PLACEHOLDER: &[u8] = &[0xFF, 0xD8, 0x00, 0xFF, 0xD9];

    struct Fixture {
        state: Arc<AppState>,
        cache: Arc<FrameCache>,
        supervisor: SourceSupervisor,
    }

    /// Camera 0 streams one frame, camera 1 is unreachable, camera 2 is disabled.
    async fn fixture() -> Fixture {
        let connector = Arc::new(
            ScriptedConnector::new().with_script(0, vec![Attempt::frames(vec![jpeg(1)])]),
        );
        let cache = Arc::new(FrameCache::new(3));
        let shutdown = CancellationToken::new();
        let supervisor = SourceSupervisor::start(
            vec![
                CameraSource::new(0, "rtsp://cam-a/live"),
                CameraSource::new(1, "http://cam-b/stream"),
                CameraSource::new(2, ""),
            ],
            connector,
            Arc::clone(&cache),
            ReaderSettings {
                initial_backoff: Duration::from_secs(1),
                max_backoff: Duration::from_secs(30),
                read_timeout: Duration::from_secs(15),
                max_frame_bytes: 1024,
            },
            shutdown.child_token(),
        )
        .unwrap();

        let state = Arc::new(AppState::new(
            Arc::clone(&cache),
            supervisor.health(),
            Bytes::from_static(PLACEHOLDER),
            FanoutSettings {
                idle_interval: Duration::from_millis(500),
                frame_timeout: Duration::from_secs(5),
                stale_after: Duration::from_secs(10),
            },
            shutdown,
        ));

        // Let the readers connect
        tokio::time::sleep(Duration::from_millis(10)).await;

        Fixture {
            state,
            cache,
            supervisor,
        }
    }

    fn path(raw: &str) -> AxumPath<String> {
        AxumPath(raw.to_string())
    }

    #[test]
    fn index_parsing() {
        assert_eq!(parse_index("0", 3), Some(0));
        assert_eq!(parse_index("2", 3), Some(2));
        assert_eq!(parse_index("3", 3), None);
        assert_eq!(parse_index("-1", 3), None);
        assert_eq!(parse_index("+1", 3), None);
        assert_eq!(parse_index("abc", 3), None);
        assert_eq!(parse_index("", 3), None);
        assert_eq!(parse_index("99999999999999999999999", 3), None);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_camera_is_not_found() {
        let f = fixture().await;
        for raw in ["3", "17", "-1", "cam0"] {
            let response = video_feed(State(f.state.clone()), path(raw)).await;
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "{raw}");
            let response = latest_frame(State(f.state.clone()), path(raw)).await;
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "{raw}");
        }
        assert_eq!(f.cache.watcher_count(0), 0);
        f.supervisor.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn video_feed_streams_multipart() {
        let f = fixture().await;
        let response = video_feed(State(f.state.clone()), path("0")).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "multipart/x-mixed-replace; boundary=frame"
        );
        assert_eq!(response.headers()[header::CACHE_CONTROL], "no-cache");
        assert_eq!(f.cache.watcher_count(0), 1);

        let mut body = response.into_body().into_data_stream();
        let first = body.next().await.unwrap().unwrap();
        assert_eq!(first, fanout::encode_part(&jpeg(1)));

        // Client goes away
        drop(body);
        assert_eq!(f.cache.watcher_count(0), 0);
        f.supervisor.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_camera_streams_placeholder() {
        let f = fixture().await;
        let response = video_feed(State(f.state.clone()), path("2")).await;
        assert_eq!(response.status(), StatusCode::OK);

        let mut body = response.into_body().into_data_stream();
        for _ in 0..3 {
            let part = body.next().await.unwrap().unwrap();
            assert_eq!(part, fanout::encode_part(PLACEHOLDER));
        }
        f.supervisor.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_ends_open_streams() {
        let f = fixture().await;
        let response = video_feed(State(f.state.clone()), path("1")).await;
        let mut body = response.into_body().into_data_stream();
        assert!(body.next().await.is_some());

        f.state.shutdown.cancel();
        assert!(body.next().await.is_none());
        f.supervisor.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn single_frame_falls_back_to_placeholder() {
        let f = fixture().await;

        let response = latest_frame(State(f.state.clone()), path("0")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "image/jpeg");
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body, jpeg(1));

        let response = latest_frame(State(f.state.clone()), path("1")).await;
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], PLACEHOLDER);
        f.supervisor.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn camera_status_reports_health() {
        let f = fixture().await;
        let Json(cameras) = list_cameras(State(f.state.clone())).await;
        assert_eq!(cameras.len(), 3);

        assert!(cameras[0].enabled);
        assert_eq!(cameras[0].state, ReaderState::Streaming);
        assert_eq!(cameras[0].sequence, 1);
        assert!(cameras[0].last_frame_at.is_some());

        assert!(cameras[1].state.is_failed());
        assert_eq!(cameras[1].sequence, 0);
        assert!(cameras[1].last_frame_at.is_none());

        assert!(!cameras[2].enabled);
        assert_eq!(cameras[2].state, ReaderState::Disabled);

        let json = serde_json::to_value(&cameras[2]).unwrap();
        assert_eq!(json["state"], "disabled");
        assert_eq!(json["viewers"], 0);
        assert!(json.get("uri").is_none());
        f.supervisor.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn single_camera_status() {
        let f = fixture().await;
        let _viewer = f.cache.subscribe(0).unwrap();

        let response = get_camera(State(f.state.clone()), path("0")).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["index"], 0);
        assert_eq!(json["state"], "streaming");
        assert_eq!(json["viewers"], 1);

        let response = get_camera(State(f.state.clone()), path("5")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        f.supervisor.shutdown(Duration::from_secs(1)).await;
    }
}
