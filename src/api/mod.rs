//! HTTP surface: control API and HLS playback
//!
//! Control endpoints mint publish tokens and inspect/stop streams; playback
//! endpoints serve the playlist, init segment, and media segments. Playlist
//! responses are never cacheable (live edge); init segments cache for an
//! hour. HEAD is served automatically for every GET route.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::auth::TokenStore;
use crate::config::Config;
use crate::hls::{init_path, segment_path, Segmenter};
use crate::registry::{StreamKey, StreamRegistry, StreamSnapshot, StreamState};
use crate::storage::Storage;

/// Shared handler state
pub struct ApiState {
    pub config: Arc<Config>,
    pub registry: Arc<StreamRegistry>,
    pub tokens: Arc<TokenStore>,
    pub segmenter: Arc<Segmenter>,
    pub storage: Arc<dyn Storage>,
}

/// Build the full router.
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/api/ping", get(ping))
        .route("/publish", post(create_publish_token))
        .route("/api/v1/publish", post(create_publish_token))
        .route("/api/v1/streams", get(list_streams))
        .route("/api/v1/streams/:stream_key", get(get_stream))
        .route("/api/v1/streams/:stream_key/stop", post(stop_stream))
        .route("/live/:stream_key/index.m3u8", get(playlist))
        .route("/live/:stream_key/init.mp4", get(init_segment))
        .route("/live/:stream_key/:segment", get(media_segment))
        .with_state(state)
}

struct ApiError(StatusCode, String);

impl ApiError {
    fn not_found(msg: &str) -> Self {
        Self(StatusCode::NOT_FOUND, msg.to_string())
    }

    fn bad_request(msg: &str) -> Self {
        Self(StatusCode::BAD_REQUEST, msg.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(serde_json::json!({ "error": self.1 }))).into_response()
    }
}

fn parse_key(raw: &str) -> Result<StreamKey, ApiError> {
    StreamKey::parse(raw).map_err(|_| ApiError::bad_request("invalid stream key"))
}

async fn ping() -> impl IntoResponse {
    Json(serde_json::json!({
        "message": "pong",
        "time": chrono::Utc::now().timestamp(),
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublishRequest {
    stream_key: String,
    #[serde(default)]
    expires_in: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PublishResponse {
    publish_url: String,
    stream_key: String,
    token: String,
    expires_at: String,
}

async fn create_publish_token(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<PublishRequest>,
) -> Result<Json<PublishResponse>, ApiError> {
    let key = parse_key(&request.stream_key)?;

    let requested_ttl = (request.expires_in > 0).then(|| Duration::from_secs(request.expires_in));
    let token = state
        .tokens
        .issue(key.clone(), requested_ttl, None)
        .map_err(|e| ApiError(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    let publish_url = format!(
        "{}/{}/{}?token={}",
        state.config.rtmp_ingest_url.trim_end_matches('/'),
        state.config.rtmp_app,
        key,
        token.token
    );

    Ok(Json(PublishResponse {
        publish_url,
        stream_key: key.as_str().to_string(),
        token: token.token,
        expires_at: token.expires_at.to_rfc3339(),
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StreamInfo {
    stream_key: String,
    state: String,
    active: bool,
    viewers: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    started_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    uptime_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    video_codec: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    resolution: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    audio_codec: Option<String>,
    bytes_received: u64,
    frames_received: u64,
    keyframes: u64,
    frames_dropped: u64,
}

impl From<StreamSnapshot> for StreamInfo {
    fn from(snap: StreamSnapshot) -> Self {
        let video_codec = snap
            .video_codec
            .as_ref()
            .map(|v| format!("H.264 {} {}", v.avc.profile_name(), v.avc.level_string()));
        let resolution = snap
            .video_codec
            .as_ref()
            .and_then(|v| v.width.zip(v.height))
            .map(|(w, h)| format!("{w}x{h}"));
        let audio_codec = snap
            .audio_codec
            .as_ref()
            .map(|a| format!("{} {} Hz", a.aac.profile_name(), a.aac.sample_rate));

        Self {
            stream_key: snap.key.as_str().to_string(),
            state: snap.state.as_str().to_string(),
            active: snap.state == StreamState::Live,
            viewers: snap.viewers,
            started_at: snap
                .started_at
                .map(|t| chrono::DateTime::<chrono::Utc>::from(t).to_rfc3339()),
            uptime_secs: snap.uptime_secs,
            video_codec,
            resolution,
            audio_codec,
            bytes_received: snap.bytes_received,
            frames_received: snap.frames_received,
            keyframes: snap.keyframes,
            frames_dropped: snap.frames_dropped,
        }
    }
}

#[derive(Debug, Serialize)]
struct StreamListResponse {
    streams: Vec<StreamInfo>,
    total: usize,
}

async fn list_streams(State(state): State<Arc<ApiState>>) -> Json<StreamListResponse> {
    let streams: Vec<StreamInfo> = state
        .registry
        .list_live()
        .into_iter()
        .map(StreamInfo::from)
        .collect();
    let total = streams.len();
    Json(StreamListResponse { streams, total })
}

async fn get_stream(
    State(state): State<Arc<ApiState>>,
    Path(stream_key): Path<String>,
) -> Result<Json<StreamInfo>, ApiError> {
    let key = parse_key(&stream_key)?;
    state
        .registry
        .get(&key)
        .map(|snap| Json(StreamInfo::from(snap)))
        .ok_or_else(|| ApiError::not_found("stream not found"))
}

async fn stop_stream(
    State(state): State<Arc<ApiState>>,
    Path(stream_key): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let key = parse_key(&stream_key)?;
    if state.registry.get(&key).is_none() {
        return Err(ApiError::not_found("stream not found"));
    }

    state.segmenter.stop(&key).await;
    state.registry.set_stopped(&key);
    tracing::info!(stream = %key, "stream stopped via API");

    Ok(Json(serde_json::json!({
        "message": "stream stopped",
        "streamKey": key.as_str(),
    })))
}

async fn playlist(
    State(state): State<Arc<ApiState>>,
    Path(stream_key): Path<String>,
) -> Result<Response, ApiError> {
    let key = parse_key(&stream_key)?;
    let text = state
        .segmenter
        .playlist_text(&key)
        .ok_or_else(|| ApiError::not_found("playlist not available"))?;

    Ok((
        [
            (header::CONTENT_TYPE, "application/vnd.apple.mpegurl"),
            (header::CACHE_CONTROL, "no-cache, no-store, must-revalidate"),
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
        ],
        text,
    )
        .into_response())
}

async fn init_segment(
    State(state): State<Arc<ApiState>>,
    Path(stream_key): Path<String>,
) -> Result<Response, ApiError> {
    let key = parse_key(&stream_key)?;
    if !state.segmenter.is_active(&key) {
        return Err(ApiError::not_found("stream not live"));
    }

    let bytes = state
        .storage
        .get(&init_path(&key))
        .await
        .map_err(|_| ApiError::not_found("init segment not available"))?;

    Ok((
        [
            (header::CONTENT_TYPE, "video/mp4"),
            (header::CACHE_CONTROL, "public, max-age=3600"),
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
        ],
        bytes.to_vec(),
    )
        .into_response())
}

async fn media_segment(
    State(state): State<Arc<ApiState>>,
    Path((stream_key, segment)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let key = parse_key(&stream_key)?;

    let sequence: u64 = segment
        .strip_prefix("segment_")
        .and_then(|s| s.strip_suffix(".m4s"))
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| ApiError::bad_request("invalid segment name"))?;

    // Out-of-window (evicted or future) segments are gone from the live edge
    if !state.segmenter.segment_in_window(&key, sequence) {
        return Err(ApiError::not_found("segment not in window"));
    }

    let bytes = state
        .storage
        .get(&segment_path(&key, sequence))
        .await
        .map_err(|_| ApiError::not_found("segment not found"))?;

    Ok((
        [
            (header::CONTENT_TYPE, "video/mp4"),
            (header::CACHE_CONTROL, "no-cache"),
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
        ],
        bytes.to_vec(),
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use bytes::Bytes;
    use tower::ServiceExt;

    use super::*;
    use crate::auth::TokenStoreConfig;
    use crate::hls::SegmenterConfig;
    use crate::media::AvcConfig;
    use crate::registry::{MediaFrame, VideoCodecInfo};
    use crate::storage::LocalStorage;

    const CONFIG_RECORD: &[u8] = &[
        0x01, 0x64, 0x00, 0x1F, 0xFF, 0xE1, 0x00, 0x04, 0x67, 0x64, 0x00, 0x1F, 0x01, 0x00,
        0x03, 0x68, 0xEF, 0x38,
    ];

    struct Harness {
        _dir: tempfile::TempDir,
        state: Arc<ApiState>,
        app: Router,
    }

    async fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let storage: Arc<dyn Storage> = Arc::new(LocalStorage::new(dir.path()).await.unwrap());
        let registry = Arc::new(StreamRegistry::new(100));
        let tokens = Arc::new(TokenStore::new(TokenStoreConfig::default()));
        let segmenter = Arc::new(Segmenter::new(
            Arc::clone(&storage),
            Arc::clone(&registry),
            SegmenterConfig {
                segment_duration: Duration::from_millis(100),
                ..Default::default()
            },
        ));
        let state = Arc::new(ApiState {
            config: Arc::new(Config::default()),
            registry,
            tokens,
            segmenter,
            storage,
        });
        let app = router(Arc::clone(&state));
        Harness {
            _dir: dir,
            state,
            app,
        }
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn keyframe(key: &StreamKey, pts: u32) -> MediaFrame {
        let payload: &[u8] = &[
            0, 0, 0, 1, 0x67, 0x64, 0x00, 0x1F, //
            0, 0, 0, 1, 0x68, 0xEF, 0x38, //
            0, 0, 0, 1, 0x65, 0x88, 0x84, 0x00,
        ];
        MediaFrame::video(key.clone(), pts, Bytes::copy_from_slice(payload), true)
    }

    async fn go_live(h: &Harness, name: &str) -> StreamKey {
        let key = StreamKey::parse(name).unwrap();
        h.state
            .registry
            .create(&key, "127.0.0.1:4000".parse().unwrap())
            .unwrap();
        h.state.segmenter.start(&key).unwrap();
        h.state.registry.set_live(&key).unwrap();
        h.state
            .registry
            .set_video_codec(
                &key,
                VideoCodecInfo {
                    avc: AvcConfig::parse(Bytes::from_static(CONFIG_RECORD)).unwrap(),
                    width: Some(1280),
                    height: Some(720),
                    frame_rate: Some(30.0),
                },
            )
            .unwrap();
        key
    }

    #[tokio::test]
    async fn test_ping() {
        let h = harness().await;
        let response = h
            .app
            .oneshot(Request::get("/api/ping").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["message"], "pong");
    }

    #[tokio::test]
    async fn test_publish_token_issued() {
        let h = harness().await;
        let response = h
            .app
            .clone()
            .oneshot(
                Request::post("/api/v1/publish")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"streamKey":"live1","expiresIn":60}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        let token = json["token"].as_str().unwrap();
        assert_eq!(token.len(), 64);
        assert_eq!(json["streamKey"], "live1");
        assert_eq!(
            json["publishUrl"],
            format!("rtmp://localhost:1935/live/live1?token={token}")
        );

        // The minted token validates in the store
        let key = StreamKey::parse("live1").unwrap();
        h.state.tokens.validate(token, &key, None).unwrap();
    }

    #[tokio::test]
    async fn test_publish_rejects_invalid_key() {
        let h = harness().await;
        let response = h
            .app
            .oneshot(
                Request::post("/api/v1/publish")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"streamKey":"bad/key"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_stream_listing_and_lookup() {
        let h = harness().await;

        let response = h
            .app
            .clone()
            .oneshot(Request::get("/api/v1/streams").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(body_json(response).await["total"], 0);

        let key = go_live(&h, "live1").await;

        let response = h
            .app
            .clone()
            .oneshot(Request::get("/api/v1/streams").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["total"], 1);
        assert_eq!(json["streams"][0]["streamKey"], "live1");
        assert_eq!(json["streams"][0]["resolution"], "1280x720");

        let response = h
            .app
            .clone()
            .oneshot(
                Request::get("/api/v1/streams/live1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["state"], "live");
        assert!(json["videoCodec"].as_str().unwrap().contains("High"));

        h.state.segmenter.stop(&key).await;
    }

    #[tokio::test]
    async fn test_unknown_stream_404() {
        let h = harness().await;
        let response = h
            .app
            .oneshot(
                Request::get("/api/v1/streams/ghost")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_playlist_404_before_first_segment() {
        let h = harness().await;
        let response = h
            .app
            .clone()
            .oneshot(
                Request::get("/live/ghost/index.m3u8")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        // Live but no segments yet: still 404
        let key = go_live(&h, "live1").await;
        let response = h
            .app
            .clone()
            .oneshot(
                Request::get("/live/live1/index.m3u8")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        h.state.segmenter.stop(&key).await;
    }

    #[tokio::test]
    async fn test_playlist_and_segment_served_live() {
        let h = harness().await;
        let key = go_live(&h, "live1").await;

        // Feed a GOP and wait for the 100 ms tick to close segment 0
        h.state.registry.publish_frame(keyframe(&key, 0)).unwrap();
        let mut served = None;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if let Some(text) = h.state.segmenter.playlist_text(&key) {
                served = Some(text);
                break;
            }
            // keep the buffer warm in case the first tick raced the frame
            h.state.registry.publish_frame(keyframe(&key, 0)).unwrap();
        }
        let text = served.expect("playlist never appeared");
        assert!(text.contains("#EXT-X-MAP:URI=\"init.mp4\""));
        assert!(text.contains("segment_0.m4s"));

        let response = h
            .app
            .clone()
            .oneshot(
                Request::get("/live/live1/index.m3u8")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/vnd.apple.mpegurl"
        );
        assert_eq!(
            response.headers()[header::CACHE_CONTROL],
            "no-cache, no-store, must-revalidate"
        );
        assert_eq!(response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");

        // Init segment is cacheable and parses as MP4
        let response = h
            .app
            .clone()
            .oneshot(
                Request::get("/live/live1/init.mp4")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CACHE_CONTROL], "public, max-age=3600");
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        assert_eq!(&bytes[4..8], b"ftyp");

        // Segment 0 is in the window
        let response = h
            .app
            .clone()
            .oneshot(
                Request::get("/live/live1/segment_0.m4s")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "video/mp4");

        // A sequence far outside the window is 404
        let response = h
            .app
            .clone()
            .oneshot(
                Request::get("/live/live1/segment_999.m4s")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        // Malformed segment names are a client error
        let response = h
            .app
            .clone()
            .oneshot(
                Request::get("/live/live1/segment_x.m4s")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        h.state.segmenter.stop(&key).await;
    }

    #[tokio::test]
    async fn test_head_playlist_supported() {
        let h = harness().await;
        let response = h
            .app
            .oneshot(
                Request::head("/live/ghost/index.m3u8")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        // HEAD routes exist (axum serves HEAD from GET handlers); unknown
        // stream is still a 404
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_stop_stream_endpoint() {
        let h = harness().await;
        let key = go_live(&h, "live1").await;

        let response = h
            .app
            .clone()
            .oneshot(
                Request::post("/api/v1/streams/live1/stop")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(!h.state.segmenter.is_active(&key));

        // Second stop: the stream is gone
        let response = h
            .app
            .clone()
            .oneshot(
                Request::post("/api/v1/streams/live1/stop")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
