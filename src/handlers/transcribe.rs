//! # Streaming Transcription Endpoints
//!
//! `POST /transcribe` (and its alias `/process`) transcribe a file the
//! server can read; `POST /transcribe-upload` transcribes the request body.
//! Both answer with Server-Sent Events, one `data: <json>` frame per event.
//!
//! ## Request Flow:
//! 1. Wait for the activity lock (one transcription at a time, server-wide)
//! 2. Move the lock guard into a blocking task that runs the streamer
//! 3. Forward events from a bounded channel to the response body
//! 4. The lock is released when the streamer returns
//!
//! Dropping the response body (client went away) cancels the request's
//! token and closes the channel; the streamer notices at the next segment
//! boundary or the next event it tries to send.

use crate::error::{AppError, AppResult};
use crate::state::AppState;
use crate::transcription::model::AudioSource;
use crate::transcription::sink::ChannelSink;
use crate::transcription::streamer::TranscriptionRequest;
use crate::transcription::types::Event;
use actix_web::http::header::{CacheControl, CacheDirective};
use actix_web::{web, HttpResponse};
use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::{CancellationToken, DropGuard};
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct TranscribeBody {
    pub audio_path: String,
    #[serde(default)]
    pub language: Option<String>,
    /// Emit a `delta` event per segment.
    #[serde(default)]
    pub incremental: bool,
}

#[derive(Debug, Deserialize)]
pub struct UploadQuery {
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub incremental: bool,
}

/// Treat blank hints as "detect", and accept `EN` as `en`.
fn normalize_language(language: Option<String>) -> Option<String> {
    language
        .map(|l| l.trim().to_lowercase())
        .filter(|l| !l.is_empty())
}

/// `POST /transcribe`, `POST /process`
pub async fn transcribe(
    state: web::Data<AppState>,
    body: web::Json<TranscribeBody>,
) -> AppResult<HttpResponse> {
    let body = body.into_inner();
    if body.audio_path.trim().is_empty() {
        return Err(AppError::ValidationError(
            "audio_path must not be empty".to_string(),
        ));
    }

    let request = TranscriptionRequest {
        audio: AudioSource::Path(PathBuf::from(body.audio_path)),
        language: normalize_language(body.language),
        incremental: body.incremental,
    };
    Ok(stream_transcription(state.get_ref().clone(), request).await)
}

/// `POST /transcribe-upload?language=xx&incremental=true`
pub async fn transcribe_upload(
    state: web::Data<AppState>,
    query: web::Query<UploadQuery>,
    body: web::Bytes,
) -> AppResult<HttpResponse> {
    if body.is_empty() {
        return Err(AppError::BadRequest(
            "Request body must contain audio data".to_string(),
        ));
    }

    let query = query.into_inner();
    let request = TranscriptionRequest {
        audio: AudioSource::Bytes(body.to_vec()),
        language: normalize_language(query.language),
        incremental: query.incremental,
    };
    Ok(stream_transcription(state.get_ref().clone(), request).await)
}

/// Hold the activity lock for one transcription and stream its events.
pub async fn stream_transcription(state: AppState, request: TranscriptionRequest) -> HttpResponse {
    let request_id = Uuid::new_v4();
    let span = tracing::info_span!("transcription", %request_id);
    tracing::info!(
        %request_id,
        audio = %request.audio.describe(),
        language = ?request.language,
        incremental = request.incremental,
        "Transcription requested"
    );

    let guard = state.activity.acquire().await;
    tracing::debug!(%request_id, "Activity lock acquired");

    let (tx, rx) = mpsc::channel::<Event>(state.config.streaming.channel_capacity);
    let cancel = CancellationToken::new();
    let worker_cancel = cancel.clone();
    let worker = state.clone();

    worker.transcription_started();
    tokio::task::spawn_blocking(move || {
        let _entered = span.enter();
        let _guard = guard;
        let mut sink = ChannelSink::new(tx);
        let outcome = worker.streamer.run(&request, &mut sink, &worker_cancel);
        worker.transcription_finished(&outcome);
    });

    HttpResponse::Ok()
        .content_type("text/event-stream")
        .insert_header(CacheControl(vec![CacheDirective::NoCache]))
        .streaming(EventStream {
            events: ReceiverStream::new(rx),
            _cancel_on_drop: cancel.drop_guard(),
        })
}

/// Response body: SSE frames for each event, cancelling the transcription
/// when dropped.
struct EventStream {
    events: ReceiverStream<Event>,
    _cancel_on_drop: DropGuard,
}

impl Stream for EventStream {
    type Item = Result<web::Bytes, actix_web::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events
            .poll_next_unpin(cx)
            .map(|event| event.map(|event| Ok(sse_frame(&event))))
    }
}

fn sse_frame(event: &Event) -> web::Bytes {
    web::Bytes::from(format!("data: {}\n\n", event.to_json()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::handlers;
    use crate::state::TranscriptionCounters;
    use crate::transcription::testing::{speech_segments, Script, ScriptedLoader};
    use crate::transcription::types::TranscriptionInfo;
    use actix_web::body::MessageBody;
    use actix_web::{test, App};
    use std::sync::Arc;
    use std::time::Duration;

    fn app_state(loader: Arc<ScriptedLoader>) -> AppState {
        AppState::new(AppConfig::default(), loader, CancellationToken::new())
    }

    fn parse_events(body: &[u8]) -> Vec<serde_json::Value> {
        std::str::from_utf8(body)
            .unwrap()
            .split("\n\n")
            .filter(|frame| !frame.is_empty())
            .map(|frame| serde_json::from_str(frame.strip_prefix("data: ").unwrap()).unwrap())
            .collect()
    }

    fn upload_request() -> test::TestRequest {
        test::TestRequest::post()
            .uri("/transcribe-upload?language=en")
            .set_payload(vec![0u8; 64])
    }

    #[actix_web::test]
    async fn test_upload_streams_events_as_sse() {
        let state = app_state(ScriptedLoader::new());
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .configure(|cfg| handlers::routes(cfg, 1 << 20)),
        )
        .await;

        let resp = test::call_service(&app, upload_request().to_request()).await;
        assert!(resp.status().is_success());
        assert_eq!(
            resp.headers().get("content-type").unwrap(),
            "text/event-stream"
        );
        let body = test::read_body(resp).await;
        let events = parse_events(&body);

        let types: Vec<&str> = events.iter().map(|e| e["type"].as_str().unwrap()).collect();
        assert_eq!(types.first(), Some(&"status"));
        assert_eq!(types.last(), Some(&"result"));
        assert_eq!(events[events.len() - 2]["progress"], 100);
        assert_eq!(events.last().unwrap()["data"]["text"], "word0 word1 word2");
    }

    #[actix_web::test]
    async fn test_concurrent_requests_never_overlap() {
        let loader = ScriptedLoader::with_script(Script {
            segment_delay: Duration::from_millis(20),
            ..Script::default()
        });
        let tracker = loader.tracker();
        let state = app_state(loader);
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .configure(|cfg| handlers::routes(cfg, 1 << 20)),
        )
        .await;

        let (first, second) = futures_util::join!(
            test::call_and_read_body(&app, upload_request().to_request()),
            test::call_and_read_body(&app, upload_request().to_request())
        );

        for body in [first, second] {
            let events = parse_events(&body);
            assert_eq!(events.last().unwrap()["type"], "result");
        }
        assert_eq!(tracker.calls(), 2);
        assert_eq!(tracker.max_active(), 1);
    }

    #[actix_web::test]
    async fn test_missing_file_yields_single_error_event() {
        let state = app_state(ScriptedLoader::new());
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .configure(|cfg| handlers::routes(cfg, 1 << 20)),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/transcribe")
            .set_json(serde_json::json!({ "audio_path": "missing.wav" }))
            .to_request();
        let events = parse_events(&test::call_and_read_body(&app, req).await);

        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["type"], "error");
        assert!(events[0]["error"].as_str().unwrap().contains("missing.wav"));
        assert!(!state.models.is_loaded());
    }

    #[actix_web::test]
    async fn test_process_alias_accepts_original_body() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.wav");
        std::fs::write(&path, crate::audio::decode::wav_bytes(&[0; 1600], 16_000, 1)).unwrap();

        let state = app_state(ScriptedLoader::new());
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .configure(|cfg| handlers::routes(cfg, 1 << 20)),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/process")
            .set_json(serde_json::json!({ "audio_path": path, "language": "en" }))
            .to_request();
        let events = parse_events(&test::call_and_read_body(&app, req).await);
        assert_eq!(events.last().unwrap()["type"], "result");
        assert!(state.models.is_loaded());
    }

    #[actix_web::test]
    async fn test_incremental_request_gets_deltas() {
        let state = app_state(ScriptedLoader::new());
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .configure(|cfg| handlers::routes(cfg, 1 << 20)),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/transcribe-upload?incremental=true")
            .set_payload(vec![1u8; 32])
            .to_request();
        let events = parse_events(&test::call_and_read_body(&app, req).await);
        let deltas: Vec<_> = events.iter().filter(|e| e["type"] == "delta").collect();
        assert_eq!(deltas.len(), 3);
        assert_eq!(deltas[0]["data"]["words"][0]["word"], "word0");
        assert_eq!(deltas[0]["data"]["segment"]["id"], 0);
    }

    #[actix_web::test]
    async fn test_invalid_requests_are_rejected_before_streaming() {
        let state = app_state(ScriptedLoader::new());
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .configure(|cfg| handlers::routes(cfg, 1 << 20)),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/transcribe")
            .set_json(serde_json::json!({ "audio_path": "  " }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 400);

        let req = test::TestRequest::post().uri("/transcribe-upload").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 400);

        assert_eq!(state.metrics_snapshot().transcriptions.started, 0);
    }

    #[actix_web::test]
    async fn test_model_panic_still_ends_stream_with_error() {
        let loader = ScriptedLoader::with_script(Script {
            panic_at: Some(0),
            ..Script::default()
        });
        let state = app_state(loader);
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .configure(|cfg| handlers::routes(cfg, 1 << 20)),
        )
        .await;

        let body = test::call_and_read_body(&app, upload_request().to_request()).await;
        let events = parse_events(&body);
        let types: Vec<&str> = events.iter().map(|e| e["type"].as_str().unwrap()).collect();
        assert_eq!(types, vec!["status", "info", "error"]);
        assert!(events[2]["error"].as_str().unwrap().contains("model panicked"));

        let guard = tokio::time::timeout(Duration::from_secs(5), state.activity.acquire())
            .await
            .expect("lock should be released after a panic");
        drop(guard);
        assert_eq!(
            state.metrics_snapshot().transcriptions,
            TranscriptionCounters {
                started: 1,
                completed: 0,
                failed: 1,
                cancelled: 0,
            }
        );
    }

    #[actix_web::test]
    async fn test_disconnect_cancels_and_releases_lock() {
        let loader = ScriptedLoader::with_script(Script {
            info: TranscriptionInfo {
                language: "en".to_string(),
                duration: 20.0,
            },
            segments: speech_segments(20, 1.0),
            segment_delay: Duration::from_millis(10),
            ..Script::default()
        });
        let state = app_state(loader);
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .configure(|cfg| handlers::routes(cfg, 1 << 20)),
        )
        .await;

        let resp = test::call_service(&app, upload_request().to_request()).await;
        let mut body = resp.into_body();

        let mut progress_seen = 0;
        while progress_seen < 2 {
            let chunk = futures_util::future::poll_fn(|cx| Pin::new(&mut body).poll_next(cx))
                .await
                .unwrap()
                .unwrap();
            for event in parse_events(&chunk) {
                if event["type"] == "progress" {
                    progress_seen += 1;
                }
            }
        }
        drop(body);

        let guard = tokio::time::timeout(Duration::from_secs(5), state.activity.acquire())
            .await
            .expect("lock should be released after disconnect");
        drop(guard);

        assert_eq!(
            state.metrics_snapshot().transcriptions,
            TranscriptionCounters {
                started: 1,
                completed: 0,
                failed: 0,
                cancelled: 1,
            }
        );
    }
}
