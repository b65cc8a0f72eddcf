//! Backend side of the protocol.
//!
//! An engine implements `Engine` and is exposed with `serve`. Capabilities an
//! engine does not have keep the default body, which reports them as
//! unimplemented to the caller as an engine failure.

use std::convert::Infallible;
use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::State,
    http::StatusCode,
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use super::types::*;

/// Frames buffered between a streaming engine and the HTTP response.
const STREAM_BUFFER: usize = 64;

/// Sending half of a `PredictStream` call. Dropping it closes the stream.
pub struct TokenSink {
    tx: mpsc::Sender<StreamFrame>,
}

impl TokenSink {
    pub fn new(tx: mpsc::Sender<StreamFrame>) -> Self {
        Self { tx }
    }

    /// Push one fragment. Returns `false` once the caller has gone away, at
    /// which point the engine should stop generating.
    pub async fn send(&self, fragment: impl Into<String>) -> bool {
        self.tx
            .send(StreamFrame {
                message: fragment.into(),
                error: None,
            })
            .await
            .is_ok()
    }
}

fn unimplemented(operation: &str) -> anyhow::Error {
    anyhow::anyhow!("{} is not implemented by this backend", operation)
}

#[async_trait]
pub trait Engine: Send + Sync + 'static {
    async fn load(&self, request: LoadRequest) -> anyhow::Result<()>;

    async fn predict(&self, _options: PredictOptions) -> anyhow::Result<String> {
        Err(unimplemented("predict"))
    }

    async fn predict_stream(&self, _options: PredictOptions, _sink: TokenSink) -> anyhow::Result<()> {
        Err(unimplemented("predict_stream"))
    }

    async fn embeddings(&self, _options: PredictOptions) -> anyhow::Result<Vec<f32>> {
        Err(unimplemented("embeddings"))
    }

    async fn generate_image(&self, _request: GenerateImageRequest) -> anyhow::Result<()> {
        Err(unimplemented("generate_image"))
    }

    async fn tts(&self, _request: TtsRequest) -> anyhow::Result<()> {
        Err(unimplemented("tts"))
    }

    async fn audio_transcription(&self, _request: TranscriptRequest) -> anyhow::Result<TranscriptResult> {
        Err(unimplemented("audio_transcription"))
    }
}

type SharedEngine = Arc<dyn Engine>;

fn failure(message: String) -> Response {
    error!("{}", message);
    (StatusCode::INTERNAL_SERVER_ERROR, Json(RpcResult::failed(message))).into_response()
}

async fn health() -> Json<Reply> {
    Json(Reply {
        message: "OK".to_string(),
    })
}

async fn load(State(engine): State<SharedEngine>, Json(request): Json<LoadRequest>) -> Response {
    info!("Loading model {}", request.model);
    match engine.load(request).await {
        Ok(()) => Json(RpcResult::ok("Loading succeeded")).into_response(),
        Err(e) => failure(format!("Error loading model: {}", e)),
    }
}

async fn predict(State(engine): State<SharedEngine>, Json(options): Json<PredictOptions>) -> Response {
    match engine.predict(options).await {
        Ok(message) => Json(Reply { message }).into_response(),
        Err(e) => failure(e.to_string()),
    }
}

async fn predict_stream(
    State(engine): State<SharedEngine>,
    Json(options): Json<PredictOptions>,
) -> Response {
    let (tx, rx) = mpsc::channel(STREAM_BUFFER);
    let error_tx = tx.clone();

    tokio::spawn(async move {
        if let Err(e) = engine.predict_stream(options, TokenSink::new(tx)).await {
            error!("Stream prediction failed: {}", e);
            let _ = error_tx
                .send(StreamFrame {
                    message: String::new(),
                    error: Some(e.to_string()),
                })
                .await;
        }
    });

    let events = ReceiverStream::new(rx).map(|frame| {
        Ok::<_, Infallible>(Event::default().data(serde_json::to_string(&frame).unwrap_or_default()))
    });

    Sse::new(events).into_response()
}

async fn embedding(State(engine): State<SharedEngine>, Json(options): Json<PredictOptions>) -> Response {
    match engine.embeddings(options).await {
        Ok(embeddings) => Json(EmbeddingResult { embeddings }).into_response(),
        Err(e) => failure(e.to_string()),
    }
}

async fn generate_image(
    State(engine): State<SharedEngine>,
    Json(request): Json<GenerateImageRequest>,
) -> Response {
    match engine.generate_image(request).await {
        Ok(()) => Json(RpcResult::ok("Image generated")).into_response(),
        Err(e) => failure(format!("Error generating image: {}", e)),
    }
}

async fn tts(State(engine): State<SharedEngine>, Json(request): Json<TtsRequest>) -> Response {
    match engine.tts(request).await {
        Ok(()) => Json(RpcResult::ok("Audio generated")).into_response(),
        Err(e) => failure(format!("Error generating audio: {}", e)),
    }
}

async fn audio_transcription(
    State(engine): State<SharedEngine>,
    Json(request): Json<TranscriptRequest>,
) -> Response {
    match engine.audio_transcription(request).await {
        Ok(result) => Json(result).into_response(),
        Err(e) => failure(e.to_string()),
    }
}

pub fn router(engine: SharedEngine) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/load", post(load))
        .route("/predict", post(predict))
        .route("/predict/stream", post(predict_stream))
        .route("/embedding", post(embedding))
        .route("/image", post(generate_image))
        .route("/tts", post(tts))
        .route("/transcription", post(audio_transcription))
        .layer(TraceLayer::new_for_http())
        .with_state(engine)
}

/// Serve `engine` on `address` until the process is stopped.
pub async fn serve(address: &str, engine: SharedEngine) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(address).await?;
    info!("Backend server listening at {}", listener.local_addr()?);
    axum::serve(listener, router(engine)).await?;
    Ok(())
}
