//! Caller side of the backend protocol.
//!
//! `Backend` is the capability surface every engine exposes. It is the same
//! whether the engine runs as a supervised subprocess or at an external
//! address; `HttpBackendClient` speaks it over JSON/HTTP.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use super::types::*;
use crate::error::BackendError;

/// Incremental text fragments produced by `PredictStream`. The stream ends when
/// the backend closes it.
pub type FragmentStream = BoxStream<'static, Result<String, BackendError>>;

#[async_trait]
pub trait Backend: Send + Sync {
    /// Liveness probe. No side effects.
    async fn health(&self) -> Result<String, BackendError>;

    /// Initialize engine state. Call at most once per live process.
    async fn load(&self, request: &LoadRequest) -> Result<RpcResult, BackendError>;

    async fn predict(&self, options: &PredictOptions) -> Result<String, BackendError>;

    async fn predict_stream(&self, options: &PredictOptions) -> Result<FragmentStream, BackendError>;

    async fn embedding(&self, options: &PredictOptions) -> Result<Vec<f32>, BackendError>;

    /// Writes the image to `request.dst`.
    async fn generate_image(&self, request: &GenerateImageRequest) -> Result<RpcResult, BackendError>;

    /// Writes the audio to `request.dst`.
    async fn tts(&self, request: &TtsRequest) -> Result<RpcResult, BackendError>;

    async fn audio_transcription(
        &self,
        request: &TranscriptRequest,
    ) -> Result<TranscriptResult, BackendError>;

    async fn is_healthy(&self) -> bool {
        self.health().await.is_ok()
    }
}

pub struct HttpBackendClient {
    base_url: String,
    http_client: reqwest::Client,
    health_timeout: Duration,
}

impl HttpBackendClient {
    /// `address` is either `host:port` or a full `http(s)://` URL.
    pub fn new(address: &str) -> Self {
        let base_url = if address.starts_with("http://") || address.starts_with("https://") {
            address.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", address)
        };

        Self {
            base_url,
            // No overall timeout: generation calls run to completion or failure.
            http_client: reqwest::Client::builder()
                .connect_timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            health_timeout: Duration::from_secs(10),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn post<Req, Resp>(&self, path: &str, body: &Req) -> Result<Resp, BackendError>
    where
        Req: Serialize + Sync + ?Sized,
        Resp: DeserializeOwned,
    {
        let response = self
            .http_client
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;

        Self::decode(response).await
    }

    async fn decode<Resp: DeserializeOwned>(response: reqwest::Response) -> Result<Resp, BackendError> {
        if !response.status().is_success() {
            return Err(Self::engine_failure(response).await);
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;

        serde_json::from_slice(&body).map_err(|e| BackendError::Protocol(e.to_string()))
    }

    async fn engine_failure(response: reqwest::Response) -> BackendError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        match serde_json::from_str::<RpcResult>(&body) {
            Ok(result) => BackendError::Engine(result.message),
            Err(_) => BackendError::Engine(format!("backend returned {}: {}", status, body)),
        }
    }
}

#[async_trait]
impl Backend for HttpBackendClient {
    async fn health(&self) -> Result<String, BackendError> {
        let response = self
            .http_client
            .get(self.url("/health"))
            .timeout(self.health_timeout)
            .send()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;

        let reply: Reply = Self::decode(response).await?;
        Ok(reply.message)
    }

    async fn load(&self, request: &LoadRequest) -> Result<RpcResult, BackendError> {
        self.post("/load", request).await
    }

    async fn predict(&self, options: &PredictOptions) -> Result<String, BackendError> {
        let reply: Reply = self.post("/predict", options).await?;
        Ok(reply.message)
    }

    async fn predict_stream(&self, options: &PredictOptions) -> Result<FragmentStream, BackendError> {
        let response = self
            .http_client
            .post(self.url("/predict/stream"))
            .json(options)
            .send()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Self::engine_failure(response).await);
        }

        let byte_stream = response.bytes_stream();

        let fragments = async_stream::stream! {
            let mut buffer: Vec<u8> = Vec::new();
            futures_util::pin_mut!(byte_stream);

            while let Some(chunk_result) = byte_stream.next().await {
                let chunk = match chunk_result {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        yield Err(BackendError::Transport(format!("stream read error: {}", e)));
                        return;
                    }
                };
                buffer.extend_from_slice(&chunk);

                while let Some(newline_pos) = buffer.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=newline_pos).collect();
                    let line = String::from_utf8_lossy(&line);
                    let Some(data) = line.trim().strip_prefix("data:") else {
                        continue;
                    };

                    match serde_json::from_str::<StreamFrame>(data.trim_start()) {
                        Ok(StreamFrame { error: Some(error), .. }) => {
                            yield Err(BackendError::Engine(error));
                            return;
                        }
                        Ok(frame) => yield Ok(frame.message),
                        Err(e) => {
                            debug!("Skipping undecodable stream frame: {}", e);
                        }
                    }
                }
            }
        };

        Ok(Box::pin(fragments))
    }

    async fn embedding(&self, options: &PredictOptions) -> Result<Vec<f32>, BackendError> {
        let result: EmbeddingResult = self.post("/embedding", options).await?;
        Ok(result.embeddings)
    }

    async fn generate_image(&self, request: &GenerateImageRequest) -> Result<RpcResult, BackendError> {
        self.post("/image", request).await
    }

    async fn tts(&self, request: &TtsRequest) -> Result<RpcResult, BackendError> {
        self.post("/tts", request).await
    }

    async fn audio_transcription(
        &self,
        request: &TranscriptRequest,
    ) -> Result<TranscriptResult, BackendError> {
        self.post("/transcription", request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_without_scheme_gets_http() {
        assert_eq!(HttpBackendClient::new("127.0.0.1:5005").base_url(), "http://127.0.0.1:5005");
        assert_eq!(HttpBackendClient::new("http://gpu-box:9000/").base_url(), "http://gpu-box:9000");
    }

    #[tokio::test]
    async fn test_health_ok() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/health")
            .with_status(200)
            .with_body(r#"{"message":"OK"}"#)
            .expect(2)
            .create_async()
            .await;

        let client = HttpBackendClient::new(&server.url());
        assert_eq!(client.health().await.unwrap(), "OK");
        assert!(client.is_healthy().await);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_engine_failure_keeps_backend_message() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/predict")
            .with_status(500)
            .with_body(r#"{"success":false,"message":"grammar parse error"}"#)
            .create_async()
            .await;

        let client = HttpBackendClient::new(&server.url());
        let err = client.predict(&PredictOptions::default()).await.unwrap_err();
        assert_eq!(err, BackendError::Engine("grammar parse error".into()));
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_transport_failure() {
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();

        let client = HttpBackendClient::new(&format!("127.0.0.1:{}", port));
        let err = client.health().await.unwrap_err();
        assert!(err.is_transport(), "unexpected error: {:?}", err);
    }

    #[tokio::test]
    async fn test_garbled_reply_is_protocol_failure() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/embedding")
            .with_status(200)
            .with_body("not json")
            .create_async()
            .await;

        let client = HttpBackendClient::new(&server.url());
        let err = client.embedding(&PredictOptions::default()).await.unwrap_err();
        assert!(matches!(err, BackendError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_stream_yields_frames_in_order_until_close() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/predict/stream")
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body("data: {\"message\":\"Hel\"}\n\n: keep-alive\n\ndata: {\"message\":\"lo\"}\n\n")
            .create_async()
            .await;

        let client = HttpBackendClient::new(&server.url());
        let stream = client.predict_stream(&PredictOptions::default()).await.unwrap();
        let fragments: Vec<_> = stream.collect().await;
        assert_eq!(fragments, vec![Ok("Hel".to_string()), Ok("lo".to_string())]);
    }

    #[tokio::test]
    async fn test_stream_error_frame_ends_stream() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/predict/stream")
            .with_status(200)
            .with_body("data: {\"message\":\"a\"}\n\ndata: {\"error\":\"out of memory\"}\n\ndata: {\"message\":\"b\"}\n\n")
            .create_async()
            .await;

        let client = HttpBackendClient::new(&server.url());
        let stream = client.predict_stream(&PredictOptions::default()).await.unwrap();
        let fragments: Vec<_> = stream.collect().await;
        assert_eq!(
            fragments,
            vec![Ok("a".to_string()), Err(BackendError::Engine("out of memory".into()))]
        );
    }
}
