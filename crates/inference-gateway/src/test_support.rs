//! Scriptable fakes for the backend seams, shared by unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;

use crate::error::{BackendError, GatewayError};
use crate::model_runtime::descriptor::BackendDescriptor;
use crate::model_runtime::launcher::{BackendLauncher, LaunchedBackend};
use crate::model_runtime::process::{ProcessControl, ProcessState};
use crate::protocol::*;

/// In-process `Backend`. Unscripted predictions echo the prompt.
pub struct FakeBackend {
    healthy: AtomicBool,
    load_result: Mutex<RpcResult>,
    replies: Mutex<VecDeque<Result<String, BackendError>>>,
    fragments: Mutex<Vec<Result<String, BackendError>>>,
    embedding: Mutex<Vec<f32>>,
    predict_delay: Mutex<Duration>,
    requests: Mutex<Vec<PredictOptions>>,
    health_calls: AtomicUsize,
    load_calls: AtomicUsize,
    backend_calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self {
            healthy: AtomicBool::new(true),
            load_result: Mutex::new(RpcResult::ok("Loading succeeded")),
            replies: Mutex::new(VecDeque::new()),
            fragments: Mutex::new(Vec::new()),
            embedding: Mutex::new(vec![0.5, 0.25]),
            predict_delay: Mutex::new(Duration::ZERO),
            requests: Mutex::new(Vec::new()),
            health_calls: AtomicUsize::new(0),
            load_calls: AtomicUsize::new(0),
            backend_calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn set_load_result(&self, result: RpcResult) {
        *self.load_result.lock().unwrap() = result;
    }

    pub fn push_reply(&self, reply: Result<String, BackendError>) {
        self.replies.lock().unwrap().push_back(reply);
    }

    pub fn set_fragments(&self, fragments: Vec<Result<String, BackendError>>) {
        *self.fragments.lock().unwrap() = fragments;
    }

    pub fn set_embedding(&self, embedding: Vec<f32>) {
        *self.embedding.lock().unwrap() = embedding;
    }

    pub fn set_predict_delay(&self, delay: Duration) {
        *self.predict_delay.lock().unwrap() = delay;
    }

    /// Every `PredictOptions` received, in arrival order.
    pub fn requests(&self) -> Vec<PredictOptions> {
        self.requests.lock().unwrap().clone()
    }

    pub fn health_count(&self) -> usize {
        self.health_calls.load(Ordering::SeqCst)
    }

    pub fn load_count(&self) -> usize {
        self.load_calls.load(Ordering::SeqCst)
    }

    /// Inference calls of any kind (predict, stream, embedding, image, tts, transcription).
    pub fn call_count(&self) -> usize {
        self.backend_calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn enter(&self) {
        self.backend_calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let delay = *self.predict_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    fn leave(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Backend for FakeBackend {
    async fn health(&self) -> Result<String, BackendError> {
        self.health_calls.fetch_add(1, Ordering::SeqCst);
        if self.healthy.load(Ordering::SeqCst) {
            Ok("OK".into())
        } else {
            Err(BackendError::Transport("connection refused".into()))
        }
    }

    async fn load(&self, _request: &LoadRequest) -> Result<RpcResult, BackendError> {
        self.load_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.load_result.lock().unwrap().clone())
    }

    async fn predict(&self, options: &PredictOptions) -> Result<String, BackendError> {
        self.requests.lock().unwrap().push(options.clone());
        self.enter().await;
        let scripted = self.replies.lock().unwrap().pop_front();
        self.leave();
        scripted.unwrap_or_else(|| Ok(options.prompt.clone()))
    }

    async fn predict_stream(&self, options: &PredictOptions) -> Result<FragmentStream, BackendError> {
        self.requests.lock().unwrap().push(options.clone());
        self.enter().await;
        self.leave();
        let fragments = self.fragments.lock().unwrap().clone();
        Ok(futures::stream::iter(fragments).boxed())
    }

    async fn embedding(&self, options: &PredictOptions) -> Result<Vec<f32>, BackendError> {
        self.requests.lock().unwrap().push(options.clone());
        self.enter().await;
        self.leave();
        Ok(self.embedding.lock().unwrap().clone())
    }

    /// A positive prompt of `fail` is refused without writing anything.
    async fn generate_image(&self, request: &GenerateImageRequest) -> Result<RpcResult, BackendError> {
        self.enter().await;
        self.leave();
        if request.positive_prompt == "fail" {
            return Ok(RpcResult::failed("diffusion failed"));
        }
        std::fs::write(&request.dst, request.positive_prompt.as_bytes())
            .map_err(|e| BackendError::Engine(e.to_string()))?;
        Ok(RpcResult::ok("Image generated"))
    }

    async fn tts(&self, request: &TtsRequest) -> Result<RpcResult, BackendError> {
        self.enter().await;
        self.leave();
        std::fs::write(&request.dst, request.text.as_bytes()).map_err(|e| BackendError::Engine(e.to_string()))?;
        Ok(RpcResult::ok("Audio generated"))
    }

    async fn audio_transcription(&self, _request: &TranscriptRequest) -> Result<TranscriptResult, BackendError> {
        self.enter().await;
        self.leave();
        Ok(TranscriptResult {
            segments: vec![TranscriptSegment {
                id: 0,
                start: 0,
                end: 1_000,
                text: "hello".into(),
                tokens: vec![1, 2],
            }],
            text: "hello".into(),
        })
    }
}

/// Observable side of a `FakeProcess` that has been handed to a handle.
#[derive(Clone)]
pub struct ProcessProbe {
    alive: Arc<AtomicBool>,
    stops: Arc<AtomicUsize>,
}

impl ProcessProbe {
    /// Simulate the process crashing.
    pub fn kill(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

pub struct FakeProcess {
    alive: Arc<AtomicBool>,
    stops: Arc<AtomicUsize>,
    state: ProcessState,
}

impl FakeProcess {
    pub fn new() -> Self {
        Self {
            alive: Arc::new(AtomicBool::new(true)),
            stops: Arc::new(AtomicUsize::new(0)),
            state: ProcessState::Ready,
        }
    }

    pub fn probe(&self) -> ProcessProbe {
        ProcessProbe {
            alive: self.alive.clone(),
            stops: self.stops.clone(),
        }
    }

    pub fn stop_counter(&self) -> Arc<AtomicUsize> {
        self.stops.clone()
    }
}

#[async_trait]
impl ProcessControl for FakeProcess {
    fn state(&self) -> ProcessState {
        self.state
    }

    fn set_state(&mut self, state: ProcessState) {
        self.state = state;
    }

    fn is_alive(&mut self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn stop(&mut self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.alive.store(false, Ordering::SeqCst);
        self.state = ProcessState::Stopped;
    }
}

/// Hands out the same `FakeBackend` on every launch, each time with a fresh
/// `FakeProcess`.
pub struct FakeLauncher {
    backend: Arc<FakeBackend>,
    delay: Duration,
    spawns: AtomicUsize,
    fail_next: AtomicBool,
    processes: Mutex<Vec<ProcessProbe>>,
}

impl FakeLauncher {
    pub fn new(backend: FakeBackend) -> Self {
        Self {
            backend: Arc::new(backend),
            delay: Duration::ZERO,
            spawns: AtomicUsize::new(0),
            fail_next: AtomicBool::new(false),
            processes: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn backend(&self) -> &Arc<FakeBackend> {
        &self.backend
    }

    pub fn spawn_count(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }

    pub fn fail_next_launch(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// Probe of the `index`-th process launched.
    pub fn process(&self, index: usize) -> ProcessProbe {
        self.processes.lock().unwrap()[index].clone()
    }
}

#[async_trait]
impl BackendLauncher for FakeLauncher {
    async fn launch(&self, descriptor: &BackendDescriptor) -> Result<LaunchedBackend, GatewayError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(GatewayError::load(&descriptor.model, "backend not ready after 1 attempts"));
        }

        self.spawns.fetch_add(1, Ordering::SeqCst);
        let process = FakeProcess::new();
        self.processes.lock().unwrap().push(process.probe());
        Ok(LaunchedBackend {
            address: format!("fake://{}", descriptor.model),
            client: self.backend.clone(),
            process: Some(Box::new(process)),
        })
    }
}
