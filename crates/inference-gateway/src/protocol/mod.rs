//! Backend protocol
//!
//! The RPC contract every engine satisfies: Health, Load, Predict,
//! PredictStream, Embedding, GenerateImage, TTS and AudioTranscription,
//! carried as JSON over HTTP. Images and audio are written to paths supplied
//! by the caller so large payloads never cross the channel.
pub mod types;
pub mod client;
pub mod server;
pub mod echo;
pub use types::*;
pub use client::{Backend, FragmentStream, HttpBackendClient};
pub use server::{router, serve, Engine, TokenSink};
pub use echo::EchoEngine;
