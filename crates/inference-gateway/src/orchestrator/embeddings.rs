use serde::Deserialize;

use super::Orchestrator;
use crate::config::ModelConfig;
use crate::error::GatewayError;
use crate::model_runtime::BackendKind;
use crate::protocol::EngineOptions;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum EmbeddingInput {
    Text(String),
    Tokens(Vec<i32>),
}

impl Orchestrator {
    pub async fn embeddings(&self, model: &ModelConfig, input: EmbeddingInput) -> Result<Vec<f32>, GatewayError> {
        let mut llm = self.llm_options(model);
        llm.embeddings = true;
        let descriptor = self.descriptor(model, BackendKind::Llama, EngineOptions::Llm(llm))?;
        let handle = self.resolve(&descriptor).await?;

        let mut options = self.base_predict_options(model);
        match input {
            EmbeddingInput::Text(text) => options.embeddings = text,
            EmbeddingInput::Tokens(tokens) => options.embedding_tokens = tokens,
        }
        self.invoke(&handle, |client| async move { client.embedding(&options).await })
            .await
    }
}
