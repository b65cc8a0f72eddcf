// inference-gateway/crates/inference-gateway/src/main.rs

#[cfg(feature = "cli")]
mod cli {
    use std::io::Write;
    use std::path::{Path, PathBuf};

    use anyhow::Context;
    use clap::{Parser, Subcommand};
    use inference_gateway::orchestrator::image::PromptInput;
    use inference_gateway::orchestrator::{
        ChatMessage, ChatRequest, ChatResponse, EmbeddingInput, ImageOutput, ImageRequest, SpeechRequest,
        TranscriptionRequest,
    };
    use inference_gateway::{metrics, telemetry, GatewayConfig, ModelConfig, Orchestrator};
    use tracing::info;

    /// Local inference gateway over supervised backend processes
    #[derive(Parser)]
    #[command(name = "inference-gateway", version = env!("CARGO_PKG_VERSION"), arg_required_else_help = true)]
    struct Cli {
        #[command(subcommand)]
        command: Commands,

        /// Per-model configuration (JSON)
        #[arg(long, global = true, value_name = "PATH")]
        config: Option<PathBuf>,
    }

    #[derive(Subcommand)]
    enum Commands {
        /// List model files in the model path
        Models,

        /// Generate text from a single user message
        Chat {
            #[arg(short, long)]
            model: String,
            #[arg(short, long)]
            prompt: String,
            #[arg(long)]
            stream: bool,
        },

        /// Generate an image
        Image {
            #[arg(short, long, default_value = "stablediffusion")]
            model: String,
            #[arg(short, long)]
            prompt: String,
            #[arg(long, default_value = "512x512")]
            size: String,
        },

        /// Synthesize speech with a voice model
        Tts {
            #[arg(short, long)]
            model: String,
            #[arg(short, long)]
            text: String,
        },

        /// Transcribe an audio file
        Transcribe {
            #[arg(short, long)]
            model: String,
            #[arg(short, long)]
            file: PathBuf,
            #[arg(long, default_value = "")]
            language: String,
        },

        /// Compute an embedding vector
        Embed {
            #[arg(short, long)]
            model: String,
            #[arg(short, long)]
            text: String,
        },
    }

    fn model_config(path: Option<&Path>, model: &str) -> anyhow::Result<ModelConfig> {
        match path {
            Some(path) => {
                let mut config = ModelConfig::from_file(path)?;
                if config.model.is_empty() {
                    config.model = model.to_string();
                }
                Ok(config)
            }
            None => Ok(ModelConfig::new(model)),
        }
    }

    pub async fn run() -> anyhow::Result<()> {
        telemetry::init_tracing();
        metrics::init_metrics();

        let cli = Cli::parse();
        let cfg = GatewayConfig::from_env()?;
        cfg.print_config();

        let orchestrator = Orchestrator::from_config(cfg);
        let result = execute(&orchestrator, cli).await;

        info!("Stopping backends");
        orchestrator.shutdown().await;
        result
    }

    async fn execute(orchestrator: &Orchestrator, cli: Cli) -> anyhow::Result<()> {
        let config_path = cli.config.as_deref();
        match cli.command {
            Commands::Models => {
                for model in orchestrator.loader().list_models()? {
                    println!("{}", model);
                }
            }
            Commands::Chat { model, prompt, stream } => {
                let model = model_config(config_path, &model)?;
                let request = ChatRequest {
                    messages: vec![ChatMessage::user(prompt)],
                    stream,
                    ..Default::default()
                };
                match orchestrator.chat(&model, request).await? {
                    ChatResponse::Complete(choices) => {
                        for choice in choices {
                            match (choice.content, choice.function_call) {
                                (_, Some(call)) => println!("{}({})", call.name, call.arguments),
                                (Some(content), None) => println!("{}", content),
                                (None, None) => {}
                            }
                        }
                    }
                    ChatResponse::Stream(mut rx) => {
                        while let Some(delta) = rx.recv().await {
                            print!("{}", delta.content);
                            std::io::stdout().flush()?;
                            if let Some(reason) = delta.finish_reason {
                                println!();
                                info!("Stream finished: {}", reason);
                            }
                        }
                    }
                }
            }
            Commands::Image { model, prompt, size } => {
                let model = model_config(config_path, &model)?;
                let request = ImageRequest {
                    prompt: PromptInput::One(prompt),
                    size,
                    ..Default::default()
                };
                for output in orchestrator.image(&model, request).await? {
                    if let ImageOutput::File(name) = output {
                        println!("{}", orchestrator.config().image_dir.join(name).display());
                    }
                }
            }
            Commands::Tts { model, text } => {
                let request = SpeechRequest {
                    model,
                    input: text,
                    backend: None,
                };
                let path = orchestrator.tts(request).await?;
                println!("{}", path.display());
            }
            Commands::Transcribe { model, file, language } => {
                let model = model_config(config_path, &model)?;
                let result = orchestrator
                    .transcribe(&model, TranscriptionRequest { file, language })
                    .await?;
                for segment in &result.segments {
                    println!("[{} - {}] {}", segment.start, segment.end, segment.text);
                }
            }
            Commands::Embed { model, text } => {
                let model = model_config(config_path, &model)?;
                let vector = orchestrator.embeddings(&model, EmbeddingInput::Text(text)).await?;
                println!("{}", serde_json::to_string(&vector).context("encoding embedding")?);
            }
        }
        Ok(())
    }
}

#[cfg(feature = "cli")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    cli::run().await
}

#[cfg(not(feature = "cli"))]
fn main() {
    println!("CLI feature not enabled. Enable with --features cli");
}
