//! Reference backend. Launched by the gateway as
//! `echo-backend --addr 127.0.0.1:<port>`.

use std::sync::Arc;

use clap::Parser;
use inference_gateway::protocol::{serve, EchoEngine};
use inference_gateway::telemetry;

#[derive(Parser)]
#[command(name = "echo-backend", version = env!("CARGO_PKG_VERSION"))]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:50051")]
    addr: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init_tracing();
    let args = Args::parse();
    serve(&args.addr, Arc::new(EchoEngine::new())).await
}
