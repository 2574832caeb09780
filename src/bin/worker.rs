//! A small reference worker built on the SDK: registers a couple of text
//! capabilities and serves until the hub goes away.

use anyhow::Context;
use serde_json::json;

use caphub::config::{self, Process};
use caphub::sdk::{Worker, handler_fn};
use caphub::wire::Capability;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    config::init(Process::Worker);
    let config = config::get();

    let _guard = config.log.install();

    let worker_id = config
        .worker
        .worker_id
        .clone()
        .unwrap_or_else(|| "rust-worker".into());

    let worker = Worker::new(worker_id.as_str(), "rust")
        .capability(
            Capability::new("echo", "Echo the payload back").input_schema(
                json!({
                    "type": "object",
                    "properties": { "msg": { "type": "string" } },
                }),
            ),
            handler_fn(|_hub, params| async move {
                Ok(json!({ "echo": params["msg"] }))
            }),
        )
        .capability(
            Capability::new("reverse", "Reverse a string"),
            handler_fn(|_hub, params| async move {
                let text = params["text"]
                    .as_str()
                    .context("missing field: text")?;
                Ok(json!({ "reversed": text.chars().rev().collect::<String>() }))
            }),
        )
        .capability(
            Capability::new("word_count", "Count words in a string"),
            handler_fn(|_hub, params| async move {
                let text = params["text"]
                    .as_str()
                    .context("missing field: text")?;
                Ok(json!({
                    "words": text.split_whitespace().count(),
                    "chars": text.chars().count(),
                }))
            }),
        );

    tracing::info!(
        worker_id = %worker_id,
        hub_address = %config.worker.hub_address,
        "Starting worker"
    );
    worker.run(&config.worker.hub_address).await?;
    Ok(())
}
