// Embedder — text + image URLs to a 512-dim vector, via an external CLI.
//
// The model runs out of process: we write the batch as JSON, invoke
// `<command> <input.json> <output.json> --model-path ... --batch-size 32`,
// and read the vectors back. Zero-vectors (the CLI's "nothing to embed"
// marker) are rejected here so they never reach the index.

use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::vectors::VECTOR_DIM;

/// Batch size handed to the CLI.
pub const EMBED_BATCH: usize = 32;

/// One unit of embeddable content.
#[derive(Debug, Clone, Serialize)]
pub struct EmbedInput {
    pub uri: String,
    pub text: String,
    pub image_urls: Vec<String>,
    pub alt_text: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct EmbedOutput {
    uri: String,
    vector: Vec<f32>,
}

#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a batch. URIs whose content couldn't be embedded are absent
    /// from the result.
    async fn embed(&self, inputs: &[EmbedInput]) -> Result<HashMap<String, Vec<f32>>>;
}

pub struct CliEmbedder {
    command: String,
    model_path: String,
}

impl CliEmbedder {
    pub fn new(command: &str, model_path: &str) -> Self {
        Self {
            command: command.to_string(),
            model_path: model_path.to_string(),
        }
    }
}

#[async_trait]
impl Embedder for CliEmbedder {
    async fn embed(&self, inputs: &[EmbedInput]) -> Result<HashMap<String, Vec<f32>>> {
        if inputs.is_empty() {
            return Ok(HashMap::new());
        }

        let dir = tempfile::tempdir().context("Failed to create embed workspace")?;
        let input_path = dir.path().join("input.json");
        let output_path = dir.path().join("output.json");
        std::fs::write(&input_path, serde_json::to_vec(inputs)?)
            .context("Failed to write embed input")?;

        let mut parts = self.command.split_whitespace();
        let program = parts.next().context("EMBEDDER_COMMAND is empty")?.to_string();
        let status = tokio::process::Command::new(program)
            .args(parts)
            .arg(&input_path)
            .arg(&output_path)
            .arg("--model-path")
            .arg(&self.model_path)
            .arg("--batch-size")
            .arg(EMBED_BATCH.to_string())
            .status()
            .await
            .context("Embedder failed to run")?;
        if !status.success() {
            anyhow::bail!("Embedder exited with {status}");
        }

        let raw = std::fs::read(&output_path).context("Failed to read embed output")?;
        let outputs: Vec<EmbedOutput> =
            serde_json::from_slice(&raw).context("Failed to parse embed output")?;

        let mut vectors = HashMap::new();
        for output in outputs {
            if output.vector.len() != VECTOR_DIM {
                continue;
            }
            if is_zero_vector(&output.vector) {
                continue;
            }
            vectors.insert(output.uri, output.vector);
        }
        Ok(vectors)
    }
}

/// The CLI emits all-zeros when a post had no embeddable content.
pub fn is_zero_vector(vector: &[f32]) -> bool {
    vector.iter().all(|v| *v == 0.0)
}
