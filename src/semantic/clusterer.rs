// Clusterer — liked-post vectors to interest centroids, via an external CLI.
//
// Input: weighted vectors with their interaction type. Output: 1–5 centroids
// (L2-normalized means) with normalized weights. The density parameters
// live inside the CLI; this wrapper owns only the contract.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Liked-post vectors below this count skip clustering entirely.
pub const MIN_CLUSTER_INPUT: usize = 3;

#[derive(Debug, Clone, Serialize)]
pub struct ClusterInput {
    pub vector: Vec<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
    #[serde(rename = "interactionType")]
    pub interaction_type: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Centroid {
    #[serde(rename = "clusterId")]
    pub cluster_id: i64,
    pub centroid: Vec<f32>,
    pub weight: f64,
    #[serde(rename = "postCount")]
    pub post_count: usize,
}

#[async_trait]
pub trait Clusterer: Send + Sync {
    async fn cluster(&self, inputs: &[ClusterInput]) -> Result<Vec<Centroid>>;
}

pub struct CliClusterer {
    command: String,
}

impl CliClusterer {
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
        }
    }
}

#[async_trait]
impl Clusterer for CliClusterer {
    async fn cluster(&self, inputs: &[ClusterInput]) -> Result<Vec<Centroid>> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }

        let dir = tempfile::tempdir().context("Failed to create cluster workspace")?;
        let input_path = dir.path().join("input.json");
        let output_path = dir.path().join("output.json");
        std::fs::write(&input_path, serde_json::to_vec(inputs)?)
            .context("Failed to write cluster input")?;

        let mut parts = self.command.split_whitespace();
        let program = parts
            .next()
            .context("CLUSTERER_COMMAND is empty")?
            .to_string();
        let status = tokio::process::Command::new(program)
            .args(parts)
            .arg(&input_path)
            .arg(&output_path)
            .status()
            .await
            .context("Clusterer failed to run")?;
        if !status.success() {
            anyhow::bail!("Clusterer exited with {status}");
        }

        let raw = std::fs::read(&output_path).context("Failed to read cluster output")?;
        serde_json::from_slice(&raw).context("Failed to parse cluster output")
    }
}

/// L2-normalize a vector in place; zero vectors stay zero.
pub fn l2_normalize(vector: &mut [f32]) {
    let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
}
