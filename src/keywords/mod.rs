// Keyword engine — per-user interest keywords with parabolic decay.
//
// Once a day per active user: the texts of their recent like-subjects are
// contrasted against a random background corpus by an external extractor,
// and the resulting (keyword, score) pairs are merged into the stored
// profile. Established keywords decay slower than tentative ones (the
// parabolic factor), and anything that fades below |0.1| is pruned.

use std::collections::HashMap;
use std::io::Write;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{Duration, SecondsFormat, Utc};
use tracing::{info, warn};

use crate::db::Database;

/// Keywords below this magnitude are pruned after merge.
pub const PRUNE_FLOOR: f64 = 0.1;

/// Days of likes feeding the liked corpus.
const LIKED_WINDOW_DAYS: i64 = 30;

/// Liked-corpus document cap.
const LIKED_CORPUS_CAP: usize = 500;

/// Background corpus size.
const BACKGROUND_CORPUS: usize = 1000;

/// Extracts (keyword, score) pairs from a liked corpus contrasted against
/// a background corpus. The production implementation shells out to the
/// extractor CLI; tests substitute a canned map.
#[async_trait]
pub trait KeywordExtractor: Send + Sync {
    async fn extract(
        &self,
        liked_docs: &[String],
        background_docs: &[String],
    ) -> Result<Vec<(String, f64)>>;
}

/// CLI-backed extractor: writes both corpora to temp files, runs
/// `<command> <liked> <background>`, and parses `keyword\tscore` lines
/// from stdout.
pub struct CliKeywordExtractor {
    command: String,
}

impl CliKeywordExtractor {
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
        }
    }
}

#[async_trait]
impl KeywordExtractor for CliKeywordExtractor {
    async fn extract(
        &self,
        liked_docs: &[String],
        background_docs: &[String],
    ) -> Result<Vec<(String, f64)>> {
        let mut liked_file =
            tempfile::NamedTempFile::new().context("Failed to create liked corpus file")?;
        liked_file
            .write_all(liked_docs.join("\n\n").as_bytes())
            .context("Failed to write liked corpus")?;
        let mut background_file =
            tempfile::NamedTempFile::new().context("Failed to create background corpus file")?;
        background_file
            .write_all(background_docs.join("\n\n").as_bytes())
            .context("Failed to write background corpus")?;

        let mut parts = self.command.split_whitespace();
        let program = parts
            .next()
            .context("EXTRACTOR_COMMAND is empty")?
            .to_string();
        let mut cmd = tokio::process::Command::new(program);
        cmd.args(parts)
            .arg(liked_file.path())
            .arg(background_file.path())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let output = cmd.output().await.context("Keyword extractor failed to run")?;
        if !output.status.success() {
            anyhow::bail!(
                "Keyword extractor exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            );
        }

        Ok(parse_extractor_output(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Parse `keyword\tscore` lines; malformed lines are skipped.
pub fn parse_extractor_output(stdout: &str) -> Vec<(String, f64)> {
    stdout
        .lines()
        .filter_map(|line| {
            let (keyword, score) = line.split_once('\t')?;
            let keyword = keyword.trim().to_lowercase();
            if keyword.is_empty() {
                return None;
            }
            let score: f64 = score.trim().parse().ok()?;
            Some((keyword, score))
        })
        .collect()
}

/// The per-round decay factor for an existing score.
///
/// Established keywords (|score| near 1) decay faster toward the middle of
/// the parabola: decay = 1 − (0.03 + 0.12·(1 − (1−|s|)²)).
pub fn decay_factor(existing: f64) -> f64 {
    let abs = existing.abs();
    let parabolic = 1.0 - (1.0 - abs).powi(2);
    1.0 - (0.03 + 0.12 * parabolic)
}

/// Merge freshly extracted scores into the stored map.
///
/// Every existing keyword decays by its parabolic factor; keywords seen this
/// round then add their new score on top. The result is clamped to [−1, 1].
pub fn merge_scores(
    existing: &HashMap<String, f64>,
    extracted: &[(String, f64)],
) -> HashMap<String, f64> {
    let mut merged: HashMap<String, f64> = existing
        .iter()
        .map(|(k, &score)| (k.clone(), decay_factor(score) * score))
        .collect();

    for (keyword, score) in extracted {
        let entry = merged.entry(keyword.clone()).or_insert(0.0);
        *entry = (*entry + score).clamp(-1.0, 1.0);
    }

    merged
}

pub struct KeywordEngine {
    db: Arc<dyn Database>,
    extractor: Arc<dyn KeywordExtractor>,
}

impl KeywordEngine {
    pub fn new(db: Arc<dyn Database>, extractor: Arc<dyn KeywordExtractor>) -> Self {
        Self { db, extractor }
    }

    /// Rebuild one user's keyword profile. Returns the number of keywords
    /// kept after pruning.
    pub async fn refresh_user(&self, user: &str) -> Result<usize> {
        let since = (Utc::now() - Duration::days(LIKED_WINDOW_DAYS))
            .to_rfc3339_opts(SecondsFormat::Millis, true);
        let liked = self.db.get_liked_texts(user, &since, LIKED_CORPUS_CAP).await?;
        if liked.is_empty() {
            info!(user, "No liked texts, skipping keyword refresh");
            return Ok(0);
        }
        let background = self.db.get_random_texts(BACKGROUND_CORPUS).await?;

        let extracted = match self.extractor.extract(&liked, &background).await {
            Ok(pairs) => pairs,
            Err(e) => {
                warn!(user, error = %e, "Keyword extraction failed");
                return Ok(0);
            }
        };

        let existing: HashMap<String, f64> = self
            .db
            .get_user_keywords(user)
            .await?
            .into_iter()
            .map(|k| (k.keyword, k.score))
            .collect();

        let merged = merge_scores(&existing, &extracted);

        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        for (keyword, score) in &merged {
            self.db
                .upsert_user_keyword(user, keyword, *score, &now)
                .await?;
        }
        let pruned = self.db.prune_user_keywords(user, PRUNE_FLOOR).await?;

        let kept = merged
            .values()
            .filter(|score| score.abs() >= PRUNE_FLOOR)
            .count();
        info!(user, kept, pruned, "Keyword profile refreshed");
        Ok(kept)
    }
}

/// A no-op extractor for tests and unconfigured deployments.
pub struct NoopExtractor;

#[async_trait]
impl KeywordExtractor for NoopExtractor {
    async fn extract(&self, _: &[String], _: &[String]) -> Result<Vec<(String, f64)>> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decay_factor_bounds() {
        // Untouched score decays 3%
        assert!((decay_factor(0.0) - 0.97).abs() < 1e-9);
        // Saturated score decays 15%
        assert!((decay_factor(1.0) - 0.85).abs() < 1e-9);
        assert!((decay_factor(-1.0) - 0.85).abs() < 1e-9);
    }

    #[test]
    fn test_decay_factor_midpoint() {
        // |s| = 0.5: parabolic = 1 - 0.25 = 0.75; decay = 1 - (0.03 + 0.09) = 0.88
        assert!((decay_factor(0.5) - 0.88).abs() < 1e-9);
    }

    #[test]
    fn test_merge_adds_new_keyword() {
        let existing = HashMap::new();
        let merged = merge_scores(&existing, &[("rust".to_string(), 0.4)]);
        assert!((merged["rust"] - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_merge_decays_unseen_keyword() {
        let existing: HashMap<String, f64> = [("fading".to_string(), 0.2)].into_iter().collect();
        let merged = merge_scores(&existing, &[]);
        let expected = decay_factor(0.2) * 0.2;
        assert!((merged["fading"] - expected).abs() < 1e-9);
    }

    #[test]
    fn test_merge_clamps_to_unit_range() {
        let existing: HashMap<String, f64> = [("hot".to_string(), 0.95)].into_iter().collect();
        let merged = merge_scores(&existing, &[("hot".to_string(), 0.5)]);
        assert!((merged["hot"] - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_parse_extractor_output() {
        let parsed = parse_extractor_output("Rust\t0.8\nbad line\nasync\t0.3\n\t0.5\n");
        assert_eq!(
            parsed,
            vec![("rust".to_string(), 0.8), ("async".to_string(), 0.3)]
        );
    }
}
