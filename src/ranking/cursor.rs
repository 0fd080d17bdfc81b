// Pagination cursors.
//
// The sort key (score, indexedAtMs, uri) is total, so a cursor encoding
// that triple pins a position in any fixed snapshot. Cursors are opaque
// strings of the form "score::timestampMs::uri".

use anyhow::{Context, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct Cursor {
    pub score: f64,
    pub indexed_at_ms: i64,
    pub uri: String,
}

impl Cursor {
    pub fn encode(&self) -> String {
        format!("{}::{}::{}", self.score, self.indexed_at_ms, self.uri)
    }

    pub fn decode(raw: &str) -> Result<Self> {
        let mut parts = raw.splitn(3, "::");
        let score = parts
            .next()
            .context("Cursor missing score")?
            .parse::<f64>()
            .context("Cursor score is not a number")?;
        let indexed_at_ms = parts
            .next()
            .context("Cursor missing timestamp")?
            .parse::<i64>()
            .context("Cursor timestamp is not a number")?;
        let uri = parts.next().context("Cursor missing uri")?.to_string();
        if uri.is_empty() {
            anyhow::bail!("Cursor uri is empty");
        }
        Ok(Self {
            score,
            indexed_at_ms,
            uri,
        })
    }

    /// Strict ordering on the ranking sort key: higher score first, then
    /// newer post, then URI ascending as the tiebreaker.
    pub fn sort_key_after(&self, score: f64, indexed_at_ms: i64, uri: &str) -> bool {
        match score
            .partial_cmp(&self.score)
            .unwrap_or(std::cmp::Ordering::Equal)
        {
            std::cmp::Ordering::Less => true,
            std::cmp::Ordering::Greater => false,
            std::cmp::Ordering::Equal => match indexed_at_ms.cmp(&self.indexed_at_ms) {
                std::cmp::Ordering::Less => true,
                std::cmp::Ordering::Greater => false,
                std::cmp::Ordering::Equal => uri > self.uri.as_str(),
            },
        }
    }
}
