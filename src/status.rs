// System status display for the CLI.

use std::sync::Arc;

use anyhow::Result;
use chrono::{TimeZone, Utc};
use colored::Colorize;

use crate::db::Database;

/// Print store statistics and ingestion health.
pub async fn show(db: &Arc<dyn Database>, db_display: &str) -> Result<()> {
    let stats = db.get_stats().await?;

    println!("{}", "=== Tideline Status ===".bold());
    println!("  Database:       {db_display}");
    println!("  Posts:          {}", stats.posts);
    println!("  Follow edges:   {}", stats.follows);
    println!("  Interactions:   {}", stats.interactions);
    println!("  Keywords:       {}", stats.keywords);
    println!("  Batch rows:     {}", stats.batch_rows);

    match &stats.cursor {
        Some(cursor) => {
            let age = cursor
                .parse::<i64>()
                .ok()
                .and_then(|us| Utc.timestamp_micros(us).single())
                .map(|t| Utc::now() - t);
            match age {
                Some(age) if age.num_seconds() >= 0 => {
                    let text = format!(
                        "  Firehose:       cursor {cursor} ({}s behind)",
                        age.num_seconds()
                    );
                    if age.num_minutes() > 5 {
                        println!("{}", text.yellow());
                    } else {
                        println!("{text}");
                    }
                }
                _ => println!("  Firehose:       cursor {cursor}"),
            }
        }
        None => println!("{}", "  Firehose:       no cursor (never ingested)".dimmed()),
    }

    Ok(())
}
