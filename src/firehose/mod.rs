// Firehose ingestion — jetstream subscription, event parsing, write batching.

pub mod batch;
pub mod event;
pub mod ingester;

pub use ingester::{Ingester, CURSOR_KEY};
