use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;
use tokio::sync::{mpsc, watch};
use tracing::info;

use tideline::appview::AppViewClient;
use tideline::config::Config;
use tideline::db::{self, Database};
use tideline::firehose::Ingester;
use tideline::graph::GraphService;
use tideline::jobs::JobRunner;
use tideline::keywords::{CliKeywordExtractor, KeywordEngine};
use tideline::ranking::RankingEngine;
use tideline::semantic::clusterer::CliClusterer;
use tideline::semantic::embedder::CliEmbedder;
use tideline::semantic::vectors::{QdrantIndex, VectorIndex};
use tideline::semantic::SemanticPipeline;
use tideline::serve::ServeEngine;
use tideline::server::{self, AppState};
use tideline::taste::{PostLikerSource, TasteEngine};
use tideline::tracking::Tracker;

/// Tideline: a personalized feed generator for Bluesky.
///
/// Ingests the jetstream firehose, models each whitelisted user's
/// interests, and serves ranked feed skeletons over XRPC.
#[derive(Parser)]
#[command(name = "tideline", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database and run migrations
    Init,

    /// Run the firehose ingester process (plus background jobs)
    Ingest,

    /// Run the HTTP server process (plus background jobs)
    Serve,

    /// Run ingester and server in one process
    Run,

    /// Force a follow-graph rebuild for one user
    Graph {
        /// The user DID to rebuild
        #[arg(long)]
        user: String,
    },

    /// Force a keyword refresh for one user
    Keywords {
        /// The user DID to refresh
        #[arg(long)]
        user: String,
    },

    /// Force a semantic candidate batch build for one user
    Batch {
        /// The user DID to build for
        #[arg(long)]
        user: String,
    },

    /// Show system status (cursor age, row counts)
    Status,
}

/// Everything the long-running processes share.
struct Services {
    db: Arc<dyn Database>,
    config: Arc<Config>,
    tracker: Arc<Tracker>,
    graph: Arc<GraphService>,
    taste: Arc<TasteEngine>,
    keywords: Arc<KeywordEngine>,
    semantic: Arc<SemanticPipeline>,
    ranking: Arc<RankingEngine>,
    likers: Arc<dyn PostLikerSource>,
}

fn build_services(config: Config, db: Arc<dyn Database>) -> Result<Services> {
    let config = Arc::new(config);
    let appview = Arc::new(AppViewClient::new(&config.appview_url)?);
    let graph = Arc::new(GraphService::new(db.clone(), appview.clone()));
    let likers: Arc<dyn PostLikerSource> = graph.clone();
    let taste = Arc::new(TasteEngine::new(db.clone(), likers.clone()));
    let tracker = Arc::new(Tracker::new(db.clone(), config.whitelist.clone()));
    let ranking = Arc::new(RankingEngine::new(db.clone(), graph.clone()));

    let index: Arc<dyn VectorIndex> = Arc::new(QdrantIndex::new(&config.qdrant_url)?);
    let embedder = Arc::new(CliEmbedder::new(
        &config.embedder_command,
        &config.embedder_model_path,
    ));
    let clusterer = Arc::new(CliClusterer::new(&config.clusterer_command));
    let keywords = Arc::new(KeywordEngine::new(
        db.clone(),
        Arc::new(CliKeywordExtractor::new(&config.extractor_command)),
    ));
    let semantic = Arc::new(SemanticPipeline::new(
        db.clone(),
        ranking.clone(),
        appview,
        index,
        embedder,
        clusterer,
    ));

    Ok(Services {
        db,
        config,
        tracker,
        graph,
        taste,
        keywords,
        semantic,
        ranking,
        likers,
    })
}

/// Flip the shutdown signal on Ctrl-C.
fn watch_shutdown() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            let _ = tx.send(true);
        }
    });
    rx
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if missing)
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("tideline=info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init => {
            info!("Initializing database...");
            let config = Config::load()?;
            let db = db::initialize(&config.db_path)?;
            let table_count = db.table_count().await?;
            println!("Database initialized at: {}", config.db_path);
            println!("Tables created: {table_count}");
            println!("\nNext: set up your .env (see .env.example), then run:");
            println!("  cargo run -- run");
        }

        Commands::Ingest => {
            let config = Config::load()?;
            config.require_identity()?;
            let db = db::open(&config.db_path)?;
            let services = build_services(config, db)?;
            let shutdown = watch_shutdown();

            services.tracker.refresh().await?;

            let (trigger_tx, trigger_rx) = mpsc::channel(16);
            // Unused in a pure ingester process, but the job runner consumes
            // the receiver either way
            drop(trigger_tx);
            let jobs = Arc::new(JobRunner::new(
                services.db.clone(),
                services.tracker.clone(),
                services.graph.clone(),
                services.keywords.clone(),
                services.semantic.clone(),
            ));
            let handles = jobs.spawn(trigger_rx, shutdown.clone());

            let ingester = Ingester::new(
                services.db.clone(),
                services.tracker.clone(),
                services.taste.clone(),
                &services.config.jetstream_url,
                services.config.reconnect_delay_secs,
            );
            ingester.run(shutdown).await?;

            for handle in handles {
                let _ = handle.await;
            }
        }

        Commands::Serve => {
            let config = Config::load()?;
            config.require_identity()?;
            let db = db::open(&config.db_path)?;
            let services = build_services(config, db)?;
            let shutdown = watch_shutdown();

            services.tracker.refresh().await?;

            let (trigger_tx, trigger_rx) = mpsc::channel(16);
            let jobs = Arc::new(JobRunner::new(
                services.db.clone(),
                services.tracker.clone(),
                services.graph.clone(),
                services.keywords.clone(),
                services.semantic.clone(),
            ));
            let _handles = jobs.spawn(trigger_rx, shutdown);

            let serve_engine = Arc::new(ServeEngine::new(
                services.db.clone(),
                services.ranking.clone(),
                trigger_tx,
            ));
            let state = AppState {
                db: services.db.clone(),
                config: services.config.clone(),
                serve: serve_engine,
                likers: services.likers.clone(),
                auth: Arc::new(server::auth::JwtClaimAuth),
            };
            server::run_server(
                state,
                &services.config.listen_host,
                services.config.listen_port,
            )
            .await?;
        }

        Commands::Run => {
            let config = Config::load()?;
            config.require_identity()?;
            let db = db::open(&config.db_path)?;
            let services = build_services(config, db)?;
            let shutdown = watch_shutdown();

            services.tracker.refresh().await?;

            let (trigger_tx, trigger_rx) = mpsc::channel(16);
            let jobs = Arc::new(JobRunner::new(
                services.db.clone(),
                services.tracker.clone(),
                services.graph.clone(),
                services.keywords.clone(),
                services.semantic.clone(),
            ));
            let _handles = jobs.spawn(trigger_rx, shutdown.clone());

            let ingester = Ingester::new(
                services.db.clone(),
                services.tracker.clone(),
                services.taste.clone(),
                &services.config.jetstream_url,
                services.config.reconnect_delay_secs,
            );
            let ingest_handle = tokio::spawn(async move { ingester.run(shutdown).await });

            let serve_engine = Arc::new(ServeEngine::new(
                services.db.clone(),
                services.ranking.clone(),
                trigger_tx,
            ));
            let state = AppState {
                db: services.db.clone(),
                config: services.config.clone(),
                serve: serve_engine,
                likers: services.likers.clone(),
                auth: Arc::new(server::auth::JwtClaimAuth),
            };
            server::run_server(
                state,
                &services.config.listen_host,
                services.config.listen_port,
            )
            .await?;

            let _ = ingest_handle.await;
        }

        Commands::Graph { user } => {
            let config = Config::load()?;
            let db = db::open(&config.db_path)?;
            let services = build_services(config, db)?;
            println!("Rebuilding follow graph for {user}...");
            let ran = services.graph.build_user_graph(&user).await?;
            if ran {
                println!("{}", "Graph rebuild complete.".bold());
            } else {
                println!("Graph is fresh (rebuilt within 24h); nothing to do.");
            }
        }

        Commands::Keywords { user } => {
            let config = Config::load()?;
            let db = db::open(&config.db_path)?;
            let services = build_services(config, db)?;
            println!("Refreshing keywords for {user}...");
            let kept = services.keywords.refresh_user(&user).await?;
            println!("{}", format!("Keyword profile refreshed: {kept} kept.").bold());
        }

        Commands::Batch { user } => {
            let config = Config::load()?;
            config.require_pipelines()?;
            let db = db::open(&config.db_path)?;
            let services = build_services(config, db)?;
            println!("Building semantic candidate batch for {user}...");
            let ran = services.semantic.run_all(&[user], true).await?;
            if ran {
                println!("{}", "Candidate batch build complete.".bold());
            } else {
                println!("Pipeline busy; try again shortly.");
            }
        }

        Commands::Status => {
            let config = Config::load()?;
            let db = db::open(&config.db_path)?;
            tideline::status::show(&db, &config.db_path).await?;
        }
    }

    Ok(())
}
