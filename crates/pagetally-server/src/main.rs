use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;

use pagetally_core::clock::{Clock, ManualClock, SystemClock};
use pagetally_core::config::Config;
use pagetally_duckdb::DuckDbBackend;
use pagetally_server::auth::tokens::issue_token;
use pagetally_server::state::AppState;
use pagetally_server::{app, import, replay};

/// Id of the site created on first start.
const DEFAULT_SITE_ID: &str = "site_default";

#[derive(Debug, Parser)]
#[command(name = "pagetally", version, about = "Privacy-friendly pageview counter")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the HTTP server (default).
    Serve,
    /// Manage sites.
    #[command(subcommand)]
    Site(SiteCommand),
    /// Manage API tokens.
    #[command(subcommand)]
    Token(TokenCommand),
    /// Load a CSV export into a site.
    Import(ImportArgs),
    /// Replay a CSV export against the count API in real time.
    Replay(ReplayArgs),
    /// Probe `GET /health` of a running server; exits 0 when healthy.
    Health,
}

#[derive(Debug, Subcommand)]
enum SiteCommand {
    Create {
        #[arg(long)]
        name: String,
        #[arg(long)]
        domain: String,
    },
}

#[derive(Debug, Subcommand)]
enum TokenCommand {
    Create {
        #[arg(long)]
        site: String,
        #[arg(long)]
        name: String,
        /// Allow `POST /count`.
        #[arg(long)]
        count: bool,
        /// Allow creating and downloading exports.
        #[arg(long)]
        export: bool,
    },
}

#[derive(Debug, Args)]
struct ImportArgs {
    /// Export file, or `-` for stdin. Files ending in `.gz` are decompressed.
    file: String,
    /// Target site; defaults to the first site.
    #[arg(long)]
    site: Option<String>,
    /// Delete the site's existing hits first.
    #[arg(long)]
    clear: bool,
}

#[derive(Debug, Args)]
struct ReplayArgs {
    /// Export file, or `-` for stdin. Files ending in `.gz` are decompressed.
    file: String,
    /// Target site; defaults to the first site.
    #[arg(long)]
    site: Option<String>,
    /// Speed multiplier; 2 replays an hour of data in half an hour.
    #[arg(long, default_value_t = 1.0)]
    speed: f64,
    /// Skip everything before this time, as `YYYY-MM-DD HH:MM:SS` (UTC).
    #[arg(long, value_parser = parse_start)]
    start: Option<DateTime<Utc>>,
}

fn parse_start(raw: &str) -> Result<DateTime<Utc>, String> {
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .map(|t| t.and_utc())
        .map_err(|e| format!("invalid start time {raw:?}: {e}"))
}

/// `pagetally health`: liveness check for container health checks.
///
/// Calls `GET http://localhost:$PAGETALLY_PORT/health`.
/// Exits 0 if the server responds with HTTP 200, exits 1 otherwise.
fn run_health_check() -> ! {
    let port = std::env::var("PAGETALLY_PORT").unwrap_or_else(|_| "8081".to_string());
    let url = format!("http://localhost:{}/health", port);
    match ureq::get(&url).call() {
        Ok(resp) if resp.status() == 200 => std::process::exit(0),
        _ => std::process::exit(1),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Command::Serve);
    // Keep the health check free of logging output.
    if let Command::Health = command {
        run_health_check();
    }

    // Structured JSON logging. Level controlled via RUST_LOG.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("pagetally=info".parse()?),
        )
        .json()
        .init();

    let cfg = Config::from_env().map_err(|e| anyhow::anyhow!(e))?;
    std::fs::create_dir_all(&cfg.data_dir)?;
    let db_path = cfg.db_path();
    let db = DuckDbBackend::open(&db_path.to_string_lossy(), &cfg.duckdb_memory_limit)
        .with_context(|| format!("opening {}", db_path.display()))?;

    match command {
        Command::Serve => serve(db, cfg).await,
        Command::Site(SiteCommand::Create { name, domain }) => {
            let site = db.create_website(&name, &domain).await?;
            println!("{}", site.id);
            Ok(())
        }
        Command::Token(TokenCommand::Create {
            site,
            name,
            count,
            export,
        }) => {
            if !db.website_exists(&site).await? {
                anyhow::bail!("no such site: {site}");
            }
            let (raw, record) = issue_token(&db, &site, &name, count, export).await?;
            info!(token_id = %record.id, website_id = %site, "API token created");
            println!("{raw}");
            Ok(())
        }
        Command::Import(args) => run_import(db, cfg, args).await,
        Command::Replay(args) => run_replay(db, cfg, args).await,
        Command::Health => run_health_check(),
    }
}

async fn serve(db: DuckDbBackend, cfg: Config) -> Result<()> {
    std::fs::create_dir_all(cfg.export_dir())?;

    // Nothing runs exports yet, so anything unfinished was cut off by a restart.
    let stale = db
        .fail_unfinished_exports("export interrupted by server restart", Utc::now())
        .await?;
    if stale > 0 {
        tracing::warn!(count = stale, "Marked interrupted exports as failed");
    }

    // Seed a default website so the server is usable out of the box.
    if let Err(e) = db.seed_website(DEFAULT_SITE_ID, "localhost").await {
        tracing::warn!(error = %e, "Failed to seed default website");
    } else {
        info!("Default website '{}' (localhost) ready", DEFAULT_SITE_ID);
    }

    let state = Arc::new(AppState::new(db, cfg.clone()));
    state.init_sessions().await?;

    let shutdown = CancellationToken::new();
    let flush_loop = {
        let state = Arc::clone(&state);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            state.run_buffer_flush_loop(shutdown).await;
        })
    };

    let addr = format!("0.0.0.0:{}", cfg.port);
    let app = app::build_app(Arc::clone(&state));
    info!(port = cfg.port, "pagetally listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::signal::ctrl_c().await.ok();
        })
        .await?;

    shutdown.cancel();
    flush_loop.await.ok();
    let timeout = cfg.shutdown_timeout();
    let drained = match tokio::time::timeout(timeout, state.drain_buffer()).await {
        Ok(drained) => drained,
        Err(_) => Err(anyhow::anyhow!(
            "final buffer flush timed out with {} rows still buffered",
            state.memstore.len().await
        )),
    };
    let aborted = state.jobs.shutdown(timeout).await;
    info!(aborted_exports = aborted, "Shutdown complete");
    drained.map(|_| ())
}

async fn resolve_site(db: &DuckDbBackend, site: Option<String>) -> Result<String> {
    match site {
        Some(site) if db.website_exists(&site).await? => Ok(site),
        Some(site) => anyhow::bail!("no such site: {site}"),
        None => db
            .first_website_id()
            .await?
            .context("no sites yet; create one with `pagetally site create`"),
    }
}

async fn run_import(db: DuckDbBackend, cfg: Config, args: ImportArgs) -> Result<()> {
    let site = resolve_site(&db, args.site).await?;
    if args.clear {
        let deleted = db.delete_site_hits(&site).await?;
        info!(website_id = %site, deleted, "Cleared existing hits");
    }

    let state = AppState::new(db, cfg);
    state.init_sessions().await?;
    let input = import::open_input(&args.file)?;
    let summary = import::import_export(&state, &site, input).await?;
    info!(
        website_id = %site,
        read = summary.read,
        rejected = summary.rejected,
        persisted = summary.persisted,
        "Import finished"
    );
    Ok(())
}

async fn run_replay(db: DuckDbBackend, cfg: Config, args: ReplayArgs) -> Result<()> {
    let site = resolve_site(&db, args.site).await?;
    let plan = replay::read_plan(import::open_input(&args.file)?, args.start)?;

    let deleted = db.delete_site_hits(&site).await?;
    info!(website_id = %site, deleted, "Cleared existing hits");
    let (raw, token) = issue_token(&db, &site, "replay", true, false).await?;

    let wall = SystemClock;
    let virtual_clock = Arc::new(ManualClock::new(plan.first_second().unwrap_or_else(|| wall.now())));
    let state = Arc::new(AppState::with_clock(db, cfg, virtual_clock.clone()));
    state.init_sessions().await?;

    let shutdown = CancellationToken::new();
    let flush_loop = {
        let state = Arc::clone(&state);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            state.run_buffer_flush_loop(shutdown).await;
        })
    };

    let app = app::build_app(Arc::clone(&state));
    let result = replay::replay(app, &raw, &virtual_clock, &wall, plan, args.speed).await;

    shutdown.cancel();
    flush_loop.await.ok();
    let drained = state.drain_buffer().await;
    if let Err(e) = state.db.delete_api_token(&token.id).await {
        tracing::warn!(error = %e, "Failed to delete replay token");
    }

    let summary = result?;
    drained?;
    info!(sent = summary.sent, failed = summary.failed, "Replay done");
    Ok(())
}
