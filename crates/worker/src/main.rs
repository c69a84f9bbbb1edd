use anyhow::Context;
use clap::{Parser, Subcommand};
use rightsize_core::applier::http::HttpApplier;
use rightsize_core::applier::simulated::SimulatedApplier;
use rightsize_core::applier::Applier;
use rightsize_core::config::Settings;
use rightsize_core::domain::recommendation::Actor;
use rightsize_core::execution::{ExecutionCoordinator, ExecutionPolicy};
use rightsize_core::feed::provider::HttpJsonFeed;
use rightsize_core::feed::{FeedClient, FileFeed};
use rightsize_core::generator::GeneratorOptions;
use rightsize_core::storage::memory::MemoryStore;
use rightsize_core::storage::pg::PgStore;
use rightsize_core::storage::runs::{record_generation_run, GenerationRun};
use rightsize_core::storage::RecommendationStore;
use rightsize_core::workflow::{ApprovalPolicy, ApprovalWorkflow, Decision};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

mod cycle;
mod stub_feed;

#[derive(Debug, Parser)]
#[command(name = "rightsize_worker")]
struct Args {
    /// Use an in-memory store, the stub feed and a simulated applier. Nothing leaves the process.
    #[arg(long, global = true)]
    dry_run: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Fetch predictions, generate and route recommendations, then execute approved ones.
    Cycle {
        /// Read the feed payload from a JSON file instead of the HTTP feed.
        #[arg(long)]
        input: Option<PathBuf>,

        /// Stop after routing; leave approved recommendations for a later `dispatch`.
        #[arg(long)]
        no_dispatch: bool,
    },

    /// Execute every AUTO_APPROVED / APPROVED recommendation.
    Dispatch,

    /// Route stranded PENDING records, recover stranded executions and failures, expire stale reviews.
    Reconcile,

    /// Record a review decision for a recommendation awaiting review.
    Decide {
        id: Uuid,

        /// approve | reject
        decision: Decision,

        #[arg(long)]
        actor: String,
    },

    /// Realized monthly savings over a window.
    Summary {
        /// YYYY-MM-DD
        #[arg(long)]
        since: Option<String>,

        /// YYYY-MM-DD, inclusive
        #[arg(long)]
        until: Option<String>,

        #[arg(long)]
        days: Option<i64>,
    },
}

struct Engine {
    store: Arc<dyn RecommendationStore>,
    pool: Option<sqlx::PgPool>,
    workflow: ApprovalWorkflow,
    coordinator: ExecutionCoordinator,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = Settings::from_env()?;
    let _sentry_guard = init_sentry(&settings);

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .with(sentry_tracing::layer())
        .init();

    let args = Args::parse();

    let res = run(args, &settings).await;
    if let Err(err) = &res {
        sentry_anyhow::capture_anyhow(err);
        tracing::error!(error = %format!("{err:#}"), "worker run failed");
    }
    res
}

async fn run(args: Args, settings: &Settings) -> anyhow::Result<()> {
    let engine = build_engine(settings, args.dry_run).await?;

    match args.command {
        Command::Cycle { input, no_dispatch } => {
            let feed: Box<dyn FeedClient> = match input {
                Some(path) => Box::new(FileFeed::new(path)),
                None if args.dry_run => Box::new(stub_feed::StubFeed::new(chrono::Utc::now())),
                None => Box::new(HttpJsonFeed::from_settings(settings)?),
            };
            run_cycle(&engine, feed.as_ref(), !no_dispatch).await
        }
        Command::Dispatch => {
            let report = engine.coordinator.dispatch_approved().await?;
            tracing::info!(?report, "dispatch finished");
            Ok(())
        }
        Command::Reconcile => {
            let now = chrono::Utc::now();
            let routed = engine.workflow.route_stranded_pending(now).await?;
            let expired = engine.workflow.expire_stale_reviews(now).await?;
            let report = engine.coordinator.reconcile(now).await?;
            tracing::info!(
                routed_pending = routed.len(),
                expired_reviews = expired.len(),
                ?report,
                "reconcile finished"
            );
            Ok(())
        }
        Command::Decide {
            id,
            decision,
            actor,
        } => {
            let actor = Actor::approver(&actor)?;
            let rec = engine.workflow.decide(id, decision, actor).await?;
            tracing::info!(recommendation_id = %rec.id, status = %rec.status, "decision recorded");
            Ok(())
        }
        Command::Summary { since, until, days } => {
            let (start, end) = rightsize_core::time::window::resolve_window(
                since.as_deref(),
                until.as_deref(),
                days,
                chrono::Utc::now(),
            )?;
            let summary = engine.store.realized_savings(start, end).await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&summary).context("serialize summary failed")?
            );
            Ok(())
        }
    }
}

async fn build_engine(settings: &Settings, dry_run: bool) -> anyhow::Result<Engine> {
    let approval = ApprovalPolicy::from_env()?;
    let execution = ExecutionPolicy::from_env()?;

    let applier = select_applier(settings, dry_run)?;

    let store: Arc<dyn RecommendationStore>;
    let pool: Option<sqlx::PgPool>;
    if dry_run {
        tracing::info!(dry_run = true, "using in-memory store and simulated applier");
        store = Arc::new(MemoryStore::new());
        pool = None;
    } else {
        let db_url = settings.require_database_url()?;
        let pg = sqlx::postgres::PgPoolOptions::new()
            .max_connections(5)
            .connect(db_url)
            .await
            .context("connect DATABASE_URL failed")?;
        rightsize_core::storage::migrate(&pg).await?;

        store = Arc::new(PgStore::new(pg.clone()));
        pool = Some(pg);
    }

    tracing::info!(
        applier = applier.name(),
        worker_id = %settings.worker_id,
        "engine ready"
    );

    Ok(Engine {
        workflow: ApprovalWorkflow::new(store.clone(), approval),
        coordinator: ExecutionCoordinator::new(
            store.clone(),
            applier,
            execution,
            settings.worker_id.clone(),
        ),
        store,
        pool,
    })
}

/// Only `--dry-run` simulates changes; a live run without `APPLIER_BASE_URL` is an error.
fn select_applier(settings: &Settings, dry_run: bool) -> anyhow::Result<Arc<dyn Applier>> {
    if dry_run {
        return Ok(Arc::new(SimulatedApplier));
    }
    Ok(Arc::new(HttpApplier::from_settings(settings)?))
}

async fn run_cycle(
    engine: &Engine,
    feed: &dyn FeedClient,
    dispatch: bool,
) -> anyhow::Result<()> {
    let opts = GeneratorOptions::from_env()?;
    let source = feed.source_name();

    let (generated_at, raw, outcome) = match feed.fetch_predictions().await {
        Ok((batch, raw)) => {
            let generated_at = batch.generated_at;
            let outcome = cycle::run_cycle(engine.store.as_ref(), &engine.workflow, batch, &opts).await;
            (generated_at, Some(raw), outcome)
        }
        Err(err) => (chrono::Utc::now(), None, Err(err)),
    };

    if let Some(pool) = &engine.pool {
        let error = outcome.as_ref().err().map(|e| format!("{e:#}"));
        let (created_count, skipped_count) = outcome
            .as_ref()
            .map(|r| (r.created, r.skipped_open))
            .unwrap_or_default();
        let run_id = record_generation_run(
            pool,
            GenerationRun {
                generated_at,
                source,
                error: error.as_deref(),
                created_count,
                skipped_count,
                raw_feed: raw,
            },
        )
        .await?;
        tracing::info!(%run_id, source, "generation run recorded");
    }

    let report = outcome?;
    tracing::info!(
        source,
        generated = report.generated,
        created = report.created,
        skipped_open = report.skipped_open,
        auto_approved = report.auto_approved,
        awaiting_review = report.awaiting_review,
        routing_failed = report.routing_failed,
        "generation cycle finished"
    );

    if dispatch {
        let report = engine.coordinator.dispatch_approved().await?;
        tracing::info!(?report, "dispatch finished");
    }
    Ok(())
}

fn init_sentry(settings: &Settings) -> Option<sentry::ClientInitGuard> {
    let dsn = settings.sentry_dsn.as_deref()?;
    Some(sentry::init((
        dsn,
        sentry::ClientOptions {
            release: sentry::release_name!(),
            ..Default::default()
        },
    )))
}
