use std::io::Read;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use mangashelf_client::MangaDexTransport;
use mangashelf_client::mangadex::DEFAULT_BASE_URL;
use mangashelf_core::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerRegistry};
use mangashelf_core::job::{CreateResolutionJob, JobStatus, WorkerConfig};
use mangashelf_core::job_queue::JobQueue;
use mangashelf_core::models::{MetadataStatus, NewLibraryEntry};
use mangashelf_core::resolver::{ResolutionService, ResolverConfig};
use mangashelf_core::scraper::{ScraperClient, ScraperConfig};
use mangashelf_core::source::{MANGADEX, external_id_from_url};
use mangashelf_core::worker::{TracingWorkerReporter, WorkerService};
use mangashelf_db::{Database, DatabaseConfig};

type MangaDexScraper = ScraperClient<MangaDexTransport>;

#[derive(Parser)]
#[command(name = "mangashelf", version, about = "Manga library import and series resolution")]
struct Cli {
    #[command(flatten)]
    scraper: ScraperArgs,

    #[command(subcommand)]
    command: Commands,
}

/// Resilience settings for outbound source calls.
#[derive(Args, Debug, Clone)]
struct ScraperArgs {
    /// Consecutive counted failures that open a source's circuit
    #[arg(long, global = true, env = "MANGASHELF_BREAKER_THRESHOLD", default_value_t = 5)]
    breaker_threshold: u32,

    /// Seconds an open circuit waits before allowing a probe
    #[arg(long, global = true, env = "MANGASHELF_BREAKER_COOLDOWN_SECS", default_value_t = 30)]
    breaker_cooldown_secs: u64,

    /// Attempts per scrape, including the first
    #[arg(long, global = true, env = "MANGASHELF_SCRAPER_MAX_ATTEMPTS", default_value_t = 3)]
    scraper_max_attempts: u32,

    /// Backoff after the first failed attempt, doubled per attempt
    #[arg(long, global = true, env = "MANGASHELF_SCRAPER_BACKOFF_MS", default_value_t = 500)]
    scraper_backoff_ms: u64,

    /// Per-attempt timeout
    #[arg(long, global = true, env = "MANGASHELF_SCRAPER_TIMEOUT_SECS", default_value_t = 15)]
    scraper_timeout_secs: u64,

    /// Longer Retry-After hints fail the scrape instead of being waited out
    #[arg(long, global = true, env = "MANGASHELF_MAX_RETRY_AFTER_SECS", default_value_t = 60)]
    max_retry_after_secs: u64,

    /// MangaDex API base URL
    #[arg(long, global = true, env = "MANGADEX_API_URL", default_value = DEFAULT_BASE_URL)]
    mangadex_url: String,
}

impl ScraperArgs {
    fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig::default()
            .with_failure_threshold(self.breaker_threshold)
            .with_cooldown(Duration::from_secs(self.breaker_cooldown_secs))
    }

    fn scraper_config(&self) -> ScraperConfig {
        ScraperConfig::default()
            .with_max_attempts(self.scraper_max_attempts)
            .with_backoff(Duration::from_millis(self.scraper_backoff_ms), Duration::from_secs(8))
            .with_attempt_timeout(Duration::from_secs(self.scraper_timeout_secs))
            .with_max_retry_after(Duration::from_secs(self.max_retry_after_secs))
    }

    fn build(&self) -> Result<MangaDexScraper> {
        let timeout = Duration::from_secs(self.scraper_timeout_secs);
        let transport = MangaDexTransport::with_config(&self.mangadex_url, timeout)
            .map_err(|e| anyhow::anyhow!(e))?;
        let breakers = CircuitBreakerRegistry::new(self.breaker_config());
        Ok(ScraperClient::new(transport, breakers, self.scraper_config()))
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Import library entries from a CSV file (title,source_name,source_url)
    Import {
        /// Path to the CSV file
        #[arg(short, long)]
        file: PathBuf,

        /// Only create entries, do not enqueue resolution jobs
        #[arg(long, default_value_t = false)]
        no_enqueue: bool,
    },

    /// Enqueue resolution jobs
    Enqueue {
        /// A single library entry
        #[arg(long, conflicts_with = "pending", required_unless_present = "pending")]
        entry: Option<Uuid>,

        /// Every pending entry
        #[arg(long, default_value_t = false)]
        pending: bool,

        /// Maximum number of pending entries to enqueue
        #[arg(short, long, default_value_t = 100)]
        limit: usize,
    },

    /// Resolve one library entry inline, without the queue
    Resolve {
        #[arg(long)]
        entry: Uuid,
    },

    /// Run resolution workers until Ctrl-C
    Worker {
        /// Number of concurrent worker loops
        #[arg(short, long, default_value_t = 1)]
        workers: usize,

        /// Sleep between polls of an empty queue
        #[arg(long, default_value_t = 5000)]
        poll_interval_ms: u64,

        /// Abandon and reschedule a job running longer than this
        #[arg(long, default_value_t = 120)]
        job_timeout_secs: u64,
    },

    /// Fetch one series from a source through the resilient client
    Scrape {
        /// Source id (e.g. a MangaDex manga UUID)
        #[arg(long, conflicts_with = "url", required_unless_present = "url")]
        id: Option<String>,

        /// Source URL to take the id from
        #[arg(long)]
        url: Option<String>,
    },

    /// List resolution jobs
    Jobs {
        /// Filter by status (pending, running, completed, failed)
        #[arg(short, long)]
        status: Option<JobStatus>,

        /// Number of jobs to show
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("mangashelf=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Import { file, no_enqueue } => {
            let db = connect_db().await?;
            cmd_import(&db, &file, !no_enqueue).await?;
        }
        Commands::Enqueue {
            entry,
            pending,
            limit,
        } => {
            let db = connect_db().await?;
            cmd_enqueue(&db, entry, pending, limit).await?;
        }
        Commands::Resolve { entry } => {
            let db = connect_db().await?;
            let scraper = cli.scraper.build()?;
            cmd_resolve(&db, scraper, entry).await?;
        }
        Commands::Worker {
            workers,
            poll_interval_ms,
            job_timeout_secs,
        } => {
            let db = connect_db().await?;
            let scraper = cli.scraper.build()?;
            let config = WorkerConfig::default()
                .with_poll_interval(Duration::from_millis(poll_interval_ms))
                .with_job_timeout(Duration::from_secs(job_timeout_secs));
            cmd_worker(&db, scraper, workers, config).await?;
        }
        Commands::Scrape { id, url } => {
            let scraper = cli.scraper.build()?;
            let external_id = match (id, url) {
                (Some(id), _) => id,
                (None, Some(url)) => external_id_from_url(MANGADEX, &url)
                    .with_context(|| format!("No MangaDex id in URL: {url}"))?,
                (None, None) => anyhow::bail!("Either --id or --url is required"),
            };
            cmd_scrape(&scraper, &external_id).await?;
        }
        Commands::Jobs { status, limit } => {
            let db = connect_db().await?;
            cmd_jobs(&db, status, limit).await?;
        }
    }

    Ok(())
}

/// Connect to PostgreSQL using DATABASE_URL and apply migrations.
async fn connect_db() -> Result<Database> {
    let config = DatabaseConfig::from_env().map_err(|e| anyhow::anyhow!(e))?;
    let db = Database::connect(&config)
        .await
        .context("Failed to connect to database")?;
    db.migrate().await.map_err(|e| anyhow::anyhow!(e))?;
    Ok(db)
}

#[derive(Debug, Deserialize)]
struct ImportRow {
    title: String,
    source_name: String,
    source_url: String,
}

/// Parses the import CSV. Rows without a title are skipped.
fn read_import_rows<R: Read>(reader: R) -> Result<Vec<NewLibraryEntry>> {
    let mut csv = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
    let mut entries = Vec::new();
    for (i, row) in csv.deserialize::<ImportRow>().enumerate() {
        let row = row.with_context(|| format!("Invalid CSV record {}", i + 1))?;
        if row.title.is_empty() {
            tracing::warn!(record = i + 1, "Skipping row without a title");
            continue;
        }
        entries.push(NewLibraryEntry {
            imported_title: row.title,
            source_name: row.source_name.to_lowercase(),
            source_url: row.source_url,
        });
    }
    Ok(entries)
}

async fn cmd_import(db: &Database, file: &PathBuf, enqueue: bool) -> Result<()> {
    let handle = std::fs::File::open(file)
        .with_context(|| format!("Failed to open CSV file: {}", file.display()))?;
    let rows = read_import_rows(handle)?;

    let library = db.library_repo();
    let queue = db.job_repo();
    let mut queued = 0usize;
    for row in &rows {
        let entry = library
            .insert_entry(row)
            .await
            .map_err(|e| anyhow::anyhow!(e))?;
        if enqueue {
            queue
                .enqueue(CreateResolutionJob::new(entry.id))
                .await
                .map_err(|e| anyhow::anyhow!(e))?;
            queued += 1;
        }
    }

    tracing::info!(imported = rows.len(), queued, "Import complete");
    println!("Imported {} entries, queued {} resolution jobs", rows.len(), queued);
    Ok(())
}

async fn cmd_enqueue(db: &Database, entry: Option<Uuid>, pending: bool, limit: usize) -> Result<()> {
    let ids = match entry {
        Some(id) => vec![id],
        None if pending => db
            .library_repo()
            .list_entry_ids(MetadataStatus::Pending, limit)
            .await
            .map_err(|e| anyhow::anyhow!(e))?,
        None => anyhow::bail!("Either --entry or --pending is required"),
    };

    let queue = db.job_repo();
    for id in &ids {
        let job = queue
            .enqueue(CreateResolutionJob::new(*id))
            .await
            .map_err(|e| anyhow::anyhow!(e))?;
        println!("{}  entry={}  status={}", job.id, job.library_entry_id, job.status);
    }
    println!("\nTotal: {} jobs", ids.len());
    Ok(())
}

async fn cmd_resolve(db: &Database, scraper: MangaDexScraper, entry: Uuid) -> Result<()> {
    let resolver = ResolutionService::new(db.library_repo(), scraper, ResolverConfig::default());
    match resolver.resolve(entry).await {
        Ok(resolution) => {
            let output = serde_json::json!({
                "entry_id": resolution.entry_id,
                "series_id": resolution.series_id,
                "action": resolution.action.to_string(),
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
            Ok(())
        }
        Err(e) => {
            if !e.is_retryable()
                && let Err(mark_err) = resolver.mark_failed(entry, &e.to_string()).await
            {
                tracing::error!(entry_id = %entry, error = %mark_err, "Failed to mark entry failed");
            }
            Err(anyhow::anyhow!(e).context(format!("Failed to resolve entry {entry}")))
        }
    }
}

async fn cmd_worker(
    db: &Database,
    scraper: MangaDexScraper,
    workers: usize,
    config: WorkerConfig,
) -> Result<()> {
    let resolver = ResolutionService::new(db.library_repo(), scraper, ResolverConfig::default());
    let cancel_token = CancellationToken::new();

    let mut handles = Vec::with_capacity(workers);
    for i in 0..workers.max(1) {
        let worker_config = config
            .clone()
            .with_worker_id(format!("{}-{i}", config.worker_id));
        let worker = WorkerService::new(db.job_repo(), resolver.clone(), worker_config);
        let token = cancel_token.clone();
        handles.push(tokio::spawn(async move {
            let reporter = TracingWorkerReporter;
            worker.run(token, &reporter).await
        }));
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    tracing::info!("Shutdown requested, waiting for workers");
    cancel_token.cancel();

    for result in futures::future::join_all(handles).await {
        result
            .context("Worker task panicked")?
            .map_err(|e| anyhow::anyhow!(e))?;
    }
    Ok(())
}

async fn cmd_scrape(scraper: &MangaDexScraper, external_id: &str) -> Result<()> {
    tracing::info!(source = scraper.source_name(), external_id, "Fetching series");
    let metadata = scraper
        .scrape_series(external_id)
        .await
        .map_err(|e| anyhow::anyhow!(e))?;
    println!("{}", serde_json::to_string_pretty(&metadata)?);
    Ok(())
}

async fn cmd_jobs(db: &Database, status: Option<JobStatus>, limit: usize) -> Result<()> {
    let jobs = db
        .job_repo()
        .list_jobs(status, limit)
        .await
        .map_err(|e| anyhow::anyhow!(e))?;

    if jobs.is_empty() {
        println!("No resolution jobs found");
        return Ok(());
    }

    for job in &jobs {
        println!(
            "  [{}] {}  entry={}  retries={}/{}  created={}{}",
            job.status,
            job.id,
            job.library_entry_id,
            job.retry_count,
            job.max_retries,
            job.created_at.format("%Y-%m-%d %H:%M:%S UTC"),
            job.error_message
                .as_deref()
                .map(|e| format!("  error={e}"))
                .unwrap_or_default(),
        );
    }
    println!("\nTotal: {} jobs", jobs.len());
    Ok(())
}
