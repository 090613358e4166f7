use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use docpub::config::PublisherConfig;
use docpub::distribution::HttpGateway;
use docpub::publisher::{JobSummary, Publisher};
use docpub::repository::MemoryRepository;
use docpub::scheduler::{JobRecord, JobStatus, RequestedDocument};
use docpub::shutdown::install_shutdown_handler;
use docpub::store::Store;

#[derive(Parser, Debug)]
#[command(name = "docpub")]
#[command(version)]
#[command(about = "Publishing job coordinator for versioned documents")]
#[command(propagate_version = true)]
struct Args {
    #[command(flatten)]
    common: CommonArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run a job that was already queued in the job store
    Run {
        #[arg(long)]
        job_id: i64,
    },

    /// Queue an ad-hoc job for a publishing system subset and run it
    Subset(SubsetArgs),

    /// Show one job, or the most recent jobs
    Status {
        #[arg(long)]
        job_id: Option<i64>,

        /// Number of recent jobs to list when no job ID is given
        #[arg(long, default_value = "20")]
        limit: i64,

        /// Output format
        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,
    },

    /// Release a push job that is waiting for approval
    Approve {
        #[arg(long)]
        job_id: i64,

        /// Replace the push description sent to the gateway
        #[arg(long)]
        description: Option<String>,
    },

    /// Kill a job; a job waiting for approval stops at its next poll
    Cancel {
        #[arg(long)]
        job_id: i64,
    },
}

// =============================================================================
// Shared Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct CommonArgs {
    /// TOML configuration file
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    /// SQLite URL of the job store (overrides the config file)
    #[arg(long, global = true)]
    database: Option<String>,

    /// JSON fixture for the document repository (overrides the config file)
    #[arg(long, global = true)]
    fixture: Option<PathBuf>,

    /// Base URL of the distribution gateway (overrides the config file)
    #[arg(long, global = true)]
    gateway: Option<String>,

    /// Number of concurrent workers per job
    #[arg(long, global = true)]
    workers: Option<usize>,
}

#[derive(Parser, Debug)]
struct SubsetArgs {
    /// Publishing system name
    system: String,

    /// Subset of the publishing system
    subset: String,

    /// Final output directory
    output_dir: PathBuf,

    /// Job parameter, repeatable (e.g. --param PubType=Export)
    #[arg(long = "param", value_parser = parse_param)]
    params: Vec<(String, String)>,

    /// Explicit document, repeatable, as ID or ID:VERSION
    #[arg(long = "doc", value_parser = parse_doc)]
    docs: Vec<RequestedDocument>,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

fn parse_param(s: &str) -> Result<(String, String), String> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUE, got {:?}", s))?;
    if name.trim().is_empty() {
        return Err(format!("empty parameter name in {:?}", s));
    }
    Ok((name.trim().to_string(), value.to_string()))
}

fn parse_doc(s: &str) -> Result<RequestedDocument, String> {
    let (id, version) = match s.split_once(':') {
        Some((id, version)) => (id, Some(version)),
        None => (s, None),
    };
    let doc_id = id
        .trim()
        .parse::<i64>()
        .map_err(|e| format!("bad document ID {:?}: {}", id, e))?;
    let version = version
        .map(|v| v.trim().parse::<i64>())
        .transpose()
        .map_err(|e| format!("bad version in {:?}: {}", s, e))?;
    Ok(RequestedDocument { doc_id, version })
}

// =============================================================================
// Output Types
// =============================================================================

#[derive(Serialize)]
struct JobSummaryOutput {
    job_id: i64,
    status: String,
    selected: usize,
    published: u32,
    removed: u32,
    errors: u32,
    warnings: u32,
    pushed: Option<usize>,
    message: String,
}

impl From<&JobSummary> for JobSummaryOutput {
    fn from(summary: &JobSummary) -> Self {
        use docpub::distribution::PushOutcome;
        Self {
            job_id: summary.job_id,
            status: summary.status.to_string(),
            selected: summary.selected,
            published: summary.published,
            removed: summary.removed,
            errors: summary.errors,
            warnings: summary.warnings,
            pushed: summary.push.map(|outcome| match outcome {
                PushOutcome::NothingToPush => 0,
                PushOutcome::Pushed { count } => count,
            }),
            message: summary.message.clone(),
        }
    }
}

#[derive(Serialize)]
struct JobOutput {
    job_id: i64,
    system: String,
    subset: String,
    status: String,
    started: String,
    completed: Option<String>,
    output_dir: String,
    parameters: BTreeMap<String, String>,
    messages: String,
}

impl From<&JobRecord> for JobOutput {
    fn from(record: &JobRecord) -> Self {
        Self {
            job_id: record.id,
            system: record.system.clone(),
            subset: record.subset.clone(),
            status: record.status.to_string(),
            started: record.started.to_rfc3339(),
            completed: record.completed.map(|c| c.to_rfc3339()),
            output_dir: record.output_dir.display().to_string(),
            parameters: record.parameters.clone(),
            messages: record.messages.clone(),
        }
    }
}

// =============================================================================
// Setup
// =============================================================================

fn load_config(common: &CommonArgs) -> Result<PublisherConfig, Box<dyn std::error::Error>> {
    let mut config = match &common.config {
        Some(path) => PublisherConfig::load(path)?,
        None => PublisherConfig::default(),
    };
    if let Some(database) = &common.database {
        config.database_url = database.clone();
    }
    if let Some(fixture) = &common.fixture {
        config.repository.fixture = Some(fixture.clone());
    }
    if let Some(gateway) = &common.gateway {
        config.gateway.base_url = Some(gateway.clone());
    }
    if let Some(workers) = common.workers {
        config = config.with_workers(workers);
    }
    Ok(config)
}

async fn build_publisher(config: PublisherConfig) -> Result<Publisher, Box<dyn std::error::Error>> {
    let store = Store::connect(&config.database_url).await?;
    let repository = match &config.repository.fixture {
        Some(path) => MemoryRepository::load(path)?,
        None => {
            tracing::warn!("No repository fixture configured, starting with an empty repository");
            MemoryRepository::new()
        }
    };

    let mut publisher = Publisher::new(config.clone(), store, Arc::new(repository))
        .with_shutdown(install_shutdown_handler());
    if let Some(base_url) = &config.gateway.base_url {
        publisher = publisher.with_gateway(Arc::new(HttpGateway::new(base_url)?));
    }
    Ok(publisher)
}

// =============================================================================
// Command Handlers
// =============================================================================

fn print_summary(
    summary: &JobSummary,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match output_format {
        OutputFormat::Json => {
            let output = JobSummaryOutput::from(summary);
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!("Job ID:    {}", summary.job_id);
            println!("Status:    {}", summary.status);
            println!("Selected:  {}", summary.selected);
            println!("Published: {}", summary.published);
            println!("Removed:   {}", summary.removed);
            println!("Errors:    {}", summary.errors);
            println!("Warnings:  {}", summary.warnings);
            if let Some(outcome) = &summary.push {
                println!("Push:      {:?}", outcome);
            }
            println!("Message:   {}", summary.message);
        }
    }
    Ok(())
}

async fn handle_status(
    store: &Store,
    job_id: Option<i64>,
    limit: i64,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let jobs = match job_id {
        Some(id) => vec![store.job(id).await?],
        None => store.recent_jobs(limit).await?,
    };

    match output_format {
        OutputFormat::Json => {
            let output: Vec<JobOutput> = jobs.iter().map(JobOutput::from).collect();
            if job_id.is_some() {
                println!("{}", serde_json::to_string_pretty(&output[0])?);
            } else {
                println!("{}", serde_json::to_string_pretty(&output)?);
            }
        }
        OutputFormat::Table if job_id.is_some() => {
            let job = &jobs[0];
            println!("Job ID:     {}", job.id);
            println!("System:     {}", job.system);
            println!("Subset:     {}", job.subset);
            println!("Status:     {}", job.status);
            println!("Started:    {}", job.started.format("%Y-%m-%d %H:%M:%S"));
            if let Some(completed) = job.completed {
                println!("Completed:  {}", completed.format("%Y-%m-%d %H:%M:%S"));
            }
            println!("Output Dir: {}", job.output_dir.display());
            if !job.messages.is_empty() {
                println!("Messages:");
                for line in job.messages.lines() {
                    println!("  {}", line);
                }
            }
        }
        OutputFormat::Table => {
            if jobs.is_empty() {
                println!("No jobs found.");
                return Ok(());
            }
            println!(
                "{:<8} {:<22} {:<16} {:<20} SYSTEM",
                "JOB ID", "STATUS", "SUBSET", "STARTED"
            );
            println!("{}", "-".repeat(84));
            for job in &jobs {
                println!(
                    "{:<8} {:<22} {:<16} {:<20} {}",
                    job.id,
                    job.status.to_string(),
                    job.subset,
                    job.started.format("%Y-%m-%d %H:%M:%S").to_string(),
                    job.system
                );
            }
        }
    }
    Ok(())
}

async fn handle_approve(
    store: &Store,
    job_id: i64,
    description: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let status = store.status(job_id).await?;
    if status != JobStatus::WaitingApproval {
        return Err(format!("Job {} is {}, not waiting for approval", job_id, status).into());
    }
    if let Some(description) = description {
        store
            .set_parameter(job_id, "PushJobDescription", &description)
            .await?;
    }
    store
        .update_status(job_id, JobStatus::InProcess, Some("Push released by operator"))
        .await?;
    println!("Job {} released", job_id);
    Ok(())
}

async fn handle_cancel(store: &Store, job_id: i64) -> Result<(), Box<dyn std::error::Error>> {
    let status = store.status(job_id).await?;
    if status.is_terminal() {
        return Err(format!("Job {} already finished with status {}", job_id, status).into());
    }
    let applied = store
        .update_status(job_id, JobStatus::Failure, Some("Job killed by operator"))
        .await?;
    if !applied {
        return Err(format!("Job {} finished before it could be killed", job_id).into());
    }
    println!("Job {} killed", job_id);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = load_config(&args.common)?;

    match args.command {
        Commands::Run { job_id } => {
            let publisher = build_publisher(config).await?;
            let summary = publisher.run_job(job_id).await?;
            print_summary(&summary, &OutputFormat::Table)?;
            if summary.status != JobStatus::Success {
                std::process::exit(1);
            }
        }
        Commands::Subset(adhoc) => {
            let publisher = build_publisher(config).await?;
            let params: BTreeMap<String, String> = adhoc.params.into_iter().collect();
            let job_id = publisher
                .queue_job(
                    &adhoc.system,
                    &adhoc.subset,
                    &adhoc.output_dir,
                    params,
                    &adhoc.docs,
                )
                .await?;
            let summary = publisher.run_job(job_id).await?;
            print_summary(&summary, &adhoc.output)?;
            if summary.status != JobStatus::Success {
                std::process::exit(1);
            }
        }
        Commands::Status {
            job_id,
            limit,
            output,
        } => {
            let store = Store::connect(&config.database_url).await?;
            handle_status(&store, job_id, limit, &output).await?;
        }
        Commands::Approve {
            job_id,
            description,
        } => {
            let store = Store::connect(&config.database_url).await?;
            handle_approve(&store, job_id, description).await?;
        }
        Commands::Cancel { job_id } => {
            let store = Store::connect(&config.database_url).await?;
            handle_cancel(&store, job_id).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_split_on_first_equals() {
        assert_eq!(
            parse_param("PushJobDescription=a=b").unwrap(),
            ("PushJobDescription".to_string(), "a=b".to_string())
        );
        assert!(parse_param("NoValue").is_err());
        assert!(parse_param("=x").is_err());
    }

    #[test]
    fn docs_with_and_without_version() {
        assert_eq!(
            parse_doc("42").unwrap(),
            RequestedDocument {
                doc_id: 42,
                version: None
            }
        );
        assert_eq!(
            parse_doc("42:3").unwrap(),
            RequestedDocument {
                doc_id: 42,
                version: Some(3)
            }
        );
        assert!(parse_doc("x:3").is_err());
        assert!(parse_doc("42:y").is_err());
    }

    #[test]
    fn cli_parses_subset_command() {
        let args = Args::try_parse_from([
            "docpub",
            "--database",
            "sqlite::memory:",
            "subset",
            "Primary",
            "Export",
            "/tmp/out",
            "--param",
            "PubType=Export",
            "--doc",
            "7:2",
        ])
        .unwrap();
        assert_eq!(args.common.database.as_deref(), Some("sqlite::memory:"));
        match args.command {
            Commands::Subset(adhoc) => {
                assert_eq!(adhoc.system, "Primary");
                assert_eq!(adhoc.params, vec![("PubType".to_string(), "Export".to_string())]);
                assert_eq!(adhoc.docs.len(), 1);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
