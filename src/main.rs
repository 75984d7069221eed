use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use cubeforge::config::{NodeConfig, WaitConfig};
use cubeforge::cube::{parse_timestamp, Cube, CubeDescriptor, EngineType, Segment};
use cubeforge::execution::{ExecutableState, Job, JobOutput};
use cubeforge::harness::{self, ScenarioReport, SCENARIOS};
use cubeforge::node::Node;
use cubeforge::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "cubeforge")]
#[command(version)]
#[command(about = "Leader-elected batch build orchestrator for cube segments")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run a scheduler instance against a data directory
    Server(ServerArgs),

    /// Cube and segment management
    Cube {
        #[command(flatten)]
        store: StoreArgs,

        #[command(subcommand)]
        command: CubeCommands,
    },

    /// Job management
    Job {
        #[command(flatten)]
        store: StoreArgs,

        #[command(subcommand)]
        command: JobCommands,
    },

    /// Cluster status
    Cluster {
        #[command(flatten)]
        store: StoreArgs,

        #[command(subcommand)]
        command: ClusterCommands,
    },

    /// Build-cube integration scenarios
    Scenario {
        #[command(flatten)]
        store: StoreArgs,

        #[command(subcommand)]
        command: ScenarioCommands,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Directory holding job, cube and lease documents
    #[arg(long, default_value = "./cubeforge-data")]
    data_dir: PathBuf,

    /// Identity written into the scheduler lease
    #[arg(long, default_value = "scheduler-1")]
    node_id: String,

    /// Maximum number of jobs driven concurrently
    #[arg(long, default_value = "4")]
    pool_size: usize,

    /// Dispatch loop period
    #[arg(long, default_value = "500")]
    poll_interval_ms: u64,

    /// Lease lifetime after each renewal
    #[arg(long, default_value = "10000")]
    lease_ttl_ms: u64,

    /// How often the active instance renews its lease
    #[arg(long, default_value = "3000")]
    lease_renew_interval_ms: u64,

    /// Duration of each simulated data-processing step
    #[arg(long, default_value = "0")]
    step_delay_ms: u64,
}

// =============================================================================
// Store Arguments (shared by cube, job, cluster and scenario commands)
// =============================================================================

#[derive(Parser, Debug)]
struct StoreArgs {
    /// Directory holding job, cube and lease documents
    #[arg(long, short = 'd', default_value = "./cubeforge-data")]
    data_dir: PathBuf,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// Cube Commands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum CubeCommands {
    /// Create an empty cube
    Create {
        name: String,

        /// Start of the first segment (YYYY-MM-DD, RFC 3339 or epoch millis)
        #[arg(long, default_value = "0")]
        partition_start: String,

        /// Build engine: layered or in-memory
        #[arg(long, default_value = "layered")]
        engine: String,
    },
    /// List cubes
    List,
    /// Show a cube and its segments
    Show { name: String },
    /// Append the next segment up to END without building it
    Append { name: String, end: String },
    /// Remove every segment of a cube
    Clear { name: String },
    /// Append the next segment up to END and submit its build job
    Build {
        name: String,
        end: String,

        #[arg(long, default_value = "CLI")]
        submitter: String,

        /// Wait for the job to finish
        #[arg(long)]
        wait: bool,

        /// Give up waiting after this many seconds
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
}

// =============================================================================
// Job Commands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum JobCommands {
    /// Get status and step outputs of a job
    Status { job_id: Uuid },
    /// List all jobs, oldest first
    List {
        /// Only jobs in this status
        #[arg(long)]
        status: Option<ExecutableState>,
    },
    /// Delete a job that is not RUNNING
    Delete { job_id: Uuid },
    /// Abandon a READY, RUNNING or STOPPED job
    Discard { job_id: Uuid },
    /// Pause a RUNNING job after its current step
    Pause { job_id: Uuid },
    /// Make a STOPPED job runnable again
    Resume { job_id: Uuid },
    /// Block until a job reaches SUCCEED, ERROR or DISCARDED
    Wait {
        job_id: Uuid,

        #[arg(long)]
        timeout_secs: Option<u64>,

        #[arg(long, default_value = "5000")]
        poll_interval_ms: u64,
    },
}

#[derive(clap::Subcommand, Debug)]
enum ClusterCommands {
    /// Show which scheduler holds the lease
    Status,
}

#[derive(clap::Subcommand, Debug)]
enum ScenarioCommands {
    /// List registered scenarios
    List,
    /// Run scenarios concurrently and check every job SUCCEEDs
    Run {
        /// Scenario names; all when omitted
        names: Vec<String>,

        /// Also run a scheduler in this process
        #[arg(long)]
        with_scheduler: bool,

        #[arg(long, default_value = "200")]
        poll_interval_ms: u64,
    },
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct JobListItem {
    job_id: Uuid,
    name: String,
    status: ExecutableState,
    submitter: String,
    steps_done: usize,
    steps_total: usize,
    created_at_ms: i64,
}

impl From<&Job> for JobListItem {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id,
            name: job.name.clone(),
            status: job.status,
            submitter: job.submitter.clone(),
            steps_done: job
                .steps
                .iter()
                .filter(|s| s.status == ExecutableState::Succeed)
                .count(),
            steps_total: job.steps.len(),
            created_at_ms: job.created_at.timestamp_millis(),
        }
    }
}

#[derive(Serialize)]
struct BuildOutput {
    job_id: Uuid,
    segment: Segment,
    status: Option<ExecutableState>,
}

#[derive(Serialize)]
struct ClusterStatusOutput {
    active: bool,
    holder: Option<String>,
    expires_at_ms: Option<i64>,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn init_tracing(default_filter: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();
}

async fn open_node(store: &StoreArgs) -> Result<Node, Box<dyn std::error::Error>> {
    Ok(Node::open(NodeConfig::default().with_data_dir(&store.data_dir)).await?)
}

fn print_json<T: Serialize>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_cube(cube: &Cube) {
    println!("Cube:            {}", cube.name);
    println!("Engine:          {}", cube.descriptor.engine);
    println!("Partition start: {}", cube.descriptor.partition_date_start);
    if cube.segments.is_empty() {
        println!("Segments:        none");
        return;
    }
    println!();
    println!("{:<38} {:<30} {:<8} BUILT BY", "SEGMENT ID", "NAME", "STATUS");
    println!("{}", "-".repeat(116));
    for s in &cube.segments {
        let built_by = s
            .last_build_job
            .map(|j| j.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!("{:<38} {:<30} {:<8} {}", s.id, s.name, s.status, built_by);
    }
}

fn print_job_output(output: &JobOutput) {
    println!("Job ID:   {}", output.job_id);
    println!("Status:   {}", output.status);
    for (k, v) in &output.output.info {
        println!("{:<9} {}", format!("{}:", k), v);
    }
    if let Some(error) = &output.output.error {
        println!("Error:");
        for line in error.lines() {
            println!("  {}", line);
        }
    }
    println!();
    println!("{:<4} {:<40} {:<10} ERROR", "#", "STEP", "STATUS");
    println!("{}", "-".repeat(70));
    for step in &output.steps {
        println!(
            "{:<4} {:<40} {:<10} {}",
            step.index,
            step.name,
            step.status,
            step.error.as_deref().unwrap_or("")
        );
    }
}

fn print_report(report: &ScenarioReport) {
    println!("{:<24} {:<38} STATUS", "SCENARIO", "JOB ID");
    println!("{}", "-".repeat(72));
    for result in &report.results {
        if let Some(error) = &result.error {
            println!("{:<24} {:<38} {}", result.name, "-", error);
        }
        for job in &result.jobs {
            println!("{:<24} {:<38} {}", result.name, job.job_id, job.status);
        }
    }
    println!();
    println!("{} jobs, all succeeded: {}", report.job_count(), report.all_succeeded());
}

// =============================================================================
// Server Implementation
// =============================================================================

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_tracing("info");

    let config = NodeConfig::new(args.node_id)
        .with_data_dir(&args.data_dir)
        .with_pool_size(args.pool_size)
        .with_poll_interval(Duration::from_millis(args.poll_interval_ms))
        .with_lease_ttl(
            Duration::from_millis(args.lease_ttl_ms),
            Duration::from_millis(args.lease_renew_interval_ms),
        )
        .with_step_delay(Duration::from_millis(args.step_delay_ms));

    if config.scheduler.lease_renew_interval_ms >= config.scheduler.lease_ttl_ms {
        return Err("--lease-renew-interval-ms must be below --lease-ttl-ms".into());
    }

    tracing::info!(
        node_id = %config.scheduler.node_id,
        data_dir = %args.data_dir.display(),
        pool_size = config.scheduler.pool_size,
        lease_ttl_ms = config.scheduler.lease_ttl_ms,
        "Starting cubeforge scheduler"
    );

    let node = Node::open(config).await?;
    let shutdown = install_shutdown_handler();
    node.run(shutdown).await?;
    Ok(())
}

// =============================================================================
// Command Handlers
// =============================================================================

async fn handle_cube(store: StoreArgs, command: CubeCommands) -> Result<(), Box<dyn std::error::Error>> {
    let node = open_node(&store).await?;
    let cubes = node.cubes();

    match command {
        CubeCommands::Create {
            name,
            partition_start,
            engine,
        } => {
            let descriptor = CubeDescriptor {
                partition_date_start: parse_timestamp(&partition_start)?,
                engine: engine.parse::<EngineType>()?,
            };
            let created = cubes.create_cube(&name, descriptor).await?;
            match store.output {
                OutputFormat::Json => print_json(&created.cube)?,
                OutputFormat::Table => println!("Cube '{}' created.", name),
            }
        }
        CubeCommands::List => {
            let all = cubes.list_cubes().await?;
            match store.output {
                OutputFormat::Json => print_json(&all)?,
                OutputFormat::Table => {
                    if all.is_empty() {
                        println!("No cubes found.");
                    } else {
                        println!("{:<32} {:<10} SEGMENTS", "CUBE", "ENGINE");
                        println!("{}", "-".repeat(52));
                        for cube in &all {
                            println!(
                                "{:<32} {:<10} {}",
                                cube.name,
                                cube.descriptor.engine,
                                cube.segments.len()
                            );
                        }
                    }
                }
            }
        }
        CubeCommands::Show { name } => {
            let cube = cubes.get_cube(&name).await?.cube;
            match store.output {
                OutputFormat::Json => print_json(&cube)?,
                OutputFormat::Table => print_cube(&cube),
            }
        }
        CubeCommands::Append { name, end } => {
            let segment = cubes.append_and_commit(&name, parse_timestamp(&end)?).await?;
            match store.output {
                OutputFormat::Json => print_json(&segment)?,
                OutputFormat::Table => println!("Segment {} ({}) appended.", segment.name, segment.id),
            }
        }
        CubeCommands::Clear { name } => {
            let cleared = node.clear_segments(&name).await?;
            match store.output {
                OutputFormat::Json => print_json(&cleared.cube)?,
                OutputFormat::Table => println!("All segments of '{}' removed.", name),
            }
        }
        CubeCommands::Build {
            name,
            end,
            submitter,
            wait,
            timeout_secs,
        } => {
            let handle = node
                .build_segment(&name, parse_timestamp(&end)?, &submitter)
                .await?;
            let status = if wait {
                let mut config = WaitConfig::default().with_poll_interval(Duration::from_millis(500));
                if let Some(secs) = timeout_secs {
                    config = config.with_timeout(Duration::from_secs(secs));
                }
                let cancel = install_shutdown_handler();
                Some(
                    node.registry()
                        .wait_for_final(&handle.job_id, &config, &cancel)
                        .await?,
                )
            } else {
                None
            };

            match store.output {
                OutputFormat::Json => print_json(&BuildOutput {
                    job_id: handle.job_id,
                    segment: handle.segment,
                    status,
                })?,
                OutputFormat::Table => {
                    println!("Segment: {}", handle.segment.name);
                    println!("Job ID:  {}", handle.job_id);
                    if let Some(status) = status {
                        println!("Status:  {}", status);
                    }
                }
            }
            if matches!(status, Some(s) if s != ExecutableState::Succeed) {
                std::process::exit(1);
            }
        }
    }
    Ok(())
}

async fn handle_job(store: StoreArgs, command: JobCommands) -> Result<(), Box<dyn std::error::Error>> {
    let node = open_node(&store).await?;
    let registry = node.registry();

    match command {
        JobCommands::Status { job_id } => {
            let output = registry.get_output(&job_id).await?;
            match store.output {
                OutputFormat::Json => print_json(&output)?,
                OutputFormat::Table => print_job_output(&output),
            }
        }
        JobCommands::List { status } => {
            let jobs: Vec<JobListItem> = registry
                .list_jobs()
                .await?
                .iter()
                .filter(|j| status.map_or(true, |s| j.status == s))
                .map(JobListItem::from)
                .collect();
            match store.output {
                OutputFormat::Json => print_json(&jobs)?,
                OutputFormat::Table => {
                    if jobs.is_empty() {
                        println!("No jobs found.");
                    } else {
                        println!("{:<38} {:<10} {:<7} NAME", "JOB ID", "STATUS", "STEPS");
                        println!("{}", "-".repeat(100));
                        for job in &jobs {
                            println!(
                                "{:<38} {:<10} {:<7} {}",
                                job.job_id,
                                job.status,
                                format!("{}/{}", job.steps_done, job.steps_total),
                                job.name
                            );
                        }
                    }
                }
            }
        }
        JobCommands::Delete { job_id } => {
            registry.delete(&job_id).await?;
            println!("Job {} deleted.", job_id);
        }
        JobCommands::Discard { job_id } => {
            let job = registry.discard(&job_id).await?;
            println!("Job {} is {}.", job_id, job.status);
        }
        JobCommands::Pause { job_id } => {
            let job = registry.pause(&job_id).await?;
            println!("Job {} is {}.", job_id, job.status);
        }
        JobCommands::Resume { job_id } => {
            let job = registry.resume(&job_id).await?;
            println!("Job {} is {}.", job_id, job.status);
        }
        JobCommands::Wait {
            job_id,
            timeout_secs,
            poll_interval_ms,
        } => {
            if node.active_scheduler().await.is_err() {
                eprintln!("Warning: no scheduler holds the lease; the job stays READY until one does.");
            }
            let mut config = WaitConfig::default().with_poll_interval(Duration::from_millis(poll_interval_ms));
            if let Some(secs) = timeout_secs {
                config = config.with_timeout(Duration::from_secs(secs));
            }
            let cancel = install_shutdown_handler();
            let status = registry.wait_for_final(&job_id, &config, &cancel).await?;
            println!("Job {} is {}.", job_id, status);
            if status != ExecutableState::Succeed {
                std::process::exit(1);
            }
        }
    }
    Ok(())
}

async fn handle_cluster(store: StoreArgs, command: ClusterCommands) -> Result<(), Box<dyn std::error::Error>> {
    let node = open_node(&store).await?;

    match command {
        ClusterCommands::Status => {
            let active = node.active_scheduler().await.ok();
            let output = ClusterStatusOutput {
                active: active.is_some(),
                holder: active.as_ref().map(|r| r.holder.clone()),
                expires_at_ms: active.as_ref().map(|r| r.expires_at.timestamp_millis()),
            };
            match store.output {
                OutputFormat::Json => print_json(&output)?,
                OutputFormat::Table => match active {
                    Some(record) => {
                        println!("Active scheduler: {}", record.holder);
                        println!("Lease expires:    {}", record.expires_at.to_rfc3339());
                    }
                    None => println!("No scheduler holds the lease."),
                },
            }
        }
    }
    Ok(())
}

async fn handle_scenario(
    store: StoreArgs,
    command: ScenarioCommands,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        ScenarioCommands::List => {
            println!("{:<24} {:<26} {:<10} DESCRIPTION", "NAME", "CUBE", "ENGINE");
            println!("{}", "-".repeat(100));
            for s in SCENARIOS {
                println!("{:<24} {:<26} {:<10} {}", s.name, s.cube, s.engine, s.description);
            }
            Ok(())
        }
        ScenarioCommands::Run {
            names,
            with_scheduler,
            poll_interval_ms,
        } => {
            init_tracing("info");

            let config = NodeConfig::new(format!("scenario-{}", std::process::id()))
                .with_data_dir(&store.data_dir)
                .with_poll_interval(Duration::from_millis(poll_interval_ms))
                .with_wait(WaitConfig::default().with_poll_interval(Duration::from_millis(poll_interval_ms)));
            let node = Node::open(config).await?;
            let shutdown = install_shutdown_handler();

            harness::prepare(&node).await?;
            let names: Vec<&str> = if names.is_empty() {
                SCENARIOS.iter().map(|s| s.name).collect()
            } else {
                names.iter().map(String::as_str).collect()
            };

            let scheduler_stop = shutdown.child_token();
            let report = if with_scheduler {
                let run = node.run(scheduler_stop.clone());
                let scenarios = async {
                    let report = harness::run_scenarios(&node, &names, &shutdown).await;
                    scheduler_stop.cancel();
                    report
                };
                let (ran, report) = tokio::join!(run, scenarios);
                ran?;
                report?
            } else {
                harness::run_scenarios(&node, &names, &shutdown).await?
            };

            match store.output {
                OutputFormat::Json => print_json(&report)?,
                OutputFormat::Table => print_report(&report),
            }
            report.ensure_succeeded()?;
            Ok(())
        }
    }
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => run_server(server_args).await?,
        Commands::Cube { store, command } => handle_cube(store, command).await?,
        Commands::Job { store, command } => handle_job(store, command).await?,
        Commands::Cluster { store, command } => handle_cluster(store, command).await?,
        Commands::Scenario { store, command } => handle_scenario(store, command).await?,
    }

    Ok(())
}
