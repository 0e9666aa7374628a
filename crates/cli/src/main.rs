//! probekit CLI - run AI-vision browser test cases.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use probekit_browser::CloudExecutor;
use probekit_core::{ExecutionMode, ExecutionRequest, Settings, TestCase};
use probekit_execution::{CacheKey, ExecutionManager, ExecutionQueue, FallbackService};
use probekit_resources::ResourceManager;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "probekit")]
#[command(about = "Resource-aware AI browser test execution", long_about = None)]
struct Cli {
    /// Settings file (TOML)
    #[arg(long, global = true, default_value = "probekit.toml")]
    config: PathBuf,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a test case file
    Run {
        /// Test case JSON file
        file: PathBuf,
        /// headless or browser
        #[arg(long, default_value = "headless")]
        mode: ExecutionMode,
    },
    /// Produce a simulated result without starting a browser
    Simulate {
        /// Test case JSON file
        file: PathBuf,
        #[arg(long, default_value = "headless")]
        mode: ExecutionMode,
    },
    /// Show current resource usage and limits
    Resources,
    /// Print the cache key of a test case
    CacheKey {
        /// Test case JSON file
        file: PathBuf,
        #[arg(long, default_value = "headless")]
        mode: ExecutionMode,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // logs go to stderr, results to stdout
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let settings = Settings::load(&cli.config)
        .and_then(Settings::with_env_overrides)
        .with_context(|| format!("failed to load settings from {}", cli.config.display()))?;

    match cli.command {
        Commands::Run { file, mode } => run(settings, &file, mode).await?,
        Commands::Simulate { file, mode } => {
            let testcase = load_testcase(&file)?;
            let resources = Arc::new(ResourceManager::with_system_sampler(settings.resources.clone()));
            let service = FallbackService::new(
                resources,
                Arc::new(ExecutionQueue::new(&settings.queue)),
                Arc::new(CloudExecutor::from_settings(settings.executor.clone())),
                settings.executor.clone(),
            );
            let request = ExecutionRequest::new(testcase, mode);
            let result = service.simulate(&request, "requested from the command line");
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::Resources => {
            let resources = ResourceManager::with_system_sampler(settings.resources.clone());
            println!("{}", serde_json::to_string_pretty(&resources.report())?);
        }
        Commands::CacheKey { file, mode } => {
            let testcase = load_testcase(&file)?;
            println!("{}", CacheKey::for_testcase(&testcase, mode));
        }
    }

    Ok(())
}

async fn run(settings: Settings, file: &Path, mode: ExecutionMode) -> Result<()> {
    let testcase = load_testcase(file)?;
    let resources = Arc::new(ResourceManager::with_system_sampler(settings.resources.clone()));
    let executor = Arc::new(CloudExecutor::from_settings(settings.executor.clone()));
    let manager = ExecutionManager::new(&settings, resources, executor);
    manager.start();

    let receipt = manager.submit(testcase, mode, None);
    info!("Execution {} is {}", receipt.execution_id, receipt.status);

    // queue wait plus the longest possible run
    let budget = settings.resources.max_execution_time()
        + Duration::from_secs(settings.queue.wait_per_item_secs * settings.queue.max_size as u64);
    let result = match receipt.result {
        Some(result) => Some(result),
        None => manager.wait_for(&receipt.execution_id, budget).await,
    };

    match result {
        Some(result) => println!("{}", serde_json::to_string_pretty(&result)?),
        None => {
            warn!("Execution {} did not finish in time", receipt.execution_id);
            if let Some(status) = manager.status(&receipt.execution_id) {
                println!("{}", serde_json::to_string_pretty(&status)?);
            }
        }
    }

    manager.shutdown().await;
    Ok(())
}

fn load_testcase(path: &Path) -> Result<TestCase> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let testcase: TestCase = serde_json::from_str(&content)
        .with_context(|| format!("invalid test case in {}", path.display()))?;
    Ok(testcase)
}

