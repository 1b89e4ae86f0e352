use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use flowgate::{
    config::AppConfig,
    discovery::ConsulClient,
    domain::DeploymentRequest,
    observability::{init_observability, log_config_info},
    xds::{start_xds_server, ConnectionTracker, PublishController, SnapshotCache, Synthesizer},
    APP_NAME, VERSION,
};
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "flowgate")]
#[command(about = "Envoy API gateway control plane")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// YAML configuration file; FLOWGATE_* variables override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Deploy the definitions found in a directory and serve ADS
    Serve {
        /// Directory of deployment requests (*.yaml, *.yml, *.json)
        #[arg(long)]
        definitions: Option<PathBuf>,
    },
    /// Synthesize deployment requests without serving them
    Validate {
        /// Deployment request files or directories
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if it exists (optional - won't fail if missing)
    if let Err(e) = dotenvy::dotenv() {
        if !e.to_string().contains("not found") {
            eprintln!("Warning: Error loading .env file: {}", e);
        }
    }

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => AppConfig::from_file(path)?,
        None => AppConfig::from_env()?,
    };
    init_observability(&config.observability)?;

    match cli.command {
        Commands::Serve { definitions } => serve(config, definitions).await,
        Commands::Validate { paths } => validate(&config, &paths),
    }
}

async fn serve(config: AppConfig, definitions: Option<PathBuf>) -> anyhow::Result<()> {
    info!(app_name = APP_NAME, version = VERSION, "Starting Envoy control plane");
    log_config_info(&config);

    let cache = Arc::new(SnapshotCache::new());
    let tracker = Arc::new(ConnectionTracker::default());
    let controller = if config.registry.enabled {
        let client = Arc::new(ConsulClient::new(&config.registry)?);
        PublishController::with_registry(config.envoy.clone(), cache.clone(), client, &config.registry)
    } else {
        PublishController::new(config.envoy.clone(), cache.clone())
    };

    if let Some(dir) = definitions {
        for path in definition_files(&dir)? {
            let request = load_request(&path)?;
            let key = request.definition.key();
            match controller.deploy(request.definition, request.labels).await {
                Ok(result) => info!(api = %key, file = %path.display(), labels = ?result.labels, "Deployed API"),
                Err(e) if e.is_validation() => {
                    warn!(api = %key, file = %path.display(), error = %e, "Rejected API definition")
                }
                Err(e) => return Err(e).with_context(|| format!("deploying {}", path.display())),
            }
        }
    }

    let shutdown = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for shutdown signal");
        }
        info!("Shutdown signal received for xDS server");
    };

    let result = start_xds_server(&config.xds, cache, tracker, shutdown).await;
    controller.shutdown().await;
    result?;

    info!("Control plane shutdown completed");
    Ok(())
}

fn validate(config: &AppConfig, paths: &[PathBuf]) -> anyhow::Result<()> {
    let synthesizer = Synthesizer::new(config.envoy.clone());
    let mut failures = 0usize;

    for root in paths {
        let files = if root.is_dir() { definition_files(root)? } else { vec![root.clone()] };
        for path in files {
            let outcome = load_request(&path)
                .and_then(|request| Ok(synthesizer.synthesize(&request.definition)?));
            match outcome {
                Ok(artifacts) => {
                    println!(
                        "{}: ok ({} routes, {} clusters)",
                        path.display(),
                        artifacts.routes.len(),
                        artifacts.clusters.len()
                    );
                    for warning in &artifacts.warnings {
                        println!("  warning: {}", warning);
                    }
                }
                Err(e) => {
                    failures += 1;
                    println!("{}: {:#}", path.display(), e);
                }
            }
        }
    }

    if failures > 0 {
        anyhow::bail!("{} definition(s) failed validation", failures);
    }
    Ok(())
}

fn definition_files(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))? {
        let path = entry?.path();
        let supported = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| matches!(ext, "yaml" | "yml" | "json"));
        if path.is_file() && supported {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn load_request(path: &Path) -> anyhow::Result<DeploymentRequest> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let request = if path.extension().is_some_and(|ext| ext == "json") {
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?
    } else {
        serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?
    };
    Ok(request)
}
