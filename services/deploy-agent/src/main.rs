//! fuzzdeploy Deploy Agent
//!
//! Runs the fuzzing manager on GCE in a continuous loop, rebuilding and
//! restarting it whenever its sources, kernel or image change.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info};

use fuzzdeploy_agent::cloud::{
    BlobStore, GceClient, GcsClient, ImagePublisher, ImageService, MetadataClient,
};
use fuzzdeploy_agent::dashboard::DashboardClient;
use fuzzdeploy_agent::exec::{CommandRunner, ProcessRunner};
use fuzzdeploy_agent::layout::WorkspaceLayout;
use fuzzdeploy_agent::sources::{ImageSource, KernelSource, PatchSetSource, SyzkallerSource};
use fuzzdeploy_agent::status::{self, StatusState};
use fuzzdeploy_agent::{
    logging, ChangeSource, Config, ManagerLauncher, ProcessSupervisor, SignalController, Updater,
    UpdaterConfig, WorkerPort,
};

/// Continuous-deployment supervisor for the fuzzing manager.
#[derive(Debug, Parser)]
#[command(name = "deploy-agent", version, about)]
struct Cli {
    /// Path to the JSON config file.
    #[arg(long, env = "FUZZDEPLOY_CONFIG")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let logs = match logging::init() {
        Ok(logs) => logs,
        Err(e) => {
            eprintln!("failed to initialize logging: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    match run(cli, logs).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{e:#}"), "Deploy agent failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli, logs: logging::LogCache) -> Result<()> {
    let config = Config::from_file(&cli.config)?;
    info!(
        name = %config.name,
        image_archive = %config.image_archive,
        http_port = config.http_port,
        "Configuration loaded"
    );

    let port = WorkerPort::new();
    status::serve(
        config.http_port,
        StatusState {
            name: config.name.clone(),
            port: port.clone(),
            logs,
        },
    )
    .await
    .with_context(|| format!("failed to listen on port {}", config.http_port))?;

    let wd = std::env::current_dir().context("failed to get working directory")?;
    let workspace = WorkspaceLayout::new(wd);

    let metadata = Arc::new(MetadataClient::new()?);
    let instance = metadata
        .instance_info()
        .await
        .context("failed to query instance metadata")?;
    info!(
        instance = %instance.instance,
        internal_ip = %instance.internal_ip,
        project = %instance.project_id,
        zone = %instance.zone,
        "Running on GCE"
    );
    let storage: Arc<dyn BlobStore> = Arc::new(GcsClient::new(metadata.clone())?);
    let images: Arc<dyn ImageService> =
        Arc::new(GceClient::new(instance.project_id.clone(), metadata.clone())?);
    let publisher = ImagePublisher::new(
        storage.clone(),
        images,
        config.image_path.clone(),
        config.image_name.clone(),
    );

    let runner: Arc<dyn CommandRunner> = Arc::new(
        ProcessRunner::new().with_env("GOPATH", workspace.gopath().display().to_string()),
    );

    let mut sources: Vec<Box<dyn ChangeSource>> = Vec::new();
    sources.push(Box::new(SyzkallerSource::new(runner.clone(), &workspace)));
    if config.builds_local_image() {
        if !nix::unistd::getuid().is_root() {
            bail!("building a local image requires root");
        }
        if config.uses_dashboard_patches() {
            let dashboard = DashboardClient::new(
                config.dashboard_addr.clone(),
                config.name.clone(),
                config.dashboard_key.clone(),
            )?;
            sources.push(Box::new(PatchSetSource::new(Arc::new(dashboard))));
        }
        sources.push(Box::new(KernelSource::new(
            runner.clone(),
            publisher,
            workspace.clone(),
            &config,
        )));
    } else {
        sources.push(Box::new(ImageSource::new(
            storage,
            publisher,
            workspace.clone(),
            config.image_archive.clone(),
        )));
    }

    let (events_tx, events_rx) = mpsc::channel(16);
    SignalController::spawn(events_tx).context("failed to install signal handlers")?;

    let updater_config = UpdaterConfig::default();
    let supervisor = ProcessSupervisor::new(port, updater_config.min_uptime);
    let launcher = Arc::new(ManagerLauncher::new(config, workspace));
    Updater::new(sources, supervisor, launcher, events_rx, updater_config)
        .run()
        .await?;

    info!("Deploy agent shutdown complete");
    Ok(())
}
