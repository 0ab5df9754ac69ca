mod config;
mod mcp_cmd;
mod observer;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use apiary_core::hub::{Hub, HubContext};
use apiary_core::runtime::DockerRuntime;
use apiary_core::workspace::GitWorkspaceProvisioner;

#[derive(Parser)]
#[command(name = "apiary", about = "Coordination hub for fleets of sandboxed coding agents")]
struct Cli {
    /// Config file path (overrides APIARY_CONFIG and ./apiary.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a starter apiary.toml into the current directory
    Init {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
    /// Run the MCP server on stdio, with the HTTP observer alongside
    Mcp {
        /// Repository the fleet works on
        #[arg(long, default_value = ".")]
        repo: PathBuf,
        /// Observer bind address
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,
        /// Observer port; 0 disables the observer
        #[arg(long, default_value_t = 9119)]
        port: u16,
    },
    /// Run only the HTTP observer (status page + SSE event stream)
    Serve {
        /// Repository the fleet works on
        #[arg(long, default_value = ".")]
        repo: PathBuf,
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,
        #[arg(long, default_value_t = 9119)]
        port: u16,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // stdout belongs to the MCP transport; all logging goes to stderr.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Init { force } => config::write_starter_config(force),
        Commands::Mcp { repo, bind, port } => {
            let hub = build_hub(cli.config.as_deref(), &repo, &bind, port).await?;
            let observer = if port > 0 {
                Some(spawn_observer(hub.clone(), &bind, port).await?)
            } else {
                None
            };

            mcp_cmd::run_stdio(hub.clone()).await?;

            hub.close().await;
            if let Some(handle) = observer {
                handle.abort();
            }
            Ok(())
        }
        Commands::Serve { repo, bind, port } => {
            let hub = build_hub(cli.config.as_deref(), &repo, &bind, port).await?;
            observer::run_serve(hub.clone(), &bind, port).await?;
            hub.close().await;
            Ok(())
        }
    }
}

async fn build_hub(
    config_path: Option<&std::path::Path>,
    repo: &std::path::Path,
    bind: &str,
    port: u16,
) -> Result<Arc<Hub>> {
    let config = config::resolve(config_path)?;
    let repo_path = repo
        .canonicalize()
        .with_context(|| format!("repository path {} not found", repo.display()))?;

    let runtime = Arc::new(DockerRuntime::default());
    let provisioner = Arc::new(
        GitWorkspaceProvisioner::new(&repo_path)
            .await
            .with_context(|| format!("{} is not a git repository", repo_path.display()))?,
    );

    let context = HubContext {
        repo_path,
        hub_url: format!("http://{bind}:{port}"),
    };
    let hub = Hub::new(config, context, runtime, provisioner)
        .context("failed to assemble the hub")?;
    Ok(hub)
}

async fn spawn_observer(
    hub: Arc<Hub>,
    bind: &str,
    port: u16,
) -> Result<tokio::task::JoinHandle<()>> {
    let addr: SocketAddr = format!("{bind}:{port}")
        .parse()
        .with_context(|| format!("invalid observer address {bind}:{port}"))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind observer on {addr}"))?;
    tracing::info!("observer listening on http://{addr}");

    let app = observer::build_router(hub);
    Ok(tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "observer server exited");
        }
    }))
}
