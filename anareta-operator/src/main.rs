use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use anareta::store::FileStore;
use anareta::webhook::{self, WebhookState};
use anareta::{AnaretaConfig, Controller, EnvironmentStore, Reconciler};

#[derive(Parser)]
#[command(name = "anareta")]
#[command(version)]
#[command(about = "Ephemeral per-branch development environments")]
struct Cli {
    /// Log filter directive, e.g. `debug` or `anareta=trace`. Overrides RUST_LOG.
    #[arg(long, global = true, env = "ANARETA_LOG_LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the webhook server and the environment controller.
    Serve(ServeArgs),
    /// Print the Environments recorded in a state file.
    List(ListArgs),
}

#[derive(Parser)]
struct ServeArgs {
    #[arg(long, env = "ANARETA_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, env = "ANARETA_LISTEN_ADDR")]
    listen_addr: Option<String>,

    /// Namespace-of-record for Environments created by the webhook.
    #[arg(long, env = "ANARETA_NAMESPACE")]
    namespace: Option<String>,

    #[arg(long, env = "ANARETA_STATE_FILE")]
    state_file: Option<PathBuf>,
}

#[derive(Parser)]
struct ListArgs {
    #[arg(long, env = "ANARETA_STATE_FILE")]
    state_file: PathBuf,

    #[arg(long)]
    namespace: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref());

    match cli.command {
        Commands::Serve(args) => serve(args).await,
        Commands::List(args) => list(args).await,
    }
}

fn init_tracing(level: Option<&str>) {
    let filter = match level {
        Some(directive) if !directive.contains('=') => {
            EnvFilter::new(format!("anareta={0},anareta_operator={0}", directive))
        }
        Some(directive) => EnvFilter::new(directive),
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("anareta=info,anareta_operator=info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_config(args: &ServeArgs) -> anyhow::Result<AnaretaConfig> {
    let mut config = match &args.config {
        Some(path) => AnaretaConfig::load(path)?,
        None => AnaretaConfig::default(),
    };
    if let Some(addr) = &args.listen_addr {
        config.webhook.listen_addr = addr.clone();
    }
    if let Some(namespace) = &args.namespace {
        config.webhook.namespace = namespace.clone();
    }
    if let Some(path) = &args.state_file {
        config.store.state_file = Some(path.clone());
    }
    config.validate()?;
    Ok(config)
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    let config = load_config(&args)?;

    let store = config.build_store().await.context("failed to open store")?;
    let reconciler = Reconciler::new(
        store.clone(),
        config.build_provisioner(),
        config.build_installer()?,
    )
    .with_cleanup_retry_delay(config.controller.cleanup_retry_delay);
    let controller = Controller::new(store.clone(), Arc::new(reconciler), config.controller_config());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let controller_task = tokio::spawn(controller.run(shutdown_rx.clone()));

    let secret = config.webhook_secret();
    if secret.is_none() {
        warn!("no webhook secret configured, signatures are not verified");
    }
    let state = WebhookState::new(store, config.webhook.namespace.clone())
        .with_default_ttl(config.webhook.default_ttl)
        .with_secret(secret);

    let addr = config.listen_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!(%addr, namespace = %config.webhook.namespace, "webhook listening");

    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown requested");
        let _ = shutdown_tx.send(true);
    });

    let mut server_shutdown = shutdown_rx;
    axum::serve(listener, webhook::router(Arc::new(state)))
        .with_graceful_shutdown(async move {
            let _ = server_shutdown.wait_for(|stop| *stop).await;
        })
        .await
        .context("webhook server failed")?;

    controller_task
        .await
        .context("controller task panicked")?
        .context("controller failed")?;
    info!("stopped");
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

async fn list(args: ListArgs) -> anyhow::Result<()> {
    let store = FileStore::open(args.state_file.clone())
        .await
        .with_context(|| format!("failed to open {}", args.state_file.display()))?;
    let items = store.list(args.namespace.as_deref()).await?;
    if items.is_empty() {
        println!("No environments.");
        return Ok(());
    }

    println!(
        "{:<16} {:<40} {:<13} {:<10} {}",
        "NAMESPACE", "NAME", "PHASE", "TTL", "BRANCH"
    );
    for env in items {
        let name = if env.metadata.is_deleting() {
            format!("{} (deleting)", env.name())
        } else {
            env.name().to_string()
        };
        println!(
            "{:<16} {:<40} {:<13} {:<10} {}",
            env.metadata.namespace,
            name,
            env.status.phase,
            format_ttl(env.spec.ttl),
            env.spec.branch
        );
    }
    Ok(())
}

fn format_ttl(ttl: std::time::Duration) -> String {
    if ttl.is_zero() {
        "-".to_string()
    } else {
        format!("{}s", ttl.as_secs())
    }
}
