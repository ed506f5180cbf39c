use std::{path::Path, sync::Arc, time::Duration};

use clap::Parser;
use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use gatehouse::{
    adapters::{
        FileDeploymentSource, HealthChecker, HttpClientAdapter, HttpServer, LogReporter, MetricsReporter,
        default_connector_registry, default_policy_registry,
    },
    config::{DefinitionValidator, GatewayConfig, HttpClientOptions, load_api_definitions, load_gateway_config},
    core::{
        Reactor,
        hooks::{MetricsHook, TracingHook},
    },
    metrics,
    ports::{deployment::DeploymentSource, http_client::HttpClient},
    tracing_setup,
    utils::{ConnectionTracker, GracefulShutdown, ShutdownReason},
};
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    /// Gateway configuration file
    #[clap(short, long, default_value = "gatehouse.yaml")]
    config: String,

    /// API definition file or directory
    #[clap(short, long, default_value = "apis")]
    apis: String,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Validate the gateway configuration and the API definitions
    Validate {
        #[clap(short, long, default_value = "gatehouse.yaml")]
        config: String,

        #[clap(short, long, default_value = "apis")]
        apis: String,
    },
    /// Start the gateway (default)
    Serve {
        #[clap(short, long, default_value = "gatehouse.yaml")]
        config: String,

        #[clap(short, long, default_value = "apis")]
        apis: String,
    },
}

/// Burst of file events coalesced into one reload
const RELOAD_DEBOUNCE: Duration = Duration::from_millis(500);

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();
    match args.command {
        Some(Commands::Validate { config, apis }) => validate_command(&config, &apis),
        Some(Commands::Serve { config, apis }) => serve(&config, &apis).await,
        None => serve(&args.config, &args.apis).await,
    }
}

fn load_config(config_path: &str) -> Result<GatewayConfig> {
    if Path::new(config_path).exists() {
        load_gateway_config(config_path).with_context(|| format!("Failed to load config from {config_path}"))
    } else {
        Ok(GatewayConfig::default())
    }
}

async fn serve(config_path: &str, apis_path: &str) -> Result<()> {
    let config = load_config(config_path)?;
    tracing_setup::init_tracing(&config.logging).map_err(|e| eyre!("Failed to initialize tracing: {e}"))?;
    if !Path::new(config_path).exists() {
        tracing::warn!(path = %config_path, "Configuration file not found, using defaults");
    }
    DefinitionValidator::validate_gateway(&config).wrap_err("Invalid gateway configuration")?;

    let provider = rustls::crypto::aws_lc_rs::default_provider();
    if let Err(e) = rustls::crypto::CryptoProvider::install_default(provider) {
        tracing::warn!(
            error = ?e,
            "CryptoProvider::install_default for aws-lc-rs reported an error, a provider is probably already installed"
        );
    }

    metrics::init_metrics().map_err(|e| eyre!("Failed to initialize metrics: {e}"))?;

    let mut builder = Reactor::builder(config.clone())
        .connectors(default_connector_registry())
        .policies(default_policy_registry())
        .hook(Arc::new(MetricsHook))
        .reporter(Arc::new(LogReporter::new(config.logging.json)))
        .reporter(Arc::new(MetricsReporter));
    if config.tracing_hooks {
        builder = builder.hook(Arc::new(TracingHook));
    }
    let reactor = Arc::new(builder.build());

    tracing::info!(path = %apis_path, "Loading API definitions");
    let source = FileDeploymentSource::new(apis_path).wrap_err("Failed to watch API definitions")?;
    let definitions = source.load().await.wrap_err("Failed to load API definitions")?;
    let report = reactor.synchronize(definitions).await;
    tracing::info!(
        deployed = report.deployed,
        failed = report.failed,
        "Initial deployment completed"
    );

    let shutdown = GracefulShutdown::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = shutdown.run_signal_handler().await {
                tracing::error!(error = %e, "Signal handler error");
            }
        });
    }

    let updates = source.watch()?;
    let watcher = tokio::spawn(watch_deployments(
        Arc::new(source),
        updates,
        reactor.clone(),
        shutdown.token(),
    ));

    let health_client: Arc<dyn HttpClient> = Arc::new(
        HttpClientAdapter::new(HttpClientOptions {
            connect_timeout_secs: config.health_check.timeout_secs,
            read_timeout_secs: config.health_check.timeout_secs,
            ..HttpClientOptions::default()
        })
        .wrap_err("Failed to create health check client")?,
    );
    let health_checker = HealthChecker::new(reactor.clone(), health_client, config.health_check.clone());
    let health_token = shutdown.token();
    let health = tokio::spawn(async move { health_checker.run(health_token).await });

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.listen_addr))?;
    let server = HttpServer::new(reactor, ConnectionTracker::new());
    let served = server.serve(listener, &shutdown).await;

    // the server may also stop on its own error
    shutdown.trigger(ShutdownReason::Requested);
    let _ = watcher.await;
    let _ = health.await;
    tracing::info!("Graceful shutdown completed");
    served
}

/// Redeploy on every change of the definitions until `token` is cancelled.
async fn watch_deployments(
    source: Arc<FileDeploymentSource>,
    mut updates: tokio::sync::mpsc::Receiver<()>,
    reactor: Arc<Reactor>,
    token: CancellationToken,
) {
    tracing::info!(path = %source.path().display(), "Deployment watcher started");
    loop {
        tokio::select! {
            update = updates.recv() => {
                if update.is_none() {
                    break;
                }
            }
            _ = token.cancelled() => break,
        }

        tokio::time::sleep(RELOAD_DEBOUNCE).await;
        while updates.try_recv().is_ok() {}

        match source.load().await {
            Ok(definitions) => {
                let report = reactor.synchronize(definitions).await;
                tracing::info!(
                    deployed = report.deployed,
                    undeployed = report.undeployed,
                    unchanged = report.unchanged,
                    failed = report.failed,
                    "API definitions reloaded"
                );
            }
            Err(e) => tracing::error!(error = %e, "Failed to reload API definitions, keeping deployed APIs"),
        }
    }
    tracing::info!("Deployment watcher stopped");
}

/// Validate the gateway configuration and the API definitions, then exit
fn validate_command(config_path: &str, apis_path: &str) -> Result<()> {
    println!("Validating configuration: {config_path}");
    let config = match load_config(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration parsing failed: {e:?}");
            std::process::exit(1);
        }
    };
    if let Err(e) = DefinitionValidator::validate_gateway(&config) {
        eprintln!("Configuration validation failed:\n{e}");
        std::process::exit(1);
    }
    println!("Configuration: OK (listen address {})", config.listen_addr);

    println!("Validating API definitions: {apis_path}");
    let apis = match load_api_definitions(apis_path) {
        Ok(apis) => apis,
        Err(e) => {
            eprintln!("API definitions parsing failed: {e:?}");
            std::process::exit(1);
        }
    };
    if let Err(e) = DefinitionValidator::validate_apis(&apis) {
        eprintln!("API definitions validation failed:\n{e}");
        std::process::exit(1);
    }

    println!("API definitions: OK ({} APIs)", apis.len());
    for api in &apis {
        let paths: Vec<&str> = api.listeners.iter().map(|l| l.path.as_str()).collect();
        println!("   - {} -> {}", api.id, paths.join(", "));
    }
    Ok(())
}
