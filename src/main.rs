use std::{net::SocketAddr, path::Path, sync::Arc, time::Duration};

use arc_swap::ArcSwap;
use clap::{Parser, ValueEnum};
use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use stockgate::{
    adapters::{AppState, FileConfigProvider, ProxyHealthChecker, ReqwestExecutor, router},
    config::{ServerConfig, ServerConfigValidator, loader::load_config},
    core::{ProviderAdapter, ProviderCatalog, ProxyPool, StockService},
    metrics,
    ports::{config_provider::ConfigProvider, http_client::HttpExecutor},
    tracing_setup,
    utils::GracefulShutdown,
};
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    #[clap(short, long, default_value = "config.toml")]
    config: String,

    /// Log output format
    #[clap(long, value_enum, default_value_t = LogFormat::Json, global = true)]
    log_format: LogFormat,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Validate configuration file
    Validate {
        #[clap(short, long, default_value = "config.toml")]
        config: String,
    },
    /// Initialize a new configuration file
    Init {
        #[clap(short, long, default_value = "config.toml")]
        config: String,
    },
    /// Start the storefront server (default)
    Serve {
        #[clap(short, long, default_value = "config.toml")]
        config: String,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum LogFormat {
    Json,
    Pretty,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();

    match args.command {
        Some(Commands::Validate { config }) => validate_config_command(&config).await,
        Some(Commands::Init { config }) => init_config_command(&config).await,
        Some(Commands::Serve { config }) => serve(&config, args.log_format).await,
        None => serve(&args.config, args.log_format).await,
    }
}

async fn serve(config_path: &str, log_format: LogFormat) -> Result<()> {
    match log_format {
        LogFormat::Json => tracing_setup::init_tracing(),
        LogFormat::Pretty => tracing_setup::init_console_tracing(),
    }
    .map_err(|e| eyre!("Failed to initialize tracing: {}", e))?;

    metrics::init_metrics().map_err(|e| eyre!("Failed to initialize metrics: {}", e))?;

    tracing::info!("Loading initial configuration from {config_path}");

    let config_provider: Arc<dyn ConfigProvider> = Arc::new(
        FileConfigProvider::new(config_path).context("Failed to create config provider")?,
    );

    let config: ServerConfig = config_provider
        .load_config()
        .await
        .with_context(|| format!("Failed to load initial config from {config_path}"))?;
    ServerConfigValidator::validate(&config).map_err(|e| eyre!("{}", e))?;

    let request_timeout = config
        .upstream
        .request_timeout()
        .context("Invalid upstream.request_timeout")?;
    let call_deadline = config
        .upstream
        .call_deadline()
        .context("Invalid upstream.call_deadline")?;

    // The pool is built once; reloads never replace it.
    let pool = Arc::new(
        ProxyPool::from_addresses(&config.proxy_pool.proxies)
            .context("Invalid proxy_pool.proxies")?,
    );
    let executor: Arc<dyn HttpExecutor> = Arc::new(ReqwestExecutor::new(
        pool.clone(),
        request_timeout,
        config.upstream.user_agent.clone(),
    ));

    let graceful_shutdown = Arc::new(GracefulShutdown::new());
    let signal_handler_shutdown = graceful_shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = signal_handler_shutdown.run_signal_handler().await {
            tracing::error!("Signal handler error: {}", e);
        }
    });

    let health_checker = ProxyHealthChecker::new(
        pool.clone(),
        executor.clone(),
        config.proxy_pool.health_check.clone(),
    );
    if config.proxy_pool.health_check.enabled && !pool.is_empty() {
        tracing::info!("Running startup proxy sweep over {} proxies", pool.len());
        health_checker.sweep().await;
    }
    let selection = pool.ensure_selection();
    tracing::info!(selection = %selection, "Initial egress selection");

    let health_token = graceful_shutdown.token();
    tokio::spawn(async move {
        if let Err(e) = health_checker.run(health_token).await {
            tracing::error!("Proxy health checker error: {}", e);
        }
    });

    let catalog = Arc::new(ArcSwap::from_pointee(ProviderCatalog::new(
        config.providers.clone(),
    )));
    spawn_config_watcher(
        config_provider.clone(),
        catalog.clone(),
        config.clone(),
        graceful_shutdown.token(),
    );

    let adapter = Arc::new(ProviderAdapter::new(executor, pool.clone()));
    let state = AppState {
        service: Arc::new(StockService::new(adapter, call_deadline)),
        catalog: catalog.clone(),
        pool,
        admin_secret: config.admin_secret.clone(),
    };
    if state.admin_secret.is_none() {
        tracing::info!("admin_secret not set; proxy management endpoints are disabled");
    }

    let addr: SocketAddr = config
        .listen_addr
        .parse()
        .context("Failed to parse listen address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    tracing::info!(
        "Stockgate listening on {} ({} providers, {} proxies)",
        addr,
        catalog.load().len(),
        config.proxy_pool.proxies.len()
    );

    let server_shutdown = graceful_shutdown.clone();
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let reason = server_shutdown.wait_for_shutdown_signal().await;
            tracing::info!("Shutdown signal received: {:?}", reason);
        })
        .await
        .context("Server error")?;

    tracing::info!("Graceful shutdown completed");
    tracing_setup::shutdown_tracing();
    Ok(())
}

/// Reload the provider catalog whenever the config file changes.
///
/// Only `providers` is applied live; other sections are logged and need a restart.
fn spawn_config_watcher(
    config_provider: Arc<dyn ConfigProvider>,
    catalog: Arc<ArcSwap<ProviderCatalog>>,
    initial: ServerConfig,
    shutdown: CancellationToken,
) {
    let Some(mut notify_rx) = config_provider.watch() else {
        tracing::warn!("Config provider is already watched; hot reload disabled");
        return;
    };
    let debounce_duration = Duration::from_secs(2);

    tokio::spawn(async move {
        tracing::info!("Config watcher task started.");
        let mut last_reload_attempt_time = tokio::time::Instant::now();
        last_reload_attempt_time = last_reload_attempt_time
            .checked_sub(debounce_duration)
            .unwrap_or(last_reload_attempt_time);

        loop {
            let notified = tokio::select! {
                _ = shutdown.cancelled() => break,
                notified = notify_rx.recv() => notified,
            };
            if notified.is_none() {
                break;
            }

            if last_reload_attempt_time.elapsed() < debounce_duration {
                tracing::debug!("Debouncing config reload event.");
                while notify_rx.try_recv().is_ok() {}
                continue;
            }
            // Let the writer finish before reading the file.
            tokio::time::sleep(Duration::from_millis(200)).await;
            last_reload_attempt_time = tokio::time::Instant::now();

            match config_provider.load_config().await {
                Ok(new_config) => {
                    if let Err(e) = ServerConfigValidator::validate(&new_config) {
                        tracing::error!("Reloaded configuration is invalid, keeping old one: {}", e);
                        continue;
                    }
                    warn_on_restart_only_changes(&initial, &new_config);

                    let new_catalog = ProviderCatalog::new(new_config.providers);
                    tracing::info!(
                        providers = new_catalog.len(),
                        active = new_catalog.active_count(),
                        "Provider catalog reloaded"
                    );
                    catalog.store(Arc::new(new_catalog));
                }
                Err(e) => {
                    tracing::error!(
                        "Failed to reload configuration: {:?}. Keeping old configuration.",
                        e
                    );
                }
            }
            while notify_rx.try_recv().is_ok() {}
        }
        tracing::info!("Config watcher task is shutting down.");
    });
}

fn warn_on_restart_only_changes(initial: &ServerConfig, new: &ServerConfig) {
    if initial.listen_addr != new.listen_addr {
        tracing::warn!("listen_addr changed; restart to apply");
    }
    if initial.admin_secret != new.admin_secret {
        tracing::warn!("admin_secret changed; restart to apply");
    }
    if initial.proxy_pool.proxies != new.proxy_pool.proxies {
        tracing::warn!("proxy_pool.proxies changed; use the /proxies endpoints or restart");
    }
    if initial.upstream.request_timeout != new.upstream.request_timeout
        || initial.upstream.call_deadline != new.upstream.call_deadline
    {
        tracing::warn!("upstream timeouts changed; restart to apply");
    }
}

/// Validate configuration file and exit
async fn validate_config_command(config_path: &str) -> Result<()> {
    println!("🔍 Validating configuration file: {config_path}");

    if !Path::new(config_path).exists() {
        eprintln!("❌ Error: Configuration file '{config_path}' not found");
        std::process::exit(1);
    }

    let config = match load_config(config_path).await {
        Ok(config) => {
            println!("✅ Configuration parsing: OK");
            config
        }
        Err(e) => {
            eprintln!("❌ Configuration parsing failed:");
            eprintln!("   {e:#}");
            std::process::exit(1);
        }
    };

    match ServerConfigValidator::validate(&config) {
        Ok(()) => {
            let active = config.providers.values().filter(|p| p.active).count();
            println!("✅ Configuration validation: OK");
            println!();
            println!("📋 Configuration Summary:");
            println!("   • Listen Address: {}", config.listen_addr);
            println!(
                "   • Providers: {} ({} active)",
                config.providers.len(),
                active
            );
            println!("   • Proxies: {}", config.proxy_pool.proxies.len());
            println!(
                "   • Proxy Health Checks: {}",
                config.proxy_pool.health_check.enabled
            );
            println!(
                "   • Proxy Management: {}",
                if config.admin_secret.is_some() { "enabled" } else { "disabled" }
            );
            println!();
            println!("🎉 Configuration is valid and ready to use!");
            Ok(())
        }
        Err(e) => {
            eprintln!("❌ Configuration validation failed:");
            eprintln!("{e}");
            println!();
            println!("💡 Common fixes:");
            println!("   • Ensure every base_url starts with http:// or https://");
            println!("   • Proxies must look like ip:port or ip:port:user:pass");
            println!("   • Durations use units, e.g. \"4s\" or \"500ms\"");
            println!("   • Path expressions look like data.stock||stock");
            std::process::exit(1);
        }
    }
}

/// Initialize a new configuration file
async fn init_config_command(config_path: &str) -> Result<()> {
    let path = Path::new(config_path);
    if path.exists() {
        eprintln!("❌ Error: Configuration file '{config_path}' already exists");
        std::process::exit(1);
    }

    let default_config = r#"# Stockgate configuration

listen_addr = "0.0.0.0:8000"

# Enables GET/POST/DELETE /proxies (x-admin-secret header)
# admin_secret = "change-me"

[upstream]
request_timeout = "4s"
call_deadline = "9s"

[proxy_pool]
# "ip:port" or "ip:port:user:pass"
proxies = []

[proxy_pool.health_check]
enabled = true
interval_secs = 300
timeout_secs = 5
probe_url = "https://api.ipify.org?format=json"

# One entry per storefront key (GET /stock?key=netflix-1m)
[providers."netflix-1m"]
base_url = "https://supplier.example.com"
api_key = "your-api-key"
product_id = 101
# credential_param = "api_key"   # tried: api_key, apikey, key, token
# stock_path = "data.stock||stock||sum"
# fetch_path = "data||items"

# Override the default supplier convention when needed:
# [providers."netflix-1m".fetch]
# path = "order/create"
# method = "POST"
# params = { product = "{productId}", count = "{quantity}" }
# success = { path = "status", equals = "success" }
"#;

    tokio::fs::write(path, default_config)
        .await
        .context("Failed to write config file")?;
    println!("✅ Created default configuration at: {config_path}");
    println!("   Run 'stockgate serve --config {config_path}' to start the server");
    Ok(())
}
