//! Interpose - intercepting HTTP/HTTPS forward proxy.
//!
//! Loads (or creates) the root CA, registers the stock filters and serves
//! until Ctrl-C.

mod config;

use std::net::SocketAddr;
use std::panic;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use directories::ProjectDirs;
use interpose_proxy::{CertificateAuthority, ProxyServer};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Interpose - intercepting HTTP/HTTPS forward proxy
#[derive(Parser, Debug)]
#[command(name = "interpose", version, about)]
struct Args {
    /// JSON configuration file
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Address to listen on (overrides the config file)
    #[arg(long, value_name = "ADDR")]
    listen: Option<SocketAddr>,

    /// Root CA file (overrides the config file)
    #[arg(long, value_name = "FILE")]
    ca: Option<PathBuf>,

    /// Do not verify upstream TLS certificates
    #[arg(long)]
    insecure: bool,

    /// Print the root CA certificate PEM and exit
    #[arg(long)]
    print_ca: bool,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Directory for daily log files
    #[arg(long, value_name = "DIR")]
    log_dir: Option<PathBuf>,

    /// Log to the console only
    #[arg(long)]
    no_log_file: bool,
}

/// Get the logs directory path.
fn logs_dir(args: &Args) -> Option<PathBuf> {
    if args.no_log_file {
        return None;
    }
    args.log_dir.clone().or_else(|| {
        ProjectDirs::from("", "interpose", "Interpose").map(|dirs| dirs.data_dir().join("logs"))
    })
}

/// Initialize logging to stdout, plus a daily log file when possible.
fn init_logging(args: &Args) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_level = if args.debug { "debug" } else { &args.log_level };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("interpose={},warn", log_level)));

    if let Some(log_dir) = logs_dir(args) {
        if std::fs::create_dir_all(&log_dir).is_ok() {
            let file_appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .max_log_files(5)
                .filename_prefix("interpose")
                .filename_suffix("log")
                .build(&log_dir)
                .ok();

            if let Some(appender) = file_appender {
                let (non_blocking, guard) = tracing_appender::non_blocking(appender);
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().with_writer(std::io::stdout))
                    .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
                    .init();

                tracing::info!("Logging to {:?}", log_dir);
                return Some(guard);
            }
        }
    }

    tracing_subscriber::fmt().with_env_filter(env_filter).init();
    if !args.no_log_file {
        tracing::warn!("File logging unavailable, using console only");
    }
    None
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _guard = init_logging(&args);

    let default_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        tracing::error!("PANIC: {}", panic_info);
        default_hook(panic_info);
    }));

    let config = config::resolve(
        config::load(args.config.as_deref())?,
        config::Overrides {
            listen: args.listen,
            ca: args.ca.clone(),
            insecure: args.insecure,
        },
    )?;

    let ca = CertificateAuthority::load_or_create(&config.ca_path, &config.ca_name)
        .with_context(|| format!("failed to load CA from {}", config.ca_path.display()))?
        .with_leaf_cache_capacity(config.leaf_cache_capacity);

    if args.print_ca {
        print!("{}", ca.root_certificate_pem());
        return Ok(());
    }

    tracing::info!("CA certificate: {:?}", config.ca_path);
    if config.dialer.insecure_skip_verify {
        tracing::warn!("Upstream certificate verification is disabled");
    }

    let addr = config.addr;
    let server = ProxyServer::builder(config)
        .default_filters(Arc::new(ca))
        .bind()
        .with_context(|| format!("failed to start proxy on {}", addr))?;

    server.run_until(shutdown_signal()).await?;
    Ok(())
}
