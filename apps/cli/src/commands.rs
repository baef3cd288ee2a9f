//! CLI definition, tracing setup, and the run command.

use std::path::PathBuf;

use clap::Parser;
use color_eyre::eyre::{Result, WrapErr};
use streamrouter_core::RouterOptions;
use streamrouter_routes::RouteSource;
use streamrouter_shared::{AppConfig, load_config, load_config_from};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::alert;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// eventstream-router: route live wiki changes to pluggable handlers.
#[derive(Parser, Debug)]
#[command(
    name = "eventstream-router",
    version,
    about = "Subscribe to the recent-changes event stream and route events to handlers.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Config file (defaults to ~/.eventstream-router/eventstream-router.toml).
    #[arg(long, env = "EVENTSTREAM_ROUTER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Ignore the saved checkpoint and start from the present.
    #[arg(long)]
    pub from_now: bool,

    /// Run a single route locator instead of the manifest, e.g. `log:enwiki`.
    #[arg(short, long, value_name = "LOCATOR")]
    pub route: Option<String>,

    /// Name for the `--route` override (defaults to the locator kind).
    #[arg(long, requires = "route")]
    pub route_name: Option<String>,

    /// Show route readiness and per-event routing detail.
    #[arg(long)]
    pub debug: bool,

    /// Log format: text (default) or json.
    #[arg(long, default_value = "text")]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Log output format.
#[derive(Clone, Debug, PartialEq, Eq, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

impl Cli {
    /// Route source chosen by the flags: the `--route` override, or the
    /// configured manifest.
    pub fn route_source(&self, config: &AppConfig) -> RouteSource {
        match &self.route {
            Some(locator) => RouteSource::Override {
                locator: locator.clone(),
                name: self.route_name.clone(),
            },
            None => RouteSource::Manifest(config.routes.manifest.clone()),
        }
    }

    pub fn router_options(&self, config: &AppConfig) -> RouterOptions {
        RouterOptions {
            routes: self.route_source(config),
            from_now: self.from_now,
            ..RouterOptions::from_config(config)
        }
    }
}

// ---------------------------------------------------------------------------
// Tracing
// ---------------------------------------------------------------------------

const CRATES: &[&str] = &[
    "eventstream_router",
    "streamrouter_core",
    "streamrouter_stream",
    "streamrouter_routes",
    "streamrouter_checkpoint",
    "streamrouter_shared",
];

/// Default `EnvFilter` directives for the given flags.
pub(crate) fn default_filter(verbose: u8, debug: bool) -> String {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let mut directives: Vec<String> = CRATES.iter().map(|c| format!("{c}={level}")).collect();
    if debug && verbose == 0 {
        directives.push("streamrouter_core=debug".into());
        directives.push("streamrouter_routes=debug".into());
    }
    directives.join(",")
}

/// Initialize tracing. `RUST_LOG` overrides the flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(cli.verbose, cli.debug)));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

fn load(cli: &Cli) -> Result<AppConfig> {
    let config = match &cli.config {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };
    config.validate().wrap_err("invalid configuration")?;
    Ok(config)
}

/// Load config and run the router until Ctrl-C. A failure or panic that
/// escapes the router is also sent to the configured alert command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let config = load(&cli)?;
    alert::on_failure(serve(&cli, &config), config.alerts.command.as_deref()).await
}

async fn serve(cli: &Cli, config: &AppConfig) -> Result<()> {
    let token = CancellationToken::new();
    tokio::spawn({
        let token = token.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("shutdown requested"),
                Err(e) => warn!(error = %e, "could not listen for Ctrl-C"),
            }
            token.cancel();
        }
    });

    let options = cli.router_options(config);
    if options.from_now {
        info!("ignoring saved checkpoint for the first subscription");
    }

    streamrouter_core::run(config, options, token)
        .await
        .wrap_err("router failed")
}
