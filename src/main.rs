use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use rankdns::config::{CliOverrides, Config};
use rankdns::proxy;

#[derive(Parser)]
#[command(name = "rankdns")]
#[command(about = "Caching DNS proxy that forwards to the best-rated upstream", long_about = None)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long, value_name = "FILE")]
    config: Option<String>,

    /// Bind address
    #[arg(short, long)]
    bind: Option<String>,

    /// Local port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Timeout in seconds for upstream queries and client replies
    #[arg(long, value_name = "SECONDS")]
    socket_timeout: Option<f64>,

    /// SQLite file holding the cache and upstream ratings
    #[arg(long, value_name = "FILE")]
    db_filepath: Option<String>,

    /// Regular expressions for addresses that are never cached
    #[arg(long, value_name = "PATTERN", num_args = 1..)]
    skip_ip_patterns: Option<Vec<String>>,

    /// Maximum number of requests handled at once
    #[arg(long)]
    max_in_flight: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = Config::load(
        args.config.as_deref(),
        CliOverrides {
            bind_address: args.bind,
            port: args.port,
            timeout_secs: args.socket_timeout,
            database_path: args.db_filepath,
            skip_ip_patterns: args.skip_ip_patterns,
            max_in_flight: args.max_in_flight,
            log_level: args.log_level,
        },
    )
    .context("failed to load configuration")?;

    init_logging(&config.logging.level);

    let proxy_config = config.proxy_config().context("invalid configuration")?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    rt.block_on(proxy::run(proxy_config))
        .context("DNS proxy failed")?;
    Ok(())
}
