use std::net::SocketAddr;
use std::sync::Arc;

use remaster_rs::config::{Config, ConfigOverrides, LogTarget};
use remaster_rs::persistence::RocksStore;
use remaster_rs::server::ServerTuning;
use remaster_rs::store::{MemoryStore, Store};
use remaster_rs::{Remaster, ServiceTuning};
use tokio::net::TcpListener;

const USAGE: &str = "usage: remasterd [-v|--verbose] [-d|--db <conn>] [-l|--log stderr|stdout|none] [config.toml ...]";

struct Args {
    verbose: bool,
    overrides: ConfigOverrides,
    config_paths: Vec<String>,
}

fn parse_args() -> Result<Args, String> {
    let mut verbose = false;
    let mut overrides = ConfigOverrides::default();
    let mut config_paths = Vec::new();

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-v" | "--verbose" => verbose = true,
            "-d" | "--db" => {
                overrides.database = Some(args.next().ok_or("--db requires a value")?);
            }
            "-l" | "--log" => {
                let value = args.next().ok_or("--log requires a value")?;
                overrides.logging =
                    Some(value.parse::<LogTarget>().map_err(|err| err.to_string())?);
            }
            flag if flag.starts_with('-') => {
                return Err(format!("unknown flag {flag}"));
            }
            path => config_paths.push(path.to_string()),
        }
    }
    Ok(Args {
        verbose,
        overrides,
        config_paths,
    })
}

fn init_logging(target: LogTarget, verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    match target {
        LogTarget::Stderr => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
        LogTarget::Stdout => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogTarget::None => {}
    }
}

#[tokio::main]
async fn main() {
    let args = match parse_args() {
        Ok(args) => args,
        Err(message) => {
            eprintln!("{message}");
            eprintln!("{USAGE}");
            std::process::exit(1);
        }
    };

    let config = match Config::load(&args.config_paths, args.overrides) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(1);
        }
    };
    let addr = match config.listen_addr() {
        Ok(addr) => addr,
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(1);
        }
    };
    init_logging(config.logging, args.verbose);

    if let Err(err) = run(config, addr).await {
        tracing::error!(%err, "unrecoverable runtime error");
        eprintln!("{err}");
        std::process::exit(2);
    }
}

async fn run(config: Config, addr: SocketAddr) -> anyhow::Result<()> {
    let store: Arc<dyn Store> = if config.database == ":memory:" {
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(RocksStore::open(&config.database)?)
    };
    let registry = config.build_registry();
    let tuning = ServiceTuning {
        workers: config.workers,
        server: ServerTuning {
            max_in_flight: config.server_requests,
            ..Default::default()
        },
        retry: config.retry.policy(),
        driver_timeout: config.driver_timeout(),
    };

    let node = Remaster::with_tuning(store, registry, tuning);
    node.open_drivers()
        .await
        .map_err(|err| anyhow::anyhow!("driver startup failed: {err}"))?;

    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "remaster daemon started");

    tokio::select! {
        result = node.serve(listener) => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown requested");
            node.shutdown();
        }
    }

    node.close_drivers().await;
    Ok(())
}
