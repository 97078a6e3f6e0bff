//! apicache CLI

use std::path::PathBuf;
use std::process;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use apicache::network::NetworkHandler;
use apicache::{fingerprint, ApiCache, Config};

fn usage() -> ! {
    eprintln!("apicache v{}", env!("CARGO_PKG_VERSION"));
    eprintln!();
    eprintln!("Usage: apicache <command> [options]");
    eprintln!();
    eprintln!("Commands:");
    eprintln!("  serve <config.toml>    Run the caching proxy");
    eprintln!("  key <METHOD> <URL>     Print the cache key of a body-less request");
    process::exit(1);
}

fn main() {
    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        usage();
    }

    let result = match args[1].as_str() {
        "serve" => match args.get(2) {
            Some(path) => serve(PathBuf::from(path)),
            None => usage(),
        },
        "key" => match (args.get(2), args.get(3)) {
            (Some(method), Some(url)) => {
                println!("{}", fingerprint::cache_key(method, url, b""));
                Ok(())
            }
            _ => usage(),
        },
        command => {
            eprintln!("Unknown command: {command}");
            eprintln!("Run 'apicache' for usage information.");
            process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

fn serve(config_path: PathBuf) -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_file(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    let proxy = ApiCache::new(config)?;

    let runtime = tokio::runtime::Runtime::new().context("starting tokio runtime")?;
    runtime.block_on(NetworkHandler::new(proxy).run())?;

    Ok(())
}
