//! Ember cache server binary.

use clap::Parser;
use ember_cache::{Cache, Domain};
use ember_server::config::Config;
use ember_server::{collector, listener, logging};
use std::sync::Arc;
use tracing::{error, info};

fn main() {
    let config = Config::parse();

    if config.daemonize {
        if let Err(error) = daemonize::Daemonize::new().start() {
            eprintln!("failed to daemonize: {}", error);
            std::process::exit(1);
        }
    }

    logging::init(config.verbose);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.port,
        memory_mb = config.max_memory_mb,
        threads = config.threads,
        "emberd starting"
    );

    let domain = Arc::new(Domain::new());
    let cache = Arc::new(
        Cache::builder()
            .max_bytes(config.max_bytes())
            .domain(domain)
            .build(),
    );

    let _collector = collector::spawn(cache.clone(), collector::DEFAULT_PERIOD);

    if let Err(error) = listener::serve(&config, cache) {
        error!(%error, "server failed");
        std::process::exit(1);
    }
}
