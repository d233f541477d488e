//! Command-line driver for the DailyMeal offline worker.
//!
//! Runs the worker against a live origin, keeping its caches in a JSON
//! snapshot so that consecutive runs behave like one long-lived worker.
//!
//! ## Usage
//!
//! ```bash
//! # Precache the app shell
//! meal-sw --origin http://localhost:3000/ install
//!
//! # Fetch through the worker, then again with the network cut
//! meal-sw fetch /api/meals
//! meal-sw --offline fetch /api/meals
//! meal-sw --offline fetch /meals/42 --navigate
//!
//! # Inspect the cache snapshot
//! meal-sw caches
//! ```

use anyhow::{bail, Context};
use async_trait::async_trait;
use clap::{ArgAction, Parser, Subcommand};
use dailymeal_common::{init_logging, LogConfig};
use dailymeal_net::{Fetcher, LoaderConfig, NetError, Request, Response, ResourceLoader};
use dailymeal_sw::{
    CacheStore, FetchEvent, FetchOutcome, PersistentCacheStore, ServiceWorker,
    ServiceWorkerContainer, WorkerConfig,
};
use http::Method;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};
use url::Url;

#[derive(Parser, Debug)]
#[command(name = "meal-sw")]
#[command(about = "Drive the DailyMeal offline worker against a live origin")]
struct Cli {
    /// Origin the worker is registered for
    #[arg(long, default_value = "http://localhost:3000/", global = true)]
    origin: Url,

    /// Cache snapshot file
    #[arg(long, default_value = "dailymeal-caches.json", global = true)]
    cache_file: PathBuf,

    /// Worker configuration (JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Treat the network as unreachable
    #[arg(long, global = true)]
    offline: bool,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Register the worker and precache the static assets
    Install,

    /// Send one request through the worker
    Fetch {
        /// Path relative to the origin
        path: String,
        /// Mark the request as a page navigation
        #[arg(long)]
        navigate: bool,
        /// HTTP method
        #[arg(short, long, default_value = "GET")]
        method: String,
    },

    /// List caches in the snapshot
    Caches,
}

/// Network that is never reachable.
struct OfflineNetwork;

#[async_trait]
impl Fetcher for OfflineNetwork {
    async fn fetch(&self, _request: Request) -> Result<Response, NetError> {
        Err(NetError::Offline)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(LogConfig::from_verbosity(cli.verbose))?;
    run(cli).await
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = match &cli.config {
        Some(path) => WorkerConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => WorkerConfig::default(),
    };
    config.validate()?;

    let store = Arc::new(
        PersistentCacheStore::open_at(&cli.cache_file)
            .await
            .with_context(|| format!("opening {}", cli.cache_file.display()))?,
    );
    let network: Arc<dyn Fetcher> = if cli.offline {
        Arc::new(OfflineNetwork)
    } else {
        Arc::new(ResourceLoader::new(LoaderConfig::default())?)
    };

    match cli.command {
        Commands::Install => {
            let container = ServiceWorkerContainer::default();
            let worker = ServiceWorker::new(
                cli.origin.clone(),
                config.clone(),
                store.clone(),
                network,
            );
            let script = cli.origin.join("sw.js")?;
            container.register(script.as_str(), worker).await?;

            let cached = store.entry_count(&config.static_cache_name).await?;
            println!(
                "installed {}: {} assets in {}",
                cli.origin,
                cached.unwrap_or(0),
                config.static_cache_name
            );
        }
        Commands::Fetch {
            path,
            navigate,
            method,
        } => {
            let container = ServiceWorkerContainer::default();
            let worker = ServiceWorker::new(
                cli.origin.clone(),
                config.clone(),
                store.clone(),
                network.clone(),
            );

            // A surviving static cache means a previous run already installed
            // and activated this generation.
            if store.entry_count(&config.static_cache_name).await?.is_some() {
                container.restore(worker).await;
            } else {
                let script = cli.origin.join("sw.js")?;
                container.register(script.as_str(), worker).await?;
            }

            let url = cli.origin.join(&path)?;
            let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
                .with_context(|| format!("invalid method {method}"))?;
            let request = if navigate {
                Request::navigate(url)
            } else {
                Request::new(method, url)
            };

            let outcome = container.fetch(FetchEvent::new(request.clone())).await;
            // Let a network-first response reach the snapshot before exiting.
            if let Some(controller) = container.controller(&request.url).await {
                controller.flush_cache_writes().await;
            }

            match outcome {
                FetchOutcome::Respond(response) => {
                    println!("{} {} ({:?})", response.status, response.status_text, response.source);
                    for (name, value) in &response.headers {
                        println!("{name}: {}", String::from_utf8_lossy(value.as_bytes()));
                    }
                    println!();
                    println!("{}", String::from_utf8_lossy(&response.body));
                }
                FetchOutcome::Passthrough => {
                    debug!(url = %request.url, "Not intercepted, fetching directly");
                    let response = network.fetch(request).await?;
                    println!("{} (passthrough)", response.status);
                    println!();
                    println!("{}", String::from_utf8_lossy(&response.body));
                }
            }
        }
        Commands::Caches => {
            let mut names = store.keys().await?;
            if names.is_empty() {
                println!("no caches in {}", cli.cache_file.display());
                return Ok(());
            }
            names.sort();
            for name in names {
                let Some(count) = store.entry_count(&name).await? else {
                    bail!("cache {name} disappeared while listing");
                };
                let marker = if config.is_current_cache(&name) { "" } else { " (stale)" };
                println!("{name}: {count} entries{marker}");
            }
        }
    }

    info!("Done");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_fetch() {
        let cli = Cli::try_parse_from([
            "meal-sw",
            "--origin",
            "https://dailymeal.app/",
            "fetch",
            "/meals/1",
            "--navigate",
            "--offline",
            "-vv",
        ])
        .unwrap();

        assert!(cli.offline);
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.origin.as_str(), "https://dailymeal.app/");
        match cli.command {
            Commands::Fetch {
                path,
                navigate,
                method,
            } => {
                assert_eq!(path, "/meals/1");
                assert!(navigate);
                assert_eq!(method, "GET");
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_offline_install_fails_and_leaves_no_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cache_file = dir.path().join("caches.json");
        let cli = Cli::try_parse_from([
            "meal-sw",
            "--offline",
            "--cache-file",
            cache_file.to_str().unwrap(),
            "install",
        ])
        .unwrap();

        assert!(run(cli).await.is_err());

        let store = PersistentCacheStore::open_at(&cache_file).await.unwrap();
        assert!(store.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_caches_on_empty_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let cache_file = dir.path().join("caches.json");
        let cli = Cli::try_parse_from([
            "meal-sw",
            "--cache-file",
            cache_file.to_str().unwrap(),
            "caches",
        ])
        .unwrap();

        run(cli).await.unwrap();
    }
}
