//! Exposes the command line application.
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use assetcache::caching::{AssetCache, AssetKey, CleanupStats, Storage};
use assetcache::config::Config;
use assetcache::metrics;
use clap::{Args, Parser, Subcommand, ValueEnum};
use url::Url;

use crate::logging;

/// Where cached files live.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum StorageArg {
    /// Below the configured temporary directory.
    Temporary,
    /// Below the configured durable directory.
    Durable,
}

impl From<StorageArg> for Storage {
    fn from(arg: StorageArg) -> Self {
        match arg {
            StorageArg::Temporary => Storage::Temporary,
            StorageArg::Durable => Storage::Durable,
        }
    }
}

/// The shape an asset is resolved to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Kind {
    Data,
    Image,
    File,
    Media,
}

#[derive(Clone, Debug, Args)]
struct ScopeArgs {
    /// The cache scope, one directory per scope.
    #[arg(long, short, default_value = "default")]
    scope: String,

    /// The storage the scope lives in.
    #[arg(long, value_enum, default_value_t = StorageArg::Temporary)]
    storage: StorageArg,
}

#[derive(Clone, Debug, Subcommand)]
enum Commands {
    /// Fetch an asset through the cache and print where it is stored.
    Fetch {
        /// The URL of the asset. Local paths are accepted as well.
        locator: String,

        /// Stores the asset under this name instead of the last path segment.
        #[arg(long)]
        identifier: Option<String>,

        /// File extension for the stored asset.
        #[arg(long)]
        extension: Option<String>,

        /// Validates the asset as this kind.
        #[arg(long, value_enum, default_value_t = Kind::Data)]
        kind: Kind,

        #[command(flatten)]
        scope: ScopeArgs,
    },

    /// Remove files that were not used recently.
    Cleanup {
        /// Only the given scopes. Defaults to every scope of both storages.
        #[arg(long, short)]
        scope: Vec<String>,

        /// Report what would be removed, without removing anything.
        #[arg(long)]
        dry_run: bool,
    },

    /// Remove every file of a scope.
    Clear {
        #[command(flatten)]
        scope: ScopeArgs,
    },
}

/// Fetches remote assets into a local cache, and maintains that cache.
#[derive(Clone, Debug, Parser)]
#[command(author, version, about, bin_name = "assetcache")]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::get(cli.config()).context("failed loading config")?;

    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: sentry::release_name!(),
        ..Default::default()
    });

    // SAFETY: The runtime has not been started yet, so this is still single-threaded.
    unsafe { logging::init_logging(&config) };

    if let Some(ref statsd) = config.metrics.statsd {
        let mut tags = config.metrics.custom_tags.clone();
        if let Some(tag) = config.metrics.hostname_tag.clone() {
            if let Some(name) = hostname::get().ok().and_then(|s| s.into_string().ok()) {
                tags.insert(tag, name);
            }
        }
        metrics::configure_statsd(&config.metrics.prefix, statsd.as_str(), tags)
            .context("failed to configure statsd")?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("assetcache")
        .build()
        .context("failed to start the runtime")?;

    runtime.block_on(run(cli.command, config))
}

async fn run(command: Commands, config: Config) -> Result<()> {
    match command {
        Commands::Fetch {
            locator,
            identifier,
            extension,
            kind,
            scope,
        } => {
            let mut key = AssetKey::new(parse_locator(&locator)?);
            if let Some(identifier) = identifier {
                key = key.with_identifier(identifier);
            }
            if let Some(extension) = extension {
                key = key.with_extension(extension);
            }
            let cache = AssetCache::from_config(&config, scope.scope, scope.storage.into())
                .context("failed to create the HTTP client")?;
            fetch(&cache, key, kind)
                .await
                .with_context(|| format!("failed to fetch `{locator}`"))?;
        }
        Commands::Cleanup { scope, dry_run } => {
            let stats = cleanup(&config, &scope, dry_run).context("failed to clean up caches")?;
            tracing::info!(
                "Removed {} files ({} bytes), retained {} files ({} bytes)",
                stats.removed_files,
                stats.removed_bytes,
                stats.retained_files,
                stats.retained_bytes,
            );
        }
        Commands::Clear { scope } => {
            let cache = AssetCache::from_config(&config, scope.scope, scope.storage.into())
                .context("failed to create the HTTP client")?;
            cache.clear().context("failed to clear the cache")?;
            println!("{}", cache.directory().display());
        }
    }
    Ok(())
}

/// Accepts URLs as well as plain paths, which are turned into `file://` URLs.
fn parse_locator(locator: &str) -> Result<Url> {
    match Url::parse(locator) {
        Ok(url) => Ok(url),
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            let path = std::path::absolute(locator).context("invalid path")?;
            Url::from_file_path(&path)
                .map_err(|()| anyhow::anyhow!("`{}` is not a valid path", path.display()))
        }
        Err(err) => Err(err).context("invalid URL"),
    }
}

async fn fetch(cache: &AssetCache, key: AssetKey, kind: Kind) -> Result<()> {
    let path = match key.locator().to_file_path() {
        Ok(path) if key.is_local() => path,
        _ => cache.local_path(&key),
    };
    let size = match kind {
        Kind::Data => cache.fetch_data_asset(key).resolve().await?.bytes().len(),
        Kind::Image => {
            let image = cache.fetch_image_asset(key).resolve().await?;
            tracing::info!("Fetched {:?} image", image.format());
            image.bytes().len()
        }
        Kind::File => {
            let file = cache.fetch_url_asset(key).resolve().await?;
            println!("{}", file.path().display());
            return Ok(());
        }
        Kind::Media => {
            let media = cache.fetch_media_asset(key).resolve().await?;
            tracing::info!("Fetched {:?} media", media.kind());
            println!("{}", media.path().display());
            return Ok(());
        }
    };
    println!("{} ({size} bytes)", path.display());
    Ok(())
}

/// Cleans up the given scopes, or every scope found on disk.
fn cleanup(config: &Config, scopes: &[String], dry_run: bool) -> Result<CleanupStats> {
    let mut total = CleanupStats::default();
    for storage in [Storage::Temporary, Storage::Durable] {
        let scopes = match scopes {
            [] => existing_scopes(config, storage)?,
            scopes => scopes.to_vec(),
        };
        for scope in scopes {
            let cache = AssetCache::from_config(config, scope, storage)?;
            total += cache.cleanup(dry_run)?;
        }
    }
    Ok(total)
}

/// Lists the scope directories below the given storage.
fn existing_scopes(config: &Config, storage: Storage) -> Result<Vec<String>> {
    let assets = config.storage_dir(storage).join("Assets");
    let entries = match std::fs::read_dir(&assets) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
        Err(err) => return Err(err).context("failed to list cache scopes"),
    };

    let mut scopes = BTreeSet::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Ok(name) = entry.file_name().into_string() {
            scopes.insert(name);
        }
    }
    Ok(scopes.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_fetch() {
        let cli = Cli::try_parse_from([
            "assetcache",
            "fetch",
            "https://example.com/logo.png",
            "--kind",
            "image",
            "--scope",
            "logos",
            "--storage",
            "durable",
            "-c",
            "config.yml",
        ])
        .unwrap();

        assert_eq!(cli.config(), Some(Path::new("config.yml")));
        match cli.command {
            Commands::Fetch { kind, scope, .. } => {
                assert_eq!(kind, Kind::Image);
                assert_eq!(scope.scope, "logos");
                assert_eq!(scope.storage, StorageArg::Durable);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_cleanup() {
        let cli =
            Cli::try_parse_from(["assetcache", "cleanup", "-s", "a", "-s", "b", "--dry-run"])
                .unwrap();
        match cli.command {
            Commands::Cleanup { scope, dry_run } => {
                assert_eq!(scope, ["a", "b"]);
                assert!(dry_run);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_locator() {
        assert_eq!(
            parse_locator("https://example.com/a.bin").unwrap().as_str(),
            "https://example.com/a.bin"
        );
        assert_eq!(parse_locator("some/file.bin").unwrap().scheme(), "file");
        assert!(parse_locator("https://").is_err());
    }
}
