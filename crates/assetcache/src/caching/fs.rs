use std::fs::{File, read_dir, remove_dir, remove_file};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use filetime::FileTime;
use tempfile::NamedTempFile;

use crate::config::Config;

use super::Contents;

/// The interval in which cached files are touched.
///
/// Files use a "time to idle" instead of "time to live" mode.
/// We thus need to regularly "touch" the files to signal that they are still in use.
/// This is being debounced to once every hour to not have to touch them on every single use.
const TOUCH_EVERY: Duration = Duration::from_secs(3600);

/// Prefix of files that are still being written.
const TEMP_PREFIX: &str = ".tmp";

/// Temporary files older than this are left over from a crash and removed by cleanup.
const STALE_TEMP_AFTER: Duration = Duration::from_secs(3600);

/// The root an [`AssetCache`](super::AssetCache) stores its files under.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Storage {
    /// The temporary directory, which the system may clear at any time.
    #[default]
    Temporary,
    /// A directory that survives restarts.
    Durable,
}

/// The on-disk tier of an [`AssetCache`](super::AssetCache).
///
/// All files of one scope live in `<root>/Assets/<scope>`. The directory is created lazily.
#[derive(Debug, Clone)]
pub(super) struct DiskTier {
    dir: PathBuf,
    max_unused_for: Option<Duration>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupStats {
    pub removed_dirs: usize,
    pub removed_files: usize,
    pub removed_bytes: u64,

    pub retained_dirs: usize,
    pub retained_files: usize,
    pub retained_bytes: u64,
}

impl std::ops::AddAssign for CleanupStats {
    fn add_assign(&mut self, other: Self) {
        self.removed_dirs += other.removed_dirs;
        self.removed_files += other.removed_files;
        self.removed_bytes += other.removed_bytes;
        self.retained_dirs += other.retained_dirs;
        self.retained_files += other.retained_files;
        self.retained_bytes += other.retained_bytes;
    }
}

impl DiskTier {
    pub fn new(config: &Config, storage: Storage, scope: &str) -> Self {
        let dir = config
            .storage_dir(storage)
            .join("Assets")
            .join(safe_scope(scope));

        Self {
            dir,
            max_unused_for: config.caches.max_unused_for,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, file_name: &str) -> PathBuf {
        self.dir.join(file_name)
    }

    /// Reads as much of a cached file as `contents` asks for, if the file exists.
    ///
    /// Takes care of bumping `mtime`. Files never expire on lookup, only [`cleanup`](Self::cleanup)
    /// removes them.
    pub fn lookup(&self, path: &Path, contents: Contents) -> io::Result<Option<Bytes>> {
        // `io::ErrorKind::NotFound` can be returned from multiple locations in this function. All
        // of those can indicate a cache miss as cleanup can run inbetween.
        catch_not_found(|| {
            // We use `mtime` to keep track of "last used", because atime is unreliable on most
            // filesystems that are mounted with noatime.
            let metadata = path.metadata()?;
            tracing::trace!("File `{}` length: {}", path.display(), metadata.len());
            let mtime_elapsed = metadata.modified()?.elapsed().unwrap_or_default();

            let bytes = read_contents(path, contents)?;

            if mtime_elapsed >= TOUCH_EVERY {
                filetime::set_file_mtime(path, FileTime::now())?;
            }

            Ok(bytes)
        })
    }

    /// Checks whether the file at `path` was used within the configured retention.
    ///
    /// If it should be removed, `Err(io::ErrorKind::NotFound)` is returned, else the time since
    /// it was last touched.
    fn check_expiry(&self, path: &Path) -> io::Result<Duration> {
        let mtime_elapsed = path.metadata()?.modified()?.elapsed().unwrap_or_default();
        let max_unused_for = self.max_unused_for.unwrap_or(Duration::MAX);
        if mtime_elapsed > max_unused_for {
            return Err(io::ErrorKind::NotFound.into());
        }

        Ok(mtime_elapsed)
    }

    /// Writes `contents` to `path` so that readers never observe a partial file.
    ///
    /// The contents go to a temporary file in the same directory first, which is then renamed
    /// into place.
    pub fn persist(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        let mut temp_file = self.tempfile()?;
        temp_file.write_all(contents)?;
        temp_file.as_file().sync_data()?;
        persist_tempfile(temp_file, path)?;

        metric!(counter("assets.file.write") += 1);
        metric!(time_raw("assets.file.size") = contents.len() as u64);
        Ok(())
    }

    /// Create a new temporary file in the scope directory.
    fn tempfile(&self) -> io::Result<NamedTempFile> {
        // The `cleanup` process could potentially remove the parent directories we are
        // operating in, so be defensive here and retry the fs operations.
        const MAX_RETRIES: usize = 2;
        let mut retries = 0;
        loop {
            retries += 1;

            if let Err(e) = std::fs::create_dir_all(&self.dir) {
                sentry::with_scope(
                    |scope| scope.set_extra("path", self.dir.display().to_string().into()),
                    || tracing::error!("Failed to create cache directory: {:?}", e),
                );
                if retries > MAX_RETRIES {
                    return Err(e);
                }
                continue;
            }

            match tempfile::Builder::new()
                .prefix(TEMP_PREFIX)
                .tempfile_in(&self.dir)
            {
                Ok(temp_file) => return Ok(temp_file),
                Err(e) => {
                    sentry::with_scope(
                        |scope| scope.set_extra("path", self.dir.display().to_string().into()),
                        || tracing::error!("Failed to create cache file: {:?}", e),
                    );
                    if retries > MAX_RETRIES {
                        return Err(e);
                    }
                    continue;
                }
            }
        }
    }

    pub fn remove(&self, path: &Path) -> io::Result<()> {
        catch_not_found(|| remove_file(path))?;
        Ok(())
    }

    /// Removes the whole scope directory.
    pub fn clear(&self) -> io::Result<()> {
        catch_not_found(|| std::fs::remove_dir_all(&self.dir))?;
        Ok(())
    }

    /// Cleans up the scope directory based on the configured retention.
    ///
    /// If `dry_run` is `true`, no files will actually be deleted.
    pub fn cleanup(&self, dry_run: bool) -> Result<CleanupStats> {
        tracing::info!("Cleaning up `{}`", self.dir.display());

        let mut stats = CleanupStats::default();
        self.cleanup_directory_recursive(&self.dir, &mut stats, dry_run)?;

        tracing::info!("Cleaning up `{}` complete", self.dir.display());
        tracing::info!(
            "Retained {} directories and {} files, totaling {} bytes",
            stats.retained_dirs,
            stats.retained_files,
            stats.retained_bytes,
        );
        tracing::info!(
            "Removed {} directories and {} files, totaling {} bytes",
            stats.removed_dirs,
            stats.removed_files,
            stats.removed_bytes
        );

        metric!(gauge("assets.size.files") = stats.retained_files as u64);
        metric!(gauge("assets.size.bytes") = stats.retained_bytes);
        metric!(counter("assets.size.files_removed") += stats.removed_files as i64);
        metric!(counter("assets.size.bytes_removed") += stats.removed_bytes as i64);

        Ok(stats)
    }

    /// Cleans up the directory recursively, returning `true` if the directory is left empty after cleanup.
    ///
    /// If `dry_run` is `true`, no files will actually be deleted.
    fn cleanup_directory_recursive(
        &self,
        directory: &Path,
        stats: &mut CleanupStats,
        dry_run: bool,
    ) -> Result<bool> {
        let entries = match catch_not_found(|| read_dir(directory))? {
            Some(x) => x,
            None => {
                tracing::debug!("Directory not found: `{}`", directory.display());
                return Ok(true);
            }
        };
        tracing::debug!("Cleaning directory `{}`", directory.display());

        let mut is_empty = true;
        for entry in entries {
            let path = entry?.path();
            if path.is_dir() {
                let mut dir_is_empty = self.cleanup_directory_recursive(&path, stats, dry_run)?;
                if dir_is_empty {
                    tracing::debug!("Removing directory `{}`", path.display());
                    if !dry_run {
                        if let Err(e) = remove_dir(&path) {
                            sentry::with_scope(
                                |scope| scope.set_extra("path", path.display().to_string().into()),
                                || tracing::error!("Failed to clean cache directory: {:?}", e),
                            );
                            dir_is_empty = false;
                        }
                    }
                }
                if dir_is_empty {
                    stats.removed_dirs += 1;
                } else {
                    stats.retained_dirs += 1;
                }
                is_empty &= dir_is_empty;
            } else {
                match self.try_cleanup_path(&path, stats, dry_run) {
                    Err(e) => {
                        sentry::with_scope(
                            |scope| scope.set_extra("path", path.display().to_string().into()),
                            || tracing::error!("Failed to clean cache file: {:?}", e),
                        );
                        is_empty = false;
                    }
                    Ok(file_removed) => is_empty &= file_removed,
                }
            }
        }

        Ok(is_empty)
    }

    /// Tries to clean up the file at `path`, returning `true` if it was removed.
    ///
    /// If `dry_run` is `true`, the file will not actually be deleted.
    fn try_cleanup_path(
        &self,
        path: &Path,
        stats: &mut CleanupStats,
        dry_run: bool,
    ) -> Result<bool> {
        tracing::trace!("Checking file `{}`", path.display());
        let Some(metadata) = catch_not_found(|| path.metadata())? else {
            return Ok(true);
        };
        anyhow::ensure!(metadata.is_file(), "not a file");
        let size = metadata.len();

        let expired = if is_temp_file(path) {
            // temp files of in-flight writes are recent, old ones were abandoned
            let age = metadata.modified()?.elapsed().unwrap_or_default();
            age > STALE_TEMP_AFTER
        } else {
            catch_not_found(|| self.check_expiry(path))?.is_none()
        };

        if expired {
            tracing::debug!("Removing file `{}`", path.display());
            if !dry_run {
                catch_not_found(|| remove_file(path))?;
            }

            stats.removed_bytes += size;
            stats.removed_files += 1;

            return Ok(true);
        }
        stats.retained_bytes += size;
        stats.retained_files += 1;

        Ok(false)
    }
}

/// Reads the part of the file at `path` that `contents` asks for.
pub(super) fn read_contents(path: &Path, contents: Contents) -> io::Result<Bytes> {
    match contents {
        Contents::Full => std::fs::read(path).map(Bytes::from),
        Contents::Header(len) => {
            let mut header = Vec::with_capacity(len);
            File::open(path)?
                .take(len as u64)
                .read_to_end(&mut header)?;
            Ok(header.into())
        }
        Contents::PathOnly => path.metadata().map(|_| Bytes::new()),
    }
}

fn is_temp_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with(TEMP_PREFIX))
}

fn persist_tempfile(mut temp_file: NamedTempFile, cache_path: &Path) -> io::Result<()> {
    let parent = cache_path
        .parent()
        .ok_or_else(|| io::Error::other("no parent directory to persist item"))?;

    // The `cleanup` process could potentially remove the parent directories we are
    // operating in, so be defensive here and retry the fs operations.
    const MAX_RETRIES: usize = 2;
    let mut retries = 0;
    loop {
        retries += 1;

        if let Err(e) = std::fs::create_dir_all(parent) {
            sentry::with_scope(
                |scope| scope.set_extra("path", parent.display().to_string().into()),
                || tracing::error!("Failed to create cache directory: {:?}", e),
            );
            if retries > MAX_RETRIES {
                return Err(e);
            }
            continue;
        }

        match temp_file.persist(cache_path) {
            Ok(_) => return Ok(()),
            Err(e) => {
                temp_file = e.file;
                let err = e.error;
                sentry::with_scope(
                    |scope| scope.set_extra("path", cache_path.display().to_string().into()),
                    || tracing::error!("Failed to create cache file: {:?}", err),
                );
                if retries > MAX_RETRIES {
                    return Err(err);
                }
                continue;
            }
        }
    }
}

/// Scopes become a single directory level.
fn safe_scope(scope: &str) -> String {
    let scope = scope.replace(['.', '/', '\\', ':'], "_");
    if scope.is_empty() {
        "_".into()
    } else {
        scope
    }
}

pub(super) fn catch_not_found<F, R>(f: F) -> io::Result<Option<R>>
where
    F: FnOnce() -> io::Result<R>,
{
    match f() {
        Ok(x) => Ok(Some(x)),
        Err(e) => match e.kind() {
            io::ErrorKind::NotFound => Ok(None),
            _ => Err(e),
        },
    }
}

/// Sets the `mtime` of `path` into the past, for expiry tests.
#[cfg(test)]
pub(super) fn set_age(path: &Path, age: Duration) {
    let mtime = std::time::SystemTime::now() - age;
    filetime::set_file_mtime(path, FileTime::from_system_time(mtime)).unwrap();
}

#[cfg(test)]
mod tests {
    use crate::test;

    use super::*;

    fn tier(root: &Path, max_unused_for: Option<Duration>) -> DiskTier {
        let config = Config {
            temporary_dir: root.to_owned(),
            ..Config::default()
        };
        let mut tier = DiskTier::new(&config, Storage::Temporary, "t");
        tier.max_unused_for = max_unused_for;
        tier
    }

    #[test]
    fn test_persist_and_lookup() {
        test::setup();
        let root = test::tempdir();
        let tier = tier(root.path(), None);

        let path = tier.path("y.bin");
        assert_eq!(path, root.path().join("Assets/t/y.bin"));
        assert!(tier.lookup(&path, Contents::Full).unwrap().is_none());

        tier.persist(&path, b"contents").unwrap();
        assert_eq!(
            &tier.lookup(&path, Contents::Full).unwrap().unwrap()[..],
            b"contents"
        );
        assert_eq!(
            &tier.lookup(&path, Contents::Header(3)).unwrap().unwrap()[..],
            b"con"
        );
        assert!(
            tier.lookup(&path, Contents::PathOnly)
                .unwrap()
                .unwrap()
                .is_empty()
        );

        // only the final file is left behind
        let names: Vec<_> = read_dir(tier.dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["y.bin"]);
    }

    #[test]
    fn test_lookup_touches_file() {
        let root = test::tempdir();
        let tier = tier(root.path(), Some(Duration::from_secs(24 * 3600)));
        let path = tier.path("y.bin");
        tier.persist(&path, b"contents").unwrap();

        set_age(&path, Duration::from_secs(2 * 3600));
        assert!(tier.lookup(&path, Contents::PathOnly).unwrap().is_some());

        let age = path.metadata().unwrap().modified().unwrap().elapsed().unwrap();
        assert!(age < Duration::from_secs(60));
    }

    #[test]
    fn test_unused_file_is_still_a_hit() {
        let root = test::tempdir();
        let tier = tier(root.path(), Some(Duration::from_secs(3600)));
        let path = tier.path("y.bin");
        tier.persist(&path, b"contents").unwrap();

        // only cleanup removes files past the retention
        set_age(&path, Duration::from_secs(8 * 24 * 3600));
        assert_eq!(
            &tier.lookup(&path, Contents::Full).unwrap().unwrap()[..],
            b"contents"
        );
    }

    #[test]
    fn test_missing_file_is_a_miss() {
        let root = test::tempdir();
        let tier = tier(root.path(), None);
        let path = tier.path("y.bin");

        for contents in [Contents::Full, Contents::Header(8), Contents::PathOnly] {
            assert!(tier.lookup(&path, contents).unwrap().is_none());
        }
    }

    #[test]
    fn test_cleanup() -> Result<()> {
        test::setup();
        let root = test::tempdir();
        let tier = tier(root.path(), Some(Duration::from_secs(3600)));

        tier.persist(&tier.path("fresh.bin"), b"fresh")?;
        tier.persist(&tier.path("old.bin"), b"old")?;
        set_age(&tier.path("old.bin"), Duration::from_secs(2 * 3600));

        let abandoned = tier.dir().join(".tmpabandoned");
        std::fs::write(&abandoned, b"partial")?;
        set_age(&abandoned, Duration::from_secs(2 * 3600));
        let in_flight = tier.dir().join(".tmpinflight");
        std::fs::write(&in_flight, b"partial")?;

        let stats = tier.cleanup(true)?;
        assert_eq!(stats.removed_files, 2);
        assert!(tier.path("old.bin").exists());

        let stats = tier.cleanup(false)?;
        assert_eq!(stats.removed_files, 2);
        assert_eq!(stats.retained_files, 2);
        assert_eq!(stats.retained_bytes, 5 + 7);
        assert!(tier.path("fresh.bin").exists());
        assert!(!tier.path("old.bin").exists());
        assert!(!abandoned.exists());
        assert!(in_flight.exists());

        Ok(())
    }

    #[test]
    fn test_clear() -> Result<()> {
        let root = test::tempdir();
        let tier = tier(root.path(), None);
        tier.persist(&tier.path("y.bin"), b"contents")?;

        tier.clear()?;
        assert!(!tier.dir().exists());
        // clearing twice is fine
        tier.clear()?;

        Ok(())
    }

    #[test]
    fn test_safe_scope() {
        assert_eq!(safe_scope("t"), "t");
        assert_eq!(safe_scope("../x"), "___x");
        assert_eq!(safe_scope(""), "_");
    }
}
