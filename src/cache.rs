//! On-disk cache for downloaded media.
//!
//! Enabled with the `resource-cache` feature.

use std::{
    io,
    path::{Path, PathBuf},
};

use tokio::fs;

use crate::{Fetcher, RequestDescriptor, Result};

/// Directory of downloaded resources, one file per URL.
///
/// File names are the MD5 hex digest of the URL followed by the extension
/// given at download time, e.g. `3f2a…9c.mp4`.
#[derive(Clone, Debug)]
pub struct ResourceCache {
    dir: PathBuf,
}

impl ResourceCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Existing cache entry for `url`, whatever extension it was stored with.
    pub async fn cached_path(&self, url: &str) -> Result<Option<PathBuf>> {
        let key = cache_key(url);
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if is_entry_for(name, &key) {
                return Ok(Some(entry.path()));
            }
        }
        Ok(None)
    }

    /// Returns the cached file for `url`, downloading it first if needed.
    ///
    /// The download goes through `fetcher`, so it shares the admission gate
    /// and retry policy with every other request.
    pub async fn fetch_to_cache(
        &self,
        fetcher: &Fetcher,
        url: &str,
        extension: &str,
    ) -> Result<PathBuf> {
        if let Some(path) = self.cached_path(url).await? {
            return Ok(path);
        }

        let response = fetcher.fetch(&RequestDescriptor::get(url)).await?;
        fs::create_dir_all(&self.dir).await?;

        let key = cache_key(url);
        let target = self.dir.join(format!("{key}{}", normalize_extension(extension)));
        // Unique per download so concurrent fetches of one URL never share a
        // temp file.
        let partial = self.dir.join(format!("{key}.{:016x}.part", rand::random::<u64>()));
        if let Err(err) = write_then_rename(&partial, &target, response.body()).await {
            let _ = fs::remove_file(&partial).await;
            // A concurrent download may have published the entry already.
            if fs::try_exists(&target).await.unwrap_or(false) {
                return Ok(target);
            }
            return Err(err.into());
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(url, path = %target.display(), "resource cached");

        Ok(target)
    }

    /// Deletes the entry for `url`. Returns whether one existed.
    pub async fn remove(&self, url: &str) -> Result<bool> {
        match self.cached_path(url).await? {
            Some(path) => {
                fs::remove_file(path).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Deletes every cache entry and returns how many were removed.
    pub async fn clear(&self) -> Result<usize> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err.into()),
        };

        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                fs::remove_file(entry.path()).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

fn cache_key(url: &str) -> String {
    format!("{:x}", md5::compute(url.trim().as_bytes()))
}

fn normalize_extension(extension: &str) -> String {
    let extension = extension.trim().trim_start_matches('.');
    if extension.is_empty() {
        String::new()
    } else {
        format!(".{extension}")
    }
}

async fn write_then_rename(partial: &Path, target: &Path, body: &[u8]) -> io::Result<()> {
    fs::write(partial, body).await?;
    fs::rename(partial, target).await
}

fn is_entry_for(name: &str, key: &str) -> bool {
    match name.strip_prefix(key) {
        Some("") => true,
        Some(rest) => rest.starts_with('.') && !rest.ends_with(".part"),
        None => false,
    }
}
