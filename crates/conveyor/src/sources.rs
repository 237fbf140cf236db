//! Inbound feed access for `import_ftp`. The real collaborator is the
//! FTP/SFTP drop the material, stock, and price feeds land on — out of
//! scope as a protocol client; here the wrapped thing is a configured drop
//! directory.

use std::fs;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("failed to read feed file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("feed source not configured: {0}")]
    NotConfigured(String),
}

/// The four named inputs `import_ftp` stages into object storage.
pub trait FeedSource: Send + Sync {
    fn fetch_stock_feed(&self) -> Result<Vec<u8>, FeedError>;
    fn fetch_price_feed(&self) -> Result<Vec<u8>, FeedError>;
    fn fetch_location_feed(&self) -> Result<Vec<u8>, FeedError>;
    /// A URL the material body can be fetched from with HTTP Range
    /// requests. Producing a signed object-storage URL is an external
    /// collaborator's job; this just names where to find one.
    fn material_url(&self) -> Result<String, FeedError>;
}

/// Reads the three small feeds from a configured local drop directory and
/// serves the material file over `file://`-style direct read, used by the
/// `import_ftp` step runner and exercised directly in tests. Production
/// deployments point `drop_dir` at a real FTP-synced mount and `material_url`
/// at a real signed URL; no protocol client is implemented here.
pub struct LocalFeedSource {
    pub drop_dir: PathBuf,
    pub material_url: Option<String>,
}

impl LocalFeedSource {
    pub fn new(drop_dir: impl Into<PathBuf>) -> Self {
        Self { drop_dir: drop_dir.into(), material_url: None }
    }

    pub fn with_material_url(mut self, url: impl Into<String>) -> Self {
        self.material_url = Some(url.into());
        self
    }

    fn read(&self, name: &str) -> Result<Vec<u8>, FeedError> {
        let path = self.drop_dir.join(name);
        fs::read(&path).map_err(|e| FeedError::Io { path: path.display().to_string(), source: e })
    }
}

impl FeedSource for LocalFeedSource {
    fn fetch_stock_feed(&self) -> Result<Vec<u8>, FeedError> {
        self.read("stock.csv")
    }

    fn fetch_price_feed(&self) -> Result<Vec<u8>, FeedError> {
        self.read("price.csv")
    }

    fn fetch_location_feed(&self) -> Result<Vec<u8>, FeedError> {
        self.read("location.csv")
    }

    fn material_url(&self) -> Result<String, FeedError> {
        self.material_url
            .clone()
            .ok_or_else(|| FeedError::NotConfigured("material_url".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_feed_source_reads_drop_directory_files() {
        let td = tempfile::tempdir().unwrap();
        std::fs::write(td.path().join("stock.csv"), "Matnr;Stock\n1;5\n").unwrap();
        let source = LocalFeedSource::new(td.path());
        assert_eq!(source.fetch_stock_feed().unwrap(), b"Matnr;Stock\n1;5\n");
    }

    #[test]
    fn missing_material_url_is_not_configured() {
        let source = LocalFeedSource::new(".");
        assert!(matches!(source.material_url(), Err(FeedError::NotConfigured(_))));
    }
}
