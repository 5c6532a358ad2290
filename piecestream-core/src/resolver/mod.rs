//! Torrent source resolution
//!
//! Turns a magnet URI, an HTTP(S) URL or a `file://` path into
//! [`TorrentMetadata`] without starting a download.

use std::fmt;
use std::path::PathBuf;

use crate::config::ResolverConfig;
use crate::session::{SessionError, TorrentSession};
use crate::torrent::{BencodeParser, MagnetParser, TorrentError, TorrentMetadata};

/// Source kind, decided by literal prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceScheme {
    Magnet,
    Http,
    File,
}

impl SourceScheme {
    /// Classifies `uri`, returning `None` for unsupported schemes.
    pub fn classify(uri: &str) -> Option<Self> {
        if uri.starts_with("magnet:") {
            Some(SourceScheme::Magnet)
        } else if uri.starts_with("http://") || uri.starts_with("https://") {
            Some(SourceScheme::Http)
        } else if uri.starts_with("file://") {
            Some(SourceScheme::File)
        } else {
            None
        }
    }
}

impl fmt::Display for SourceScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SourceScheme::Magnet => "magnet",
            SourceScheme::Http => "http",
            SourceScheme::File => "file",
        };
        write!(f, "{name}")
    }
}

/// Errors raised while resolving a torrent source.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ResolveError {
    #[error("Unsupported torrent source: {uri}")]
    InvalidSource { uri: String },

    #[error("Failed to fetch {uri}: {reason}")]
    Fetch { uri: String, reason: String },

    #[error("Invalid torrent metadata: {0}")]
    Decode(#[from] TorrentError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),
}

/// Resolves torrent sources into metadata.
///
/// Magnet links are fetched through the session's engine, so they need a
/// running session. HTTP and file sources do not touch the session.
#[derive(Clone)]
pub struct TorrentResolver {
    session: TorrentSession,
    client: reqwest::Client,
    config: ResolverConfig,
}

impl TorrentResolver {
    /// # Errors
    ///
    /// - `ResolveError::Fetch` - HTTP client could not be created
    pub fn new(session: TorrentSession, config: ResolverConfig) -> Result<Self, ResolveError> {
        let client = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .user_agent(config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .map_err(|e| ResolveError::Fetch {
                uri: "http client".to_string(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            session,
            client,
            config,
        })
    }

    /// Resolves `uri` into torrent metadata.
    ///
    /// # Errors
    ///
    /// - `ResolveError::InvalidSource` - Scheme is not magnet, http(s) or file
    /// - `ResolveError::Fetch` - Retrieval failed or produced no bytes
    /// - `ResolveError::Decode` - Bytes are not valid torrent metadata
    /// - `ResolveError::Session` - Magnet resolution without a running session
    pub async fn resolve(&self, uri: &str) -> Result<TorrentMetadata, ResolveError> {
        let scheme = SourceScheme::classify(uri).ok_or_else(|| ResolveError::InvalidSource {
            uri: uri.to_string(),
        })?;
        tracing::debug!("Resolving {} source {}", scheme, uri);

        let metadata = match scheme {
            SourceScheme::Magnet => self.resolve_magnet(uri).await?,
            SourceScheme::Http => BencodeParser::parse_torrent_bytes(&self.fetch_http(uri).await?)?,
            SourceScheme::File => BencodeParser::parse_torrent_bytes(&self.read_file(uri).await?)?,
        };

        tracing::info!(
            "Resolved {} ({} files, {} pieces of {} bytes)",
            metadata.name,
            metadata.files.len(),
            metadata.piece_count(),
            metadata.piece_length
        );
        Ok(metadata)
    }

    async fn resolve_magnet(&self, uri: &str) -> Result<TorrentMetadata, ResolveError> {
        let magnet = MagnetParser::parse_magnet_link(uri)?;
        let timeout = self.config.magnet_timeout;

        let bytes = self
            .session
            .fetch_magnet(&magnet, timeout)
            .await?
            .filter(|bytes| !bytes.is_empty())
            .ok_or_else(|| ResolveError::Fetch {
                uri: uri.to_string(),
                reason: format!("no metadata received within {timeout:?}"),
            })?;

        let metadata = BencodeParser::parse_torrent_bytes(&bytes)?;
        if metadata.info_hash != magnet.info_hash {
            return Err(TorrentError::InvalidTorrentFile {
                reason: format!(
                    "Metadata hash {} does not match magnet hash {}",
                    metadata.info_hash, magnet.info_hash
                ),
            }
            .into());
        }
        Ok(metadata)
    }

    async fn fetch_http(&self, uri: &str) -> Result<Vec<u8>, ResolveError> {
        let fetch_error = |reason: String| ResolveError::Fetch {
            uri: uri.to_string(),
            reason,
        };

        let response = self.client.get(uri).send().await.map_err(|e| {
            tracing::warn!("HTTP request to {} failed: {}", uri, e);
            fetch_error(e.to_string())
        })?;

        let status = response.status();
        if !status.is_success() {
            tracing::warn!("{} returned {}", uri, status);
            return Err(fetch_error(format!("HTTP status {status}")));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| fetch_error(e.to_string()))?;
        if body.is_empty() {
            return Err(fetch_error("empty response body".to_string()));
        }
        Ok(body.to_vec())
    }

    async fn read_file(&self, uri: &str) -> Result<Vec<u8>, ResolveError> {
        let path = file_uri_to_path(uri);
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| ResolveError::Fetch {
                uri: uri.to_string(),
                reason: format!("{}: {e}", path.display()),
            })?;

        if bytes.is_empty() {
            return Err(ResolveError::Fetch {
                uri: uri.to_string(),
                reason: "file is empty".to_string(),
            });
        }
        Ok(bytes)
    }
}

/// `file://` URI to a local path. Falls back to stripping the prefix for
/// URIs the URL parser rejects, such as unescaped relative paths.
fn file_uri_to_path(uri: &str) -> PathBuf {
    url::Url::parse(uri)
        .ok()
        .and_then(|url| url.to_file_path().ok())
        .unwrap_or_else(|| {
            let raw = uri.trim_start_matches("file://");
            let decoded = urlencoding::decode(raw)
                .map(|path| path.into_owned())
                .unwrap_or_else(|_| raw.to_string());
            PathBuf::from(decoded)
        })
}
