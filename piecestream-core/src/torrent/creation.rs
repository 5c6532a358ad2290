//! Torrent creation from in-memory content
//!
//! Splits content into pieces, hashes them and bencodes a complete `.torrent`
//! payload. Used by simulation mode and by tests that need real torrent bytes.

use sha1::{Digest, Sha1};

use super::TorrentError;

/// Standard BitTorrent piece size (256KB)
pub const DEFAULT_PIECE_SIZE: u32 = 262_144;

/// Builds bencoded `.torrent` files.
pub struct TorrentCreator {
    piece_size: u32,
    announce_urls: Vec<String>,
}

impl Default for TorrentCreator {
    fn default() -> Self {
        Self::new()
    }
}

impl TorrentCreator {
    /// Creates torrent creator with default piece size (256KB)
    pub fn new() -> Self {
        Self::with_piece_size(DEFAULT_PIECE_SIZE)
    }

    /// Creates torrent creator with custom piece size
    pub fn with_piece_size(piece_size: u32) -> Self {
        Self {
            piece_size,
            announce_urls: Vec::new(),
        }
    }

    /// Sets tracker URLs. The first becomes `announce`, all of them form
    /// a single-tier `announce-list`.
    pub fn with_announce_urls(mut self, announce_urls: Vec<String>) -> Self {
        self.announce_urls = announce_urls;
        self
    }

    /// Creates a single-file torrent.
    ///
    /// # Errors
    /// - `TorrentError::InvalidTorrentFile` - Empty content or zero piece size
    pub fn create_single_file(&self, name: &str, content: &[u8]) -> Result<Vec<u8>, TorrentError> {
        self.validate(name, content.len() as u64)?;

        let mut info = Vec::new();
        info.extend_from_slice(b"d");
        encode_key_int(&mut info, "length", content.len() as u64);
        self.encode_common_info(&mut info, name, &[content]);
        info.extend_from_slice(b"e");

        Ok(self.wrap_info(&info))
    }

    /// Creates a multi-file torrent rooted at directory `name`.
    ///
    /// File paths use `/` as separator.
    ///
    /// # Errors
    /// - `TorrentError::InvalidTorrentFile` - No files, empty total content or zero piece size
    pub fn create_multi_file(
        &self,
        name: &str,
        files: &[(&str, &[u8])],
    ) -> Result<Vec<u8>, TorrentError> {
        if files.is_empty() {
            return Err(TorrentError::InvalidTorrentFile {
                reason: "Cannot create torrent without files".to_string(),
            });
        }
        let total: u64 = files.iter().map(|(_, data)| data.len() as u64).sum();
        self.validate(name, total)?;

        let mut info = Vec::new();
        info.extend_from_slice(b"d");
        encode_bytes(&mut info, b"files");
        info.extend_from_slice(b"l");
        for (path, data) in files {
            info.extend_from_slice(b"d");
            encode_key_int(&mut info, "length", data.len() as u64);
            encode_bytes(&mut info, b"path");
            info.extend_from_slice(b"l");
            for component in path.split('/').filter(|c| !c.is_empty()) {
                encode_bytes(&mut info, component.as_bytes());
            }
            info.extend_from_slice(b"ee");
        }
        info.extend_from_slice(b"e");

        let contents: Vec<&[u8]> = files.iter().map(|(_, data)| *data).collect();
        self.encode_common_info(&mut info, name, &contents);
        info.extend_from_slice(b"e");

        Ok(self.wrap_info(&info))
    }

    fn validate(&self, name: &str, total_length: u64) -> Result<(), TorrentError> {
        if self.piece_size == 0 {
            return Err(TorrentError::InvalidTorrentFile {
                reason: "Piece size must be positive".to_string(),
            });
        }
        if total_length == 0 {
            return Err(TorrentError::InvalidTorrentFile {
                reason: "Cannot create torrent from empty content".to_string(),
            });
        }
        if name.is_empty() {
            return Err(TorrentError::InvalidTorrentFile {
                reason: "Torrent name must not be empty".to_string(),
            });
        }
        Ok(())
    }

    /// Appends `name`, `piece length` and `pieces`, which sort after
    /// `files` and `length`.
    fn encode_common_info(&self, info: &mut Vec<u8>, name: &str, contents: &[&[u8]]) {
        encode_bytes(info, b"name");
        encode_bytes(info, name.as_bytes());
        encode_key_int(info, "piece length", u64::from(self.piece_size));
        encode_bytes(info, b"pieces");
        encode_bytes(info, &self.calculate_piece_hashes(contents));
    }

    /// Hashes the concatenation of all contents piece by piece.
    fn calculate_piece_hashes(&self, contents: &[&[u8]]) -> Vec<u8> {
        let piece_size = self.piece_size as usize;
        let mut hashes = Vec::new();
        let mut hasher = Sha1::new();
        let mut filled = 0usize;

        for content in contents {
            let mut remaining = *content;
            while !remaining.is_empty() {
                let take = (piece_size - filled).min(remaining.len());
                hasher.update(&remaining[..take]);
                filled += take;
                remaining = &remaining[take..];

                if filled == piece_size {
                    hashes.extend_from_slice(&hasher.finalize_reset());
                    filled = 0;
                }
            }
        }
        if filled > 0 {
            hashes.extend_from_slice(&hasher.finalize());
        }

        hashes
    }

    fn wrap_info(&self, info: &[u8]) -> Vec<u8> {
        let mut torrent = Vec::with_capacity(info.len() + 64);
        torrent.extend_from_slice(b"d");
        if let Some(first) = self.announce_urls.first() {
            encode_bytes(&mut torrent, b"announce");
            encode_bytes(&mut torrent, first.as_bytes());
            encode_bytes(&mut torrent, b"announce-list");
            torrent.extend_from_slice(b"ll");
            for url in &self.announce_urls {
                encode_bytes(&mut torrent, url.as_bytes());
            }
            torrent.extend_from_slice(b"ee");
        }
        encode_bytes(&mut torrent, b"info");
        torrent.extend_from_slice(info);
        torrent.extend_from_slice(b"e");
        torrent
    }
}

fn encode_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(bytes.len().to_string().as_bytes());
    out.push(b':');
    out.extend_from_slice(bytes);
}

fn encode_key_int(out: &mut Vec<u8>, key: &str, value: u64) {
    encode_bytes(out, key.as_bytes());
    out.extend_from_slice(format!("i{value}e").as_bytes());
}
