//! Immutable description of a resolved torrent

use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};

use super::InfoHash;

/// Complete metadata extracted from a torrent file.
///
/// Produced once per resolve call and shared read-only afterwards. File
/// offsets are positions in the torrent's concatenated byte stream, which is
/// what maps a file onto the global piece numbering.
#[derive(Debug, Clone, PartialEq)]
pub struct TorrentMetadata {
    pub info_hash: InfoHash,
    pub name: String,
    pub piece_length: u32,
    pub piece_hashes: Vec<[u8; 20]>,
    pub total_length: u64,
    pub files: Vec<FileEntry>,
    pub announce_urls: Vec<String>,
}

/// Individual file within a torrent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Position of the file in the torrent's file list.
    pub index: usize,
    /// Path relative to the save directory. Multi-file torrents are rooted
    /// at the torrent name.
    pub path: PathBuf,
    pub length: u64,
    /// Byte offset of the file's first byte within the whole torrent.
    pub offset: u64,
}

impl FileEntry {
    /// Last path component, or the whole path when it has none.
    pub fn filename(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.to_string_lossy().into_owned())
    }

    /// Full location of the file once saved below `save_path`.
    pub fn full_path(&self, save_path: &Path) -> PathBuf {
        save_path.join(&self.path)
    }
}

impl TorrentMetadata {
    /// Total number of pieces in the torrent.
    pub fn piece_count(&self) -> u32 {
        self.piece_hashes.len() as u32
    }

    /// Looks up a file by index.
    pub fn file(&self, index: usize) -> Option<&FileEntry> {
        self.files.get(index)
    }

    /// The file with the most bytes. Ties go to the lowest index.
    pub fn largest_file(&self) -> Option<&FileEntry> {
        self.files
            .iter()
            .reduce(|best, file| if file.length > best.length { file } else { best })
    }

    /// Global piece indices overlapped by the file's bytes.
    ///
    /// Returns `None` for unknown indices and for zero-length files, which
    /// overlap no piece.
    pub fn pieces_for_file(&self, index: usize) -> Option<RangeInclusive<u32>> {
        let file = self.file(index)?;
        if file.length == 0 || self.piece_length == 0 {
            return None;
        }

        let piece_length = u64::from(self.piece_length);
        let first = file.offset / piece_length;
        let last = (file.offset + file.length - 1) / piece_length;
        Some(first as u32..=last as u32)
    }

    /// Size in bytes of a piece; the final piece may be short.
    pub fn piece_size(&self, piece: u32) -> u64 {
        let piece_length = u64::from(self.piece_length);
        let start = u64::from(piece) * piece_length;
        if start >= self.total_length {
            return 0;
        }
        piece_length.min(self.total_length - start)
    }
}
