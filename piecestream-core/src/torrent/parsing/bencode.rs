//! Bencode parsing logic and info hash calculation

use std::path::{Component, Path, PathBuf};

use sha1::{Digest, Sha1};

use crate::torrent::{FileEntry, InfoHash, TorrentError, TorrentMetadata};

type BencodeDict<'a> = std::collections::HashMap<&'a [u8], bencode_rs::Value<'a>>;
type ParseResult<T> = Result<T, TorrentError>;

fn invalid(reason: impl Into<String>) -> TorrentError {
    TorrentError::InvalidTorrentFile {
        reason: reason.into(),
    }
}

/// Bencode parsing utilities for torrent metadata extraction.
pub struct BencodeParser;

impl BencodeParser {
    /// Parses raw `.torrent` bytes into metadata.
    ///
    /// # Errors
    ///
    /// - `TorrentError::InvalidTorrentFile` - If bencode parsing or metadata extraction failed
    pub fn parse_torrent_bytes(torrent_bytes: &[u8]) -> Result<TorrentMetadata, TorrentError> {
        let parsed = bencode_rs::Value::parse(torrent_bytes)
            .map_err(|e| invalid(format!("Bencode parsing failed: {e:?}")))?;

        let Some(root) = parsed.first() else {
            return Err(invalid("Empty bencode data"));
        };

        if let bencode_rs::Value::Dictionary(dict) = root {
            Self::extract_metadata_from_dict(dict, torrent_bytes)
        } else {
            Err(invalid("Root element must be dictionary"))
        }
    }

    fn extract_metadata_from_dict(
        dict: &BencodeDict<'_>,
        original_data: &[u8],
    ) -> ParseResult<TorrentMetadata> {
        let Some(bencode_rs::Value::Dictionary(info)) = dict.get(b"info".as_slice()) else {
            return Err(invalid("Missing or invalid 'info' dictionary"));
        };

        let info_hash = Self::calculate_info_hash(original_data)?;

        let name = Self::extract_string(info, b"name")?;
        Self::ensure_plain_component(&name)?;
        let piece_length = Self::extract_integer(info, b"piece length")?;
        if piece_length <= 0 || piece_length > i64::from(u32::MAX) {
            return Err(invalid(format!("Invalid piece length: {piece_length}")));
        }

        let pieces_bytes = Self::extract_bytes(info, b"pieces")?;
        if pieces_bytes.is_empty() || pieces_bytes.len() % 20 != 0 {
            return Err(invalid("Invalid pieces length"));
        }
        let piece_hashes: Vec<[u8; 20]> = pieces_bytes
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect();

        let files = if let Ok(length) = Self::extract_integer(info, b"length") {
            vec![FileEntry {
                index: 0,
                path: PathBuf::from(&name),
                length: Self::non_negative(length)?,
                offset: 0,
            }]
        } else if let Some(bencode_rs::Value::List(files_list)) = info.get(b"files".as_slice()) {
            Self::extract_files(&name, files_list)?
        } else {
            return Err(invalid("Missing 'files' or 'length' field"));
        };

        let total_length = files
            .iter()
            .try_fold(0u64, |total, file| total.checked_add(file.length))
            .ok_or_else(|| invalid("Total length overflows"))?;
        let piece_length = piece_length as u32;
        let expected_pieces = total_length.div_ceil(u64::from(piece_length));
        if expected_pieces != piece_hashes.len() as u64 {
            return Err(invalid(format!(
                "Piece count mismatch: {} hashes for {expected_pieces} pieces",
                piece_hashes.len()
            )));
        }

        Ok(TorrentMetadata {
            info_hash,
            name,
            piece_length,
            piece_hashes,
            total_length,
            files,
            announce_urls: Self::extract_announce_urls(dict),
        })
    }

    fn extract_files(name: &str, files_list: &[bencode_rs::Value<'_>]) -> ParseResult<Vec<FileEntry>> {
        if files_list.is_empty() {
            return Err(invalid("Empty 'files' list"));
        }

        let mut offset = 0u64;
        let mut files = Vec::with_capacity(files_list.len());
        for (index, value) in files_list.iter().enumerate() {
            let bencode_rs::Value::Dictionary(file_dict) = value else {
                return Err(invalid(format!("File entry {index} must be dictionary")));
            };

            let length = Self::non_negative(Self::extract_integer(file_dict, b"length")?)?;
            let Some(bencode_rs::Value::List(components)) = file_dict.get(b"path".as_slice()) else {
                return Err(invalid(format!("File entry {index} missing 'path'")));
            };

            let mut path = PathBuf::from(name);
            for component in components {
                let bencode_rs::Value::Bytes(bytes) = component else {
                    return Err(invalid(format!("File entry {index} has invalid path")));
                };
                let component = String::from_utf8_lossy(bytes);
                Self::ensure_plain_component(&component)?;
                path.push(component.as_ref());
            }

            files.push(FileEntry {
                index,
                path,
                length,
                offset,
            });
            offset = offset
                .checked_add(length)
                .ok_or_else(|| invalid(format!("File entry {index} overflows the total length")))?;
        }

        Ok(files)
    }

    fn extract_announce_urls(dict: &BencodeDict<'_>) -> Vec<String> {
        let mut urls = Vec::new();

        if let Some(bencode_rs::Value::Bytes(announce)) = dict.get(b"announce".as_slice()) {
            urls.push(String::from_utf8_lossy(announce).into_owned());
        }

        if let Some(bencode_rs::Value::List(tiers)) = dict.get(b"announce-list".as_slice()) {
            for tier in tiers {
                let bencode_rs::Value::List(tier_urls) = tier else {
                    continue;
                };
                for url in tier_urls {
                    if let bencode_rs::Value::Bytes(bytes) = url {
                        let url = String::from_utf8_lossy(bytes).into_owned();
                        if !urls.contains(&url) {
                            urls.push(url);
                        }
                    }
                }
            }
        }

        urls
    }

    /// Calculate SHA1 hash of the raw info dictionary bytes.
    ///
    /// Walks the top-level dictionary key by key so an `info` string inside
    /// another value cannot be mistaken for the key.
    fn calculate_info_hash(original_data: &[u8]) -> ParseResult<InfoHash> {
        if original_data.first() != Some(&b'd') {
            return Err(invalid("Expected dictionary start"));
        }

        let mut pos = 1;
        while pos < original_data.len() && original_data[pos] != b'e' {
            let key_end = Self::find_bencode_value_end(original_data, pos)?;
            let key = Self::string_contents(&original_data[pos..key_end])?;
            let value_end = Self::find_bencode_value_end(original_data, key_end)?;

            if key == b"info" {
                let mut hasher = Sha1::new();
                hasher.update(&original_data[key_end..value_end]);
                let mut hash = [0u8; 20];
                hash.copy_from_slice(&hasher.finalize());
                return Ok(InfoHash::new(hash));
            }
            pos = value_end;
        }

        Err(invalid("Could not find info dictionary in data"))
    }

    fn string_contents(encoded: &[u8]) -> ParseResult<&[u8]> {
        let colon = encoded
            .iter()
            .position(|&b| b == b':')
            .ok_or_else(|| invalid("Dictionary key must be a string"))?;
        Ok(&encoded[colon + 1..])
    }

    /// Returns the position just past the bencode value starting at `start`.
    ///
    /// # Errors
    ///
    /// - `TorrentError::InvalidTorrentFile` - If the value is truncated or malformed
    pub fn find_bencode_value_end(data: &[u8], start: usize) -> ParseResult<usize> {
        let mut pos = start;
        let mut depth = 0usize;

        loop {
            let Some(&byte) = data.get(pos) else {
                return Err(invalid("Incomplete bencode value"));
            };

            match byte {
                b'd' | b'l' => {
                    depth += 1;
                    pos += 1;
                }
                b'e' if depth > 0 => {
                    depth -= 1;
                    pos += 1;
                }
                b'i' => {
                    let end = data[pos..]
                        .iter()
                        .position(|&b| b == b'e')
                        .ok_or_else(|| invalid("Unterminated integer"))?;
                    pos += end + 1;
                }
                b'0'..=b'9' => {
                    let colon = data[pos..]
                        .iter()
                        .position(|&b| b == b':')
                        .ok_or_else(|| invalid("Invalid string format"))?;
                    let length: usize = std::str::from_utf8(&data[pos..pos + colon])
                        .ok()
                        .and_then(|text| text.parse().ok())
                        .ok_or_else(|| invalid("Invalid string length"))?;
                    pos += colon + 1 + length;
                    if pos > data.len() {
                        return Err(invalid("String runs past end of data"));
                    }
                }
                _ => return Err(invalid("Invalid bencode character")),
            }

            if depth == 0 {
                return Ok(pos);
            }
        }
    }

    fn extract_string(dict: &BencodeDict<'_>, key: &[u8]) -> ParseResult<String> {
        let bytes = Self::extract_bytes(dict, key)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| {
            invalid(format!(
                "Invalid UTF-8 in field: {:?}",
                String::from_utf8_lossy(key)
            ))
        })
    }

    fn extract_bytes<'a>(dict: &'a BencodeDict<'_>, key: &[u8]) -> ParseResult<&'a [u8]> {
        match dict.get(key) {
            Some(bencode_rs::Value::Bytes(bytes)) => Ok(bytes),
            _ => Err(invalid(format!(
                "Missing or invalid field: {:?}",
                String::from_utf8_lossy(key)
            ))),
        }
    }

    fn extract_integer(dict: &BencodeDict<'_>, key: &[u8]) -> ParseResult<i64> {
        match dict.get(key) {
            Some(bencode_rs::Value::Integer(value)) => Ok(*value),
            _ => Err(invalid(format!(
                "Missing or invalid integer field: {:?}",
                String::from_utf8_lossy(key)
            ))),
        }
    }

    /// Accepts a single normal path segment so file paths stay inside the
    /// save directory.
    fn ensure_plain_component(component: &str) -> ParseResult<()> {
        let plain = !component.contains(['/', '\\', '\0'])
            && matches!(
                Path::new(component).components().collect::<Vec<_>>().as_slice(),
                [Component::Normal(_)]
            );
        if plain {
            Ok(())
        } else {
            Err(invalid(format!("Unsafe path component: {component:?}")))
        }
    }

    fn non_negative(value: i64) -> ParseResult<u64> {
        u64::try_from(value).map_err(|_| invalid(format!("Negative length: {value}")))
    }
}
