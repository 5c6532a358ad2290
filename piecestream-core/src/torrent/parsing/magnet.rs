//! Magnet link parsing utilities

use crate::torrent::{InfoHash, TorrentError};

/// Magnet link components.
///
/// Carries only what the URI itself states. The torrent's file list has to
/// be fetched from the swarm before it can be streamed.
#[derive(Debug, Clone, PartialEq)]
pub struct MagnetLink {
    pub info_hash: InfoHash,
    pub display_name: Option<String>,
    pub trackers: Vec<String>,
    /// The URI as given, handed to the engine unchanged.
    pub uri: String,
}

/// Magnet link parsing utilities.
pub struct MagnetParser;

impl MagnetParser {
    /// Parses magnet link to extract torrent information.
    ///
    /// # Errors
    /// - `TorrentError::InvalidMagnetLink` - Malformed magnet URI or missing `btih` topic
    pub fn parse_magnet_link(magnet_uri: &str) -> Result<MagnetLink, TorrentError> {
        let magnet =
            magnet_url::Magnet::new(magnet_uri).map_err(|e| TorrentError::InvalidMagnetLink {
                reason: format!("{e:?}"),
            })?;

        let url = url::Url::parse(magnet_uri).map_err(|e| TorrentError::InvalidMagnetLink {
            reason: e.to_string(),
        })?;

        let mut info_hash = None;
        let mut display_name = None;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "xt" if info_hash.is_none() => {
                    if let Some(hash) = value.strip_prefix("urn:btih:") {
                        info_hash = Some(InfoHash::from_hex(hash)?);
                    }
                }
                "dn" if display_name.is_none() => display_name = Some(value.into_owned()),
                _ => {}
            }
        }

        let info_hash = info_hash.ok_or_else(|| TorrentError::InvalidMagnetLink {
            reason: format!("Missing btih info hash in {magnet_uri}"),
        })?;

        Ok(MagnetLink {
            info_hash,
            display_name,
            trackers: magnet.trackers().to_vec(),
            uri: magnet_uri.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HASH: &str = "c9e15763f722f23e98a29decdfae341b98d53056";

    #[test]
    fn test_parse_magnet_with_name_and_tracker() {
        let uri = format!(
            "magnet:?xt=urn:btih:{HASH}&dn=Big+Buck%20Bunny&tr=udp%3A%2F%2Ftracker.test%3A1337"
        );
        let link = MagnetParser::parse_magnet_link(&uri).unwrap();

        assert_eq!(link.info_hash.to_string(), HASH);
        assert_eq!(link.display_name.as_deref(), Some("Big Buck Bunny"));
        assert_eq!(link.trackers.len(), 1);
        assert_eq!(link.uri, uri);
    }

    #[test]
    fn test_parse_magnet_without_name() {
        let link = MagnetParser::parse_magnet_link(&format!("magnet:?xt=urn:btih:{HASH}")).unwrap();
        assert_eq!(link.display_name, None);
        assert!(link.trackers.is_empty());
    }

    #[test]
    fn test_parse_magnet_rejects_missing_hash() {
        assert!(MagnetParser::parse_magnet_link("magnet:?dn=nothing").is_err());
        assert!(MagnetParser::parse_magnet_link("http://example.com").is_err());
    }
}
