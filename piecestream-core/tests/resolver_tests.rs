//! Torrent source resolution against HTTP, file and magnet sources

use std::sync::Arc;
use std::time::Duration;

use mockito::Server;
use piecestream_core::config::PieceStreamConfig;
use piecestream_core::resolver::{ResolveError, TorrentResolver};
use piecestream_core::session::{SessionError, SessionState, TorrentSession};
use piecestream_core::torrent::{BencodeParser, TorrentCreator};
use piecestream_core::MemoryEngine;

fn torrent_bytes() -> Vec<u8> {
    TorrentCreator::with_piece_size(1024)
        .with_announce_urls(vec!["http://tracker.test/announce".to_string()])
        .create_single_file("big.buck.bunny.mkv", &[7u8; 5000])
        .unwrap()
}

fn resolver() -> (MemoryEngine, TorrentSession, TorrentResolver) {
    let config = PieceStreamConfig::for_testing();
    let engine = MemoryEngine::new();
    let session = TorrentSession::new(Arc::new(engine.clone()), config.session.clone());
    let resolver = TorrentResolver::new(session.clone(), config.resolver).unwrap();
    (engine, session, resolver)
}

async fn running_resolver() -> (MemoryEngine, TorrentSession, TorrentResolver) {
    let (engine, session, resolver) = resolver();
    session.initialize();
    session
        .wait_until_running(Duration::from_secs(2))
        .await
        .unwrap();
    (engine, session, resolver)
}

// =============================================================================
// HTTP sources
// =============================================================================

#[tokio::test]
async fn test_http_source_resolves() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("GET", "/files/bunny.torrent")
        .with_status(200)
        .with_header("content-type", "application/x-bittorrent")
        .with_body(torrent_bytes())
        .create_async()
        .await;

    let (_engine, _session, resolver) = resolver();
    let metadata = resolver
        .resolve(&format!("{}/files/bunny.torrent", server.url()))
        .await
        .unwrap();

    mock.assert_async().await;
    assert_eq!(metadata.name, "big.buck.bunny.mkv");
    assert_eq!(metadata.total_length, 5000);
    assert_eq!(metadata.piece_count(), 5);
    assert_eq!(
        metadata.announce_urls,
        vec!["http://tracker.test/announce".to_string()]
    );
}

#[tokio::test]
async fn test_http_not_found_is_fetch_error() {
    let mut server = Server::new_async().await;
    let _mock = server
        .mock("GET", "/missing.torrent")
        .with_status(404)
        .create_async()
        .await;

    let (_engine, _session, resolver) = resolver();
    let error = resolver
        .resolve(&format!("{}/missing.torrent", server.url()))
        .await
        .unwrap_err();

    assert!(matches!(error, ResolveError::Fetch { ref reason, .. } if reason.contains("404")));
}

#[tokio::test]
async fn test_http_empty_body_is_fetch_error() {
    let mut server = Server::new_async().await;
    let _mock = server
        .mock("GET", "/empty.torrent")
        .with_status(200)
        .with_body("")
        .create_async()
        .await;

    let (_engine, _session, resolver) = resolver();
    let error = resolver
        .resolve(&format!("{}/empty.torrent", server.url()))
        .await
        .unwrap_err();

    assert!(matches!(error, ResolveError::Fetch { .. }));
}

#[tokio::test]
async fn test_http_garbage_is_decode_error() {
    let mut server = Server::new_async().await;
    let _mock = server
        .mock("GET", "/garbage.torrent")
        .with_status(200)
        .with_body("<html>not a torrent</html>")
        .create_async()
        .await;

    let (_engine, _session, resolver) = resolver();
    let error = resolver
        .resolve(&format!("{}/garbage.torrent", server.url()))
        .await
        .unwrap_err();

    assert!(matches!(error, ResolveError::Decode(_)));
}

// =============================================================================
// File sources
// =============================================================================

#[tokio::test]
async fn test_file_source_resolves() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bunny.torrent");
    std::fs::write(&path, torrent_bytes()).unwrap();

    let (_engine, _session, resolver) = resolver();
    let metadata = resolver
        .resolve(&format!("file://{}", path.display()))
        .await
        .unwrap();

    assert_eq!(metadata.name, "big.buck.bunny.mkv");
    assert_eq!(metadata.files.len(), 1);
}

#[tokio::test]
async fn test_missing_and_empty_files_are_fetch_errors() {
    let dir = tempfile::tempdir().unwrap();
    let empty = dir.path().join("empty.torrent");
    std::fs::write(&empty, b"").unwrap();
    let (_engine, _session, resolver) = resolver();

    let missing = resolver
        .resolve(&format!("file://{}/nope.torrent", dir.path().display()))
        .await
        .unwrap_err();
    let empty = resolver
        .resolve(&format!("file://{}", empty.display()))
        .await
        .unwrap_err();

    assert!(matches!(missing, ResolveError::Fetch { .. }));
    assert!(matches!(empty, ResolveError::Fetch { .. }));
}

#[tokio::test]
async fn test_unsupported_scheme_is_invalid_source() {
    let (_engine, _session, resolver) = resolver();

    for uri in ["ftp://example.com/a.torrent", "/tmp/a.torrent", ""] {
        let error = resolver.resolve(uri).await.unwrap_err();
        assert_eq!(
            error,
            ResolveError::InvalidSource {
                uri: uri.to_string()
            }
        );
    }
}

// =============================================================================
// Magnet sources
// =============================================================================

#[tokio::test]
async fn test_magnet_requires_running_session() {
    let (_engine, _session, resolver) = resolver();
    let bytes = torrent_bytes();
    let hash = BencodeParser::parse_torrent_bytes(&bytes).unwrap().info_hash;

    let error = resolver
        .resolve(&format!("magnet:?xt=urn:btih:{hash}"))
        .await
        .unwrap_err();

    assert_eq!(
        error,
        ResolveError::Session(SessionError::InvalidSessionState {
            state: SessionState::Creating
        })
    );
}

#[tokio::test]
async fn test_magnet_resolves_published_metadata() {
    let (engine, _session, resolver) = running_resolver().await;
    let bytes = torrent_bytes();
    let hash = BencodeParser::parse_torrent_bytes(&bytes).unwrap().info_hash;
    engine.publish_metadata(hash, bytes);

    let metadata = resolver
        .resolve(&format!("magnet:?xt=urn:btih:{hash}&dn=bunny"))
        .await
        .unwrap();

    assert_eq!(metadata.info_hash, hash);
    assert_eq!(metadata.name, "big.buck.bunny.mkv");
}

#[tokio::test]
async fn test_magnet_without_metadata_times_out_as_fetch_error() {
    let (_engine, _session, resolver) = running_resolver().await;

    let error = resolver
        .resolve("magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef01234567")
        .await
        .unwrap_err();

    assert!(matches!(error, ResolveError::Fetch { .. }));
}

#[tokio::test]
async fn test_magnet_with_foreign_metadata_is_decode_error() {
    let (engine, _session, resolver) = running_resolver().await;
    let claimed = "0123456789abcdef0123456789abcdef01234567";
    engine.publish_metadata(
        piecestream_core::InfoHash::from_hex(claimed).unwrap(),
        torrent_bytes(),
    );

    let error = resolver
        .resolve(&format!("magnet:?xt=urn:btih:{claimed}"))
        .await
        .unwrap_err();

    assert!(matches!(error, ResolveError::Decode(_)));
}

#[tokio::test]
async fn test_malformed_magnet_is_decode_error() {
    let (_engine, _session, resolver) = running_resolver().await;

    let error = resolver.resolve("magnet:?dn=no-hash").await.unwrap_err();

    assert!(matches!(error, ResolveError::Decode(_)));
}
