//! End-to-end streaming through the service and the in-memory engine

use std::sync::Arc;
use std::time::Duration;

use piecestream_core::config::PieceStreamConfig;
use piecestream_core::engine::Priority;
use piecestream_core::torrent::{BencodeParser, TorrentCreator, TorrentMetadata};
use piecestream_core::{
    HealthState, MemoryEngine, StreamError, StreamEvent, StreamHandle, StreamingService,
    TorrentState,
};
use tokio::sync::mpsc::UnboundedReceiver;

const PIECE: u32 = 1024;
const EVENT_TIMEOUT: Duration = Duration::from_secs(2);

struct Harness {
    engine: MemoryEngine,
    service: StreamingService,
    dir: tempfile::TempDir,
}

impl Harness {
    async fn start() -> Self {
        let engine = MemoryEngine::new();
        let service =
            StreamingService::new(Arc::new(engine.clone()), PieceStreamConfig::for_testing())
                .unwrap();
        service.start().await.unwrap();
        Self {
            engine,
            service,
            dir: tempfile::tempdir().unwrap(),
        }
    }

    async fn stream(&self, metadata: &Arc<TorrentMetadata>, file_index: usize) -> StreamHandle {
        self.service
            .create_stream(Arc::clone(metadata), file_index, Some(self.dir.path()), true)
            .await
            .unwrap()
    }
}

/// Single 10-piece movie.
fn movie() -> Arc<TorrentMetadata> {
    let bytes = TorrentCreator::with_piece_size(PIECE)
        .with_announce_urls(vec!["udp://tracker.test:1337".to_string()])
        .create_single_file("movie.mkv", &[3u8; 10 * PIECE as usize])
        .unwrap();
    Arc::new(BencodeParser::parse_torrent_bytes(&bytes).unwrap())
}

async fn next_event(events: &mut UnboundedReceiver<StreamEvent>) -> StreamEvent {
    tokio::time::timeout(EVENT_TIMEOUT, events.recv())
        .await
        .expect("event timeout")
        .expect("event channel closed")
}

async fn wait_for_state(stream: &StreamHandle, expected: TorrentState) {
    tokio::time::timeout(EVENT_TIMEOUT, async {
        while stream.state() != expected {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("stream never reached {expected}, stuck at {}", stream.state()));
}

#[tokio::test]
async fn test_stream_completes_on_last_piece() {
    let harness = Harness::start().await;
    let movie = movie();
    let stream = harness.stream(&movie, 0).await;
    let mut events = harness.service.subscribe(&stream).unwrap();

    assert_eq!(stream.piece_range().first(), 0);
    assert_eq!(stream.piece_range().last(), 9);
    assert_eq!(stream.total_pieces(), 9);
    assert_eq!(stream.state(), TorrentState::Starting);

    let mut log = Vec::new();
    for piece in 0..10 {
        harness.engine.complete_piece(movie.info_hash, piece).unwrap();
        loop {
            let event = next_event(&mut events).await;
            let arrived = matches!(
                event,
                StreamEvent::PieceFinished { piece: local, .. } if local == piece
            );
            log.push(event);
            if arrived {
                break;
            }
        }
    }
    loop {
        let event = next_event(&mut events).await;
        let done = matches!(
            event,
            StreamEvent::StateChanged {
                new: TorrentState::Completed,
                ..
            }
        );
        log.push(event);
        if done {
            break;
        }
    }

    let states: Vec<(usize, TorrentState)> = log
        .iter()
        .enumerate()
        .filter_map(|(position, event)| match event {
            StreamEvent::StateChanged { new, .. } => Some((position, *new)),
            _ => None,
        })
        .collect();
    let pieces: Vec<u32> = log
        .iter()
        .filter_map(|event| match event {
            StreamEvent::PieceFinished { piece, .. } => Some(*piece),
            _ => None,
        })
        .collect();

    assert_eq!(pieces, (0..10).collect::<Vec<_>>());
    assert_eq!(
        states,
        vec![(1, TorrentState::Downloading), (11, TorrentState::Completed)]
    );
    assert!((0..10).all(|piece| stream.has_piece(piece)));
    assert!(stream.has_byte(10 * u64::from(PIECE) - 1));
}

#[tokio::test]
async fn test_pieces_out_of_order_complete_once_all_arrive() {
    let harness = Harness::start().await;
    let movie = movie();
    let stream = harness.stream(&movie, 0).await;

    for piece in [9, 0, 5, 1, 2, 3, 4, 6, 7] {
        harness.engine.complete_piece(movie.info_hash, piece).unwrap();
    }
    wait_for_state(&stream, TorrentState::Downloading).await;
    assert!(!stream.has_piece(8));

    harness.engine.complete_piece(movie.info_hash, 8).unwrap();
    wait_for_state(&stream, TorrentState::Completed).await;
}

#[tokio::test]
async fn test_seek_prioritizes_playback_window() {
    let harness = Harness::start().await;
    let movie = movie();
    let stream = harness.stream(&movie, 0).await;

    let pieces = stream.prioritize_byte(u64::from(PIECE) * 4 + 10).unwrap();
    assert_eq!(pieces, vec![4, 5]);

    let priorities = stream.handle().piece_priorities();
    assert_eq!(priorities[4], Priority::Top);
    assert_eq!(priorities[5], Priority::Top);
    assert_eq!(priorities[6], Priority::Normal);

    assert!(stream.prioritize_byte(u64::from(PIECE) * 10).unwrap().is_empty());
    assert_eq!(
        stream.prioritize_byte(u64::from(PIECE) * 9).unwrap(),
        vec![9]
    );

    stream.prioritize_pieces(&[0, 1, 42]).unwrap();
    let torrent = harness.engine.torrent(movie.info_hash).unwrap();
    assert_eq!(torrent.deadline_count(), 2);

    stream.sequential_mode().unwrap();
    assert_eq!(torrent.deadline_count(), 0);
    assert!(stream.handle().status().sequential_download);
}

#[tokio::test]
async fn test_remove_before_completion_is_safe() {
    let harness = Harness::start().await;
    let movie = movie();
    let stream = harness.stream(&movie, 0).await;
    for piece in 0..3 {
        harness.engine.complete_piece(movie.info_hash, piece).unwrap();
    }
    wait_for_state(&stream, TorrentState::Downloading).await;

    harness.service.remove_stream(&stream).unwrap();

    assert!(stream.is_removed());
    assert_eq!(harness.engine.torrent_count(), 0);
    assert!(harness.engine.complete_piece(movie.info_hash, 3).is_err());
    assert!(!stream.handle().is_valid());
    assert!(matches!(
        stream.remove(),
        Err(StreamError::NotManaged { .. })
    ));

    let again = harness.stream(&movie, 0).await;
    assert!(!again.is_removed());
    assert_eq!(again.state(), TorrentState::Starting);
}

#[tokio::test]
async fn test_pause_and_resume_are_idempotent() {
    let harness = Harness::start().await;
    let movie = movie();
    let stream = harness.stream(&movie, 0).await;
    let torrent = harness.engine.torrent(movie.info_hash).unwrap();

    stream.pause().unwrap();
    stream.pause().unwrap();
    assert_eq!(stream.state(), TorrentState::Paused);
    assert!(torrent.is_paused());

    stream.resume().unwrap();
    assert_eq!(stream.state(), TorrentState::Downloading);
    assert!(!torrent.is_paused());

    for piece in 0..10 {
        harness.engine.complete_piece(movie.info_hash, piece).unwrap();
    }
    wait_for_state(&stream, TorrentState::Completed).await;

    stream.resume().unwrap();
    stream.pause().unwrap();
    assert_eq!(stream.state(), TorrentState::Completed);
}

#[tokio::test]
async fn test_status_reports_swarm_and_progress() {
    let harness = Harness::start().await;
    let movie = movie();
    harness.engine.set_swarm(movie.info_hash, 12, 4);
    let stream = harness.stream(&movie, 0).await;
    harness
        .engine
        .set_transfer_rates(movie.info_hash, 4096, 512)
        .unwrap();
    let mut events = harness.service.subscribe(&stream).unwrap();

    harness.engine.post_stats(movie.info_hash).unwrap();

    let status = loop {
        if let StreamEvent::Status { status, .. } = next_event(&mut events).await {
            break status;
        }
    };
    assert_eq!(status.seeds, 12);
    assert_eq!(status.peers, 4);
    assert_eq!(status.download_speed_bps, 4096);
    assert_eq!(status.total_wanted_bytes, 10 * u64::from(PIECE));
    assert_eq!(stream.download_status(), status);
}

#[tokio::test]
async fn test_health_of_file_and_uri() {
    let harness = Harness::start().await;
    let movie = movie();
    harness.engine.set_swarm(movie.info_hash, 100, 5);

    let health = harness
        .service
        .health_of_file(&movie, &movie.files[0])
        .await
        .unwrap();
    assert_eq!(health.state, HealthState::Excellent);
    assert_eq!(health.seeds, 100);
    assert_eq!(harness.engine.torrent_count(), 0);

    let bytes = TorrentCreator::with_piece_size(PIECE)
        .with_announce_urls(vec!["udp://tracker.test:1337".to_string()])
        .create_single_file("movie.mkv", &[3u8; 10 * PIECE as usize])
        .unwrap();
    let path = harness.dir.path().join("movie.torrent");
    std::fs::write(&path, bytes).unwrap();

    let health = harness
        .service
        .health_of_uri(&format!("file://{}", path.display()))
        .await
        .unwrap();
    assert_eq!(health.state, HealthState::Excellent);
}

#[tokio::test]
async fn test_health_check_shares_streaming_handle() {
    let harness = Harness::start().await;
    let movie = movie();
    harness.engine.set_swarm(movie.info_hash, 24, 8);
    let stream = harness.stream(&movie, 0).await;

    let health = harness
        .service
        .health_of_file(&movie, &movie.files[0])
        .await
        .unwrap();

    assert_eq!(health.state, HealthState::Good);
    assert!(stream.handle().is_valid());
    assert_eq!(harness.engine.torrent_count(), 1);
}

#[tokio::test]
async fn test_stream_created_during_health_check_keeps_handle() {
    let harness = Harness::start().await;
    let movie = movie();
    harness.engine.set_swarm(movie.info_hash, 24, 8);

    let (health, stream) = tokio::join!(
        harness.service.health_of_file(&movie, &movie.files[0]),
        harness.stream(&movie, 0),
    );

    assert_eq!(health.unwrap().state, HealthState::Good);
    assert!(stream.handle().is_valid());
    assert_eq!(harness.engine.torrent_count(), 1);

    for piece in 0..10 {
        harness.engine.complete_piece(movie.info_hash, piece).unwrap();
    }
    wait_for_state(&stream, TorrentState::Completed).await;

    harness.service.remove_stream(&stream).unwrap();
    assert_eq!(harness.engine.torrent_count(), 0);
}

#[tokio::test]
async fn test_shutdown_removes_streams() {
    let harness = Harness::start().await;
    let movie = movie();
    let stream = harness.stream(&movie, 0).await;

    harness.service.shutdown();

    assert!(stream.is_removed());
    assert!(harness.service.streams().is_empty());
    assert!(!harness.engine.is_running());
    assert!(harness
        .service
        .create_stream(movie, 0, Some(harness.dir.path()), true)
        .await
        .is_err());
}
