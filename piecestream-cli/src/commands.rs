//! CLI command implementations

use std::path::PathBuf;
use std::sync::Arc;

use clap::Subcommand;
use piecestream_core::config::PieceStreamConfig;
use piecestream_core::torrent::{BencodeParser, TorrentCreator, TorrentMetadata};
use piecestream_core::{
    MemoryEngine, PieceStreamError, Result, SourceScheme, StreamEvent, StreamHandle,
    StreamingService, TorrentState,
};
use serde_json::json;

/// Size of the generated `--demo` file.
const DEMO_FILE_SIZE: usize = 4 * 1024 * 1024;
const DEMO_PIECE_SIZE: u32 = 256 * 1024;

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Show the files of a torrent source
    Resolve {
        /// Magnet link, HTTP(S) URL or file:// URI
        source: String,
    },
    /// Score the swarm of a torrent source
    Health {
        /// Magnet link, HTTP(S) URL or file:// URI
        source: String,
    },
    /// Stream one file and print progress as JSON lines
    Stream {
        /// Magnet link, HTTP(S) URL or file:// URI
        #[arg(required_unless_present = "demo")]
        source: Option<String>,
        /// File index to stream (defaults to the largest file)
        #[arg(short, long)]
        file: Option<usize>,
        /// Byte offset to prioritize before the rest of the file
        #[arg(long)]
        seek: Option<u64>,
        /// Download directory
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Stream a generated torrent instead of a source
        #[arg(long)]
        demo: bool,
    },
}

/// Handle the CLI command
///
/// # Errors
/// Returns the error of the failing subsystem
pub async fn handle_command(command: Commands) -> Result<()> {
    let mut config = PieceStreamConfig::from_env();
    match command {
        Commands::Resolve { source } => resolve(config, source).await,
        Commands::Health { source } => health(config, source).await,
        Commands::Stream {
            source,
            file,
            seek,
            output,
            demo,
        } => {
            if demo {
                config.simulation.enabled = true;
            }
            stream(config, source, file, seek, output).await
        }
    }
}

/// Print name, info hash and file layout of a source
///
/// # Errors
/// - `PieceStreamError::Resolve` - Source could not be resolved
/// - `PieceStreamError::Configuration` - Magnet link without simulation mode
pub async fn resolve(config: PieceStreamConfig, source: String) -> Result<()> {
    let needs_session = SourceScheme::classify(&source) == Some(SourceScheme::Magnet);
    let service = if needs_session {
        started_service(config).await?.1
    } else {
        StreamingService::new(Arc::new(MemoryEngine::new()), config)?
    };

    let metadata = service.resolve(&source).await?;
    print_metadata(&metadata);
    service.shutdown();
    Ok(())
}

/// Print the health of a source's largest file as JSON
///
/// # Errors
/// - `PieceStreamError::Health` - Resolution or scrape failed
/// - `PieceStreamError::Configuration` - Simulation mode disabled
pub async fn health(config: PieceStreamConfig, source: String) -> Result<()> {
    let simulation = config.simulation.clone();
    let (engine, service) = started_service(config).await?;

    let metadata = service.resolve(&source).await?;
    engine.set_swarm(
        metadata.info_hash,
        simulation.simulated_seeds,
        simulation.simulated_peers,
    );

    let health = service.health_of_uri(&source).await?;
    println!(
        "{}",
        json!({
            "info_hash": metadata.info_hash.to_string(),
            "health": health,
        })
    );
    service.shutdown();
    Ok(())
}

/// Stream a file, printing events until it completes
///
/// # Errors
/// - `PieceStreamError::Resolve` - Source could not be resolved
/// - `PieceStreamError::Stream` - Invalid file or scheduling failure
/// - `PieceStreamError::Configuration` - Simulation mode disabled
pub async fn stream(
    config: PieceStreamConfig,
    source: Option<String>,
    file: Option<usize>,
    seek: Option<u64>,
    output: Option<PathBuf>,
) -> Result<()> {
    let simulation = config.simulation.clone();
    let (engine, service) = started_service(config).await?;

    let metadata = match source {
        Some(source) => service.resolve(&source).await?,
        None => Arc::new(demo_metadata()?),
    };
    print_metadata(&metadata);

    let file_index = match file {
        Some(index) => index,
        None => metadata.largest_file().map(|f| f.index).unwrap_or_default(),
    };
    engine.set_swarm(
        metadata.info_hash,
        simulation.simulated_seeds,
        simulation.simulated_peers,
    );
    engine.set_transfer_rates(metadata.info_hash, 2 * 1024 * 1024, 64 * 1024)?;

    let stream = service
        .create_stream(Arc::clone(&metadata), file_index, output.as_deref(), true)
        .await?;
    let mut events = service.subscribe(&stream)?;

    let mut order = match seek {
        Some(offset) => stream.prioritize_byte(offset)?,
        None => Vec::new(),
    };
    let rest: Vec<u32> = stream
        .piece_range()
        .iter()
        .filter(|piece| !order.contains(piece))
        .collect();
    order.extend(rest);

    let feeder = tokio::spawn(feed_pieces(
        engine.clone(),
        stream.clone(),
        order,
        simulation.piece_interval,
    ));

    while let Some(event) = events.recv().await {
        print_event(&event);
        if let StreamEvent::StateChanged {
            new: TorrentState::Completed | TorrentState::Error,
            ..
        } = event
        {
            break;
        }
    }

    feeder.abort();
    service.shutdown();
    Ok(())
}

async fn started_service(config: PieceStreamConfig) -> Result<(MemoryEngine, StreamingService)> {
    if !config.simulation.enabled {
        return Err(PieceStreamError::Configuration {
            reason: "no swarm backend is linked; set PIECESTREAM_SIMULATION_MODE=true".to_string(),
        });
    }

    let engine = MemoryEngine::new();
    let service = StreamingService::new(Arc::new(engine.clone()), config)?;
    service.start().await?;
    Ok((engine, service))
}

async fn feed_pieces(
    engine: MemoryEngine,
    stream: StreamHandle,
    order: Vec<u32>,
    interval: std::time::Duration,
) {
    for piece in order {
        tokio::time::sleep(interval).await;
        if stream.is_removed() {
            return;
        }
        let info_hash = stream.info_hash();
        if let Err(error) = engine
            .complete_piece(info_hash, piece)
            .and_then(|()| engine.post_stats(info_hash))
        {
            tracing::warn!("Simulation stopped at piece {}: {}", piece, error);
            return;
        }
    }
}

fn demo_metadata() -> Result<TorrentMetadata> {
    let content: Vec<u8> = (0..DEMO_FILE_SIZE).map(|i| (i % 251) as u8).collect();
    let bytes = TorrentCreator::with_piece_size(DEMO_PIECE_SIZE)
        .create_multi_file(
            "piecestream-demo",
            &[("demo.mkv", &content[..]), ("demo.nfo", &b"generated"[..])],
        )?;
    Ok(BencodeParser::parse_torrent_bytes(&bytes)?)
}

fn print_metadata(metadata: &TorrentMetadata) {
    println!("{} ({})", metadata.name, metadata.info_hash);
    for file in &metadata.files {
        let pieces = metadata
            .pieces_for_file(file.index)
            .map(|range| format!("pieces {}-{}", range.start(), range.end()))
            .unwrap_or_else(|| "no pieces".to_string());
        println!(
            "  [{}] {} ({} bytes, {})",
            file.index,
            file.path.display(),
            file.length,
            pieces
        );
    }
}

fn print_event(event: &StreamEvent) {
    let line = match event {
        StreamEvent::StateChanged { old, new, .. } => {
            json!({ "event": "state", "old": old, "new": new })
        }
        StreamEvent::PieceFinished { piece, .. } => json!({ "event": "piece", "piece": piece }),
        StreamEvent::Status { status, .. } => json!({ "event": "status", "status": status }),
    };
    println!("{line}");
}
