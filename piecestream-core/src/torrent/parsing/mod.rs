//! Torrent metadata decoding from `.torrent` bytes and magnet URIs

pub mod bencode;
pub mod magnet;

pub use bencode::BencodeParser;
pub use magnet::{MagnetLink, MagnetParser};
