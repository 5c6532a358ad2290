//! Inclusive global piece bounds of one file

use super::StreamError;
use crate::engine::Priority;

/// First and last global piece of the file being streamed.
///
/// Computed once per stream and never mutated, so it is read without
/// locking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PieceRange {
    first: u32,
    last: u32,
}

impl PieceRange {
    /// Creates a range, returning `None` when `first > last`.
    pub fn new(first: u32, last: u32) -> Option<Self> {
        (first <= last).then_some(Self { first, last })
    }

    /// Scans piece priorities for the first and last piece that is not
    /// ignored.
    ///
    /// # Errors
    ///
    /// - `StreamError::PieceRange` - Every piece is ignored
    pub fn from_priorities(priorities: &[Priority]) -> Result<Self, StreamError> {
        let wanted = |priority: &Priority| *priority != Priority::Ignore;
        let first = priorities.iter().position(wanted);
        let last = priorities.iter().rposition(wanted);

        match (first, last) {
            (Some(first), Some(last)) => Ok(Self {
                first: first as u32,
                last: last as u32,
            }),
            _ => Err(StreamError::PieceRange),
        }
    }

    pub fn first(&self) -> u32 {
        self.first
    }

    pub fn last(&self) -> u32 {
        self.last
    }

    pub fn contains(&self, piece: u32) -> bool {
        (self.first..=self.last).contains(&piece)
    }

    /// `last - first`: one less than the number of pieces in the range.
    ///
    /// Progress math built on this value expects the exclusive count.
    pub fn total_pieces(&self) -> u32 {
        self.last - self.first
    }

    /// Translates a file-local piece index into a global one.
    pub fn to_global(&self, local: u32) -> Option<u32> {
        self.first
            .checked_add(local)
            .filter(|global| *global <= self.last)
    }

    /// Translates a global piece index into a file-local one.
    pub fn to_local(&self, global: u32) -> Option<u32> {
        self.contains(global).then(|| global - self.first)
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> {
        self.first..=self.last
    }

    /// Global piece holding `byte_offset` of the file:
    /// `byte_offset / piece_length + first`.
    ///
    /// `None` when that piece lies past the range.
    pub fn piece_for_byte(&self, piece_length: u32, byte_offset: u64) -> Option<u32> {
        if piece_length == 0 {
            return None;
        }
        let piece = byte_offset / u64::from(piece_length) + u64::from(self.first);
        u32::try_from(piece).ok().filter(|piece| self.contains(*piece))
    }

    /// Piece holding `byte_offset` plus the one after it while still in
    /// range.
    pub fn lookahead(&self, piece_length: u32, byte_offset: u64) -> Vec<u32> {
        let Some(piece) = self.piece_for_byte(piece_length, byte_offset) else {
            return Vec::new();
        };

        let mut pieces = vec![piece];
        if let Some(next) = piece.checked_add(1).filter(|next| self.contains(*next)) {
            pieces.push(next);
        }
        pieces
    }
}
