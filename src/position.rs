use std::{
    fmt,
    hash::{Hash, Hasher},
    str::FromStr,
};

use shakmaty::{
    Board, Color,
    fen::{Fen, ParseFenError},
};

pub const START_FEN: &str = "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1";

/// An immutable board snapshot as scraped from the page.
///
/// Two positions are equal iff their canonical key is equal. The key is the FEN
/// re-serialised by shakmaty, so whitespace or field quirks in the scraped string
/// do not produce spurious "new" positions.
#[derive(Debug, Clone)]
pub struct Position {
    fen: Fen,
    key: String,
}

impl Position {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn side_to_move(&self) -> Color {
        self.fen.as_setup().turn
    }

    /// the original piece setup, regardless of who is to move
    pub fn is_start_position(&self) -> bool {
        self.fen.as_setup().board == Board::new()
    }
}

impl FromStr for Position {
    type Err = ParseFenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fen = Fen::from_str(s.trim())?;
        let key = fen.to_string();
        Ok(Position { fen, key })
    }
}

impl PartialEq for Position {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for Position {}

impl Hash for Position {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}
