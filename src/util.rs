use std::{fmt, str::FromStr};

use anyhow::{Result, bail};
use shakmaty::{Role, Square, uci::UciMove};

/// A move as highlighted on the board: origin, destination and an optional
/// promotion piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SuggestedMove {
    pub from: Square,
    pub to: Square,
    pub promotion: Option<Role>,
}

impl fmt::Display for SuggestedMove {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.from, self.to)?;
        if let Some(role) = self.promotion {
            write!(f, "{}", role.char())?;
        }
        Ok(())
    }
}

pub fn parse_uci_move(move_str: &str) -> Result<SuggestedMove> {
    let uci_move = UciMove::from_str(move_str.trim())?;

    match uci_move {
        UciMove::Normal {
            from,
            to,
            promotion,
        } => Ok(SuggestedMove {
            from,
            to,
            promotion,
        }),
        other => bail!("'{other}' is not a from-to move"),
    }
}

pub fn parse_uci_moves(move_str: &str) -> Result<Vec<SuggestedMove>> {
    let moves = move_str
        .split_whitespace()
        .map(parse_uci_move)
        .collect::<Result<Vec<_>>>()?;

    Ok(moves)
}

/// Deduplicates the alternates (dropping the best move itself), keeps their order
/// and truncates to `max` entries.
pub fn normalize_alternates(
    best: &SuggestedMove,
    candidates: impl IntoIterator<Item = SuggestedMove>,
    max: usize,
) -> Vec<SuggestedMove> {
    let mut alternates: Vec<SuggestedMove> = Vec::with_capacity(max);
    for candidate in candidates {
        if alternates.len() == max {
            break;
        }
        if candidate != *best && !alternates.contains(&candidate) {
            alternates.push(candidate);
        }
    }
    alternates
}
