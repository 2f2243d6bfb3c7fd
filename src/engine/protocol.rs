//! Parsing of the engine's line-oriented output (`info …` and `bestmove …`)

use std::time::Duration;

use crate::{
    analysis::Score,
    util::{SuggestedMove, parse_uci_move},
};

#[derive(Debug, Clone, PartialEq)]
pub enum EngineLine {
    Info(InfoLine),
    BestMove {
        best: Option<SuggestedMove>,
        ponder: Option<SuggestedMove>,
    },
    Other,
}

/// The fields of an `info` line we care about.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct InfoLine {
    pub depth: Option<u32>,
    pub time: Option<Duration>,
    /// 1-based
    pub multipv: u32,
    pub score: Option<Score>,
    pub pv: Vec<SuggestedMove>,
}

pub fn parse_line(line: &str) -> EngineLine {
    let line = line.trim();
    if let Some(rest) = line.strip_prefix("bestmove") {
        let mut parts = rest.split_whitespace();
        let best = parts.next().and_then(|m| parse_uci_move(m).ok());
        let ponder = match (parts.next(), parts.next()) {
            (Some("ponder"), Some(m)) => parse_uci_move(m).ok(),
            _ => None,
        };
        return EngineLine::BestMove { best, ponder };
    }
    if line.starts_with("info") {
        return EngineLine::Info(parse_info(line));
    }
    EngineLine::Other
}

fn parse_info(line: &str) -> InfoLine {
    let parts: Vec<&str> = line.split_whitespace().collect();
    let mut info = InfoLine {
        multipv: 1,
        ..InfoLine::default()
    };

    let mut i = 1;
    while i < parts.len() {
        let value = parts.get(i + 1).copied();
        match parts[i] {
            "depth" => info.depth = value.and_then(|v| v.parse().ok()),
            "time" => info.time = value.and_then(|v| v.parse().ok()).map(Duration::from_millis),
            "multipv" => info.multipv = value.and_then(|v| v.parse().ok()).unwrap_or(1),
            "score" => {
                let amount = parts.get(i + 2).and_then(|v| v.parse().ok());
                info.score = match (value, amount) {
                    (Some("cp"), Some(cp)) => Some(Score::Centipawns(cp)),
                    (Some("mate"), Some(n)) => Some(Score::Mate(n)),
                    _ => info.score,
                };
                i += 1;
            }
            "pv" => {
                // pv runs to the end of the line, minus any trailing non-move tokens
                info.pv = parts[i + 1..]
                    .iter()
                    .map_while(|m| parse_uci_move(m).ok())
                    .collect();
                break;
            }
            // free text, nothing after it is a field
            "string" => break,
            _ => {
                i += 1;
                continue;
            }
        }
        i += 2;
    }

    info
}

/// The latest line per multipv slot of the running search.
#[derive(Debug, Clone, Default)]
pub struct MultiPvTable {
    lines: Vec<Option<InfoLine>>,
}

impl MultiPvTable {
    pub fn new(slots: usize) -> MultiPvTable {
        MultiPvTable {
            lines: vec![None; slots.max(1)],
        }
    }

    /// Records an info line; returns false for lines without a pv or outside the
    /// table.
    pub fn update(&mut self, info: InfoLine) -> bool {
        let index = info.multipv.saturating_sub(1) as usize;
        if info.pv.is_empty() || index >= self.lines.len() {
            return false;
        }
        self.lines[index] = Some(info);
        true
    }

    pub fn leader(&self) -> Option<&InfoLine> {
        self.lines.first().and_then(Option::as_ref)
    }

    /// first move of every secondary line, in multipv order
    pub fn alternates(&self) -> Vec<SuggestedMove> {
        self.lines
            .iter()
            .skip(1)
            .flatten()
            .filter_map(|info| info.pv.first().copied())
            .collect()
    }
}
