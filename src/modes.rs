use serde::{Deserialize, Serialize};

/// The direction of a digital line as the device reports it.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Hash, Clone, Copy)]
pub enum Direction {
    /// The line is an input.
    In,

    /// The line is an output.
    Out,
}

impl Direction {
    /// The digit used for this direction in `IO,SET` commands and
    /// `IO,GET,ALL` snapshots.
    pub fn wire_digit(&self) -> char {
        match self {
            Direction::In => '1',
            Direction::Out => '0',
        }
    }

    /// Parse a snapshot digit. Anything but `0`/`1` is unknown.
    pub fn from_wire_digit(digit: char) -> Option<Self> {
        match digit {
            '1' => Some(Direction::In),
            '0' => Some(Direction::Out),
            _ => None,
        }
    }
}

/// A declarative mode for a digital line.
///
/// A line in a mode is re-checked against the cached direction and
/// state whenever either cache is (re)loaded, and corrective
/// commands are issued if they disagree.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Hash, Clone, Copy)]
pub enum LineMode {
    /// The line must be an input.
    In,

    /// The line must be an output.
    Out,

    /// The line must be an output and must rest low between pulses.
    Pulse,
}

/// A corrective command the controller should issue for a line whose
/// cached direction or state disagrees with its mode.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub(crate) enum Correction {
    /// Rewrite the line direction.
    SetDirection(Direction),

    /// Write the line low.
    ClearState,
}

/// Compute the corrective commands for one line.
///
/// An unknown direction means the direction snapshot has not arrived
/// yet; nothing is corrected until it has.
pub(crate) fn corrections(
    mode: LineMode,
    direction: Option<Direction>,
    state: Option<bool>,
) -> Vec<Correction> {
    let Some(direction) = direction else {
        return vec![];
    };

    let mut corrections = vec![];

    match mode {
        LineMode::In => {
            if direction == Direction::Out {
                corrections.push(Correction::SetDirection(Direction::In));
            }
        }
        LineMode::Out | LineMode::Pulse => {
            if direction == Direction::In {
                corrections.push(Correction::SetDirection(Direction::Out));
            }
            if mode == LineMode::Pulse && state == Some(true) {
                corrections.push(Correction::ClearState);
            }
        }
    }

    corrections
}
