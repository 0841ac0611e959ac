//! Call and packet status codes.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Closed status set shared by every stage of the stack.
///
/// Used both as the return value of non-blocking calls and as the status tag
/// carried by a packet while it moves through the pipeline.
#[repr(u8)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    /// Accepted or succeeded
    #[default]
    Good = 0,
    /// Rejected: malformed input, checksum mismatch or contract violation
    Bad = 1,
    /// Transient: retry the identical input later
    Busy = 2,
    /// Terminal success marker on a packet
    Complete = 3,
}

impl Status {
    /// True for `Good`
    pub fn is_good(self) -> bool {
        self == Status::Good
    }

    /// True for `Busy`
    pub fn is_busy(self) -> bool {
        self == Status::Busy
    }
}

impl TryFrom<u8> for Status {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Status::Good),
            1 => Ok(Status::Bad),
            2 => Ok(Status::Busy),
            3 => Ok(Status::Complete),
            other => Err(other),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Good => "good",
            Status::Bad => "bad",
            Status::Busy => "busy",
            Status::Complete => "complete",
        };
        f.write_str(name)
    }
}
