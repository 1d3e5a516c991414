use serde::Serialize;
use std::fmt;

/// Health of a monitor derived from its current window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum StatusCode {
    NoData = 1,
    Good = 2,
    LowAvailability = 3,
    Down = 4,
}

impl StatusCode {
    /// Classify an up/down split. Percentages are truncated like the dashboard shows them.
    pub fn from_counts(up: u64, down: u64) -> Self {
        let total = up + down;
        if total == 0 {
            return StatusCode::NoData;
        }

        let percent = up * 100 / total;
        if percent > 95 {
            StatusCode::Good
        } else if percent > 80 {
            StatusCode::LowAvailability
        } else {
            StatusCode::Down
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StatusCode::NoData => "No Data",
            StatusCode::Good => "Good",
            StatusCode::LowAvailability => "Low Availability",
            StatusCode::Down => "Down",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
