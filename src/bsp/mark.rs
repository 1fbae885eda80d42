use std::fmt;

/// Out-of-band signal delivered in sequence with stream data.
///
/// The well-known codes are the telnet-style terminal marks; anything else is
/// passed through as [`Mark::Other`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mark {
    Sync,
    /// Followed by one data byte: the line width.
    LineWidth,
    /// Followed by one data byte: the page length.
    PageLength,
    /// Followed by one data byte: the terminal type.
    TerminalType,
    TimingRequest,
    TimingReply,
    Other(u8),
}

impl Mark {
    pub fn code(self) -> u8 {
        match self {
            Mark::Sync => 1,
            Mark::LineWidth => 2,
            Mark::PageLength => 3,
            Mark::TerminalType => 4,
            Mark::TimingRequest => 5,
            Mark::TimingReply => 6,
            Mark::Other(code) => code,
        }
    }

    /// True for marks whose parameter follows as the next data byte.
    pub fn has_parameter(self) -> bool {
        matches!(self, Mark::LineWidth | Mark::PageLength | Mark::TerminalType)
    }
}

impl From<u8> for Mark {
    fn from(code: u8) -> Self {
        match code {
            1 => Mark::Sync,
            2 => Mark::LineWidth,
            3 => Mark::PageLength,
            4 => Mark::TerminalType,
            5 => Mark::TimingRequest,
            6 => Mark::TimingReply,
            other => Mark::Other(other),
        }
    }
}

impl From<Mark> for u8 {
    fn from(mark: Mark) -> Self {
        mark.code()
    }
}

impl fmt::Display for Mark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mark::Other(code) => write!(f, "Mark({code})"),
            known => write!(f, "{known:?}"),
        }
    }
}
