use std::fmt;

/// Connection lifecycle.
///
/// ```text
/// CLOSED --connect--> SYN_SENT --SYN+ACK--> ESTABLISHED
/// CLOSED --listen---> LISTEN ----SYN------> ESTABLISHED
/// ESTABLISHED --FIN--> CLOSING --ACK of FIN--> CLOSED
/// any --RST / exhaustion / close timeout--> CLOSED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnState {
    Closed,
    Listen,
    SynSent,
    Established,
    Closing,
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Closed => "CLOSED",
            Self::Listen => "LISTEN",
            Self::SynSent => "SYN_SENT",
            Self::Established => "ESTABLISHED",
            Self::Closing => "CLOSING",
        };
        f.write_str(name)
    }
}

/// How far ahead of the expected sequence number a frame may land and still
/// be accepted. A sender that gives up on a frame skips one sequence number,
/// so gaps show up here.
pub const RESYNC_WINDOW: u8 = 4;

/// How far behind the expected sequence number a frame is treated as a
/// replay of something already delivered.
pub const DUPLICATE_WINDOW: u8 = 16;

/// Classification of an inbound data sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqCheck {
    /// Exactly the next frame.
    Expected,
    /// Ahead by this many frames; the sender abandoned what came between.
    Skipped(u8),
    /// Already delivered; acknowledge again, do not deliver.
    Duplicate,
    /// Neither; drop.
    OutOfWindow,
}

/// Classify `seq` against the next expected sequence number (modulo 256).
pub fn check_sequence(expected: u8, seq: u8) -> SeqCheck {
    let ahead = seq.wrapping_sub(expected);
    if ahead == 0 {
        return SeqCheck::Expected;
    }
    if ahead <= RESYNC_WINDOW {
        return SeqCheck::Skipped(ahead);
    }
    let behind = expected.wrapping_sub(seq);
    if behind <= DUPLICATE_WINDOW {
        SeqCheck::Duplicate
    } else {
        SeqCheck::OutOfWindow
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expected_and_skipped() {
        assert_eq!(check_sequence(0, 0), SeqCheck::Expected);
        assert_eq!(check_sequence(10, 11), SeqCheck::Skipped(1));
        assert_eq!(check_sequence(10, 14), SeqCheck::Skipped(4));
        assert_eq!(check_sequence(10, 15), SeqCheck::OutOfWindow);
    }

    #[test]
    fn duplicates_behind() {
        assert_eq!(check_sequence(10, 9), SeqCheck::Duplicate);
        assert_eq!(check_sequence(20, 4), SeqCheck::Duplicate);
        assert_eq!(check_sequence(20, 3), SeqCheck::OutOfWindow);
    }

    #[test]
    fn wraps_modulo_256() {
        assert_eq!(check_sequence(255, 0), SeqCheck::Skipped(1));
        assert_eq!(check_sequence(0, 255), SeqCheck::Duplicate);
        assert_eq!(check_sequence(2, 250), SeqCheck::Duplicate);
        assert_eq!(check_sequence(254, 254), SeqCheck::Expected);
    }

    #[test]
    fn display_names() {
        assert_eq!(ConnState::SynSent.to_string(), "SYN_SENT");
        assert_eq!(ConnState::Established.to_string(), "ESTABLISHED");
    }
}
