use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Control flags carried in every frame header.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Flags(u8);

impl Flags {
    pub const SYN: Flags = Flags(0x80);
    pub const ACK: Flags = Flags(0x40);
    pub const FIN: Flags = Flags(0x20);
    pub const RST: Flags = Flags(0x10);
    /// Last fragment of a message.
    pub const EOR: Flags = Flags(0x02);
    /// The frame carries a payload.
    pub const DATA: Flags = Flags(0x01);

    const KNOWN: u8 = 0x80 | 0x40 | 0x20 | 0x10 | 0x02 | 0x01;

    pub const fn empty() -> Self {
        Flags(0)
    }

    /// Build flags from a raw byte, rejecting undefined bits.
    pub const fn from_bits(bits: u8) -> Option<Self> {
        if bits & !Self::KNOWN == 0 {
            Some(Flags(bits))
        } else {
            None
        }
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: Flags) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

impl BitOrAssign for Flags {
    fn bitor_assign(&mut self, rhs: Flags) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(Flags, &str); 6] = [
            (Flags::SYN, "SYN"),
            (Flags::ACK, "ACK"),
            (Flags::FIN, "FIN"),
            (Flags::RST, "RST"),
            (Flags::EOR, "EOR"),
            (Flags::DATA, "DATA"),
        ];

        if self.is_empty() {
            return f.write_str("-");
        }
        let mut first = true;
        for (flag, name) in NAMES {
            if self.contains(flag) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

impl fmt::Display for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_lists_set_flags() {
        assert_eq!(format!("{:?}", Flags::SYN | Flags::ACK), "SYN|ACK");
        assert_eq!(format!("{:?}", Flags::DATA | Flags::EOR), "EOR|DATA");
        assert_eq!(format!("{:?}", Flags::empty()), "-");
    }

    #[test]
    fn from_bits_rejects_undefined() {
        assert_eq!(Flags::from_bits(0xc0), Some(Flags::SYN | Flags::ACK));
        assert_eq!(Flags::from_bits(0x04), None);
        assert_eq!(Flags::from_bits(0x08), None);
    }

    #[test]
    fn contains_and_intersects() {
        let f = Flags::DATA | Flags::EOR;
        assert!(f.contains(Flags::DATA));
        assert!(!f.contains(Flags::DATA | Flags::SYN));
        assert!(f.intersects(Flags::DATA | Flags::SYN));
        assert!(!f.intersects(Flags::SYN | Flags::FIN));
    }
}
