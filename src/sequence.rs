use std::fmt::{Display, Formatter};
use std::ops::{Add, AddAssign};
use std::time::SystemTime;

/// Sequence numbers are plain counters starting at 1. 0 is reserved for 'none', e.g. a
///  non-retainable frame or a message without dependency.
macro_rules! sequence_number {
    ($name: ident) => {
        #[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
        pub struct $name(u64);

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl $name {
            pub const ZERO: $name = $name(0);
            pub const FIRST: $name = $name(1);

            pub const fn from_raw(value: u64) -> Self {
                Self(value)
            }

            pub fn to_raw(&self) -> u64 {
                self.0
            }

            pub fn is_zero(&self) -> bool {
                self.0 == 0
            }

            pub fn next(&self) -> $name {
                // 2^64 frames will not be sent in the lifetime of a session
                $name(self.0 + 1)
            }

            pub fn checked_minus(&self, other: u64) -> Option<$name> {
                self.0.checked_sub(other).map($name)
            }
        }

        impl Add<u64> for $name {
            type Output = $name;

            fn add(self, rhs: u64) -> $name {
                $name(self.0 + rhs)
            }
        }

        impl AddAssign<u64> for $name {
            fn add_assign(&mut self, rhs: u64) {
                self.0 += rhs;
            }
        }
    }
}

sequence_number!(FrameSeq);
sequence_number!(MessageSeq);


/// Identifies one sender for the lifetime of its process. The id is derived from the start
///  timestamp, so a restarted node shows up as a new sender, and receivers do not confuse its
///  sequence numbers with those of the previous incarnation.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct SessionId(u64);

impl Display for SessionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl SessionId {
    pub const fn from_raw(value: u64) -> SessionId {
        SessionId(value)
    }

    pub fn to_raw(&self) -> u64 {
        self.0
    }

    /// millis since epoch in the upper 48 bits, random low 16 bits to separate nodes started
    ///  in the same millisecond
    pub fn from_timestamp() -> anyhow::Result<SessionId> {
        let raw = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)?
            .as_millis();

        if raw > 0xffff_ffff_ffff {
            anyhow::bail!("system clock is in the future");
        }
        let discriminator: u16 = rand::random();
        Ok(SessionId(((raw as u64) << 16) | discriminator as u64))
    }
}
