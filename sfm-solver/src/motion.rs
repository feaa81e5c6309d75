use std::fmt;

use serde::{Deserialize, Serialize};

/// Classification of the camera motion over a frame range, as a bit-set over
/// static / rotational / translational with a qualitative magnitude.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CameraMotion(u16);

impl CameraMotion {
    pub const INVALID: Self = Self(0);
    pub const STATIC: Self = Self(1 << 0);

    pub const ROTATIONAL: Self = Self(1 << 1);
    pub const TRANSLATIONAL: Self = Self(1 << 2);

    pub const ROTATIONAL_TINY: Self = Self(Self::ROTATIONAL.0 | 1 << 3);
    pub const ROTATIONAL_MODERATE: Self = Self(Self::ROTATIONAL.0 | 1 << 4);
    pub const ROTATIONAL_SIGNIFICANT: Self = Self(Self::ROTATIONAL.0 | 1 << 5);

    pub const TRANSLATIONAL_TINY: Self = Self(Self::TRANSLATIONAL.0 | 1 << 6);
    pub const TRANSLATIONAL_MODERATE: Self = Self(Self::TRANSLATIONAL.0 | 1 << 7);
    pub const TRANSLATIONAL_SIGNIFICANT: Self = Self(Self::TRANSLATIONAL.0 | 1 << 8);

    pub const UNKNOWN: Self = Self(Self::ROTATIONAL.0 | Self::TRANSLATIONAL.0 | 1 << 9);

    #[inline]
    pub fn is_invalid(self) -> bool {
        self == Self::INVALID
    }

    #[inline]
    pub fn is_static(self) -> bool {
        self == Self::STATIC
    }

    #[inline]
    pub fn is_unknown(self) -> bool {
        self == Self::UNKNOWN
    }

    /// Whether the rotational bit is set.
    #[inline]
    pub fn is_rotational(self) -> bool {
        self.0 & Self::ROTATIONAL.0 != 0
    }

    /// Whether the translational bit is set.
    #[inline]
    pub fn is_translational(self) -> bool {
        self.0 & Self::TRANSLATIONAL.0 != 0
    }

    /// Whether purely rotational: rotational bits set, translational unset.
    #[inline]
    pub fn is_purely_rotational(self) -> bool {
        self.is_rotational() && !self.is_translational() && !self.is_unknown()
    }

    #[inline]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for CameraMotion {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for CameraMotion {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for CameraMotion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::UNKNOWN {
            return write!(f, "unknown");
        }
        if *self == Self::STATIC {
            return write!(f, "static");
        }
        if self.is_invalid() {
            return write!(f, "invalid");
        }

        let mut first = true;
        let mut part = |f: &mut fmt::Formatter<'_>, label: &str| -> fmt::Result {
            if !first {
                write!(f, " and ")?;
            }
            first = false;
            write!(f, "{label}")
        };

        if self.is_translational() {
            let magnitude = if self.contains(Self::TRANSLATIONAL_TINY) {
                " (tiny)"
            } else if self.contains(Self::TRANSLATIONAL_MODERATE) {
                " (moderate)"
            } else if self.contains(Self::TRANSLATIONAL_SIGNIFICANT) {
                " (significant)"
            } else {
                ""
            };
            part(f, "translational")?;
            write!(f, "{magnitude}")?;
        }

        if self.is_rotational() {
            let magnitude = if self.contains(Self::ROTATIONAL_TINY) {
                " (tiny)"
            } else if self.contains(Self::ROTATIONAL_MODERATE) {
                " (moderate)"
            } else if self.contains(Self::ROTATIONAL_SIGNIFICANT) {
                " (significant)"
            } else {
                ""
            };
            part(f, "rotational")?;
            write!(f, "{magnitude}")?;
        }

        Ok(())
    }
}
