//! Well-known C-Bus application addresses.
//!
//! An application address selects which functional domain a SAL/CAL payload
//! belongs to (lighting, clock sync, temperature broadcast, ...). Lighting is
//! the only application this gateway drives; the others are recognised so the
//! codec can classify traffic it sees on a shared network without treating it
//! as malformed.

use std::fmt;
use std::ops::RangeInclusive;

/// An 8-bit C-Bus application address.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Application(pub u8);

impl Application {
    /// Default lighting application address.
    pub const LIGHTING: Application = Application(0x38);
    pub const CLOCK: Application = Application(0xDF);
    pub const STATUS_REQUEST: Application = Application(0xFF);
    pub const TEMPERATURE: Application = Application(0x19);
    pub const TRIGGER: Application = Application(0xCA);
    pub const ENABLE: Application = Application(0xCB);

    /// Lighting applications occupy the whole 0x38-0x5F block; a network can
    /// run more than one lighting application in parallel (e.g. a second
    /// group of 255 addresses), though this gateway only ever originates
    /// commands on [`Application::LIGHTING`] itself.
    pub const LIGHTING_RANGE: RangeInclusive<u8> = 0x38..=0x5F;

    pub fn is_lighting(self) -> bool {
        Self::LIGHTING_RANGE.contains(&self.0)
    }
}

impl From<u8> for Application {
    fn from(b: u8) -> Self {
        Application(b)
    }
}

impl From<Application> for u8 {
    fn from(a: Application) -> Self {
        a.0
    }
}

impl fmt::Display for Application {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lighting_range_covers_default() {
        assert!(Application::LIGHTING.is_lighting());
        assert!(Application(0x5F).is_lighting());
        assert!(!Application(0x60).is_lighting());
        assert!(!Application::CLOCK.is_lighting());
    }
}
