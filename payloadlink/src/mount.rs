//! Mount positions: the physical payload ports a call can target.

use std::fmt;

/// Physical payload port on the aircraft.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum MountPosition {
    /// Payload port 1 (default).
    #[default]
    Payload1,
    /// Payload port 2.
    Payload2,
    /// Payload port 3.
    Payload3,
    /// FPV camera.
    Fpv,
    /// Extension port (E-Port).
    ExtensionPort,
}

impl MountPosition {
    /// All mount positions in port order.
    pub const ALL: [Self; 5] = [
        Self::Payload1,
        Self::Payload2,
        Self::Payload3,
        Self::Fpv,
        Self::ExtensionPort,
    ];

    /// Numeric code used by the payload core.
    #[must_use]
    pub fn code(&self) -> u8 {
        match self {
            Self::Payload1 => 1,
            Self::Payload2 => 2,
            Self::Payload3 => 3,
            Self::Fpv => 7,
            Self::ExtensionPort => 80,
        }
    }

    /// Decode a numeric mount position code.
    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|m| m.code() == code)
    }

    /// Parse a mount position from a user-facing name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "payload1" | "p1" | "1" => Some(Self::Payload1),
            "payload2" | "p2" | "2" => Some(Self::Payload2),
            "payload3" | "p3" | "3" => Some(Self::Payload3),
            "fpv" => Some(Self::Fpv),
            "extension" | "eport" | "e-port" => Some(Self::ExtensionPort),
            _ => None,
        }
    }

    /// Directory name used when laying out downloaded files.
    #[must_use]
    pub fn dir_name(&self) -> &'static str {
        match self {
            Self::Payload1 => "payload1",
            Self::Payload2 => "payload2",
            Self::Payload3 => "payload3",
            Self::Fpv => "fpv",
            Self::ExtensionPort => "extension",
        }
    }
}

impl fmt::Display for MountPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Payload1 => write!(f, "Payload 1"),
            Self::Payload2 => write!(f, "Payload 2"),
            Self::Payload3 => write!(f, "Payload 3"),
            Self::Fpv => write!(f, "FPV"),
            Self::ExtensionPort => write!(f, "Extension port"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mount_from_name() {
        assert_eq!(MountPosition::from_name("payload2"), Some(MountPosition::Payload2));
        assert_eq!(MountPosition::from_name("P3"), Some(MountPosition::Payload3));
        assert_eq!(MountPosition::from_name("eport"), Some(MountPosition::ExtensionPort));
        assert_eq!(MountPosition::from_name("gimbal"), None);
    }

    #[test]
    fn test_mount_code_roundtrip() {
        for mount in MountPosition::ALL {
            assert_eq!(MountPosition::from_code(mount.code()), Some(mount));
        }
        assert_eq!(MountPosition::from_code(42), None);
    }
}
