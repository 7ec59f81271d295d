//! Logical device identity and advertised-name identification
//!
//! Every sensor unit is addressed by a [`DeviceId`] that encodes which knee it is
//! worn on and whether it sits above (thigh) or below (shin) the joint. Radio
//! addresses change across power cycles and re-pairing; the logical id does not.
//!
//! # Bit layout
//!
//! ```text
//! bit 0: joint     0 = left,  1 = right
//! bit 1: position  0 = shin,  1 = thigh
//! ```

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

const JOINT_BIT: u8 = 0b01;
const POSITION_BIT: u8 = 0b10;

/// Which knee a unit is worn on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Joint {
    Left,
    Right,
}

/// Where on the leg a unit sits relative to the knee.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Position {
    /// Proximal unit, above the joint
    Thigh,
    /// Distal unit, below the joint
    Shin,
}

/// Stable logical identifier of one sensor unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum DeviceId {
    LeftShin = 0b00,
    RightShin = 0b01,
    LeftThigh = 0b10,
    RightThigh = 0b11,
}

impl DeviceId {
    /// All logical ids, in bit order.
    pub const ALL: [DeviceId; 4] = [
        DeviceId::LeftShin,
        DeviceId::RightShin,
        DeviceId::LeftThigh,
        DeviceId::RightThigh,
    ];

    /// Build an id from its two components.
    pub const fn from_parts(joint: Joint, position: Position) -> Self {
        match (joint, position) {
            (Joint::Left, Position::Shin) => DeviceId::LeftShin,
            (Joint::Right, Position::Shin) => DeviceId::RightShin,
            (Joint::Left, Position::Thigh) => DeviceId::LeftThigh,
            (Joint::Right, Position::Thigh) => DeviceId::RightThigh,
        }
    }

    /// Decode an id from its raw bits. Returns `None` for bits outside the layout.
    pub const fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0b00 => Some(DeviceId::LeftShin),
            0b01 => Some(DeviceId::RightShin),
            0b10 => Some(DeviceId::LeftThigh),
            0b11 => Some(DeviceId::RightThigh),
            _ => None,
        }
    }

    pub const fn bits(self) -> u8 {
        self as u8
    }

    pub const fn is_left(self) -> bool {
        self.bits() & JOINT_BIT == 0
    }

    pub const fn is_shin(self) -> bool {
        self.bits() & POSITION_BIT == 0
    }

    pub const fn joint(self) -> Joint {
        if self.is_left() {
            Joint::Left
        } else {
            Joint::Right
        }
    }

    pub const fn position(self) -> Position {
        if self.is_shin() {
            Position::Shin
        } else {
            Position::Thigh
        }
    }

    /// Machine-friendly name, matches the serde representation.
    pub const fn as_str(self) -> &'static str {
        match self {
            DeviceId::LeftShin => "left_shin",
            DeviceId::RightShin => "right_shin",
            DeviceId::LeftThigh => "left_thigh",
            DeviceId::RightThigh => "right_thigh",
        }
    }

    /// Operator-facing name, e.g. "Left Thigh".
    pub const fn display_name(self) -> &'static str {
        match self {
            DeviceId::LeftShin => "Left Shin",
            DeviceId::RightShin => "Right Shin",
            DeviceId::LeftThigh => "Left Thigh",
            DeviceId::RightThigh => "Right Thigh",
        }
    }

    /// Two-letter badge used in compact views.
    pub const fn short_label(self) -> &'static str {
        match self {
            DeviceId::LeftShin => "LS",
            DeviceId::RightShin => "RS",
            DeviceId::LeftThigh => "LT",
            DeviceId::RightThigh => "RT",
        }
    }

    /// Where the unit is worn, e.g. "left knee, thigh".
    pub fn placement(self) -> String {
        let side = match self.joint() {
            Joint::Left => "left",
            Joint::Right => "right",
        };
        let segment = match self.position() {
            Position::Thigh => "thigh",
            Position::Shin => "shin",
        };
        format!("{side} knee, {segment}")
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Identification
// ============================================================================

/// Current firmware advertises `KneeLink-<L|R><S|T>[suffix]`.
static CURRENT_NAMING: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?i)^kneelink[\s_-]*(?P<joint>[lr])(?P<pos>[st])(?:[^a-z]|$)").ok()
});

/// Older units advertise `[KL ]<Left|Right> <Shin|Thigh>[suffix]`.
static LEGACY_NAMING: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:kl[\s_-]*)?(?P<joint>left|right)[\s_-]*(?P<pos>shin|thigh)(?:[^a-z]|$)")
        .ok()
});

/// Resolve the logical id from an advertised name.
///
/// Matching is case-insensitive and tolerant of surrounding whitespace.
/// Returns `None` when the name follows neither naming convention.
pub fn identify_device(advertised_name: &str) -> Option<DeviceId> {
    let name = advertised_name.trim();

    // a pattern that failed to build matches nothing
    [&*CURRENT_NAMING, &*LEGACY_NAMING].into_iter().flatten().find_map(|pattern| {
        let captures = pattern.captures(name)?;
        let joint = match captures.name("joint")?.as_str().as_bytes().first()? {
            b'l' | b'L' => Joint::Left,
            _ => Joint::Right,
        };
        let position = match captures.name("pos")?.as_str().as_bytes().first()? {
            b's' | b'S' => Position::Shin,
            _ => Position::Thigh,
        };
        Some(DeviceId::from_parts(joint, position))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_naming_patterns_build() {
        assert!(CURRENT_NAMING.is_some());
        assert!(LEGACY_NAMING.is_some());
    }

    #[test]
    fn test_bit_helpers() {
        assert!(DeviceId::LeftShin.is_left());
        assert!(DeviceId::LeftShin.is_shin());
        assert!(!DeviceId::RightThigh.is_left());
        assert!(!DeviceId::RightThigh.is_shin());
        assert_eq!(DeviceId::RightShin.joint(), Joint::Right);
        assert_eq!(DeviceId::LeftThigh.position(), Position::Thigh);
    }

    #[test]
    fn test_bits_roundtrip_all_ids() {
        for id in DeviceId::ALL {
            assert_eq!(DeviceId::from_bits(id.bits()), Some(id));
            assert_eq!(DeviceId::from_parts(id.joint(), id.position()), id);
        }
        assert_eq!(DeviceId::from_bits(4), None);
    }

    #[test]
    fn test_display_strings() {
        assert_eq!(DeviceId::LeftThigh.to_string(), "left_thigh");
        assert_eq!(DeviceId::LeftThigh.display_name(), "Left Thigh");
        assert_eq!(DeviceId::RightShin.short_label(), "RS");
        assert_eq!(DeviceId::RightShin.placement(), "right knee, shin");
    }

    #[test]
    fn test_identify_current_naming() {
        assert_eq!(identify_device("KneeLink-LS"), Some(DeviceId::LeftShin));
        assert_eq!(identify_device("kneelink_rt-0042"), Some(DeviceId::RightThigh));
        assert_eq!(identify_device("  KNEELINK LT01 "), Some(DeviceId::LeftThigh));
        assert_eq!(identify_device("KneeLink-RS"), Some(DeviceId::RightShin));
    }

    #[test]
    fn test_identify_legacy_naming() {
        assert_eq!(identify_device("LEFT_SHIN"), Some(DeviceId::LeftShin));
        assert_eq!(identify_device("KL Right Thigh 2"), Some(DeviceId::RightThigh));
        assert_eq!(identify_device("right-shin"), Some(DeviceId::RightShin));
    }

    #[test]
    fn test_identify_rejects_unknown_names() {
        assert_eq!(identify_device(""), None);
        assert_eq!(identify_device("Heart Rate Strap"), None);
        assert_eq!(identify_device("KneeLink-XX"), None);
        assert_eq!(identify_device("KneeLink-LSX"), None);
        assert_eq!(identify_device("leftover shin"), None);
    }
}
