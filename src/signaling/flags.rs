//! Webcam capability flags
//!
//! Every user publishes a small set of named booleans describing their
//! camera (is it on, is it explicit, who may watch it). On the wire this is
//! a plain integer bitmask; inside the crate it is always a [`VideoFlags`].

use serde::{Deserialize, Serialize};

const ACTIVE: u32 = 1 << 0;
const NSFW: u32 = 1 << 1;
const MUTED: u32 = 1 << 2;
const NON_EXPLICIT: u32 = 1 << 3;
const MUTUAL_REQUIRED: u32 = 1 << 4;
const MUTUAL_OPEN: u32 = 1 << 5;
const VIP_ONLY: u32 = 1 << 6;
const INVITED: u32 = 1 << 7;

/// Structured view of a user's video flag bitmask
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u32", into = "u32")]
pub struct VideoFlags {
    /// Camera is broadcasting
    pub active: bool,
    /// Camera content is marked explicit
    pub nsfw: bool,
    /// Outgoing microphone is muted
    pub muted: bool,
    /// Owner does not want to see explicit cameras
    pub non_explicit: bool,
    /// Viewers must be sharing their own camera
    pub mutual_required: bool,
    /// Owner's camera is offered back to anyone who opens theirs
    pub mutual_open: bool,
    /// Only VIP users may watch
    pub vip_only: bool,
    /// Owner has invited the viewer, bypassing the mutual requirement
    pub invited: bool,
}

impl VideoFlags {
    /// No flags set: the camera is off.
    pub const NONE: VideoFlags = VideoFlags {
        active: false,
        nsfw: false,
        muted: false,
        non_explicit: false,
        mutual_required: false,
        mutual_open: false,
        vip_only: false,
        invited: false,
    };

    /// Decode the wire bitmask. Unknown bits are ignored.
    pub fn from_bits(bits: u32) -> Self {
        Self {
            active: bits & ACTIVE != 0,
            nsfw: bits & NSFW != 0,
            muted: bits & MUTED != 0,
            non_explicit: bits & NON_EXPLICIT != 0,
            mutual_required: bits & MUTUAL_REQUIRED != 0,
            mutual_open: bits & MUTUAL_OPEN != 0,
            vip_only: bits & VIP_ONLY != 0,
            invited: bits & INVITED != 0,
        }
    }

    /// Encode to the wire bitmask.
    pub fn bits(&self) -> u32 {
        let mut bits = 0;
        for (set, bit) in [
            (self.active, ACTIVE),
            (self.nsfw, NSFW),
            (self.muted, MUTED),
            (self.non_explicit, NON_EXPLICIT),
            (self.mutual_required, MUTUAL_REQUIRED),
            (self.mutual_open, MUTUAL_OPEN),
            (self.vip_only, VIP_ONLY),
            (self.invited, INVITED),
        ] {
            if set {
                bits |= bit;
            }
        }
        bits
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::NONE
    }
}

impl From<u32> for VideoFlags {
    fn from(bits: u32) -> Self {
        VideoFlags::from_bits(bits)
    }
}

impl From<VideoFlags> for u32 {
    fn from(flags: VideoFlags) -> Self {
        flags.bits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_known_bit_positions() {
        // Active | NonExplicit | MutualRequired
        let flags = VideoFlags::from_bits(0b0001_1001);
        assert!(flags.active);
        assert!(flags.non_explicit);
        assert!(flags.mutual_required);
        assert!(!flags.nsfw);
        assert!(!flags.mutual_open);
        assert!(!flags.invited);
    }

    #[test]
    fn ignores_unknown_bits() {
        let flags = VideoFlags::from_bits(1 << 20 | 1);
        assert_eq!(flags.bits(), 1);
    }

    #[test]
    fn serializes_as_integer() {
        let flags = VideoFlags { active: true, vip_only: true, ..VideoFlags::NONE };
        assert_eq!(serde_json::to_string(&flags).unwrap(), "65");
        let back: VideoFlags = serde_json::from_str("65").unwrap();
        assert_eq!(back, flags);
    }

    #[test]
    fn empty_flags_mean_camera_off() {
        assert!(VideoFlags::from_bits(0).is_empty());
        assert!(!VideoFlags::from_bits(ACTIVE).is_empty());
    }
}
