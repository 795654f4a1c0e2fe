//! Local camera state

use super::flags::VideoFlags;
use crate::prefs::Preference;

/// Opaque handle of the acquired local media stream
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LocalStreamId(pub String);

/// The single local broadcast
#[derive(Debug, Clone, Default)]
pub struct LocalCamera {
    pub active: bool,
    pub stream: Option<LocalStreamId>,
    /// Outgoing audio muted
    pub muted: bool,
    pub nsfw: bool,
    pub mutual_required: bool,
    pub mutual_open: bool,
    pub non_explicit: bool,
    pub vip_only: bool,
}

/// Viewer-side preferences that do not travel in the flag bitmask
#[derive(Debug, Clone)]
pub struct ViewerPrefs {
    pub remember_expressly_closed: bool,
    pub auto_mute: bool,
}

impl Default for ViewerPrefs {
    fn default() -> Self {
        Self {
            remember_expressly_closed: true,
            auto_mute: false,
        }
    }
}

impl LocalCamera {
    /// Flags to publish in `me`. Empty while the camera is off.
    pub fn video_flags(&self, permit_nsfw: bool, is_vip: bool) -> VideoFlags {
        if !self.active {
            return VideoFlags::NONE;
        }
        VideoFlags {
            active: true,
            muted: self.muted,
            nsfw: self.nsfw && permit_nsfw,
            mutual_required: self.mutual_required,
            mutual_open: self.mutual_open,
            non_explicit: self.non_explicit,
            vip_only: self.vip_only && is_vip,
            invited: false,
        }
    }

    /// Mark the camera live with a freshly acquired stream.
    pub fn start(&mut self, stream: LocalStreamId) {
        self.active = true;
        self.stream = Some(stream);
    }

    /// Drop the stream and reset the broadcast to inactive. Policy toggles survive.
    pub fn stop(&mut self) {
        self.active = false;
        self.muted = false;
        self.stream = None;
    }

    /// Apply a camera preference toggle. Returns false for keys that are not
    /// camera flags.
    pub fn apply(&mut self, pref: Preference, value: bool) -> bool {
        match pref {
            Preference::Explicit => self.nsfw = value,
            Preference::Mutual => self.mutual_required = value,
            Preference::MutualOpen => self.mutual_open = value,
            Preference::NonExplicit => {
                self.non_explicit = value;
                if value {
                    self.nsfw = false;
                }
            }
            Preference::VipOnly => self.vip_only = value,
            Preference::RememberExpresslyClosed | Preference::AutoMute => return false,
        }
        true
    }
}

impl ViewerPrefs {
    pub fn apply(&mut self, pref: Preference, value: bool) -> bool {
        match pref {
            Preference::RememberExpresslyClosed => self.remember_expressly_closed = value,
            Preference::AutoMute => self.auto_mute = value,
            _ => return false,
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inactive_camera_publishes_no_flags() {
        let cam = LocalCamera { mutual_required: true, nsfw: true, ..Default::default() };
        assert!(cam.video_flags(true, true).is_empty());
    }

    #[test]
    fn nsfw_and_vip_only_are_gated() {
        let mut cam = LocalCamera { nsfw: true, vip_only: true, ..Default::default() };
        cam.start(LocalStreamId("s1".into()));
        let flags = cam.video_flags(false, false);
        assert!(flags.active);
        assert!(!flags.nsfw);
        assert!(!flags.vip_only);
        let flags = cam.video_flags(true, true);
        assert!(flags.nsfw);
        assert!(flags.vip_only);
    }

    #[test]
    fn non_explicit_clears_explicit() {
        let mut cam = LocalCamera { nsfw: true, ..Default::default() };
        assert!(cam.apply(Preference::NonExplicit, true));
        assert!(!cam.nsfw);
        assert!(cam.non_explicit);
    }

    #[test]
    fn stop_keeps_policy_toggles() {
        let mut cam = LocalCamera { mutual_open: true, ..Default::default() };
        cam.start(LocalStreamId("s1".into()));
        cam.muted = true;
        cam.stop();
        assert!(!cam.active);
        assert!(!cam.muted);
        assert!(cam.stream.is_none());
        assert!(cam.mutual_open);
    }
}
