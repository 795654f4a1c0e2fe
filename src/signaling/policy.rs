//! Viewing policy
//!
//! Side-effect free decisions shared by the open-video path and the
//! track-received path, so both apply the same rules.

use super::camera::LocalCamera;
use super::flags::VideoFlags;
use super::registry::Relationship;
use std::fmt;

/// The local user, as seen by policy
#[derive(Debug, Clone, Copy)]
pub struct Viewer<'a> {
    pub camera: &'a LocalCamera,
    pub vip: bool,
    /// Moderation rule forbidding this user from opening cameras
    pub no_video: bool,
}

/// The remote user whose camera is being considered
#[derive(Debug, Clone, Copy, Default)]
pub struct Target {
    pub flags: VideoFlags,
    pub vip: bool,
}

/// Why a camera may not be opened
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Denial {
    NoVideoRule,
    MutualRequired,
    VipOnlyInvisible,
    Muted,
    Booted,
    /// Target avoids explicit cameras and ours is explicit
    TargetNonExplicit,
    /// We avoid explicit cameras and the target's is explicit
    ViewerNonExplicit,
}

impl fmt::Display for Denial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Denial::NoVideoRule => write!(f, "you are not allowed to open webcams"),
            Denial::MutualRequired => write!(f, "they ask that you share your own camera before opening theirs"),
            Denial::VipOnlyInvisible => write!(f, "they require a shared camera but cannot see your VIP-only camera"),
            Denial::Muted => write!(f, "you have muted them"),
            Denial::Booted => write!(f, "you have booted them"),
            Denial::TargetNonExplicit => write!(f, "they prefer not to see explicit cameras and yours is marked explicit"),
            Denial::ViewerNonExplicit => write!(f, "their camera is marked explicit and you prefer non-explicit cameras"),
        }
    }
}

/// Full viewing check, in the order the reasons are reported.
pub fn check_viewing(viewer: Viewer<'_>, target: Target, rel: &Relationship) -> Result<(), Denial> {
    if viewer.no_video {
        return Err(Denial::NoVideoRule);
    }

    let flags = target.flags;
    if flags.active && flags.mutual_required && !flags.invited {
        let cam = viewer.camera;
        if cam.active && viewer.vip && cam.vip_only && !target.vip {
            return Err(Denial::VipOnlyInvisible);
        }
        if !cam.active {
            return Err(Denial::MutualRequired);
        }
    }

    if rel.muted {
        return Err(Denial::Muted);
    }
    if rel.booted {
        return Err(Denial::Booted);
    }

    check_content(viewer.camera, flags)
}

/// Explicit/non-explicit compatibility in both directions.
pub fn check_content(camera: &LocalCamera, flags: VideoFlags) -> Result<(), Denial> {
    if camera.active && camera.nsfw && flags.active && flags.non_explicit {
        return Err(Denial::TargetNonExplicit);
    }
    if camera.non_explicit && flags.active && flags.nsfw {
        return Err(Denial::ViewerNonExplicit);
    }
    Ok(())
}

pub fn is_viewing_allowed(viewer: Viewer<'_>, target: Target, rel: &Relationship) -> bool {
    check_viewing(viewer, target, rel).is_ok()
}

/// Whether our camera rides along on an offer we create towards `target`.
pub fn should_offer_video_on_create(target: VideoFlags, camera: &LocalCamera, rel: &Relationship) -> bool {
    target.mutual_open
        && camera.active
        && !rel.booted
        && !rel.muted
        && (!camera.nsfw || !target.non_explicit)
}

pub fn should_accept_incoming_track(
    is_offering: bool,
    local_mutual_open: bool,
    expressly_closed: bool,
    remember_expressly_closed: bool,
    booted_admin: bool,
) -> bool {
    if !is_offering && !local_mutual_open {
        return false;
    }
    if !is_offering && expressly_closed && remember_expressly_closed {
        return false;
    }
    !booted_admin
}

/// An operator we have booted or muted can still watch us, but we ignore them.
pub fn is_booted_admin(rel: &Relationship, target_is_operator: bool) -> bool {
    (rel.booted || rel.muted) && target_is_operator
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mutual_target() -> Target {
        Target {
            flags: VideoFlags { active: true, mutual_required: true, ..VideoFlags::NONE },
            vip: false,
        }
    }

    fn viewer(camera: &LocalCamera) -> Viewer<'_> {
        Viewer { camera, vip: false, no_video: false }
    }

    #[test]
    fn mutual_required_unlocks_when_camera_starts() {
        let rel = Relationship::default();
        let mut cam = LocalCamera::default();
        assert_eq!(check_viewing(viewer(&cam), mutual_target(), &rel), Err(Denial::MutualRequired));

        cam.active = true;
        assert!(is_viewing_allowed(viewer(&cam), mutual_target(), &rel));
    }

    #[test]
    fn invite_bypasses_mutual_requirement() {
        let cam = LocalCamera::default();
        let mut target = mutual_target();
        target.flags.invited = true;
        assert!(is_viewing_allowed(viewer(&cam), target, &Relationship::default()));
    }

    #[test]
    fn vip_only_camera_is_invisible_to_non_vip_target() {
        let cam = LocalCamera { active: true, vip_only: true, ..Default::default() };
        let v = Viewer { camera: &cam, vip: true, no_video: false };
        let rel = Relationship::default();
        assert_eq!(check_viewing(v, mutual_target(), &rel), Err(Denial::VipOnlyInvisible));

        let vip_target = Target { vip: true, ..mutual_target() };
        assert!(is_viewing_allowed(v, vip_target, &rel));
    }

    #[test]
    fn muted_and_booted_block_viewing() {
        let cam = LocalCamera::default();
        let target = Target { flags: VideoFlags::from_bits(1), vip: false };
        let muted = Relationship { muted: true, ..Default::default() };
        let booted = Relationship { booted: true, ..Default::default() };
        assert_eq!(check_viewing(viewer(&cam), target, &muted), Err(Denial::Muted));
        assert_eq!(check_viewing(viewer(&cam), target, &booted), Err(Denial::Booted));
    }

    #[test]
    fn no_video_rule_wins() {
        let cam = LocalCamera { active: true, ..Default::default() };
        let v = Viewer { camera: &cam, vip: false, no_video: true };
        assert_eq!(check_viewing(v, Target::default(), &Relationship::default()), Err(Denial::NoVideoRule));
    }

    #[test]
    fn explicit_content_mismatch() {
        let nsfw_cam = LocalCamera { active: true, nsfw: true, ..Default::default() };
        let prude = VideoFlags { active: true, non_explicit: true, ..VideoFlags::NONE };
        assert_eq!(check_content(&nsfw_cam, prude), Err(Denial::TargetNonExplicit));

        let prude_cam = LocalCamera { non_explicit: true, ..Default::default() };
        let explicit = VideoFlags { active: true, nsfw: true, ..VideoFlags::NONE };
        assert_eq!(check_content(&prude_cam, explicit), Err(Denial::ViewerNonExplicit));

        assert!(check_content(&LocalCamera::default(), explicit).is_ok());
    }

    #[test]
    fn offer_video_only_to_mutual_open_targets() {
        let cam = LocalCamera { active: true, ..Default::default() };
        let rel = Relationship::default();
        let open = VideoFlags { active: true, mutual_open: true, ..VideoFlags::NONE };
        assert!(should_offer_video_on_create(open, &cam, &rel));
        assert!(!should_offer_video_on_create(VideoFlags::from_bits(1), &cam, &rel));
        assert!(!should_offer_video_on_create(open, &LocalCamera::default(), &rel));

        let booted = Relationship { booted: true, ..Default::default() };
        assert!(!should_offer_video_on_create(open, &cam, &booted));

        let nsfw_cam = LocalCamera { active: true, nsfw: true, ..Default::default() };
        let open_prude = VideoFlags { non_explicit: true, ..open };
        assert!(!should_offer_video_on_create(open_prude, &nsfw_cam, &rel));
    }

    #[test]
    fn incoming_track_gating() {
        // offerer always accepts
        assert!(should_accept_incoming_track(true, false, false, true, false));
        // answerer needs mutual open
        assert!(!should_accept_incoming_track(false, false, false, true, false));
        assert!(should_accept_incoming_track(false, true, false, true, false));
        // remembered express close
        assert!(!should_accept_incoming_track(false, true, true, true, false));
        assert!(should_accept_incoming_track(false, true, true, false, false));
        // booted admin
        assert!(!should_accept_incoming_track(true, true, false, true, true));
    }

    #[test]
    fn booted_admin_requires_operator() {
        let rel = Relationship { booted: true, ..Default::default() };
        assert!(is_booted_admin(&rel, true));
        assert!(!is_booted_admin(&rel, false));
        assert!(!is_booted_admin(&Relationship::default(), true));
    }
}
