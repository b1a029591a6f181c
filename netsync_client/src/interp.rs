//! Interpolation.
//!
//! The authority sends discrete poses at broadcast boundaries. For entities
//! that interpolate, the peer keeps one track per entity and blends from a
//! start pose to the latest target over the entity's lerp delay.
//!
//! A new target normally starts from the previous target. When the same
//! target arrives again (the authority re-sent it after a refused or manual
//! change), the track restarts from the pose currently rendered instead.

use std::collections::HashMap;

use netsync_shared::{entity::SyncFlags, math::Pose, net::EntityId};

#[derive(Debug, Clone, Copy)]
struct Track {
    start: Pose,
    target: Pose,
    elapsed: f32,
    delay: f32,
    parts: SyncFlags,
    done: bool,
}

impl Track {
    fn alpha(&self) -> f32 {
        if self.delay <= 0.0 {
            1.0
        } else {
            (self.elapsed / self.delay).clamp(0.0, 1.0)
        }
    }

    fn sample(&self) -> Pose {
        let t = self.alpha();
        Pose::new(
            self.start.position.lerp(self.target.position, t),
            self.start.rotation.slerp(self.target.rotation, t),
        )
    }
}

/// Pose parts an entity interpolates, as `POSITION` / `ROTATION` flags.
pub fn lerp_parts(sync: SyncFlags) -> SyncFlags {
    let mut parts = SyncFlags::empty();
    if sync.contains(SyncFlags::POSITION | SyncFlags::LERP_POSITION) {
        parts |= SyncFlags::POSITION;
    }
    if sync.contains(SyncFlags::ROTATION | SyncFlags::LERP_ROTATION) {
        parts |= SyncFlags::ROTATION;
    }
    parts
}

/// Per-entity interpolation tracks.
#[derive(Debug, Default)]
pub struct Interpolator {
    tracks: HashMap<EntityId, Track>,
}

impl Interpolator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Current target of an entity, if it has a track.
    pub fn target(&self, id: EntityId) -> Option<Pose> {
        self.tracks.get(&id).map(|t| t.target)
    }

    /// Starts blending towards `target`. `rendered` is the pose the entity
    /// shows right now.
    pub fn set_target(
        &mut self,
        id: EntityId,
        rendered: Pose,
        target: Pose,
        delay: f32,
        parts: SyncFlags,
    ) {
        let start = match self.tracks.get(&id) {
            Some(prev) if prev.target != target => prev.target,
            _ => rendered,
        };
        self.tracks.insert(
            id,
            Track {
                start,
                target,
                elapsed: 0.0,
                delay,
                parts,
                done: false,
            },
        );
    }

    /// Advances every track by `dt` seconds and returns the poses to write.
    /// A track yields one last pose when it reaches its target and stays
    /// quiet afterwards.
    pub fn advance(&mut self, dt: f32) -> Vec<(EntityId, Pose, SyncFlags)> {
        let mut out = Vec::new();
        for (id, track) in &mut self.tracks {
            if track.done {
                continue;
            }
            track.elapsed += dt;
            if track.alpha() >= 1.0 {
                track.done = true;
            }
            out.push((*id, track.sample(), track.parts));
        }
        out
    }

    pub fn remove(&mut self, id: EntityId) {
        self.tracks.remove(&id);
    }

    pub fn clear(&mut self) {
        self.tracks.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netsync_shared::math::{Quat, Vec3};

    fn at(x: f32) -> Pose {
        Pose::new(Vec3::new(x, 0.0, 0.0), Quat::IDENTITY)
    }

    const ALL: SyncFlags = SyncFlags::POSITION.union(SyncFlags::ROTATION);

    #[test]
    fn blends_over_the_delay() {
        let mut interp = Interpolator::new();
        let id = EntityId(4);
        interp.set_target(id, at(0.0), at(10.0), 0.1, ALL);

        let half = interp.advance(0.05);
        assert_eq!(half.len(), 1);
        assert!((half[0].1.position.x - 5.0).abs() < 1e-4);

        let end = interp.advance(0.05);
        assert!((end[0].1.position.x - 10.0).abs() < 1e-4);
        assert!(interp.advance(0.05).is_empty());
    }

    #[test]
    fn new_target_starts_from_previous_target() {
        let mut interp = Interpolator::new();
        let id = EntityId(1);
        interp.set_target(id, at(0.0), at(10.0), 1.0, ALL);
        interp.advance(0.5);
        // Rendered pose is 5, but the next segment starts at 10.
        interp.set_target(id, at(5.0), at(20.0), 1.0, ALL);
        let first = interp.advance(0.0);
        assert!((first[0].1.position.x - 10.0).abs() < 1e-4);
    }

    #[test]
    fn repeated_target_restarts_from_rendered_pose() {
        let mut interp = Interpolator::new();
        let id = EntityId(1);
        interp.set_target(id, at(0.0), at(10.0), 1.0, ALL);
        interp.advance(1.0);
        interp.set_target(id, at(3.0), at(10.0), 1.0, ALL);
        let first = interp.advance(0.0);
        assert!((first[0].1.position.x - 3.0).abs() < 1e-4);
    }

    #[test]
    fn zero_delay_snaps() {
        let mut interp = Interpolator::new();
        interp.set_target(EntityId(2), at(0.0), at(7.0), 0.0, ALL);
        let out = interp.advance(0.0);
        assert_eq!(out[0].1, at(7.0));
    }

    #[test]
    fn parts_follow_lerp_flags() {
        let sync = SyncFlags::default() | SyncFlags::LERP_POSITION;
        assert_eq!(lerp_parts(sync), SyncFlags::POSITION);
        assert!(lerp_parts(SyncFlags::VARS | SyncFlags::LERP_ROTATION).is_empty());
    }
}
