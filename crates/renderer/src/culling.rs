//! Bounding-box visibility against the Vulkan clip volume.
//!
//! A box is culled only when all eight of its corners, in clip space, lie
//! outside the same plane of `-w <= x <= w`, `-w <= y <= w`, `0 <= z <= w`.
//! The planes are half-spaces in homogeneous coordinates, so the test holds
//! for corners behind the eye too. It is conservative: boxes near a frustum
//! edge or corner may be reported visible without being on screen.

use glam::{Mat4, Vec3, Vec4};

/// Whether the box `min..max` (model space) may be visible under `view_proj`.
pub fn is_visible(min: Vec3, max: Vec3, view_proj: &Mat4) -> bool {
    let corners = [
        Vec3::new(min.x, min.y, min.z),
        Vec3::new(max.x, min.y, min.z),
        Vec3::new(min.x, max.y, min.z),
        Vec3::new(max.x, max.y, min.z),
        Vec3::new(min.x, min.y, max.z),
        Vec3::new(max.x, min.y, max.z),
        Vec3::new(min.x, max.y, max.z),
        Vec3::new(max.x, max.y, max.z),
    ];

    // Bit per clip plane a corner is outside of; culled if some bit is set
    // for every corner.
    let mut outside_all = u8::MAX;
    for corner in corners {
        let clip = *view_proj * corner.extend(1.0);
        outside_all &= outside_planes(clip);
        if outside_all == 0 {
            return true;
        }
    }
    outside_all == 0
}

fn outside_planes(clip: Vec4) -> u8 {
    let w = clip.w;
    let mut mask = 0;
    if clip.x < -w {
        mask |= 1 << 0;
    }
    if clip.x > w {
        mask |= 1 << 1;
    }
    if clip.y < -w {
        mask |= 1 << 2;
    }
    if clip.y > w {
        mask |= 1 << 3;
    }
    if clip.z < 0.0 {
        mask |= 1 << 4;
    }
    if clip.z > w {
        mask |= 1 << 5;
    }
    mask
}
