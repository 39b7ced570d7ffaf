//! Camera slots around the vehicle.
//!
//! Every per-camera convention (yaw of the camera frame in the vehicle frame,
//! quarter of the preview screen) is read from one table instead of being
//! derived from index arithmetic.

use nalgebra::{Point3, Rotation3, Vector3};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CameraSlot {
    Front,
    Right,
    Rear,
    Left,
}

/// Top-left corner of a camera's quarter of the preview screen, in NDC.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScreenTile {
    pub left: f32,
    pub top: f32,
}

impl ScreenTile {
    /// Map normalized image coordinates (`u`, `v` in `[0, 1]`, `v` down)
    /// into the tile.
    pub fn map(&self, u: f32, v: f32) -> [f32; 2] {
        [self.left + u, self.top - v]
    }
}

struct SlotInfo {
    slot: CameraSlot,
    yaw_deg: f64,
    tile: ScreenTile,
}

const SLOTS: [SlotInfo; 4] = [
    SlotInfo {
        slot: CameraSlot::Front,
        yaw_deg: 0.0,
        tile: ScreenTile {
            left: -1.0,
            top: 1.0,
        },
    },
    SlotInfo {
        slot: CameraSlot::Right,
        yaw_deg: 90.0,
        tile: ScreenTile {
            left: 0.0,
            top: 1.0,
        },
    },
    SlotInfo {
        slot: CameraSlot::Rear,
        yaw_deg: 180.0,
        tile: ScreenTile {
            left: -1.0,
            top: 0.0,
        },
    },
    SlotInfo {
        slot: CameraSlot::Left,
        yaw_deg: 270.0,
        tile: ScreenTile {
            left: 0.0,
            top: 0.0,
        },
    },
];

impl CameraSlot {
    pub const ALL: [CameraSlot; 4] = [
        CameraSlot::Front,
        CameraSlot::Right,
        CameraSlot::Rear,
        CameraSlot::Left,
    ];

    pub fn from_index(index: usize) -> Option<Self> {
        SLOTS.get(index).map(|s| s.slot)
    }

    pub fn index(self) -> usize {
        self as usize
    }

    fn info(self) -> &'static SlotInfo {
        &SLOTS[self.index()]
    }

    /// Rotation of the camera's template frame about the vehicle up axis.
    pub fn yaw_deg(self) -> f64 {
        self.info().yaw_deg
    }

    pub fn tile(self) -> ScreenTile {
        self.info().tile
    }

    fn rotation(self) -> Rotation3<f64> {
        Rotation3::from_axis_angle(&Vector3::z_axis(), self.yaw_deg().to_radians())
    }

    /// Camera template frame to the shared vehicle frame.
    pub fn to_vehicle(self, p: Point3<f64>) -> Point3<f64> {
        self.rotation() * p
    }

    /// Shared vehicle frame to the camera template frame.
    pub fn to_camera(self, p: Point3<f64>) -> Point3<f64> {
        self.rotation().inverse() * p
    }
}

/// Index of the next camera around the ring.
pub fn next_index(i: usize, count: usize) -> usize {
    if i + 1 < count {
        i + 1
    } else {
        0
    }
}

/// Index of the previous camera around the ring.
pub fn previous_index(i: usize, count: usize) -> usize {
    if i > 0 {
        i - 1
    } else {
        count.saturating_sub(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn ring_indices_wrap() {
        assert_eq!(next_index(3, 4), 0);
        assert_eq!(next_index(1, 4), 2);
        assert_eq!(previous_index(0, 4), 3);
        assert_eq!(previous_index(2, 4), 1);
    }

    #[test]
    fn tiles_cover_the_four_quarters() {
        let corners: Vec<_> = CameraSlot::ALL
            .iter()
            .map(|s| (s.tile().left, s.tile().top))
            .collect();
        assert_eq!(
            corners,
            vec![(-1.0, 1.0), (0.0, 1.0), (-1.0, 0.0), (0.0, 0.0)]
        );
        assert_eq!(CameraSlot::Rear.tile().map(0.5, 0.5), [-0.5, -0.5]);
    }

    #[test]
    fn vehicle_rotation_round_trips() {
        let p = Point3::new(0.25, -1.0, -0.5);
        for slot in CameraSlot::ALL {
            let back = slot.to_camera(slot.to_vehicle(p));
            assert_relative_eq!(back, p, epsilon = 1e-12);
        }
        let right = CameraSlot::Right.to_vehicle(Point3::new(0.0, -1.0, 0.0));
        assert_relative_eq!(right, Point3::new(1.0, 0.0, 0.0), epsilon = 1e-12);
        assert_eq!(CameraSlot::from_index(4), None);
    }
}
