//! Sensor-to-display orientation.
//!
//! Sensor frames are landscape. The texture-coordinate rotation depends on the
//! quantized display rotation, the sensor facing, and whether the device is
//! held in portrait.

use crate::capture::Facing;
use bytemuck::{Pod, Zeroable};
use tracing::debug;

/// Quantized display rotation relative to the device's natural orientation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DisplayRotation {
    #[default]
    Rotation0,
    Rotation90,
    Rotation180,
    Rotation270,
}

impl DisplayRotation {
    pub fn degrees(self) -> u32 {
        match self {
            DisplayRotation::Rotation0 => 0,
            DisplayRotation::Rotation90 => 90,
            DisplayRotation::Rotation180 => 180,
            DisplayRotation::Rotation270 => 270,
        }
    }

    /// Exact quarter turns only.
    pub fn from_degrees(degrees: u32) -> Option<Self> {
        match degrees % 360 {
            0 => Some(DisplayRotation::Rotation0),
            90 => Some(DisplayRotation::Rotation90),
            180 => Some(DisplayRotation::Rotation180),
            270 => Some(DisplayRotation::Rotation270),
            _ => None,
        }
    }

    /// Snaps a raw sensor angle to the nearest quarter turn.
    pub fn quantize(degrees: i32) -> Self {
        match (degrees.rem_euclid(360) + 45) / 90 % 4 {
            0 => DisplayRotation::Rotation0,
            1 => DisplayRotation::Rotation90,
            2 => DisplayRotation::Rotation180,
            _ => DisplayRotation::Rotation270,
        }
    }

    /// Rotations in which the display is upside down relative to the sensor.
    pub fn is_inverted(self) -> bool {
        matches!(self, DisplayRotation::Rotation180 | DisplayRotation::Rotation270)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DisplayOrientation {
    Portrait,
    #[default]
    Landscape,
}

impl DisplayOrientation {
    /// Portrait when the surface is taller than it is wide.
    pub fn from_size(width: u32, height: u32) -> Self {
        if height > width {
            DisplayOrientation::Portrait
        } else {
            DisplayOrientation::Landscape
        }
    }

    pub fn is_portrait(self) -> bool {
        self == DisplayOrientation::Portrait
    }
}

/// Column-major 4x4 matrix, laid out as the shader's `mat4` uniform.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct RotationMatrix(pub [f32; 16]);

impl RotationMatrix {
    pub const IDENTITY: RotationMatrix = RotationMatrix([
        1.0, 0.0, 0.0, 0.0, //
        0.0, 1.0, 0.0, 0.0, //
        0.0, 0.0, 1.0, 0.0, //
        0.0, 0.0, 0.0, 1.0,
    ]);

    /// Counter-clockwise rotation about the z axis by a multiple of 90 degrees.
    pub fn about_z(degrees: i32) -> Self {
        // Quarter turns are tabulated so the result is exact.
        let (c, s) = match degrees.rem_euclid(360) {
            0 => (1.0, 0.0),
            90 => (0.0, 1.0),
            180 => (-1.0, 0.0),
            270 => (0.0, -1.0),
            other => {
                let radians = (other as f32).to_radians();
                (radians.cos(), radians.sin())
            }
        };
        RotationMatrix([
            c, s, 0.0, 0.0, //
            -s, c, 0.0, 0.0, //
            0.0, 0.0, 1.0, 0.0, //
            0.0, 0.0, 0.0, 1.0,
        ])
    }

    /// Applies the matrix to a point in the z = 0 plane.
    pub fn transform_point(&self, x: f32, y: f32) -> (f32, f32) {
        let m = &self.0;
        (m[0] * x + m[4] * y + m[12], m[1] * x + m[5] * y + m[13])
    }
}

impl Default for RotationMatrix {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// Texture rotation in degrees, normalized to `0..360`.
pub fn rotation_degrees(rotation: DisplayRotation, facing: Facing, orientation: DisplayOrientation) -> i32 {
    let base: i32 = if rotation.is_inverted() { 180 } else { 0 };
    let portrait: i32 = match (orientation, facing) {
        (DisplayOrientation::Landscape, _) => 0,
        (DisplayOrientation::Portrait, Facing::Back) => -90,
        (DisplayOrientation::Portrait, Facing::Front) => 90,
    };
    (base + portrait).rem_euclid(360)
}

/// Caches the texture rotation and recomputes it only on change events.
#[derive(Debug, Clone)]
pub struct OrientationTracker {
    rotation: DisplayRotation,
    facing: Facing,
    orientation: DisplayOrientation,
    degrees: i32,
    matrix: RotationMatrix,
}

impl OrientationTracker {
    pub fn new(facing: Facing) -> Self {
        let mut tracker = Self {
            rotation: DisplayRotation::default(),
            facing,
            orientation: DisplayOrientation::default(),
            degrees: 0,
            matrix: RotationMatrix::IDENTITY,
        };
        tracker.recompute();
        tracker
    }

    pub fn rotation(&self) -> DisplayRotation {
        self.rotation
    }

    pub fn facing(&self) -> Facing {
        self.facing
    }

    pub fn orientation(&self) -> DisplayOrientation {
        self.orientation
    }

    pub fn degrees(&self) -> i32 {
        self.degrees
    }

    pub fn matrix(&self) -> &RotationMatrix {
        &self.matrix
    }

    /// Surface-changed notification. Returns true when the matrix changed.
    pub fn on_surface_changed(&mut self, rotation: DisplayRotation, orientation: DisplayOrientation) -> bool {
        self.rotation = rotation;
        self.orientation = orientation;
        self.recompute()
    }

    /// Orientation-change event. A 180 degree flip does not always produce a
    /// surface change, so the rotation is rechecked here as well.
    pub fn on_orientation_event(&mut self, rotation: DisplayRotation) -> bool {
        self.rotation = rotation;
        self.recompute()
    }

    pub fn set_facing(&mut self, facing: Facing) -> bool {
        self.facing = facing;
        self.recompute()
    }

    fn recompute(&mut self) -> bool {
        let degrees = rotation_degrees(self.rotation, self.facing, self.orientation);
        let matrix = RotationMatrix::about_z(degrees);
        let changed = matrix != self.matrix;
        if changed {
            debug!(
                rotation = self.rotation.degrees(),
                facing = ?self.facing,
                orientation = ?self.orientation,
                degrees,
                "Texture rotation updated"
            );
        }
        self.degrees = degrees;
        self.matrix = matrix;
        changed
    }
}
