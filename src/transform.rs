//! Output orientation.
//!
//! The eight values mirror `wl_output.transform`: rotations turn the framebuffer clockwise and the
//! flipped variants mirror around the vertical axis before rotating. A transform maps the framebuffer
//! orientation (what screencopy hands out) to the orientation shown on the output.

/// One element of the dihedral group of order 8.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transform {
    #[default]
    Normal,
    Rot90,
    Rot180,
    Rot270,
    Flipped,
    Flipped90,
    Flipped180,
    Flipped270,
}

impl Transform {
    pub const ALL: [Transform; 8] = [
        Transform::Normal,
        Transform::Rot90,
        Transform::Rot180,
        Transform::Rot270,
        Transform::Flipped,
        Transform::Flipped90,
        Transform::Flipped180,
        Transform::Flipped270,
    ];

    /// Convert a `wl_output.transform` code.
    pub fn from_wl(code: u32) -> Option<Self> {
        Self::ALL.get(code as usize).copied()
    }

    pub fn to_wl(self) -> u32 {
        match self {
            Transform::Normal => 0,
            Transform::Rot90 => 1,
            Transform::Rot180 => 2,
            Transform::Rot270 => 3,
            Transform::Flipped => 4,
            Transform::Flipped90 => 5,
            Transform::Flipped180 => 6,
            Transform::Flipped270 => 7,
        }
    }

    /// True for the variants rotating by 90 or 270 degrees.
    pub fn swaps_axes(self) -> bool {
        matches!(
            self,
            Transform::Rot90 | Transform::Rot270 | Transform::Flipped90 | Transform::Flipped270
        )
    }

    pub fn is_flipped(self) -> bool {
        matches!(
            self,
            Transform::Flipped | Transform::Flipped90 | Transform::Flipped180 | Transform::Flipped270
        )
    }

    pub fn apply_to_dimensions<T>(self, width: T, height: T) -> (T, T) {
        if self.swaps_axes() {
            (height, width)
        } else {
            (width, height)
        }
    }

    /// Split into (flipped, clockwise quarter turns). The flip is applied first.
    fn parts(self) -> (bool, u32) {
        let code = self.to_wl();
        (code >= 4, code % 4)
    }

    fn from_parts(flipped: bool, turns: u32) -> Self {
        Self::ALL[(turns % 4 + if flipped { 4 } else { 0 }) as usize]
    }

    /// The transform applying `first`, then `self`.
    pub fn compose(self, first: Transform) -> Self {
        let (flipped, turns) = self.parts();
        let (first_flipped, first_turns) = first.parts();
        // A flip reverses the direction of any rotation applied before it.
        let turns = if flipped {
            turns + 4 - first_turns
        } else {
            turns + first_turns
        };
        Self::from_parts(flipped != first_flipped, turns)
    }

    pub fn inverse(self) -> Self {
        match self {
            Transform::Rot90 => Transform::Rot270,
            Transform::Rot270 => Transform::Rot90,
            other => other,
        }
    }

    /// Map a continuous coordinate inside a grid of `bounds` (width, height) to the transformed
    /// grid, whose size is `apply_to_dimensions(bounds)`. Use [`Transform::inverse`] to go back.
    pub fn map_point(self, (x, y): (f64, f64), (width, height): (f64, f64)) -> (f64, f64) {
        match self {
            Transform::Normal => (x, y),
            Transform::Rot90 => (height - y, x),
            Transform::Rot180 => (width - x, height - y),
            Transform::Rot270 => (y, width - x),
            Transform::Flipped => (width - x, y),
            Transform::Flipped90 => (height - y, width - x),
            Transform::Flipped180 => (x, height - y),
            Transform::Flipped270 => (y, x),
        }
    }

    /// Integer version of [`Transform::map_point`] addressing whole pixels.
    pub fn map_pixel(self, (x, y): (u32, u32), (width, height): (u32, u32)) -> (u32, u32) {
        let (max_x, max_y) = (width - 1, height - 1);
        match self {
            Transform::Normal => (x, y),
            Transform::Rot90 => (max_y - y, x),
            Transform::Rot180 => (max_x - x, max_y - y),
            Transform::Rot270 => (y, max_x - x),
            Transform::Flipped => (max_x - x, y),
            Transform::Flipped90 => (max_y - y, max_x - x),
            Transform::Flipped180 => (x, max_y - y),
            Transform::Flipped270 => (y, x),
        }
    }
}
