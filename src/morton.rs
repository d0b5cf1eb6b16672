//! Spatial keys: Morton (Z-order) codes derived from node positions
//!
//! Positions are quantised on a grid spanning the current bounding box and
//! the bits of the two grid coordinates are interleaved. Nearby nodes get
//! nearby keys, so sorting by key groups them for the tree builder.
//! The device kernel in `gpu::shaders::MORTON_CODES` mirrors these functions.

use crate::config::MORTON_BITS_PER_AXIS;

/// Largest grid coordinate per axis
pub const GRID_MAX: u32 = (1 << MORTON_BITS_PER_AXIS) - 1;

/// Spread the low 16 bits of `v` to the even bit positions
pub fn expand_bits(v: u32) -> u32 {
    let mut x = v & 0xFFFF;
    x = (x | (x << 8)) & 0x00FF_00FF;
    x = (x | (x << 4)) & 0x0F0F_0F0F;
    x = (x | (x << 2)) & 0x3333_3333;
    x = (x | (x << 1)) & 0x5555_5555;
    x
}

/// Interleave two grid coordinates, x in the even bits
pub fn interleave(x: u32, y: u32) -> u32 {
    expand_bits(x) | (expand_bits(y) << 1)
}

/// Quantise a coordinate into `[0, GRID_MAX]` relative to `[min, max]`
pub fn quantize(value: f32, min: f32, max: f32) -> u32 {
    let extent = (max - min).max(f32::EPSILON);
    let t = ((value - min) / extent).clamp(0.0, 1.0);
    (t * GRID_MAX as f32) as u32
}

/// Morton code of a position inside `rect = [min_x, min_y, max_x, max_y]`
pub fn encode(x: f32, y: f32, rect: [f32; 4]) -> u32 {
    interleave(quantize(x, rect[0], rect[2]), quantize(y, rect[1], rect[3]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interleaves_bits() {
        assert_eq!(interleave(0, 0), 0);
        assert_eq!(interleave(1, 0), 0b01);
        assert_eq!(interleave(0, 1), 0b10);
        assert_eq!(interleave(0b11, 0b00), 0b0101);
        assert_eq!(interleave(GRID_MAX, GRID_MAX), u32::MAX);
    }

    #[test]
    fn quantize_clamps_to_grid() {
        assert_eq!(quantize(-5.0, 0.0, 1.0), 0);
        assert_eq!(quantize(5.0, 0.0, 1.0), GRID_MAX);
        assert_eq!(quantize(0.5, 0.0, 1.0), GRID_MAX / 2);
    }

    #[test]
    fn degenerate_rect_does_not_divide_by_zero() {
        let code = encode(1.0, 1.0, [1.0, 1.0, 1.0, 1.0]);
        assert_eq!(code, 0);
    }

    #[test]
    fn quadrants_are_ordered() {
        let rect = [0.0, 0.0, 1.0, 1.0];
        let low_left = encode(0.1, 0.1, rect);
        let low_right = encode(0.9, 0.1, rect);
        let up_left = encode(0.1, 0.9, rect);
        let up_right = encode(0.9, 0.9, rect);
        assert!(low_left < low_right);
        assert!(low_right < up_left);
        assert!(up_left < up_right);
    }
}
