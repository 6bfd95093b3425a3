//! Pixel-to-angle control math.

pub mod coordinate;
