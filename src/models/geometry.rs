//! Spatial bookkeeping for the encoder/decoder networks.
//!
//! Transposed convolutions only recover the size of the matching skip feature map
//! when their padding and output padding are chosen for the exact input
//! resolution. Rather than hard-coding the values that happen to work for one
//! resolution, the networks derive them here at construction time and reject
//! resolutions for which no valid output padding exists.

use serde::{Deserialize, Serialize};

use crate::core::{DetectorError, DetectorResult};

/// Input resolution of a network, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub height: usize,
    pub width: usize,
}

impl Resolution {
    /// Page size the production checkpoints were trained at.
    pub const DEFAULT: Resolution = Resolution {
        height: 1176,
        width: 828,
    };

    pub const fn new(height: usize, width: usize) -> Self {
        Self { height, width }
    }

    pub fn dims(self) -> (usize, usize) {
        (self.height, self.width)
    }

    /// Output size of a 2x2 / stride-2 max pool (floor).
    pub fn halved(self) -> Self {
        Self::new(self.height / 2, self.width / 2)
    }

    /// Output size of a convolution or pooling window applied on both axes.
    pub fn after_window(self, kernel: usize, stride: usize, padding: usize) -> DetectorResult<Self> {
        Ok(Self::new(
            window_output(self.height, kernel, stride, padding)?,
            window_output(self.width, kernel, stride, padding)?,
        ))
    }
}

impl Default for Resolution {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.height, self.width)
    }
}

/// Output length of a sliding window over one axis.
pub fn window_output(len: usize, kernel: usize, stride: usize, padding: usize) -> DetectorResult<usize> {
    let padded = len + 2 * padding;
    if padded < kernel || stride == 0 {
        return Err(DetectorError::config(format!(
            "window of {kernel} (stride {stride}, padding {padding}) does not fit an axis of {len}"
        )));
    }
    Ok((padded - kernel) / stride + 1)
}

/// A per-axis pair (height, width).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Pad2 {
    pub h: usize,
    pub w: usize,
}

impl Pad2 {
    pub const ZERO: Pad2 = Pad2 { h: 0, w: 0 };
    pub const ONE: Pad2 = Pad2 { h: 1, w: 1 };

    pub const fn new(h: usize, w: usize) -> Self {
        Self { h, w }
    }

    pub fn is_symmetric(self) -> bool {
        self.h == self.w
    }
}

impl From<(usize, usize)> for Pad2 {
    fn from((h, w): (usize, usize)) -> Self {
        Self { h, w }
    }
}

/// Geometry of one stride-2 transposed convolution in a decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsampleGeometry {
    pub kernel: usize,
    pub stride: usize,
    pub padding: Pad2,
    pub output_padding: Pad2,
}

impl UpsampleGeometry {
    pub const KERNEL: usize = 3;
    pub const STRIDE: usize = 2;

    /// Derives the output padding that maps `input` onto exactly `target`.
    ///
    /// Fails when the configured padding makes `target` unreachable, i.e. the
    /// required output padding would be negative or not smaller than the stride.
    pub fn fit(input: Resolution, target: Resolution, padding: Pad2) -> DetectorResult<Self> {
        let kernel = Self::KERNEL;
        let stride = Self::STRIDE;
        let solve = |axis: &str, n: usize, want: usize, p: usize| -> DetectorResult<usize> {
            let base = ((n.max(1) - 1) * stride + kernel) as isize - 2 * p as isize;
            let op = want as isize - base;
            if op < 0 || op >= stride as isize {
                return Err(DetectorError::config(format!(
                    "cannot upsample {axis} {n} -> {want} with padding {p}: output padding would be {op}"
                )));
            }
            Ok(op as usize)
        };
        let output_padding = Pad2::new(
            solve("height", input.height, target.height, padding.h)?,
            solve("width", input.width, target.width, padding.w)?,
        );
        Ok(Self {
            kernel,
            stride,
            padding,
            output_padding,
        })
    }

    /// Output resolution for a given input.
    pub fn output(&self, input: Resolution) -> Resolution {
        let axis = |n: usize, p: usize, op: usize| (n - 1) * self.stride + self.kernel + op - 2 * p;
        Resolution::new(
            axis(input.height, self.padding.h, self.output_padding.h),
            axis(input.width, self.padding.w, self.output_padding.w),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_output_matches_resnet_stem() {
        // conv1 7x7/2 pad 3 then maxpool 3x3/2 pad 1
        let stem = Resolution::DEFAULT.after_window(7, 2, 3).unwrap();
        assert_eq!(stem, Resolution::new(588, 414));
        let pooled = stem.after_window(3, 2, 1).unwrap();
        assert_eq!(pooled, Resolution::new(294, 207));
        assert_eq!(pooled.after_window(3, 2, 1).unwrap(), Resolution::new(147, 104));
    }

    #[test]
    fn test_fit_reproduces_odd_axis() {
        let g = UpsampleGeometry::fit(
            Resolution::new(147, 104),
            Resolution::new(294, 207),
            Pad2::ONE,
        )
        .unwrap();
        assert_eq!(g.output_padding, Pad2::new(1, 0));
        assert_eq!(g.output(Resolution::new(147, 104)), Resolution::new(294, 207));
    }

    #[test]
    fn test_fit_rejects_unreachable_target() {
        // padding 0 on the width axis overshoots an even target
        let err = UpsampleGeometry::fit(
            Resolution::new(32, 32),
            Resolution::new(64, 64),
            Pad2::new(1, 0),
        );
        assert!(err.is_err());
    }

    #[test]
    fn test_halved_floors() {
        assert_eq!(Resolution::new(147, 103).halved(), Resolution::new(73, 51));
    }
}
