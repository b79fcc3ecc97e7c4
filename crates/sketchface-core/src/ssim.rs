//! Structural similarity index on grayscale planes.
//!
//! Uniform 7×7 window, sample covariance, K1 = 0.01, K2 = 0.03, and the mean
//! taken over the interior where the window fits entirely inside the image.
//! These are the scikit-image defaults the reconstruction scores are
//! calibrated against.

use thiserror::Error;

const SSIM_WINDOW: usize = 7;
const SSIM_K1: f64 = 0.01;
const SSIM_K2: f64 = 0.03;

#[derive(Error, Debug, PartialEq)]
pub enum SsimError {
    #[error("plane size mismatch: {a} vs {b} samples")]
    SizeMismatch { a: usize, b: usize },
    #[error("plane {width}x{height} does not hold {len} samples")]
    BadDimensions { width: usize, height: usize, len: usize },
    #[error("image {width}x{height} is smaller than the 7x7 window")]
    TooSmall { width: usize, height: usize },
}

/// Summed-area table with a zero guard row and column.
struct Integral {
    stride: usize,
    sums: Vec<f64>,
}

impl Integral {
    fn build(width: usize, height: usize, value: impl Fn(usize) -> f64) -> Self {
        let stride = width + 1;
        let mut sums = vec![0.0f64; stride * (height + 1)];
        for y in 0..height {
            let mut row = 0.0f64;
            for x in 0..width {
                row += value(y * width + x);
                sums[(y + 1) * stride + x + 1] = sums[y * stride + x + 1] + row;
            }
        }
        Self { stride, sums }
    }

    /// Sum over the window whose top-left corner is (x, y).
    fn window(&self, x: usize, y: usize, size: usize) -> f64 {
        let s = self.stride;
        let (x1, y1) = (x + size, y + size);
        self.sums[y1 * s + x1] - self.sums[y * s + x1] - self.sums[y1 * s + x]
            + self.sums[y * s + x]
    }
}

/// Mean SSIM between two grayscale planes of identical size.
///
/// `data_range` is the dynamic range used for the stabilising constants.
/// A non-positive range (a perfectly flat image) falls back to 1.0, the
/// nominal range of normalized pixels.
pub fn structural_similarity(
    a: &[f32],
    b: &[f32],
    width: usize,
    height: usize,
    data_range: f32,
) -> Result<f64, SsimError> {
    if a.len() != b.len() {
        return Err(SsimError::SizeMismatch { a: a.len(), b: b.len() });
    }
    if width * height != a.len() {
        return Err(SsimError::BadDimensions {
            width,
            height,
            len: a.len(),
        });
    }
    if width < SSIM_WINDOW || height < SSIM_WINDOW {
        return Err(SsimError::TooSmall { width, height });
    }

    let range = if data_range > 0.0 && data_range.is_finite() {
        data_range as f64
    } else {
        1.0
    };
    let c1 = (SSIM_K1 * range).powi(2);
    let c2 = (SSIM_K2 * range).powi(2);

    let ia = Integral::build(width, height, |i| a[i] as f64);
    let ib = Integral::build(width, height, |i| b[i] as f64);
    let iaa = Integral::build(width, height, |i| (a[i] as f64).powi(2));
    let ibb = Integral::build(width, height, |i| (b[i] as f64).powi(2));
    let iab = Integral::build(width, height, |i| a[i] as f64 * b[i] as f64);

    let n = (SSIM_WINDOW * SSIM_WINDOW) as f64;
    let cov_norm = n / (n - 1.0);

    let mut total = 0.0f64;
    let mut count = 0usize;
    for y in 0..=(height - SSIM_WINDOW) {
        for x in 0..=(width - SSIM_WINDOW) {
            let ux = ia.window(x, y, SSIM_WINDOW) / n;
            let uy = ib.window(x, y, SSIM_WINDOW) / n;
            let uxx = iaa.window(x, y, SSIM_WINDOW) / n;
            let uyy = ibb.window(x, y, SSIM_WINDOW) / n;
            let uxy = iab.window(x, y, SSIM_WINDOW) / n;

            let vx = cov_norm * (uxx - ux * ux);
            let vy = cov_norm * (uyy - uy * uy);
            let vxy = cov_norm * (uxy - ux * uy);

            let num = (2.0 * ux * uy + c1) * (2.0 * vxy + c2);
            let den = (ux * ux + uy * uy + c1) * (vx + vy + c2);
            total += num / den;
            count += 1;
        }
    }

    Ok(total / count as f64)
}

/// `max - min` of a plane; 0.0 for an empty plane.
pub fn dynamic_range(plane: &[f32]) -> f32 {
    let mut lo = f32::INFINITY;
    let mut hi = f32::NEG_INFINITY;
    for &v in plane {
        lo = lo.min(v);
        hi = hi.max(v);
    }
    if hi >= lo { hi - lo } else { 0.0 }
}
