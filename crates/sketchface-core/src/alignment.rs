//! Five-point face alignment.
//!
//! Estimates the least-squares similarity transform (scale, rotation,
//! translation) that maps detected landmarks onto canonical positions and
//! warps the face into a square RGB crop for the embedding model.

use image::{Rgb, RgbImage};

/// Canonical landmark positions in a 112×112 crop; scaled for other sizes.
const REFERENCE_LANDMARKS_112: [(f32, f32); 5] = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

/// Similarity transform `dst = [a -b; b a] * src + t`.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Similarity {
    a: f32,
    b: f32,
    tx: f32,
    ty: f32,
}

impl Similarity {
    /// Closed-form least squares over centred point sets.
    fn estimate(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> Option<Self> {
        let centroid = |pts: &[(f32, f32); 5]| {
            let (sx, sy) = pts.iter().fold((0.0, 0.0), |(ax, ay), &(x, y)| (ax + x, ay + y));
            (sx / 5.0, sy / 5.0)
        };
        let (msx, msy) = centroid(src);
        let (mdx, mdy) = centroid(dst);

        let (mut dot, mut cross, mut norm) = (0.0f32, 0.0f32, 0.0f32);
        for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst.iter()) {
            let (sx, sy) = (sx - msx, sy - msy);
            let (dx, dy) = (dx - mdx, dy - mdy);
            dot += sx * dx + sy * dy;
            cross += sx * dy - sy * dx;
            norm += sx * sx + sy * sy;
        }
        if norm < 1e-9 {
            return None;
        }

        let a = dot / norm;
        let b = cross / norm;
        Some(Self {
            a,
            b,
            tx: mdx - (a * msx - b * msy),
            ty: mdy - (b * msx + a * msy),
        })
    }

    /// Map a destination pixel back into the source image.
    fn invert_point(&self, x: f32, y: f32) -> Option<(f32, f32)> {
        let det = self.a * self.a + self.b * self.b;
        if det < 1e-12 {
            return None;
        }
        let (dx, dy) = (x - self.tx, y - self.ty);
        Some(((self.a * dx + self.b * dy) / det, (-self.b * dx + self.a * dy) / det))
    }
}

/// Bilinear sample; out-of-bounds neighbours contribute black.
fn sample_bilinear(image: &RgbImage, sx: f32, sy: f32) -> Rgb<u8> {
    let (x0, y0) = (sx.floor() as i64, sy.floor() as i64);
    let (fx, fy) = (sx - x0 as f32, sy - y0 as f32);
    let (w, h) = (image.width() as i64, image.height() as i64);

    let texel = |x: i64, y: i64| -> [f32; 3] {
        if x >= 0 && x < w && y >= 0 && y < h {
            let p = image.get_pixel(x as u32, y as u32);
            [p[0] as f32, p[1] as f32, p[2] as f32]
        } else {
            [0.0; 3]
        }
    };

    let (tl, tr) = (texel(x0, y0), texel(x0 + 1, y0));
    let (bl, br) = (texel(x0, y0 + 1), texel(x0 + 1, y0 + 1));
    Rgb(std::array::from_fn(|c| {
        let v = tl[c] * (1.0 - fx) * (1.0 - fy)
            + tr[c] * fx * (1.0 - fy)
            + bl[c] * (1.0 - fx) * fy
            + br[c] * fx * fy;
        v.round().clamp(0.0, 255.0) as u8
    }))
}

/// Reference landmarks for a `size`×`size` crop.
pub fn reference_landmarks(size: u32) -> [(f32, f32); 5] {
    let k = size as f32 / 112.0;
    REFERENCE_LANDMARKS_112.map(|(x, y)| (x * k, y * k))
}

/// Align a face to a canonical `size`×`size` crop.
///
/// Degenerate landmarks (all coincident) fall back to a plain resize of the
/// whole image.
pub fn align_face(image: &RgbImage, landmarks: &[(f32, f32); 5], size: u32) -> RgbImage {
    let Some(m) = Similarity::estimate(landmarks, &reference_landmarks(size)) else {
        return image::imageops::resize(image, size, size, image::imageops::FilterType::Triangle);
    };

    RgbImage::from_fn(size, size, |x, y| match m.invert_point(x as f32, y as f32) {
        Some((sx, sy)) => sample_bilinear(image, sx, sy),
        None => Rgb([0, 0, 0]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_transform() {
        let pts = REFERENCE_LANDMARKS_112;
        let m = Similarity::estimate(&pts, &pts).unwrap();
        assert!((m.a - 1.0).abs() < 1e-4, "a = {}", m.a);
        assert!(m.b.abs() < 1e-4, "b = {}", m.b);
        assert!(m.tx.abs() < 1e-3 && m.ty.abs() < 1e-3, "t = ({}, {})", m.tx, m.ty);
    }

    #[test]
    fn test_scaled_and_rotated_transform() {
        // Source at 2x scale, rotated 90°: (x, y) -> (-2y, 2x) + (300, 0).
        let src = REFERENCE_LANDMARKS_112.map(|(x, y)| (300.0 - 2.0 * y, 2.0 * x));
        let m = Similarity::estimate(&src, &REFERENCE_LANDMARKS_112).unwrap();
        // Inverse mapping: scale 0.5, rotation -90°.
        assert!(m.a.abs() < 1e-4, "a = {}", m.a);
        assert!((m.b + 0.5).abs() < 1e-4, "b = {}", m.b);
    }

    #[test]
    fn test_degenerate_landmarks() {
        let pts = [(10.0, 10.0); 5];
        assert!(Similarity::estimate(&pts, &REFERENCE_LANDMARKS_112).is_none());
        let out = align_face(&RgbImage::new(50, 40), &pts, 160);
        assert_eq!(out.dimensions(), (160, 160));
    }

    #[test]
    fn test_reference_scaling() {
        let r = reference_landmarks(224);
        assert!((r[0].0 - 2.0 * 38.2946).abs() < 1e-4);
        assert_eq!(reference_landmarks(112), REFERENCE_LANDMARKS_112);
    }

    #[test]
    fn test_landmark_lands_on_reference() {
        let mut image = RgbImage::new(200, 200);
        let src: [(f32, f32); 5] = [
            (80.0, 60.0),
            (120.0, 60.0),
            (100.0, 85.0),
            (85.0, 110.0),
            (115.0, 110.0),
        ];

        // Bright 5x5 patch on the left eye survives bilinear interpolation.
        for dy in 0..5 {
            for dx in 0..5 {
                image.put_pixel(78 + dx, 58 + dy, Rgb([255, 200, 100]));
            }
        }

        let aligned = align_face(&image, &src, 112);
        let (rx, ry) = (
            REFERENCE_LANDMARKS_112[0].0.round() as u32,
            REFERENCE_LANDMARKS_112[0].1.round() as u32,
        );
        let brightest = (rx - 1..=rx + 1)
            .flat_map(|x| (ry - 1..=ry + 1).map(move |y| (x, y)))
            .map(|(x, y)| aligned.get_pixel(x, y)[0])
            .max()
            .unwrap();
        assert!(brightest > 100, "max red near reference eye = {brightest}");
    }
}
