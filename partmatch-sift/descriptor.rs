use partmatch_core::{Descriptor, DESCRIPTOR_LEN};
use rayon::prelude::*;
use crate::pyramid::ScaleSpace;
use crate::types::{OctaveKeypoint, Plane};

/// Spatial cells per side
const DESCR_WIDTH: usize = 4;
/// Orientation bins per cell
const DESCR_HIST_BINS: usize = 8;
/// Cell width in units of keypoint scale
const DESCR_SCL_FCTR: f32 = 3.0;
/// Large gradient magnitudes are clamped to this fraction of the norm
const DESCR_MAG_THR: f32 = 0.2;
const INT_DESCR_FCTR: f32 = 512.0;

/// Gradient histogram descriptor generator
pub struct DescriptorGenerator<'a> {
    space: &'a ScaleSpace,
}

impl<'a> DescriptorGenerator<'a> {
    pub fn new(space: &'a ScaleSpace) -> Self {
        Self { space }
    }

    pub(crate) fn generate_descriptors(&self, kps: &[OctaveKeypoint]) -> Vec<Descriptor> {
        kps.par_iter()
            .map(|kp| {
                let img = &self.space.gaussians[kp.octave][kp.layer];
                let mut angle = 360.0 - kp.keypoint.angle;
                if (angle - 360.0).abs() < f32::EPSILON {
                    angle = 0.0;
                }
                describe(img, kp.octave_position(), angle, kp.scale_octave)
            })
            .collect()
    }
}

/// Compute the descriptor for a point in octave coordinates. `ori` is in
/// degrees, `scl` is the keypoint blur relative to the octave.
fn describe(img: &Plane, (px, py): (f32, f32), ori: f32, scl: f32) -> Descriptor {
    let d = DESCR_WIDTH;
    let n = DESCR_HIST_BINS;
    let (cx, cy) = (px.round() as i64, py.round() as i64);
    let (rows, cols) = (img.height as i64, img.width as i64);

    let (sin_t, cos_t) = ori.to_radians().sin_cos();
    let bins_per_deg = n as f32 / 360.0;
    let exp_scale = -1.0 / (d as f32 * d as f32 * 0.5);
    let hist_width = DESCR_SCL_FCTR * scl;
    let max_radius = ((rows * rows + cols * cols) as f32).sqrt();
    let radius = (hist_width * std::f32::consts::SQRT_2 * (d as f32 + 1.0) * 0.5)
        .round()
        .min(max_radius) as i64;
    let (cos_t, sin_t) = (cos_t / hist_width, sin_t / hist_width);

    // Padded histogram: one extra cell on every side and one extra
    // orientation bin for wrap-around
    let mut hist = vec![0.0f32; (d + 2) * (d + 2) * (n + 2)];

    for i in -radius..=radius {
        for j in -radius..=radius {
            let c_rot = j as f32 * cos_t - i as f32 * sin_t;
            let r_rot = j as f32 * sin_t + i as f32 * cos_t;
            let rbin = r_rot + d as f32 / 2.0 - 0.5;
            let cbin = c_rot + d as f32 / 2.0 - 0.5;
            let (r, c) = (cy + i, cx + j);

            if rbin <= -1.0 || rbin >= d as f32 || cbin <= -1.0 || cbin >= d as f32 {
                continue;
            }
            if r <= 0 || r >= rows - 1 || c <= 0 || c >= cols - 1 {
                continue;
            }

            let (ru, cu) = (r as usize, c as usize);
            let dx = img.at(cu + 1, ru) - img.at(cu - 1, ru);
            let dy = img.at(cu, ru - 1) - img.at(cu, ru + 1);
            let weight = ((c_rot * c_rot + r_rot * r_rot) * exp_scale).exp();
            let magnitude = (dx * dx + dy * dy).sqrt() * weight;
            let mut grad_ori = dy.atan2(dx).to_degrees();
            if grad_ori < 0.0 {
                grad_ori += 360.0;
            }
            let obin = (grad_ori - ori) * bins_per_deg;

            accumulate(&mut hist, rbin, cbin, obin, magnitude);
        }
    }

    let mut dst = vec![0.0f32; DESCRIPTOR_LEN];
    for i in 0..d {
        for j in 0..d {
            let idx = ((i + 1) * (d + 2) + (j + 1)) * (n + 2);
            hist[idx] += hist[idx + n];
            hist[idx + 1] += hist[idx + n + 1];
            for k in 0..n {
                dst[(i * d + j) * n + k] = hist[idx + k];
            }
        }
    }

    normalize(&mut dst);
    dst
}

/// Trilinear distribution of one sample over the neighbouring row, column
/// and orientation bins
fn accumulate(hist: &mut [f32], rbin: f32, cbin: f32, obin: f32, mag: f32) {
    let d = DESCR_WIDTH as i64;
    let n = DESCR_HIST_BINS as i64;

    let (r0, c0, o0) = (rbin.floor(), cbin.floor(), obin.floor());
    let (rf, cf, of) = (rbin - r0, cbin - c0, obin - o0);
    let (r0, c0) = (r0 as i64, c0 as i64);
    let o0 = (o0 as i64).rem_euclid(n);

    let v_r1 = mag * rf;
    let v_r0 = mag - v_r1;
    let v_rc11 = v_r1 * cf;
    let v_rc10 = v_r1 - v_rc11;
    let v_rc01 = v_r0 * cf;
    let v_rc00 = v_r0 - v_rc01;
    let v_rco111 = v_rc11 * of;
    let v_rco110 = v_rc11 - v_rco111;
    let v_rco101 = v_rc10 * of;
    let v_rco100 = v_rc10 - v_rco101;
    let v_rco011 = v_rc01 * of;
    let v_rco010 = v_rc01 - v_rco011;
    let v_rco001 = v_rc00 * of;
    let v_rco000 = v_rc00 - v_rco001;

    let idx = (((r0 + 1) * (d + 2) + c0 + 1) * (n + 2) + o0) as usize;
    let row = ((d + 2) * (n + 2)) as usize;
    let col = (n + 2) as usize;

    hist[idx] += v_rco000;
    hist[idx + 1] += v_rco001;
    hist[idx + col] += v_rco010;
    hist[idx + col + 1] += v_rco011;
    hist[idx + row] += v_rco100;
    hist[idx + row + 1] += v_rco101;
    hist[idx + row + col] += v_rco110;
    hist[idx + row + col + 1] += v_rco111;
}

/// Unit-normalise, clamp large components, renormalise and scale into the
/// byte range
fn normalize(dst: &mut [f32]) {
    let norm = dst.iter().map(|v| v * v).sum::<f32>().sqrt();
    let threshold = norm * DESCR_MAG_THR;

    let mut clamped_sq = 0.0f32;
    for v in dst.iter_mut() {
        *v = v.min(threshold);
        clamped_sq += *v * *v;
    }

    let scale = INT_DESCR_FCTR / clamped_sq.sqrt().max(f32::EPSILON);
    for v in dst.iter_mut() {
        *v = (*v * scale).round().clamp(0.0, 255.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn textured_plane(size: usize) -> Plane {
        let data = (0..size * size)
            .map(|i| {
                let (x, y) = ((i % size) as f32, (i / size) as f32);
                0.5 + 0.25 * (x * 0.35).sin() * (y * 0.2).cos()
            })
            .collect();
        Plane::new(size, size, data)
    }

    #[test]
    fn test_descriptor_length_and_range() {
        let img = textured_plane(64);
        let desc = describe(&img, (32.0, 32.0), 0.0, 2.0);
        assert_eq!(desc.len(), DESCRIPTOR_LEN);
        assert!(desc.iter().all(|v| (0.0..=255.0).contains(v)));
        assert!(desc.iter().any(|v| *v > 0.0));
    }

    #[test]
    fn test_flat_patch_gives_zero_descriptor() {
        let img = Plane::new(32, 32, vec![0.5; 32 * 32]);
        let desc = describe(&img, (16.0, 16.0), 45.0, 1.6);
        assert!(desc.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_clamped_components() {
        let mut v = vec![0.0f32; DESCRIPTOR_LEN];
        v[0] = 10.0;
        v[1] = 1.0;
        normalize(&mut v);
        // The dominant component is clamped, so it no longer saturates
        // the rest of the vector
        assert!(v[1] > 0.0);
        assert!(v[0] <= 255.0);
    }

    #[test]
    fn test_descriptor_depends_on_orientation() {
        let img = textured_plane(64);
        let a = describe(&img, (32.0, 32.0), 0.0, 2.0);
        let b = describe(&img, (32.0, 32.0), 90.0, 2.0);
        assert_ne!(a, b);
    }
}
