use partmatch_core::Keypoint;
use rayon::prelude::*;
use crate::config::{SiftConfig, IMAGE_BORDER};
use crate::pyramid::ScaleSpace;
use crate::types::{OctaveKeypoint, Plane};

/// Sub-pixel interpolation attempts before an extremum is dropped
const MAX_INTERP_STEPS: usize = 5;

const ORI_HIST_BINS: usize = 36;
const ORI_SIG_FCTR: f32 = 1.5;
const ORI_RADIUS: f32 = 3.0 * ORI_SIG_FCTR;
/// Secondary histogram peaks at or above this fraction of the maximum
/// spawn additional keypoints
const ORI_PEAK_RATIO: f32 = 0.8;

/// Scale-space extremum detector with sub-pixel refinement and
/// orientation assignment
pub struct ExtremaDetector<'a> {
    cfg: &'a SiftConfig,
    space: &'a ScaleSpace,
}

impl<'a> ExtremaDetector<'a> {
    pub fn new(cfg: &'a SiftConfig, space: &'a ScaleSpace) -> Self {
        Self { cfg, space }
    }

    /// Detect oriented keypoints across all octaves, in octave, layer and
    /// raster order
    pub(crate) fn detect(&self) -> Vec<OctaveKeypoint> {
        let threshold = 0.5 * self.cfg.contrast_threshold / self.cfg.n_layers as f32;
        let mut keypoints = Vec::new();

        for (octave, dogs) in self.space.dogs.iter().enumerate() {
            let (w, h) = (dogs[0].width, dogs[0].height);
            if w <= 2 * IMAGE_BORDER || h <= 2 * IMAGE_BORDER {
                continue;
            }

            for layer in 1..=self.cfg.n_layers {
                let found: Vec<OctaveKeypoint> = (IMAGE_BORDER..h - IMAGE_BORDER)
                    .into_par_iter()
                    .flat_map_iter(|r| {
                        let mut v = Vec::new();
                        for c in IMAGE_BORDER..w - IMAGE_BORDER {
                            let val = dogs[layer].at(c, r);
                            if val.abs() > threshold && is_extremum(dogs, layer, c, r, val) {
                                if let Some(kp) = self.localize(octave, layer, c, r) {
                                    v.extend(self.assign_orientations(kp));
                                }
                            }
                        }
                        v
                    })
                    .collect();
                keypoints.extend(found);
            }
        }

        keypoints
    }

    /// Fit a quadratic to the DoG around (c, r, layer) and move to the
    /// interpolated extremum. Rejects low contrast and edge responses.
    fn localize(&self, octave: usize, layer: usize, c: usize, r: usize) -> Option<OctaveKeypoint> {
        let dogs = &self.space.dogs[octave];
        let n_layers = self.cfg.n_layers;
        let (w, h) = (dogs[0].width as i64, dogs[0].height as i64);
        let border = IMAGE_BORDER as i64;

        let (mut layer, mut c, mut r) = (layer, c, r);
        let mut steps = 0;

        let (offset, grad, hess) = loop {
            let (grad, hess) = derivatives(dogs, layer, c, r);
            let solved = solve3(&hess, &grad)?;
            let offset = [-solved[0], -solved[1], -solved[2]];

            if offset.iter().all(|v| v.abs() < 0.5) {
                break (offset, grad, hess);
            }
            if offset.iter().any(|v| v.abs() > (i32::MAX / 3) as f32) {
                return None;
            }

            steps += 1;
            if steps >= MAX_INTERP_STEPS {
                return None;
            }

            let nc = c as i64 + offset[0].round() as i64;
            let nr = r as i64 + offset[1].round() as i64;
            let nl = layer as i64 + offset[2].round() as i64;
            if nl < 1 || nl > n_layers as i64 || nc < border || nc >= w - border || nr < border || nr >= h - border {
                return None;
            }
            c = nc as usize;
            r = nr as usize;
            layer = nl as usize;
        };

        let dot: f32 = grad.iter().zip(offset.iter()).map(|(g, o)| g * o).sum();
        let contrast = dogs[layer].at(c, r) + 0.5 * dot;
        if contrast.abs() * (n_layers as f32) < self.cfg.contrast_threshold {
            return None;
        }

        // Principal curvature ratio
        let (dxx, dyy, dxy) = (hess[0][0], hess[1][1], hess[0][1]);
        let trace = dxx + dyy;
        let det = dxx * dyy - dxy * dxy;
        let edge = self.cfg.edge_threshold;
        if det <= 0.0 || trace * trace * edge >= (edge + 1.0) * (edge + 1.0) * det {
            return None;
        }

        let scale = (1u32 << octave) as f32;
        let scale_octave = self.cfg.sigma * 2f32.powf((layer as f32 + offset[2]) / n_layers as f32);
        let keypoint = Keypoint {
            x: (c as f32 + offset[0]) * scale,
            y: (r as f32 + offset[1]) * scale,
            size: scale_octave * scale * 2.0,
            angle: 0.0,
            response: contrast.abs(),
            octave: octave as i32,
            class_id: -1,
        };

        Some(OctaveKeypoint {
            keypoint,
            octave,
            layer,
            scale_octave,
        })
    }

    /// One keypoint per dominant gradient direction around `kp`
    fn assign_orientations(&self, kp: OctaveKeypoint) -> Vec<OctaveKeypoint> {
        let img = &self.space.gaussians[kp.octave][kp.layer];
        let (px, py) = kp.octave_position();
        let hist = orientation_histogram(img, px.round() as i64, py.round() as i64, kp.scale_octave);

        let max = hist.iter().cloned().fold(0.0f32, f32::max);
        let n = ORI_HIST_BINS;
        let mut oriented = Vec::new();

        for j in 0..n {
            let left = hist[(j + n - 1) % n];
            let right = hist[(j + 1) % n];
            if hist[j] > left && hist[j] > right && hist[j] >= ORI_PEAK_RATIO * max {
                // Parabolic interpolation of the peak position
                let mut bin = j as f32 + 0.5 * (left - right) / (left - 2.0 * hist[j] + right);
                if bin < 0.0 {
                    bin += n as f32;
                } else if bin >= n as f32 {
                    bin -= n as f32;
                }
                let mut angle = 360.0 - (360.0 / n as f32) * bin;
                if (angle - 360.0).abs() < f32::EPSILON {
                    angle = 0.0;
                }
                let mut out = kp;
                out.keypoint.angle = angle;
                oriented.push(out);
            }
        }

        oriented
    }
}

/// Smoothed, Gaussian-weighted histogram of gradient directions
fn orientation_histogram(img: &Plane, cx: i64, cy: i64, scale_octave: f32) -> [f32; ORI_HIST_BINS] {
    let n = ORI_HIST_BINS as i64;
    let radius = (ORI_RADIUS * scale_octave).round() as i64;
    let sigma_w = ORI_SIG_FCTR * scale_octave;
    let exp_scale = -1.0 / (2.0 * sigma_w * sigma_w);
    let (w, h) = (img.width as i64, img.height as i64);
    let mut raw = [0.0f32; ORI_HIST_BINS];

    for i in -radius..=radius {
        let y = cy + i;
        if y <= 0 || y >= h - 1 {
            continue;
        }
        for j in -radius..=radius {
            let x = cx + j;
            if x <= 0 || x >= w - 1 {
                continue;
            }
            let (xu, yu) = (x as usize, y as usize);
            let dx = img.at(xu + 1, yu) - img.at(xu - 1, yu);
            let dy = img.at(xu, yu - 1) - img.at(xu, yu + 1);
            let weight = (((i * i + j * j) as f32) * exp_scale).exp();
            let magnitude = (dx * dx + dy * dy).sqrt();
            let mut ori = dy.atan2(dx).to_degrees();
            if ori < 0.0 {
                ori += 360.0;
            }
            let mut bin = (ori * n as f32 / 360.0).round() as i64;
            if bin >= n {
                bin -= n;
            }
            if bin < 0 {
                bin += n;
            }
            raw[bin as usize] += weight * magnitude;
        }
    }

    let mut smooth = [0.0f32; ORI_HIST_BINS];
    let at = |k: i64| raw[k.rem_euclid(n) as usize];
    for (k, slot) in smooth.iter_mut().enumerate() {
        let k = k as i64;
        *slot = (at(k - 2) + at(k + 2)) * (1.0 / 16.0)
            + (at(k - 1) + at(k + 1)) * (4.0 / 16.0)
            + at(k) * (6.0 / 16.0);
    }
    smooth
}

/// True when `val` is not exceeded (maximum) or not undercut (minimum) by
/// any of its 26 scale-space neighbours
fn is_extremum(dogs: &[Plane], layer: usize, c: usize, r: usize, val: f32) -> bool {
    for plane in &dogs[layer - 1..=layer + 1] {
        for y in r - 1..=r + 1 {
            for x in c - 1..=c + 1 {
                let q = plane.at(x, y);
                if (val > 0.0 && q > val) || (val <= 0.0 && q < val) {
                    return false;
                }
            }
        }
    }
    true
}

/// Gradient `(dx, dy, ds)` and Hessian of the DoG at (c, r, layer)
fn derivatives(dogs: &[Plane], layer: usize, c: usize, r: usize) -> ([f32; 3], [[f32; 3]; 3]) {
    let (prev, img, next) = (&dogs[layer - 1], &dogs[layer], &dogs[layer + 1]);
    let v2 = img.at(c, r) * 2.0;

    let grad = [
        (img.at(c + 1, r) - img.at(c - 1, r)) * 0.5,
        (img.at(c, r + 1) - img.at(c, r - 1)) * 0.5,
        (next.at(c, r) - prev.at(c, r)) * 0.5,
    ];

    let dxx = img.at(c + 1, r) + img.at(c - 1, r) - v2;
    let dyy = img.at(c, r + 1) + img.at(c, r - 1) - v2;
    let dss = next.at(c, r) + prev.at(c, r) - v2;
    let dxy = (img.at(c + 1, r + 1) - img.at(c - 1, r + 1) - img.at(c + 1, r - 1) + img.at(c - 1, r - 1)) * 0.25;
    let dxs = (next.at(c + 1, r) - next.at(c - 1, r) - prev.at(c + 1, r) + prev.at(c - 1, r)) * 0.25;
    let dys = (next.at(c, r + 1) - next.at(c, r - 1) - prev.at(c, r + 1) + prev.at(c, r - 1)) * 0.25;

    (grad, [[dxx, dxy, dxs], [dxy, dyy, dys], [dxs, dys, dss]])
}

/// Solve `m * x = b` for a symmetric 3x3 system by Cramer's rule
fn solve3(m: &[[f32; 3]; 3], b: &[f32; 3]) -> Option<[f32; 3]> {
    let m: [[f64; 3]; 3] = m.map(|row| row.map(f64::from));
    let b = b.map(f64::from);
    let det3 = |a: &[[f64; 3]; 3]| {
        a[0][0] * (a[1][1] * a[2][2] - a[1][2] * a[2][1])
            - a[0][1] * (a[1][0] * a[2][2] - a[1][2] * a[2][0])
            + a[0][2] * (a[1][0] * a[2][1] - a[1][1] * a[2][0])
    };

    let det = det3(&m);
    if det.abs() < 1e-12 {
        return None;
    }

    let mut x = [0.0f32; 3];
    for (col, slot) in x.iter_mut().enumerate() {
        let mut replaced = m;
        for row in 0..3 {
            replaced[row][col] = b[row];
        }
        *slot = (det3(&replaced) / det) as f32;
    }
    Some(x)
}
