use image::{imageops, ImageBuffer, Luma};
use rayon::prelude::*;
use crate::config::SiftConfig;
use crate::types::Plane;

/// Gaussian and difference-of-Gaussian pyramids for one image
pub struct ScaleSpace {
    /// `n_layers + 3` progressively blurred levels per octave
    pub gaussians: Vec<Vec<Plane>>,
    /// `n_layers + 2` differences of adjacent Gaussian levels per octave
    pub dogs: Vec<Vec<Plane>>,
}

impl ScaleSpace {
    /// Build the scale space from a base plane with intensities in `[0, 1]`
    pub fn build(base: &Plane, cfg: &SiftConfig) -> Self {
        let n_octaves = cfg.octave_count(base.width, base.height);
        if n_octaves == 0 {
            return Self { gaussians: Vec::new(), dogs: Vec::new() };
        }
        let sigmas = Self::level_sigmas(cfg);

        let initial = (cfg.sigma * cfg.sigma - cfg.assumed_blur * cfg.assumed_blur).max(0.01).sqrt();
        let mut current = gaussian_blur(base, initial);
        let mut gaussians = Vec::with_capacity(n_octaves);

        for _ in 0..n_octaves {
            let mut levels = Vec::with_capacity(cfg.n_layers + 3);
            let mut prev = current;
            for sigma in sigmas.iter().skip(1) {
                let next = gaussian_blur(&prev, *sigma);
                levels.push(prev);
                prev = next;
            }
            levels.push(prev);
            // Level n_layers carries twice the base blur, so decimating it
            // seeds the next octave
            current = levels[cfg.n_layers].decimate();
            gaussians.push(levels);
        }

        let dogs = gaussians
            .par_iter()
            .map(|levels| levels.windows(2).map(|pair| pair[1].subtract(&pair[0])).collect())
            .collect();

        Self { gaussians, dogs }
    }

    /// Incremental blur applied to reach each level from the previous one
    pub fn level_sigmas(cfg: &SiftConfig) -> Vec<f32> {
        let k = 2f32.powf(1.0 / cfg.n_layers as f32);
        let mut sigmas = Vec::with_capacity(cfg.n_layers + 3);
        sigmas.push(cfg.sigma);
        for i in 1..cfg.n_layers + 3 {
            let prev = k.powi(i as i32 - 1) * cfg.sigma;
            let total = prev * k;
            sigmas.push((total * total - prev * prev).sqrt());
        }
        sigmas
    }

    pub fn octaves(&self) -> usize {
        self.gaussians.len()
    }
}

fn gaussian_blur(plane: &Plane, sigma: f32) -> Plane {
    let buffer: ImageBuffer<Luma<f32>, Vec<f32>> =
        ImageBuffer::from_fn(plane.width as u32, plane.height as u32, |x, y| {
            Luma([plane.at(x as usize, y as usize)])
        });
    let blurred = imageops::blur(&buffer, sigma);
    Plane::new(plane.width, plane.height, blurred.into_raw())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_sigmas_reach_double_blur() {
        let cfg = SiftConfig::default();
        let sigmas = ScaleSpace::level_sigmas(&cfg);
        assert_eq!(sigmas.len(), cfg.n_layers + 3);

        // Accumulated blur after n_layers steps is twice the base blur
        let total: f32 = sigmas[..=cfg.n_layers].iter().map(|s| s * s).sum::<f32>().sqrt();
        assert!((total - 2.0 * cfg.sigma).abs() < 1e-3);
    }

    #[test]
    fn test_pyramid_shape() {
        let cfg = SiftConfig::default();
        let base = Plane::new(64, 48, vec![0.5; 64 * 48]);
        let space = ScaleSpace::build(&base, &cfg);

        assert_eq!(space.octaves(), cfg.octave_count(64, 48));
        for (octave, levels) in space.gaussians.iter().enumerate() {
            assert_eq!(levels.len(), cfg.n_layers + 3);
            assert_eq!(space.dogs[octave].len(), cfg.n_layers + 2);
            assert_eq!(levels[0].width, 64 >> octave);
            assert_eq!(levels[0].height, 48 >> octave);
        }
    }

    #[test]
    fn test_flat_image_has_flat_dog() {
        let cfg = SiftConfig::default();
        let base = Plane::new(32, 32, vec![0.25; 32 * 32]);
        let space = ScaleSpace::build(&base, &cfg);
        for dog in space.dogs.iter().flatten() {
            assert!(dog.data.iter().all(|v| v.abs() < 1e-4));
        }
    }

    #[test]
    fn test_tiny_image_has_no_octaves() {
        let base = Plane::new(1, 1, vec![1.0]);
        let space = ScaleSpace::build(&base, &SiftConfig::default());
        assert_eq!(space.octaves(), 0);
        assert!(space.dogs.is_empty());
    }
}
