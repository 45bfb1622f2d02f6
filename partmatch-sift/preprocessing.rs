use image::GrayImage;
use imageproc::contrast::equalize_histogram;
use imageproc::filter::gaussian_blur_f32;
use crate::config::Preprocessing;

/// Tile geometry of a CLAHE pass: the image is split into `grid` tiles per
/// axis, each `ceil(dim / grid)` pixels wide
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileLayout {
    pub tile_width: usize,
    pub tile_height: usize,
    pub tiles_x: usize,
    pub tiles_y: usize,
}

impl TileLayout {
    pub fn new(width: usize, height: usize, grid: usize) -> Self {
        let grid = grid.max(1);
        let tile_width = width.div_ceil(grid).max(1);
        let tile_height = height.div_ceil(grid).max(1);
        Self {
            tile_width,
            tile_height,
            tiles_x: width.div_ceil(tile_width),
            tiles_y: height.div_ceil(tile_height),
        }
    }
}

/// Image preprocessing algorithms (histogram equalisation, smoothing, CLAHE)
pub struct ImagePreprocessing;

impl ImagePreprocessing {
    /// Apply the configured steps in order: equalise, blur, CLAHE
    pub fn apply(img: &GrayImage, steps: &Preprocessing) -> GrayImage {
        let mut out = img.clone();
        if steps.equalize_histogram {
            out = equalize_histogram(&out);
        }
        if let Some(sigma) = steps.blur_sigma {
            out = gaussian_blur_f32(&out, sigma);
        }
        if steps.clahe {
            out = Self::apply_clahe(&out, steps.clahe_grid, steps.clahe_clip_limit);
        }
        out
    }

    /// Apply CLAHE (Contrast Limited Adaptive Histogram Equalization) over
    /// a `grid` x `grid` layout of tiles
    pub fn apply_clahe(img: &GrayImage, grid: usize, clip_limit: f32) -> GrayImage {
        let (width, height) = (img.width() as usize, img.height() as usize);
        if width == 0 || height == 0 || grid == 0 {
            return img.clone();
        }
        let layout = TileLayout::new(width, height, grid);

        let histograms = Self::compute_tile_histograms(img, &layout);
        let limited_histograms = Self::apply_contrast_limiting(&histograms, clip_limit);
        let tile_cdfs = Self::compute_tile_cdfs(&limited_histograms);

        Self::apply_adaptive_equalization(img, &tile_cdfs, &layout)
    }

    fn compute_tile_histograms(img: &GrayImage, layout: &TileLayout) -> Vec<[u32; 256]> {
        let (width, height) = (img.width() as usize, img.height() as usize);
        let mut histograms = Vec::with_capacity(layout.tiles_x * layout.tiles_y);

        for tile_y in 0..layout.tiles_y {
            for tile_x in 0..layout.tiles_x {
                let mut histogram = [0u32; 256];
                let end_x = ((tile_x + 1) * layout.tile_width).min(width);
                let end_y = ((tile_y + 1) * layout.tile_height).min(height);

                for y in tile_y * layout.tile_height..end_y {
                    for x in tile_x * layout.tile_width..end_x {
                        histogram[img.get_pixel(x as u32, y as u32)[0] as usize] += 1;
                    }
                }
                histograms.push(histogram);
            }
        }
        histograms
    }

    /// Clip every bin at `clip_limit` times the mean bin height and spread
    /// the excess uniformly
    fn apply_contrast_limiting(histograms: &[[u32; 256]], clip_limit: f32) -> Vec<[u32; 256]> {
        histograms
            .iter()
            .map(|histogram| {
                let total_pixels: u32 = histogram.iter().sum();
                let clip_threshold = ((total_pixels as f32 / 256.0) * clip_limit).max(1.0) as u32;

                let mut limited = *histogram;
                let mut excess = 0u32;
                for count in limited.iter_mut() {
                    if *count > clip_threshold {
                        excess += *count - clip_threshold;
                        *count = clip_threshold;
                    }
                }

                let redistribution = excess / 256;
                let remainder = (excess % 256) as usize;
                for (i, count) in limited.iter_mut().enumerate() {
                    *count += redistribution;
                    if i < remainder {
                        *count += 1;
                    }
                }
                limited
            })
            .collect()
    }

    fn compute_tile_cdfs(histograms: &[[u32; 256]]) -> Vec<[f32; 256]> {
        histograms
            .iter()
            .map(|histogram| {
                let total_pixels: u32 = histogram.iter().sum();
                let mut cdf = [0.0f32; 256];
                if total_pixels == 0 {
                    return cdf;
                }
                let mut cumulative = 0u32;
                for (slot, &count) in cdf.iter_mut().zip(histogram.iter()) {
                    cumulative += count;
                    *slot = (cumulative as f32 / total_pixels as f32) * 255.0;
                }
                cdf
            })
            .collect()
    }

    /// Map each pixel through a bilinear blend of the four nearest tile CDFs
    fn apply_adaptive_equalization(
        img: &GrayImage,
        tile_cdfs: &[[f32; 256]],
        layout: &TileLayout,
    ) -> GrayImage {
        let (tiles_x, tiles_y) = (layout.tiles_x, layout.tiles_y);
        let (tile_w, tile_h) = (layout.tile_width as f32, layout.tile_height as f32);
        GrayImage::from_fn(img.width(), img.height(), |x, y| {
            let pixel = img.get_pixel(x, y)[0] as usize;

            // Tile-centre coordinates of this pixel
            let gx = ((x as f32 + 0.5) / tile_w - 0.5).clamp(0.0, (tiles_x - 1) as f32);
            let gy = ((y as f32 + 0.5) / tile_h - 0.5).clamp(0.0, (tiles_y - 1) as f32);
            let (x0, y0) = (gx.floor() as usize, gy.floor() as usize);
            let (x1, y1) = ((x0 + 1).min(tiles_x - 1), (y0 + 1).min(tiles_y - 1));
            let (fx, fy) = (gx - x0 as f32, gy - y0 as f32);

            let lookup = |tx: usize, ty: usize| tile_cdfs[ty * tiles_x + tx][pixel];
            let top = lookup(x0, y0) * (1.0 - fx) + lookup(x1, y0) * fx;
            let bottom = lookup(x0, y1) * (1.0 - fx) + lookup(x1, y1) * fx;

            image::Luma([(top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8])
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient_image(width: u32, height: u32) -> GrayImage {
        GrayImage::from_fn(width, height, |x, _| image::Luma([(60 + x % 40) as u8]))
    }

    #[test]
    fn test_identity_steps_leave_image_unchanged() {
        let img = gradient_image(32, 32);
        let out = ImagePreprocessing::apply(&img, &Preprocessing::default());
        assert_eq!(out, img);
    }

    #[test]
    fn test_clahe_preserves_dimensions() {
        let img = gradient_image(37, 21);
        let out = ImagePreprocessing::apply_clahe(&img, 8, 2.0);
        assert_eq!(out.dimensions(), (37, 21));
    }

    #[test]
    fn test_clahe_lifts_dark_low_contrast_image() {
        let img = gradient_image(64, 64);
        let out = ImagePreprocessing::apply_clahe(&img, 8, 2.0);
        let mean = |im: &GrayImage| im.pixels().map(|p| p[0] as f32).sum::<f32>() / (64.0 * 64.0);
        assert!(mean(&out) > mean(&img));
    }

    #[test]
    fn test_tile_layout_is_a_fixed_grid() {
        let layout = TileLayout::new(256, 256, 8);
        assert_eq!((layout.tiles_x, layout.tiles_y), (8, 8));
        assert_eq!((layout.tile_width, layout.tile_height), (32, 32));

        let layout = TileLayout::new(640, 480, 8);
        assert_eq!((layout.tiles_x, layout.tiles_y), (8, 8));
        assert_eq!((layout.tile_width, layout.tile_height), (80, 60));

        // Ragged sizes never produce more tiles than the grid
        let layout = TileLayout::new(37, 21, 8);
        assert_eq!((layout.tile_width, layout.tile_height), (5, 3));
        assert!(layout.tiles_x <= 8 && layout.tiles_y <= 8);

        let layout = TileLayout::new(5, 5, 8);
        assert_eq!((layout.tiles_x, layout.tiles_y), (5, 5));
    }

    #[test]
    fn test_clahe_keeps_local_contrast_moderate() {
        // Low-amplitude noise around mid grey stays near mid grey
        let img = GrayImage::from_fn(256, 256, |x, y| image::Luma([(126 + (x * 7 + y * 13) % 5) as u8]));
        let out = ImagePreprocessing::apply_clahe(&img, 8, 2.0);
        let mean = out.pixels().map(|p| p[0] as f32).sum::<f32>() / (256.0 * 256.0);
        assert!((mean - 128.0).abs() < 20.0, "mean {}", mean);
    }

    #[test]
    fn test_uniform_image_stays_uniform() {
        let img = GrayImage::from_pixel(24, 24, image::Luma([128]));
        let out = ImagePreprocessing::apply_clahe(&img, 8, 2.0);
        let first = out.get_pixel(0, 0)[0];
        assert!(out.pixels().all(|p| p[0] == first));
    }
}
