use partmatch_core::Keypoint;

/// Single-channel f32 plane, row-major, intensities in `[0, 1]` for
/// Gaussian levels and signed values for DoG levels
#[derive(Debug, Clone)]
pub struct Plane {
    pub width: usize,
    pub height: usize,
    pub data: Vec<f32>,
}

impl Plane {
    pub fn new(width: usize, height: usize, data: Vec<f32>) -> Self {
        debug_assert_eq!(data.len(), width * height);
        Self { width, height, data }
    }

    #[inline]
    pub fn at(&self, x: usize, y: usize) -> f32 {
        self.data[y * self.width + x]
    }

    /// Keep every second pixel in both directions
    pub fn decimate(&self) -> Plane {
        let width = (self.width / 2).max(1);
        let height = (self.height / 2).max(1);
        let mut data = Vec::with_capacity(width * height);
        for y in 0..height {
            for x in 0..width {
                data.push(self.at(x * 2, y * 2));
            }
        }
        Plane::new(width, height, data)
    }

    /// Element-wise `self - other`
    pub fn subtract(&self, other: &Plane) -> Plane {
        let data = self
            .data
            .iter()
            .zip(other.data.iter())
            .map(|(a, b)| a - b)
            .collect();
        Plane::new(self.width, self.height, data)
    }
}

/// Keypoint together with the pyramid coordinates needed to describe it
#[derive(Debug, Clone, Copy)]
pub(crate) struct OctaveKeypoint {
    pub keypoint: Keypoint,
    pub octave: usize,
    pub layer: usize,
    /// Blur of the keypoint relative to its octave
    pub scale_octave: f32,
}

impl OctaveKeypoint {
    /// Location in the coordinates of the keypoint's octave
    pub fn octave_position(&self) -> (f32, f32) {
        let scale = 1.0 / (1u32 << self.octave) as f32;
        (self.keypoint.x * scale, self.keypoint.y * scale)
    }
}
