use candle_core::{Device, Result, Shape, Tensor};

/// Stream constant of the reference PCG32 generator
pub const DEFAULT_STREAM: u64 = 1442695040888963407;

/// PCG32 (XSH-RR) random number generator.
///
/// Used where output must depend only on `(seed, stream)` and never on call
/// order elsewhere in the process, e.g. per-frame mock output.
#[derive(Debug, Clone)]
pub struct Pcg32 {
    state: u64,
    inc: u64,
}

impl Pcg32 {
    pub fn new(seed: u64, stream: u64) -> Self {
        let mut rng = Self {
            state: 0,
            inc: (stream << 1) | 1,
        };
        rng.next_u32();
        rng.state = rng.state.wrapping_add(seed);
        rng.next_u32();
        rng
    }

    /// Generator for one frame of one seed
    pub fn for_frame(seed: u64, frame: usize) -> Self {
        Self::new(seed, DEFAULT_STREAM ^ frame as u64)
    }

    pub fn next_u32(&mut self) -> u32 {
        let old = self.state;
        self.state = old
            .wrapping_mul(6364136223846793005)
            .wrapping_add(self.inc);
        let xorshifted = (((old >> 18) ^ old) >> 27) as u32;
        let rot = (old >> 59) as u32;
        xorshifted.rotate_right(rot)
    }

    /// Uniform in `[0, 1)` with 24 bits of precision
    pub fn next_f32(&mut self) -> f32 {
        (self.next_u32() >> 8) as f32 * (1.0 / (1u32 << 24) as f32)
    }

    /// Tensor of uniform `[0, 1)` values
    pub fn uniform(&mut self, shape: impl Into<Shape>, device: &Device) -> Result<Tensor> {
        let shape = shape.into();
        let data: Vec<f32> = (0..shape.elem_count()).map(|_| self.next_f32()).collect();
        Tensor::from_vec(data, shape, device)
    }
}
