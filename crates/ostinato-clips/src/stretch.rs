//! Real-time grain overlap-add time-stretching.
//!
//! Pre-allocated FIFOs, no allocation in the process path. Pitch is
//! preserved; only duration changes. Each grain is Hann-windowed and
//! overlap-added at a fixed synthesis hop while the analysis position
//! advances by `hop × speed`, so `speed > 1` consumes input faster than it
//! produces output.

/// Grain length in milliseconds. 25 ms balances transient smear against
/// artifacts on sustained material.
const GRAIN_MS: f64 = 25.0;

/// FIFO headroom in grains.
const FIFO_GRAINS: usize = 8;

/// Mono grain stretcher.
pub struct GrainStretcher {
    grain: usize,
    hop: usize,
    window: Vec<f32>,
    input: Vec<f32>,
    output: Vec<f32>,
    in_write: usize,
    out_write: usize,
    out_read: usize,
    /// Fractional analysis position into the input stream.
    analysis_pos: f64,
}

impl GrainStretcher {
    pub fn new(sample_rate: f64) -> Self {
        let grain = ((sample_rate * GRAIN_MS / 1000.0) as usize).max(64);
        let hop = grain / 2;
        let window = (0..grain)
            .map(|i| {
                let phase = core::f32::consts::TAU * i as f32 / grain as f32;
                0.5 * (1.0 - phase.cos())
            })
            .collect();

        Self {
            grain,
            hop,
            window,
            input: vec![0.0; grain * FIFO_GRAINS],
            output: vec![0.0; grain * FIFO_GRAINS],
            in_write: 0,
            out_write: 0,
            out_read: 0,
            analysis_pos: 0.0,
        }
    }

    /// Processing delay in frames.
    #[inline]
    pub fn latency(&self) -> usize {
        self.grain
    }

    pub fn reset(&mut self) {
        self.input.fill(0.0);
        self.output.fill(0.0);
        self.in_write = 0;
        self.out_write = 0;
        self.out_read = 0;
        self.analysis_pos = 0.0;
    }

    /// Queue input frames.
    pub fn push_input(&mut self, frames: &[f32]) {
        let len = self.input.len();
        for &s in frames {
            self.input[self.in_write % len] = s;
            self.in_write += 1;
        }
    }

    /// Synthesize as many grains as the queued input allows.
    ///
    /// `speed` is the playback-rate ratio: 2.0 consumes input twice as fast
    /// as output is produced.
    pub fn process(&mut self, speed: f64) {
        let speed = speed.clamp(0.25, 4.0);
        let in_len = self.input.len();
        let out_len = self.output.len();

        // A grain is synthesizable once its whole analysis window is queued
        // and the output FIFO has room for it.
        while (self.analysis_pos as usize) + self.grain < self.in_write
            && self.out_write + self.grain < self.out_read + out_len
        {
            let base = self.analysis_pos;
            for i in 0..self.grain {
                let pos = base + i as f64;
                let idx = pos as usize;
                let frac = (pos - idx as f64) as f32;
                let a = self.input[idx % in_len];
                let b = self.input[(idx + 1) % in_len];
                let sample = a + (b - a) * frac;
                self.output[(self.out_write + i) % out_len] += sample * self.window[i];
            }
            self.out_write += self.hop;
            self.analysis_pos += self.hop as f64 * speed;
        }
    }

    /// Frames ready to pop.
    #[inline]
    pub fn available(&self) -> usize {
        // The final hop of the newest grain is still awaiting its overlap.
        self.out_write.saturating_sub(self.out_read)
    }

    /// Pop up to `out.len()` frames; returns the count written. Popped
    /// slots are zeroed so later grains can overlap-add into them.
    pub fn pop_output(&mut self, out: &mut [f32]) -> usize {
        let n = out.len().min(self.available());
        let len = self.output.len();
        for (i, slot) in out.iter_mut().take(n).enumerate() {
            let idx = (self.out_read + i) % len;
            *slot = self.output[idx];
            self.output[idx] = 0.0;
        }
        self.out_read += n;
        n
    }
}

/// Stereo pair of grain stretchers driven in lockstep.
pub struct StereoStretcher {
    left: GrainStretcher,
    right: GrainStretcher,
}

impl StereoStretcher {
    pub fn new(sample_rate: f64) -> Self {
        Self {
            left: GrainStretcher::new(sample_rate),
            right: GrainStretcher::new(sample_rate),
        }
    }

    #[inline]
    pub fn latency(&self) -> usize {
        self.left.latency()
    }

    pub fn reset(&mut self) {
        self.left.reset();
        self.right.reset();
    }

    pub fn push_input(&mut self, left: &[f32], right: &[f32]) {
        self.left.push_input(left);
        self.right.push_input(right);
    }

    pub fn process(&mut self, speed: f64) {
        self.left.process(speed);
        self.right.process(speed);
    }

    #[inline]
    pub fn available(&self) -> usize {
        self.left.available().min(self.right.available())
    }

    pub fn pop_output(&mut self, left: &mut [f32], right: &mut [f32]) -> usize {
        let n = left.len().min(right.len()).min(self.available());
        let l = self.left.pop_output(&mut left[..n]);
        let r = self.right.pop_output(&mut right[..n]);
        debug_assert_eq!(l, r);
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drive(stretcher: &mut GrainStretcher, input: &[f32], speed: f64) -> Vec<f32> {
        stretcher.push_input(input);
        stretcher.process(speed);
        let mut out = vec![0.0; stretcher.available()];
        stretcher.pop_output(&mut out);
        out
    }

    #[test]
    fn test_unity_speed_preserves_dc_level() {
        let mut s = GrainStretcher::new(48000.0);
        let input = vec![0.5f32; 48000 / 4];
        let out = drive(&mut s, &input, 1.0);
        assert!(!out.is_empty());

        // Skip the windowed ramp-in; the steady state of 50%-overlap Hann
        // grains reconstructs the input level.
        let steady = &out[s.latency()..];
        let mean: f32 = steady.iter().sum::<f32>() / steady.len() as f32;
        assert!((mean - 0.5).abs() < 0.05, "mean {mean}");
    }

    #[test]
    fn test_double_speed_halves_output_length() {
        let sr = 48000.0;
        let input: Vec<f32> = (0..24000).map(|i| (i as f32 * 0.01).sin()).collect();

        let mut s1 = GrainStretcher::new(sr);
        let out1 = drive(&mut s1, &input, 1.0).len();
        let mut s2 = GrainStretcher::new(sr);
        let out2 = drive(&mut s2, &input, 2.0).len();

        let ratio = out1 as f64 / out2 as f64;
        assert!((ratio - 2.0).abs() < 0.2, "ratio {ratio}");
    }

    #[test]
    fn test_incremental_feed_matches_cycle_sizes() {
        // Feeding in cycle-sized chunks keeps producing output.
        let mut s = GrainStretcher::new(48000.0);
        let chunk = vec![0.25f32; 256];
        let mut produced = 0;
        for _ in 0..64 {
            s.push_input(&chunk);
            s.process(1.0);
            let mut out = vec![0.0; 256];
            produced += s.pop_output(&mut out);
        }
        // Output trails input by about one grain of latency.
        assert!(produced >= 64 * 256 - 4 * s.latency(), "produced {produced}");
    }

    #[test]
    fn test_noise_level_roughly_preserved() {
        use rand::{Rng, SeedableRng};
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);
        let input: Vec<f32> = (0..48000).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
        let rms = |s: &[f32]| (s.iter().map(|v| v * v).sum::<f32>() / s.len() as f32).sqrt();

        let mut s = GrainStretcher::new(48000.0);
        let out = drive(&mut s, &input, 1.3);
        let steady = &out[s.latency()..out.len() - s.latency()];
        let ratio = rms(steady) / rms(&input);
        // Overlap-add of uncorrelated grains keeps the level within a few dB.
        assert!((0.5..2.0).contains(&ratio), "rms ratio {ratio}");
    }

    #[test]
    fn test_reset_clears_state() {
        let mut s = GrainStretcher::new(48000.0);
        s.push_input(&vec![1.0; 8192]);
        s.process(1.0);
        s.reset();
        assert_eq!(s.available(), 0);
        let out = drive(&mut s, &[0.0; 64], 1.0);
        assert!(out.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_stereo_lockstep() {
        let mut s = StereoStretcher::new(48000.0);
        let l = vec![0.5f32; 4096];
        let r = vec![-0.5f32; 4096];
        s.push_input(&l, &r);
        s.process(1.0);
        let n = s.available();
        assert!(n > 0);
        let mut ol = vec![0.0; n];
        let mut or = vec![0.0; n];
        assert_eq!(s.pop_output(&mut ol, &mut or), n);
        // Channels stay independent.
        let tail_l = ol[s.latency()..].iter().sum::<f32>() / (n - s.latency()) as f32;
        let tail_r = or[s.latency()..].iter().sum::<f32>() / (n - s.latency()) as f32;
        assert!(tail_l > 0.3 && tail_r < -0.3);
    }
}
