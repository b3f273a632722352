//! Pull-style sample-rate conversion over `rubato`.
//!
//! The converters run output-driven: each call asks for an exact number
//! of output frames at the current ratio, and the required input is
//! fetched on demand from a caller-supplied reader, which keeps the ring
//! buffers as the only upstream state.

use rubato::{
    FastFixedOut, PolynomialDegree, Resampler, SincFixedOut, SincInterpolationParameters,
    SincInterpolationType, WindowFunction,
};
use tracing::debug;

// Hosts up to 16x away from the device rate stay inside rubato's ratio
// window, xrun compensation included.
const MAX_RATIO_RELATIVE: f64 = 16.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quality {
    Best,
    High,
    Medium,
    Low,
    Fastest,
}

impl Quality {
    pub fn from_index(index: u8) -> Self {
        match index {
            0 => Quality::Best,
            1 => Quality::High,
            2 => Quality::Medium,
            3 => Quality::Low,
            _ => Quality::Fastest,
        }
    }

    fn sinc_len(self) -> usize {
        match self {
            Quality::Best => 256,
            Quality::High => 128,
            _ => 64,
        }
    }
}

impl Default for Quality {
    fn default() -> Self {
        Quality::Medium
    }
}

enum Inner {
    Sinc(SincFixedOut<f32>),
    Fast(FastFixedOut<f32>),
}

impl Inner {
    fn set_chunk_size(&mut self, frames: usize) -> Result<(), String> {
        match self {
            Inner::Sinc(r) => r.set_chunk_size(frames),
            Inner::Fast(r) => r.set_chunk_size(frames),
        }
        .map_err(|e| format!("Could not set converter chunk size: {e}"))
    }

    fn set_ratio(&mut self, ratio: f64) -> Result<(), String> {
        match self {
            Inner::Sinc(r) => r.set_resample_ratio(ratio, true),
            Inner::Fast(r) => r.set_resample_ratio(ratio, true),
        }
        .map_err(|e| format!("Could not set converter ratio: {e}"))
    }

    fn input_frames_next(&self) -> usize {
        match self {
            Inner::Sinc(r) => r.input_frames_next(),
            Inner::Fast(r) => r.input_frames_next(),
        }
    }

    fn input_frames_max(&self) -> usize {
        match self {
            Inner::Sinc(r) => r.input_frames_max(),
            Inner::Fast(r) => r.input_frames_max(),
        }
    }

    fn output_frames_max(&self) -> usize {
        match self {
            Inner::Sinc(r) => r.output_frames_max(),
            Inner::Fast(r) => r.output_frames_max(),
        }
    }

    fn process(
        &mut self,
        wave_in: &[Vec<f32>],
        wave_out: &mut [Vec<f32>],
    ) -> Result<(usize, usize), String> {
        match self {
            Inner::Sinc(r) => r.process_into_buffer(wave_in, wave_out, None),
            Inner::Fast(r) => r.process_into_buffer(wave_in, wave_out, None),
        }
        .map_err(|e| format!("Conversion failed: {e}"))
    }
}

pub struct PullConverter {
    inner: Inner,
    channels: usize,
    max_chunk: usize,
    plan_in: Vec<Vec<f32>>,
    plan_out: Vec<Vec<f32>>,
    fetch: Vec<f32>,
}

impl PullConverter {
    /// `max_chunk` bounds the output frames a single read may request.
    pub fn new(quality: Quality, channels: usize, max_chunk: usize) -> Result<Self, String> {
        let inner = match quality {
            Quality::Best | Quality::High | Quality::Medium => {
                let params = SincInterpolationParameters {
                    sinc_len: quality.sinc_len(),
                    f_cutoff: 0.95,
                    interpolation: SincInterpolationType::Linear,
                    oversampling_factor: 128,
                    window: WindowFunction::BlackmanHarris2,
                };
                SincFixedOut::<f32>::new(1.0, MAX_RATIO_RELATIVE, params, max_chunk, channels)
                    .map(Inner::Sinc)
            }
            Quality::Low => FastFixedOut::<f32>::new(
                1.0,
                MAX_RATIO_RELATIVE,
                PolynomialDegree::Cubic,
                max_chunk,
                channels,
            )
            .map(Inner::Fast),
            Quality::Fastest => FastFixedOut::<f32>::new(
                1.0,
                MAX_RATIO_RELATIVE,
                PolynomialDegree::Linear,
                max_chunk,
                channels,
            )
            .map(Inner::Fast),
        }
        .map_err(|e| format!("Failed to create resampler: {e}"))?;

        let in_max = inner.input_frames_max();
        let out_max = inner.output_frames_max();
        Ok(Self {
            inner,
            channels,
            max_chunk,
            plan_in: vec![vec![0.0; in_max]; channels],
            plan_out: vec![vec![0.0; out_max]; channels],
            fetch: vec![0.0; in_max * channels],
        })
    }

    /// Produces exactly `frames` interleaved output frames into `out`.
    ///
    /// `ratio` is the number of input frames consumed per output frame.
    /// `fill` is handed an interleaved scratch slice and returns how many
    /// frames it provided; it is called until the conversion is fed.
    pub fn read(
        &mut self,
        ratio: f64,
        frames: usize,
        out: &mut [f32],
        fill: &mut dyn FnMut(&mut [f32]) -> usize,
    ) -> Result<usize, String> {
        if frames == 0 || frames > self.max_chunk {
            return Err(format!(
                "Requested {} frames outside converter chunk limit {}",
                frames, self.max_chunk
            ));
        }
        self.inner.set_chunk_size(frames)?;
        self.inner.set_ratio(1.0 / ratio)?;

        let needed = self.inner.input_frames_next();
        let mut got = 0_usize;
        while got < needed {
            let want = needed - got;
            let dst = &mut self.fetch[..want * self.channels];
            let n = fill(dst).min(want);
            if n == 0 {
                break;
            }
            for ch in 0..self.channels {
                let plan = &mut self.plan_in[ch];
                for frame in 0..n {
                    plan[got + frame] = dst[frame * self.channels + ch];
                }
            }
            got += n;
        }
        if got < needed {
            debug!("Converter input starved ({got} of {needed} frames)");
            for plan in &mut self.plan_in {
                plan[got..needed].fill(0.0);
            }
        }

        for plan in &mut self.plan_in {
            plan.resize(needed, 0.0);
        }
        let out_next = frames;
        for plan in &mut self.plan_out {
            plan.resize(out_next.max(1), 0.0);
        }

        let (_, produced) = self.inner.process(&self.plan_in, &mut self.plan_out)?;

        for plan in &mut self.plan_in {
            plan.resize(plan.capacity(), 0.0);
        }

        let produced = produced.min(out.len() / self.channels);
        for frame in 0..produced {
            for ch in 0..self.channels {
                out[frame * self.channels + ch] = self.plan_out[ch][frame];
            }
        }
        for plan in &mut self.plan_out {
            plan.resize(plan.capacity(), 0.0);
        }
        Ok(produced)
    }
}
