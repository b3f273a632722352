//! Resampler core: owns the converters, the tracking DLL, and the host
//! ends of the audio rings, and drives the READY→BOOT→TUNE→RUN state
//! machine once per host cycle.

use crate::converter::{PullConverter, Quality};
use crate::devices::{SAMPLE_BYTES, SAMPLE_RATE};
use crate::dll::TrackingDll;
use crate::engine::{Engine, EngineStatus};
use crate::mutex::SpinLock;
use crate::ring::{RingClearer, RingConsumer, RingProducer, f32_bytes, f32_bytes_mut};
use crate::transport::{TimeSource, TransportSession};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Upper bound on frames pulled from the o2h ring per reader step.
pub const MAX_READ_FRAMES: usize = 5;

// Seconds of host cycles spent in the wide boot filter, and per
// logging/average window afterwards.
const STARTUP_TIME: u32 = 5;
const LOG_TIME: u32 = 2;
const RATIO_DIFF_THRES: f64 = 1.0e-5;

/// Downstream scratch scale; keeps hosts up to 8x the device rate inside
/// the queue and output buffers.
const QUEUE_SCALE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ResamplerStatus {
    Ready,
    Boot,
    Tune,
    Run,
}

/// Host ends of the MIDI rings, handed to the host-binding layer at
/// activation while the resampler keeps the audio ends.
pub struct MidiEnds {
    pub o2h: RingConsumer,
    pub h2o: RingProducer,
}

pub struct Resampler {
    engine: Arc<Engine>,
    quality: Quality,
    bufsize: u32,
    samplerate: u32,
    status: ResamplerStatus,
    o2p_ratio: f64,
    p2o_ratio: f64,
    dll: TrackingDll,
    dll_initialized: bool,
    log_cycles: u32,
    log_control_cycles: u32,
    xruns: SpinLock<u32>,

    o2h_audio: Option<RingConsumer>,
    h2o_audio: Option<RingProducer>,
    clearers: Vec<RingClearer>,
    o2h_state: Option<PullConverter>,
    h2o_state: Option<PullConverter>,

    // Interleaved scratch, reallocated on buffer-size changes.
    o2h_buf_in: Vec<f32>,
    o2h_buf_out: Vec<f32>,
    h2o_buf_in: Vec<f32>,
    h2o_buf_out: Vec<f32>,
    h2o_aux: Vec<f32>,
    h2o_queue: Vec<f32>,
    p2o_queue_len: usize,
    p2o_acc: f64,
    last_frames: usize,
    reading_at_o2p_end: bool,

    // Latencies in ring bytes.
    o2p_latency: usize,
    o2p_max_latency: usize,
    p2o_latency: usize,
    p2o_max_latency: usize,
}

impl Resampler {
    pub fn new(engine: Arc<Engine>, quality: Quality) -> Self {
        Self {
            engine,
            quality,
            bufsize: 0,
            samplerate: 0,
            status: ResamplerStatus::Ready,
            o2p_ratio: 1.0,
            p2o_ratio: 1.0,
            dll: TrackingDll::default(),
            dll_initialized: false,
            log_cycles: 0,
            log_control_cycles: 0,
            xruns: SpinLock::new(0),
            o2h_audio: None,
            h2o_audio: None,
            clearers: vec![],
            o2h_state: None,
            h2o_state: None,
            o2h_buf_in: vec![],
            o2h_buf_out: vec![],
            h2o_buf_in: vec![],
            h2o_buf_out: vec![],
            h2o_aux: vec![],
            h2o_queue: vec![],
            p2o_queue_len: 0,
            p2o_acc: 0.0,
            last_frames: 1,
            reading_at_o2p_end: false,
            o2p_latency: 0,
            o2p_max_latency: 0,
            p2o_latency: 0,
            p2o_max_latency: 0,
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn status(&self) -> ResamplerStatus {
        self.status
    }

    pub fn o2p_ratio(&self) -> f64 {
        self.o2p_ratio
    }

    pub fn p2o_ratio(&self) -> f64 {
        self.p2o_ratio
    }

    pub fn bufsize(&self) -> u32 {
        self.bufsize
    }

    pub fn samplerate(&self) -> u32 {
        self.samplerate
    }

    /// Current and maximum upstream latency, in device frames.
    pub fn o2h_latency(&self) -> (usize, usize) {
        let frame = self.engine.descriptor().o2h_frame_size().max(1);
        (self.o2p_latency / frame, self.o2p_max_latency / frame)
    }

    /// Current and maximum downstream latency, in device frames.
    pub fn h2o_latency(&self) -> (usize, usize) {
        let frame = self.engine.descriptor().h2o_frame_size().max(1);
        (self.p2o_latency / frame, self.p2o_max_latency / frame)
    }

    pub fn inc_xruns(&self) {
        *self.xruns.lock() += 1;
    }

    /// Builds the rings and splits the ends: audio stays here, MIDI goes
    /// to the caller together with the transport session.
    pub fn activate(&mut self, clock: Arc<dyn TimeSource>) -> (TransportSession, MidiEnds) {
        let (session, ends) = Engine::activate(&self.engine, clock);
        self.clearers = vec![
            ends.o2h_audio.clearer(),
            ends.h2o_audio.clearer(),
            ends.o2h_midi.clearer(),
            ends.h2o_midi.clearer(),
        ];
        self.o2h_audio = Some(ends.o2h_audio);
        self.h2o_audio = Some(ends.h2o_audio);
        (
            session,
            MidiEnds {
                o2h: ends.o2h_midi,
                h2o: ends.h2o_midi,
            },
        )
    }

    /// Empties every ring and the downstream queue. Invoked when the last
    /// host port connection goes away.
    pub fn clear_buffers(&mut self) {
        for clearer in &self.clearers {
            clearer.clear();
        }
        self.h2o_queue.clear();
        self.p2o_queue_len = 0;
    }

    pub fn set_buffer_size(&mut self, bufsize: u32) {
        if self.bufsize != bufsize {
            self.bufsize = bufsize;
            self.reset_buffers();
            if self.samplerate != 0 {
                self.reset_dll(self.samplerate);
            }
        }
    }

    pub fn set_samplerate(&mut self, samplerate: u32) {
        if self.samplerate != samplerate {
            if self.bufsize != 0 {
                self.reset_dll(samplerate);
            } else {
                self.samplerate = samplerate;
            }
        }
    }

    fn reset_buffers(&mut self) {
        let inputs = self.engine.descriptor().input_count();
        let outputs = self.engine.descriptor().output_count();
        let bufsize = self.bufsize as usize;

        self.o2h_buf_in = vec![0.0; bufsize * outputs];
        self.o2h_buf_out = vec![0.0; bufsize * outputs];
        self.h2o_buf_in = vec![0.0; bufsize * inputs];
        self.h2o_buf_out = vec![0.0; bufsize * QUEUE_SCALE * inputs];
        self.h2o_aux = vec![0.0; bufsize * QUEUE_SCALE * inputs];
        self.h2o_queue = Vec::with_capacity(bufsize * QUEUE_SCALE * inputs);
        self.p2o_queue_len = 0;
        self.p2o_acc = 0.0;
        self.last_frames = 1;
        self.reading_at_o2p_end = false;
        self.o2p_latency = 0;
        self.o2p_max_latency = 0;
        self.p2o_latency = 0;
        self.p2o_max_latency = 0;

        self.o2h_state = match PullConverter::new(self.quality, outputs, bufsize) {
            Ok(converter) => Some(converter),
            Err(e) => {
                error!("o2h: {e}");
                None
            }
        };
        self.h2o_state = match PullConverter::new(self.quality, inputs, bufsize * QUEUE_SCALE) {
            Ok(converter) => Some(converter),
            Err(e) => {
                error!("h2o: {e}");
                None
            }
        };

        // Drop any stale upstream backlog, keeping whole frames.
        if let Some(ring) = &self.o2h_audio {
            let frame = self.engine.descriptor().o2h_frame_size();
            let read_space = ring.read_space();
            ring.advance(read_space - read_space % frame);
        }
    }

    fn reset_dll(&mut self, samplerate: u32) {
        if !self.dll_initialized || self.engine.status() < EngineStatus::Run {
            debug!("Initializing DLL...");
            self.dll = TrackingDll::new(samplerate, SAMPLE_RATE, self.bufsize);
            self.dll_initialized = true;
        } else {
            debug!("Just adjusting DLL ratio...");
            self.dll
                .rescale(f64::from(self.samplerate) / f64::from(samplerate));
            self.log_cycles = 0;
            self.log_control_cycles = STARTUP_TIME * samplerate / self.bufsize;
        }
        self.engine.set_status(EngineStatus::Ready);
        self.status = ResamplerStatus::Ready;
        self.o2p_ratio = self.dll.ratio;
        self.p2o_ratio = 1.0 / self.o2p_ratio;
        self.samplerate = samplerate;
    }

    /// Per-cycle ratio computation. Returns false when the cycle should
    /// skip audio processing entirely.
    pub fn compute_ratios(&mut self, time_us: u64) -> bool {
        let xruns = {
            let mut xruns = self.xruns.lock();
            std::mem::take(&mut *xruns)
        };

        {
            let shared = self.engine.shared.lock();
            self.p2o_latency = shared.p2o_latency;
            self.p2o_max_latency = shared.p2o_max_latency;
            self.dll.load_transfer(&shared.dll);
        }

        let engine_status = self.engine.status();
        if self.status == ResamplerStatus::Ready && engine_status <= EngineStatus::Boot {
            if engine_status == EngineStatus::Ready {
                self.engine.set_status(EngineStatus::Boot);
                debug!("Booting Overbridge side...");
            }
            return false;
        }

        if self.status == ResamplerStatus::Ready && engine_status == EngineStatus::Wait {
            self.dll.update_err(time_us);
            self.dll.first_time_run();

            debug!("Starting up resampler...");
            self.dll.set_loop_filter(1.0, self.bufsize, self.samplerate);
            self.status = ResamplerStatus::Boot;

            self.log_cycles = 0;
            self.log_control_cycles = STARTUP_TIME * self.samplerate / self.bufsize;
            return true;
        }

        if xruns > 0 {
            debug!("Fixing {xruns} xruns...");
            // Recover the unread frames sitting in the o2h ring with one
            // elevated pull, and skip this cycle's DLL update: the time
            // measurements around an xrun are too imprecise to feed it.
            self.o2p_ratio = self.dll.ratio * (1.0 + f64::from(xruns));
            self.p2o_ratio = 1.0 / self.o2p_ratio;
            self.read_audio();

            self.p2o_max_latency = 0;
            self.o2p_max_latency = 0;
            return true;
        }

        self.dll.update_err(time_us);
        self.dll.update();

        if self.dll.ratio < 0.0 {
            error!("Negative ratio detected. Stopping resampler...");
            self.engine.set_status(EngineStatus::Error);
            return false;
        }

        self.o2p_ratio = self.dll.ratio;
        self.p2o_ratio = 1.0 / self.o2p_ratio;

        self.log_cycles += 1;
        if self.log_cycles == self.log_control_cycles {
            self.dll.calc_avg(self.log_control_cycles);
            self.log_status();
            self.log_cycles = 0;

            if self.status == ResamplerStatus::Boot {
                debug!("Tuning resampler...");
                self.dll.set_loop_filter(0.05, self.bufsize, self.samplerate);
                self.status = ResamplerStatus::Tune;
                self.log_control_cycles = LOG_TIME * self.samplerate / self.bufsize;
            }

            if self.status == ResamplerStatus::Tune
                && (self.dll.ratio_avg - self.dll.last_ratio_avg).abs() < RATIO_DIFF_THRES
            {
                debug!("Running resampler...");
                self.dll.set_loop_filter(0.02, self.bufsize, self.samplerate);
                self.status = ResamplerStatus::Run;
                self.engine.set_status(EngineStatus::Run);
            }
        }

        true
    }

    /// Pulls exactly one host buffer of upstream audio through the
    /// converter into the o2h output scratch.
    pub fn read_audio(&mut self) {
        let Some(ring) = self.o2h_audio.as_ref() else {
            return;
        };
        let Some(state) = self.o2h_state.as_mut() else {
            return;
        };
        let outputs = self.engine.descriptor().output_count();
        let frame_size = self.engine.descriptor().o2h_frame_size();
        let bufsize = self.bufsize as usize;
        let start_bytes = bufsize * frame_size;
        let ratio = self.o2p_ratio;

        let buf_in = &mut self.o2h_buf_in;
        let reading = &mut self.reading_at_o2p_end;
        let latency = &mut self.o2p_latency;
        let max_latency = &mut self.o2p_max_latency;
        let last_frames = &mut self.last_frames;
        let mut consumed = 0_usize;

        let produced = state.read(
            ratio,
            bufsize,
            &mut self.o2h_buf_out,
            &mut |dst: &mut [f32]| {
                let want = dst.len() / outputs;
                let read_space = ring.read_space();

                if !*reading {
                    // Still filling: drain down to a whole number of host
                    // buffers once enough has arrived, then start.
                    if read_space >= start_bytes {
                        debug!("o2h: Emptying buffer and running...");
                        ring.advance(read_space - read_space % start_bytes);
                        *reading = true;
                    }
                    let n = want.min(MAX_READ_FRAMES);
                    dst[..n * outputs].copy_from_slice(&buf_in[..n * outputs]);
                    *last_frames = n;
                    consumed += n;
                    return n;
                }

                *latency = read_space;
                if *latency > *max_latency {
                    *max_latency = *latency;
                }

                let n = if read_space >= frame_size {
                    let n = (read_space / frame_size).min(MAX_READ_FRAMES).min(want);
                    ring.read(f32_bytes_mut(&mut buf_in[..n * outputs]));
                    n
                } else {
                    debug!(
                        "o2h: Audio ring buffer underflow ({read_space} B). Replicating last sample..."
                    );
                    if *last_frames > 1 {
                        let pos = (*last_frames - 1) * outputs;
                        buf_in.copy_within(pos..pos + outputs, 0);
                    }
                    want.min(MAX_READ_FRAMES)
                };
                dst[..n * outputs].copy_from_slice(&buf_in[..n * outputs]);
                *last_frames = n;
                consumed += n;
                n
            },
        );

        self.dll.add_consumed(consumed);
        match produced {
            Ok(frames) if frames == bufsize => {}
            Ok(frames) => error!(
                "o2h: Unexpected frames with ratio {ratio} (output {frames}, expected {bufsize})"
            ),
            Err(e) => error!("o2h: {e}"),
        }
    }

    /// Queues one host buffer of downstream audio and converts the
    /// ratio-adjusted amount onto the h2o ring.
    pub fn write_audio(&mut self) {
        let Some(ring) = self.h2o_audio.as_ref() else {
            return;
        };
        let Some(state) = self.h2o_state.as_mut() else {
            return;
        };
        let inputs = self.engine.descriptor().input_count();
        let bufsize = self.bufsize as usize;
        let samples = bufsize * inputs;

        if self.h2o_queue.len() + samples > self.h2o_queue.capacity() {
            error!("h2o: Input queue overflow. Discarding queued data...");
            self.h2o_queue.clear();
            self.p2o_queue_len = 0;
        }
        self.h2o_queue.extend_from_slice(&self.h2o_buf_in[..samples]);
        self.p2o_queue_len += bufsize;

        // Cumulative fractional adjustment: on average the device side
        // receives bufsize * (device_rate / host_rate) frames per cycle.
        self.p2o_acc += bufsize as f64 * (self.o2p_ratio - 1.0);
        let inc = self.p2o_acc.trunc();
        self.p2o_acc -= inc;
        let frames = ((bufsize as i64 + inc as i64).max(1) as usize).min(bufsize * QUEUE_SCALE);

        let p2o_ratio = self.p2o_ratio;
        let status = self.status;
        let queue = &mut self.h2o_queue;
        let queue_len = &mut self.p2o_queue_len;
        let aux = &mut self.h2o_aux;
        let mut starved = false;

        let produced = state.read(
            p2o_ratio,
            frames,
            &mut self.h2o_buf_out,
            &mut |dst: &mut [f32]| {
                let want = dst.len() / inputs;
                if *queue_len == 0 {
                    // Stale scratch is acceptable during warm-up, when
                    // everything produced is discarded anyway.
                    starved = true;
                    let n = want.min(bufsize);
                    dst[..n * inputs].copy_from_slice(&aux[..n * inputs]);
                    return n;
                }
                let n = want.min(*queue_len);
                let take = n * inputs;
                dst[..take].copy_from_slice(&queue[..take]);
                aux[..take].copy_from_slice(&queue[..take]);
                queue.drain(..take);
                *queue_len -= n;
                n
            },
        );

        if starved {
            if status >= ResamplerStatus::Run {
                warn!("h2o: Input queue empty while running");
            } else {
                debug!("h2o: Cannot read data from queue");
            }
        }

        let produced = match produced {
            Ok(produced) => {
                if produced != frames {
                    error!(
                        "h2o: Unexpected frames with ratio {p2o_ratio} (output {produced}, expected {frames})"
                    );
                }
                produced
            }
            Err(e) => {
                error!("h2o: {e}");
                0
            }
        };

        if self.status < ResamplerStatus::Run || produced == 0 {
            return;
        }

        let out = &self.h2o_buf_out[..produced * inputs];
        if ring.write_space() >= produced * inputs * SAMPLE_BYTES {
            ring.write(f32_bytes(out));
        } else {
            error!("h2o: Audio ring buffer overflow. Discarding data...");
        }
    }

    /// Interleaved upstream output for the current cycle.
    pub fn o2h_output(&self) -> &[f32] {
        &self.o2h_buf_out
    }

    /// Interleaved downstream input buffer for the current cycle.
    pub fn h2o_input_mut(&mut self) -> &mut [f32] {
        &mut self.h2o_buf_in
    }

    fn log_status(&self) {
        debug!("{}", self.status_line());
    }

    /// One-line latency and ratio summary, also printed once on stop.
    pub fn report_status(&self) {
        info!("{}", self.status_line());
    }

    fn status_line(&self) -> String {
        let desc = self.engine.descriptor();
        let o2h_frame = desc.o2h_frame_size() as f64;
        let h2o_frame = desc.h2o_frame_size() as f64;
        let rate = f64::from(SAMPLE_RATE);
        format!(
            "{}: o2h latency: {:.1} ms, max. {:.1} ms; h2o latency: {:.1} ms, max. {:.1} ms; o2h ratio: {:.6}, avg. {:.6}",
            desc.name,
            self.o2p_latency as f64 * 1000.0 / (o2h_frame * rate),
            self.o2p_max_latency as f64 * 1000.0 / (o2h_frame * rate),
            self.p2o_latency as f64 * 1000.0 / (h2o_frame * rate),
            self.p2o_max_latency as f64 * 1000.0 / (h2o_frame * rate),
            self.dll.ratio,
            self.dll.ratio_avg,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices;

    #[test]
    fn ratios_stay_reciprocal() {
        let engine = Engine::new(devices::by_name("Analog Heat").unwrap(), 24);
        let mut resampler = Resampler::new(engine, Quality::Fastest);
        resampler.set_samplerate(48_000);
        resampler.set_buffer_size(128);
        assert_eq!(resampler.status(), ResamplerStatus::Ready);
        assert!((resampler.o2p_ratio() * resampler.p2o_ratio() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn buffer_size_change_reenters_ready() {
        let engine = Engine::new(devices::by_name("Analog Heat").unwrap(), 24);
        let mut resampler = Resampler::new(engine.clone(), Quality::Fastest);
        resampler.set_samplerate(48_000);
        resampler.set_buffer_size(256);
        engine.set_status(EngineStatus::Run);
        resampler.set_buffer_size(128);
        assert_eq!(resampler.status(), ResamplerStatus::Ready);
        assert_eq!(engine.status(), EngineStatus::Ready);
        assert_eq!(resampler.bufsize(), 128);
    }

    #[test]
    fn compute_skips_until_transport_streams() {
        let engine = Engine::new(devices::by_name("Analog Heat").unwrap(), 24);
        let mut resampler = Resampler::new(engine.clone(), Quality::Fastest);
        resampler.set_samplerate(48_000);
        resampler.set_buffer_size(128);
        // First cycle boots the engine side and skips audio.
        assert!(!resampler.compute_ratios(0));
        assert_eq!(engine.status(), EngineStatus::Boot);
        // Still skipping until the transport reports WAIT.
        assert!(!resampler.compute_ratios(2_666));
    }
}
