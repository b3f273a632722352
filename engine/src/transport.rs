//! The transport contract: what the engine requires from the component
//! that moves audio and MIDI to and from the actual device, plus the
//! session object that carries the device-side ring ends and the
//! per-transfer bookkeeping every transport gets for free.

use crate::engine::{
    Engine, EngineStatus, OPT_DLL, OPT_O2P_AUDIO, OPT_O2P_MIDI, OPT_P2O_AUDIO, OPT_P2O_MIDI,
};
use crate::midi::packet::{EVENT_BYTES, MidiEvent};
use crate::ring::{RingConsumer, RingProducer, f32_bytes, f32_bytes_mut};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;
use tracing::{debug, error};

/// Wallclock microseconds shared by both clock domains.
pub trait TimeSource: Send + Sync {
    fn time_us(&self) -> u64;
}

/// Process-monotonic fallback clock for transports that run without a
/// host binding (tests, loopback).
pub struct MonotonicClock {
    origin: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl TimeSource for MonotonicClock {
    fn time_us(&self) -> u64 {
        self.origin.elapsed().as_micros() as u64
    }
}

/// A device driver. `run` blocks on the transport thread until the
/// session reports a stop.
pub trait Transport: Send {
    fn run(&mut self, session: TransportSession) -> Result<(), String>;
}

/// Device-thread handle: owns the producer end of the o2h rings and the
/// consumer end of the h2o rings.
pub struct TransportSession {
    engine: Arc<Engine>,
    o2h_audio: RingProducer,
    h2o_audio: RingConsumer,
    o2h_midi: RingProducer,
    h2o_midi: RingConsumer,
    clock: Arc<dyn TimeSource>,
}

impl TransportSession {
    pub(crate) fn new(
        engine: Arc<Engine>,
        o2h_audio: RingProducer,
        h2o_audio: RingConsumer,
        o2h_midi: RingProducer,
        h2o_midi: RingConsumer,
        clock: Arc<dyn TimeSource>,
    ) -> Self {
        Self {
            engine,
            o2h_audio,
            h2o_audio,
            o2h_midi,
            h2o_midi,
            clock,
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn frames_per_transfer(&self) -> usize {
        self.engine.frames_per_transfer()
    }

    pub fn time_us(&self) -> u64 {
        self.clock.time_us()
    }

    pub fn stopped(&self) -> bool {
        self.engine.status() <= EngineStatus::Stop
    }

    /// Delivers one transfer of interleaved device output frames stamped
    /// with its arrival time. Ticks the device-side DLL and flips the
    /// engine from BOOT to WAIT on the first delivery.
    pub fn push_audio(&mut self, frames: &[f32], time_us: u64) {
        let outputs = self.engine.descriptor().output_count();
        if outputs == 0 || frames.is_empty() {
            return;
        }
        if self.engine.status() == EngineStatus::Boot {
            debug!("Transport streaming; waiting for the resampler...");
            self.engine.set_status(EngineStatus::Wait);
        }
        if self.engine.is_option(OPT_DLL) {
            let mut shared = self.engine.shared.lock();
            if shared.dll.started() {
                shared.dll.inc(frames.len() / outputs, time_us);
            } else {
                shared.dll.start(time_us);
            }
        }
        if !self.engine.is_option(OPT_O2P_AUDIO) {
            return;
        }
        if !self.o2h_audio.write(f32_bytes(frames)) {
            debug!("o2h: Audio ring buffer overflow. Discarding transfer...");
        }
    }

    /// Fills one transfer of interleaved device input frames from the
    /// h2o ring, or silence when the ring cannot cover it. Also records
    /// the downstream latency for the host side to snapshot.
    pub fn pull_audio(&mut self, frames: &mut [f32]) {
        let read_space = self.h2o_audio.read_space();
        {
            let mut shared = self.engine.shared.lock();
            shared.p2o_latency = read_space;
            if read_space > shared.p2o_max_latency {
                shared.p2o_max_latency = read_space;
            }
        }
        let bytes = std::mem::size_of_val(frames);
        if self.engine.is_option(OPT_P2O_AUDIO) && read_space >= bytes {
            self.h2o_audio.read(f32_bytes_mut(frames));
        } else {
            frames.fill(0.0);
        }
    }

    pub fn push_midi(&mut self, event: &MidiEvent) {
        if !self.engine.is_option(OPT_O2P_MIDI) {
            return;
        }
        let mut buf = [0_u8; EVENT_BYTES];
        event.encode(&mut buf);
        if !self.o2h_midi.write(&buf) {
            error!("o2h: MIDI ring buffer overflow. Discarding data...");
        }
    }

    pub fn pull_midi(&mut self) -> Option<MidiEvent> {
        if !self.engine.is_option(OPT_P2O_MIDI) || self.h2o_midi.read_space() < EVENT_BYTES {
            return None;
        }
        let mut buf = [0_u8; EVENT_BYTES];
        self.h2o_midi.read(&mut buf);
        Some(MidiEvent::decode(&buf))
    }
}

pub const DEFAULT_RT_PRIORITY: i32 = 18;

/// SCHED_FIFO setup for the transport thread.
pub fn configure_rt_thread(name: &str, priority: i32) -> Result<(), String> {
    #[cfg(unix)]
    {
        use nix::libc;
        let thread = unsafe { libc::pthread_self() };
        #[cfg(target_os = "linux")]
        {
            if let Ok(c_name) = std::ffi::CString::new(name) {
                unsafe {
                    let _ = libc::pthread_setname_np(thread, c_name.as_ptr());
                }
            }
        }
        let param = unsafe {
            let mut p = std::mem::zeroed::<libc::sched_param>();
            p.sched_priority = priority;
            p
        };
        let rc = unsafe { libc::pthread_setschedparam(thread, libc::SCHED_FIFO, &param) };
        if rc != 0 {
            return Err(format!(
                "pthread_setschedparam({name}, prio {priority}) failed with errno {rc}"
            ));
        }
        Ok(())
    }
    #[cfg(not(unix))]
    {
        let _ = (name, priority);
        Err("Realtime thread priority is not supported on this platform".to_string())
    }
}

/// Runs a transport on its own named RT thread. A transport error is a
/// fatal engine condition.
pub fn spawn(
    mut transport: Box<dyn Transport>,
    session: TransportSession,
    priority: i32,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("oblink-transport".to_string())
        .spawn(move || {
            if let Err(e) = configure_rt_thread("oblink-transport", priority) {
                error!("Transport realtime priority not enabled: {e}");
            }
            let engine = session.engine().clone();
            if let Err(e) = transport.run(session) {
                error!("Transport failed: {e}");
                engine.set_status(EngineStatus::Error);
            }
        })
        .expect("Failed to spawn transport thread")
}
