//! Shared engine state between the transport thread, the audio callback,
//! and the supervisor: status, option flags, the device-side DLL and
//! latency counters under a short lock, and the four rings.

use crate::devices::DeviceDescriptor;
use crate::dll::TransferDll;
use crate::midi::MIDI_BUF_LEN;
use crate::mutex::SpinLock;
use crate::ring::{RingConsumer, RingProducer, ring_buffer};
use crate::transport::{TimeSource, TransportSession};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use tracing::debug;

/// Ring capacity in frames; twice the nominal maximum host buffer.
pub const MAX_LATENCY: usize = 8192 * 2;

pub const OPT_O2P_AUDIO: u32 = 1 << 0;
pub const OPT_O2P_MIDI: u32 = 1 << 1;
pub const OPT_P2O_AUDIO: u32 = 1 << 2;
pub const OPT_P2O_MIDI: u32 = 1 << 3;
pub const OPT_DLL: u32 = 1 << 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EngineStatus {
    Error,
    Stop,
    Ready,
    Boot,
    Wait,
    Run,
}

/// State written by the transport thread and snapshotted by the audio
/// callback; every access holds the engine lock.
#[derive(Debug)]
pub struct EngineShared {
    pub dll: TransferDll,
    pub p2o_latency: usize,
    pub p2o_max_latency: usize,
}

/// Host-side ends of the four rings, handed out at activation.
pub struct HostEnds {
    pub o2h_audio: RingConsumer,
    pub h2o_audio: RingProducer,
    pub o2h_midi: RingConsumer,
    pub h2o_midi: RingProducer,
}

pub struct Engine {
    desc: DeviceDescriptor,
    frames_per_transfer: usize,
    status: SpinLock<EngineStatus>,
    options: AtomicU32,
    pub(crate) shared: SpinLock<EngineShared>,
    stopped: Mutex<bool>,
    stop_signal: Condvar,
}

impl Engine {
    pub fn new(desc: DeviceDescriptor, blocks_per_transfer: usize) -> Arc<Self> {
        let frames_per_transfer = crate::devices::FRAMES_PER_BLOCK * blocks_per_transfer.max(1);
        Arc::new(Self {
            shared: SpinLock::new(EngineShared {
                dll: TransferDll::new(
                    f64::from(crate::devices::SAMPLE_RATE),
                    frames_per_transfer,
                ),
                p2o_latency: 0,
                p2o_max_latency: 0,
            }),
            desc,
            frames_per_transfer,
            status: SpinLock::new(EngineStatus::Stop),
            options: AtomicU32::new(OPT_DLL | OPT_O2P_AUDIO | OPT_O2P_MIDI | OPT_P2O_MIDI),
            // Not running until activation, so wait() must not block.
            stopped: Mutex::new(true),
            stop_signal: Condvar::new(),
        })
    }

    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.desc
    }

    pub fn frames_per_transfer(&self) -> usize {
        self.frames_per_transfer
    }

    pub fn status(&self) -> EngineStatus {
        *self.status.lock()
    }

    pub fn set_status(&self, status: EngineStatus) {
        *self.status.lock() = status;
        if status <= EngineStatus::Stop {
            if let Ok(mut stopped) = self.stopped.lock() {
                *stopped = true;
                self.stop_signal.notify_all();
            }
        }
    }

    pub fn set_option(&self, option: u32, on: bool) {
        if on {
            self.options.fetch_or(option, Ordering::AcqRel);
        } else {
            self.options.fetch_and(!option, Ordering::AcqRel);
        }
    }

    pub fn is_option(&self, option: u32) -> bool {
        self.options.load(Ordering::Acquire) & option != 0
    }

    /// Creates the four rings and splits their ends between the transport
    /// session and the host side. The audio rings are sized for
    /// [`MAX_LATENCY`] frames; the MIDI rings use the protocol length.
    pub fn activate(
        engine: &Arc<Engine>,
        clock: Arc<dyn TimeSource>,
    ) -> (TransportSession, HostEnds) {
        let (o2h_audio_w, o2h_audio_r) = ring_buffer(MAX_LATENCY * engine.desc.o2h_frame_size());
        let (h2o_audio_w, h2o_audio_r) = ring_buffer(MAX_LATENCY * engine.desc.h2o_frame_size());
        let (o2h_midi_w, o2h_midi_r) = ring_buffer(MIDI_BUF_LEN);
        let (h2o_midi_w, h2o_midi_r) = ring_buffer(MIDI_BUF_LEN);

        if let Ok(mut stopped) = engine.stopped.lock() {
            *stopped = false;
        }
        engine.set_status(EngineStatus::Ready);
        debug!(
            "Engine ready with {} frames per transfer",
            engine.frames_per_transfer
        );

        let session = TransportSession::new(
            engine.clone(),
            o2h_audio_w,
            h2o_audio_r,
            o2h_midi_w,
            h2o_midi_r,
            clock,
        );
        let ends = HostEnds {
            o2h_audio: o2h_audio_r,
            h2o_audio: h2o_audio_w,
            o2h_midi: o2h_midi_r,
            h2o_midi: h2o_midi_w,
        };
        (session, ends)
    }

    pub fn stop(&self) {
        self.set_status(EngineStatus::Stop);
    }

    /// Blocks until the engine reaches a terminal state.
    pub fn wait(&self) {
        let Ok(guard) = self.stopped.lock() else {
            return;
        };
        let _guard = self
            .stop_signal
            .wait_while(guard, |stopped| !*stopped)
            .ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices;

    fn descriptor() -> DeviceDescriptor {
        devices::by_name("Digitakt").unwrap()
    }

    #[test]
    fn options_toggle() {
        let engine = Engine::new(descriptor(), 24);
        assert!(engine.is_option(OPT_DLL));
        assert!(!engine.is_option(OPT_P2O_AUDIO));
        engine.set_option(OPT_P2O_AUDIO, true);
        assert!(engine.is_option(OPT_P2O_AUDIO));
        engine.set_option(OPT_P2O_AUDIO, false);
        assert!(!engine.is_option(OPT_P2O_AUDIO));
    }

    #[test]
    fn stop_releases_waiters() {
        let engine = Engine::new(descriptor(), 24);
        let (_session, _ends) =
            Engine::activate(&engine, std::sync::Arc::new(crate::transport::MonotonicClock::new()));
        assert_eq!(engine.status(), EngineStatus::Ready);
        let waiter = {
            let engine = engine.clone();
            std::thread::spawn(move || engine.wait())
        };
        engine.stop();
        waiter.join().unwrap();
        assert_eq!(engine.status(), EngineStatus::Stop);
    }

    #[test]
    fn status_order_matches_lifecycle() {
        assert!(EngineStatus::Error < EngineStatus::Stop);
        assert!(EngineStatus::Stop < EngineStatus::Ready);
        assert!(EngineStatus::Ready < EngineStatus::Boot);
        assert!(EngineStatus::Boot < EngineStatus::Wait);
        assert!(EngineStatus::Wait < EngineStatus::Run);
    }
}
