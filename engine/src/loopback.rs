//! Software stand-in for a USB transport: paces itself at the device
//! rate and echoes downstream audio and MIDI back upstream. Lets the
//! whole bridge run against a host graph with no hardware attached.

use crate::devices::SAMPLE_RATE;
use crate::transport::{Transport, TransportSession};
use std::time::{Duration, Instant};
use tracing::debug;

pub struct LoopbackTransport;

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self
    }
}

impl Transport for LoopbackTransport {
    fn run(&mut self, mut session: TransportSession) -> Result<(), String> {
        let desc = session.engine().descriptor().clone();
        let inputs = desc.input_count();
        let outputs = desc.output_count();
        let frames = session.frames_per_transfer();
        let mut h2o = vec![0.0_f32; frames * inputs];
        let mut o2h = vec![0.0_f32; frames * outputs];

        let period =
            Duration::from_nanos((frames as u64 * 1_000_000_000) / u64::from(SAMPLE_RATE));
        let mut deadline = Instant::now() + period;

        debug!(
            "Loopback transport for {} running ({} frames per transfer)",
            desc.name, frames
        );

        while !session.stopped() {
            let now = Instant::now();
            if deadline > now {
                std::thread::sleep(deadline - now);
            } else if now - deadline > period * 8 {
                // Fell badly behind (debugger, suspend); resynchronize
                // instead of bursting transfers.
                deadline = now;
            }
            deadline += period;

            let time_us = session.time_us();
            session.pull_audio(&mut h2o);
            for frame in 0..frames {
                for ch in 0..outputs {
                    o2h[frame * outputs + ch] = h2o[frame * inputs + ch % inputs];
                }
            }
            session.push_audio(&o2h, time_us);

            while let Some(mut event) = session.pull_midi() {
                event.time = time_us;
                session.push_midi(&event);
            }
        }

        debug!("Loopback transport for {} finished", desc.name);
        Ok(())
    }
}
