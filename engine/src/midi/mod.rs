//! MIDI stream adapters between the device's packetised wire format and
//! the host's per-cycle timestamped events, in both directions.

pub mod packet;

use crate::ring::{RingConsumer, RingProducer};
use packet::{EVENT_BYTES, MidiEvent, PACKET_DATA_BYTES, classify, header_for};
use tracing::{debug, error};

/// Ring and reassembly-queue length; enough for several event bursts.
pub const MIDI_BUF_LEN: usize = 4096;

/// Bounded byte buffer used to reassemble or fragment SysEx across
/// packets. Overflow empties the queue and reports failure.
pub struct ByteQueue {
    data: Vec<u8>,
    max_len: usize,
}

impl ByteQueue {
    pub fn new(max_len: usize) -> Self {
        Self {
            data: Vec::with_capacity(max_len),
            max_len,
        }
    }

    pub fn write(&mut self, bytes: &[u8]) -> Result<(), ()> {
        if self.data.len() + bytes.len() >= self.max_len {
            error!("Not enough space in MIDI queue. Resetting...");
            self.data.clear();
            return Err(());
        }
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Drops `n` bytes from the head, keeping any unconsumed tail.
    pub fn consume(&mut self, n: usize) {
        self.data.drain(..n.min(self.data.len()));
    }
}

/// Host frame/time conversions the translators need; implemented by the
/// JACK client and by test clocks.
pub trait FrameClock {
    fn time_to_frames(&self, time_us: u64) -> u32;
    fn frames_to_time(&self, frame: u32) -> u64;
}

/// Per-cycle host MIDI output buffer.
pub trait EventSink {
    fn write(&mut self, frame: u32, bytes: &[u8]) -> Result<(), ()>;
    /// Events the host has dropped so far; polled after each emission.
    fn lost_count(&self) -> u32;
}

/// Device to host: drains packets from the o2h MIDI ring into host
/// events with per-event frame offsets.
pub struct DeviceToHostMidi {
    queue: ByteQueue,
    skipping: bool,
    last_lost_count: u32,
}

impl Default for DeviceToHostMidi {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceToHostMidi {
    pub fn new() -> Self {
        Self {
            queue: ByteQueue::new(MIDI_BUF_LEN),
            skipping: false,
            last_lost_count: 0,
        }
    }

    pub fn run(
        &mut self,
        ring: &RingConsumer,
        clock: &impl FrameClock,
        sink: &mut impl EventSink,
        nframes: u32,
        last_frame: u32,
    ) {
        let mut buf = [0_u8; EVENT_BYTES];
        while ring.read_space() >= EVENT_BYTES {
            ring.peek(&mut buf);
            let event = MidiEvent::decode(&buf);

            // One extra cycle is the highest delay worth aiming for:
            // whatever the device generated during the previous cycle can
            // always be played, so no automatic look-ahead is needed.
            let event_frame = clock.time_to_frames(event.time).wrapping_add(nframes);

            let frame = if event_frame < last_frame {
                debug!("o2h: Processing missed event at frame 0...");
                0
            } else {
                let offset = event_frame - last_frame;
                if offset >= nframes {
                    // Not due yet; leave it queued for the next cycle.
                    break;
                }
                offset
            };

            ring.advance(EVENT_BYTES);

            let Some((len, send)) = classify(event.header) else {
                error!("o2h: Message {:02x} not implemented", event.header);
                self.queue.clear();
                self.skipping = false;
                continue;
            };
            if self.skipping {
                // A queue overflow is skipped through to the end of the
                // message it truncated.
                self.skipping = event.header == packet::SYSEX_CONT;
                if event.header <= packet::SYSEX_END_3 {
                    continue;
                }
            }

            if self.queue.write(&event.data[..len]).is_err() {
                self.skipping = true;
                continue;
            }

            if send {
                if sink.write(frame, self.queue.as_slice()).is_err() {
                    error!("o2h: Host could not reserve event");
                }
                self.queue.clear();
            }

            let lost = sink.lost_count();
            if lost > self.last_lost_count {
                self.last_lost_count = lost;
                error!("Lost event count: {}", lost);
            }
        }
    }
}

/// Host to device: packetises host events onto the h2o MIDI ring,
/// fragmenting SysEx into 3-byte chunks across cycles.
pub struct HostToDeviceMidi {
    queue: ByteQueue,
    ongoing_sysex: bool,
}

impl Default for HostToDeviceMidi {
    fn default() -> Self {
        Self::new()
    }
}

impl HostToDeviceMidi {
    pub fn new() -> Self {
        Self {
            queue: ByteQueue::new(MIDI_BUF_LEN),
            ongoing_sysex: false,
        }
    }

    /// Feeds one cycle's host events, all stamped with the cycle's base
    /// wallclock time.
    pub fn run<'a>(
        &mut self,
        events: impl Iterator<Item = (u32, &'a [u8])>,
        ring: &RingProducer,
        time_us: u64,
    ) {
        for (_frame, bytes) in events {
            if bytes.is_empty() {
                continue;
            }
            if bytes[0] == 0xf0 || self.ongoing_sysex {
                self.ongoing_sysex = true;
                self.sysex(bytes, ring, time_us);
            } else {
                Self::message(bytes, ring, time_us);
            }
        }
    }

    fn message(bytes: &[u8], ring: &RingProducer, time_us: u64) {
        let Some(header) = header_for(bytes[0], bytes.len()) else {
            error!("h2o: Message {:02x} not implemented", bytes[0] & 0xf0);
            return;
        };
        Self::enqueue(ring, MidiEvent::new(time_us, header, bytes));
    }

    fn sysex(&mut self, bytes: &[u8], ring: &RingProducer, time_us: u64) {
        if self.queue.write(bytes).is_err() {
            return;
        }

        let data = self.queue.as_slice();
        let mut consumed = 0_usize;
        while consumed < data.len() {
            let mut header = packet::SYSEX_CONT;
            let mut len = 0_usize;
            let mut end = false;
            for (i, byte) in data[consumed..].iter().take(PACKET_DATA_BYTES).enumerate() {
                len = i + 1;
                if *byte == 0xf7 {
                    header = match i {
                        0 => packet::SYSEX_END_1,
                        1 => packet::SYSEX_END_2,
                        _ => packet::SYSEX_END_3,
                    };
                    end = true;
                    self.ongoing_sysex = false;
                    break;
                }
            }

            if !end && len < PACKET_DATA_BYTES {
                // Partial tail; wait for the rest of the message.
                break;
            }

            Self::enqueue(
                ring,
                MidiEvent::new(time_us, header, &data[consumed..consumed + len]),
            );
            consumed += len;
        }

        self.queue.consume(consumed);
        debug!("h2o: SysEx pending bytes: {}", self.queue.len());
    }

    fn enqueue(ring: &RingProducer, event: MidiEvent) {
        if ring.write_space() >= EVENT_BYTES {
            let mut buf = [0_u8; EVENT_BYTES];
            event.encode(&mut buf);
            ring.write(&buf);
        } else {
            error!("h2o: MIDI ring buffer overflow. Discarding data...");
        }
    }
}
