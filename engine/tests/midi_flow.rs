//! MIDI adapter scenarios: packetising, SysEx framing, event timing,
//! and byte-exact round trips between the two representations.

use midly::MidiMessage;
use midly::live::LiveEvent;
use oblink_engine::midi::packet::{self, EVENT_BYTES, MidiEvent};
use oblink_engine::midi::{DeviceToHostMidi, EventSink, FrameClock, HostToDeviceMidi};
use oblink_engine::ring::{RingConsumer, RingProducer, ring_buffer};

const HOST_RATE: u64 = 48_000;

struct HostClock;

impl FrameClock for HostClock {
    fn time_to_frames(&self, time_us: u64) -> u32 {
        (time_us * HOST_RATE / 1_000_000) as u32
    }

    fn frames_to_time(&self, frame: u32) -> u64 {
        u64::from(frame) * 1_000_000 / HOST_RATE
    }
}

#[derive(Default)]
struct CollectingSink {
    events: Vec<(u32, Vec<u8>)>,
    refuse: bool,
    refused: u32,
}

impl EventSink for CollectingSink {
    fn write(&mut self, frame: u32, bytes: &[u8]) -> Result<(), ()> {
        if self.refuse {
            self.refused += 1;
            return Err(());
        }
        self.events.push((frame, bytes.to_vec()));
        Ok(())
    }

    fn lost_count(&self) -> u32 {
        self.refused
    }
}

fn push_packet(ring: &RingProducer, time: u64, header: u8, payload: &[u8]) {
    let mut buf = [0_u8; EVENT_BYTES];
    MidiEvent::new(time, header, payload).encode(&mut buf);
    assert!(ring.write(&buf));
}

fn drain_packets(ring: &RingConsumer) -> Vec<MidiEvent> {
    let mut packets = vec![];
    let mut buf = [0_u8; EVENT_BYTES];
    while ring.read_space() >= EVENT_BYTES {
        ring.read(&mut buf);
        packets.push(MidiEvent::decode(&buf));
    }
    packets
}

#[test]
fn sysex_is_chunked_into_wire_packets() {
    let (producer, consumer) = ring_buffer(1024);
    let mut translator = HostToDeviceMidi::new();
    let message = [0xf0, 0x01, 0x02, 0x03, 0x04, 0x05, 0xf7];
    translator.run([(0_u32, &message[..])].into_iter(), &producer, 77);

    let packets = drain_packets(&consumer);
    assert_eq!(packets.len(), 3);
    assert_eq!(packets[0], MidiEvent::new(77, 0x04, &[0xf0, 0x01, 0x02]));
    assert_eq!(packets[1], MidiEvent::new(77, 0x04, &[0x03, 0x04, 0x05]));
    assert_eq!(packets[2], MidiEvent::new(77, 0x05, &[0xf7, 0x00, 0x00]));
}

#[test]
fn sysex_payload_concatenation_is_identity() {
    for len in 3..32_usize {
        let mut message = vec![0xf0_u8];
        message.extend((0..len as u8 - 2).map(|b| b & 0x7f));
        message.push(0xf7);

        let (producer, consumer) = ring_buffer(4096);
        let mut translator = HostToDeviceMidi::new();
        translator.run([(0_u32, &message[..])].into_iter(), &producer, 0);

        let packets = drain_packets(&consumer);
        assert_eq!(packets.len(), message.len().div_ceil(3));

        let mut bytes = vec![];
        for (i, packet) in packets.iter().enumerate() {
            let (payload_len, send) = packet::classify(packet.header).unwrap();
            if i + 1 < packets.len() {
                assert_eq!(packet.header, 0x04);
                assert!(!send);
            } else {
                let expected_header = match (message.len() - 1) % 3 {
                    0 => 0x05,
                    1 => 0x06,
                    _ => 0x07,
                };
                assert_eq!(packet.header, expected_header);
                assert!(send);
            }
            bytes.extend_from_slice(&packet.data[..payload_len]);
        }
        assert_eq!(bytes, message);
    }
}

#[test]
fn sysex_tail_waits_for_the_next_cycle() {
    let (producer, consumer) = ring_buffer(1024);
    let mut translator = HostToDeviceMidi::new();
    translator.run([(0_u32, &[0xf0, 0x01][..])].into_iter(), &producer, 0);
    assert!(drain_packets(&consumer).is_empty());

    translator.run([(0_u32, &[0x02, 0xf7][..])].into_iter(), &producer, 1);
    let packets = drain_packets(&consumer);
    assert_eq!(packets.len(), 2);
    assert_eq!(packets[0], MidiEvent::new(1, 0x04, &[0xf0, 0x01, 0x02]));
    assert_eq!(packets[1], MidiEvent::new(1, 0x05, &[0xf7, 0x00, 0x00]));
}

#[test]
fn host_messages_map_by_status_byte() {
    let (producer, consumer) = ring_buffer(1024);
    let mut translator = HostToDeviceMidi::new();
    let note_on = [0x90_u8, 0x3c, 0x7f];
    let program_change = [0xc5_u8, 0x42];
    let clock_start = [0xfa_u8];
    translator.run(
        [
            (0_u32, &note_on[..]),
            (1_u32, &program_change[..]),
            (2_u32, &clock_start[..]),
        ]
        .into_iter(),
        &producer,
        5,
    );

    let packets = drain_packets(&consumer);
    assert_eq!(packets.len(), 3);
    assert_eq!(packets[0], MidiEvent::new(5, 0x09, &note_on));
    assert_eq!(packets[1], MidiEvent::new(5, 0x0c, &program_change));
    assert_eq!(packets[2], MidiEvent::new(5, 0x0f, &clock_start));
}

#[test]
fn note_on_round_trip_is_byte_exact() {
    // Host side: a midly-built note-on becomes one wire packet.
    let live = LiveEvent::Midi {
        channel: 0.into(),
        message: MidiMessage::NoteOn {
            key: 60.into(),
            vel: 127.into(),
        },
    };
    let mut message = vec![];
    live.write_std(&mut message).unwrap();
    assert_eq!(message, vec![0x90, 0x3c, 0x7f]);

    let (producer, consumer) = ring_buffer(1024);
    let mut h2o = HostToDeviceMidi::new();
    h2o.run([(0_u32, &message[..])].into_iter(), &producer, 0);
    let packets = drain_packets(&consumer);
    assert_eq!(packets.len(), 1);
    assert_eq!(packets[0].header, 0x09);

    // Device side: the same packet comes back as the original bytes.
    let (producer, consumer) = ring_buffer(1024);
    push_packet(&producer, 0, packets[0].header, &packets[0].data);
    let mut o2h = DeviceToHostMidi::new();
    let mut sink = CollectingSink::default();
    o2h.run(&consumer, &HostClock, &mut sink, 256, 256);
    assert_eq!(sink.events.len(), 1);
    assert_eq!(sink.events[0].1, message);
    assert!(LiveEvent::parse(&sink.events[0].1).is_ok());
}

#[test]
fn device_note_on_lands_on_the_computed_frame() {
    // last_frame 1000, cycle of 256: an event stamped 20 ms in lands at
    // time_to_frames(T) + nframes - last_frame = 960 + 256 - 1000 = 216.
    let (producer, consumer) = ring_buffer(1024);
    push_packet(&producer, 20_000, 0x09, &[0x90, 0x3c, 0x7f]);
    let mut o2h = DeviceToHostMidi::new();
    let mut sink = CollectingSink::default();
    o2h.run(&consumer, &HostClock, &mut sink, 256, 1000);
    assert_eq!(sink.events.len(), 1);
    assert_eq!(sink.events[0], (216, vec![0x90, 0x3c, 0x7f]));
}

#[test]
fn late_event_is_emitted_at_frame_zero() {
    let (producer, consumer) = ring_buffer(1024);
    // 10 ms -> frame 480; 480 + 256 < 1000, so the event is late.
    push_packet(&producer, 10_000, 0x09, &[0x90, 0x3c, 0x7f]);
    let mut o2h = DeviceToHostMidi::new();
    let mut sink = CollectingSink::default();
    o2h.run(&consumer, &HostClock, &mut sink, 256, 1000);
    assert_eq!(sink.events.len(), 1);
    assert_eq!(sink.events[0], (0, vec![0x90, 0x3c, 0x7f]));
}

#[test]
fn future_event_stays_queued_for_the_next_cycle() {
    let (producer, consumer) = ring_buffer(1024);
    // 30 ms -> frame 1440; 1440 + 256 - 1000 >= 256, so not due yet.
    push_packet(&producer, 30_000, 0x09, &[0x90, 0x3c, 0x7f]);
    let mut o2h = DeviceToHostMidi::new();
    let mut sink = CollectingSink::default();
    o2h.run(&consumer, &HostClock, &mut sink, 256, 1000);
    assert!(sink.events.is_empty());
    assert_eq!(consumer.read_space(), EVENT_BYTES);

    // Two cycles later it falls inside the window.
    o2h.run(&consumer, &HostClock, &mut sink, 256, 1512);
    assert_eq!(sink.events.len(), 1);
    assert_eq!(sink.events[0], (184, vec![0x90, 0x3c, 0x7f]));
}

#[test]
fn device_sysex_is_reassembled_into_one_event() {
    let (producer, consumer) = ring_buffer(1024);
    push_packet(&producer, 0, 0x04, &[0xf0, 0x01, 0x02]);
    push_packet(&producer, 0, 0x04, &[0x03, 0x04, 0x05]);
    push_packet(&producer, 0, 0x05, &[0xf7]);
    let mut o2h = DeviceToHostMidi::new();
    let mut sink = CollectingSink::default();
    o2h.run(&consumer, &HostClock, &mut sink, 256, 256);
    assert_eq!(sink.events.len(), 1);
    assert_eq!(
        sink.events[0].1,
        vec![0xf0, 0x01, 0x02, 0x03, 0x04, 0x05, 0xf7]
    );
}

#[test]
fn refused_reservation_drains_the_queue() {
    let (producer, consumer) = ring_buffer(1024);
    push_packet(&producer, 0, 0x09, &[0x90, 0x3c, 0x7f]);
    push_packet(&producer, 0, 0x09, &[0x90, 0x3d, 0x7f]);
    let mut o2h = DeviceToHostMidi::new();
    let mut sink = CollectingSink {
        refuse: true,
        ..Default::default()
    };
    o2h.run(&consumer, &HostClock, &mut sink, 256, 256);
    assert!(sink.events.is_empty());
    assert_eq!(sink.refused, 2);

    // The queue did not accumulate the refused payloads.
    sink.refuse = false;
    push_packet(&producer, 0, 0x09, &[0x90, 0x3e, 0x7f]);
    o2h.run(&consumer, &HostClock, &mut sink, 256, 256);
    assert_eq!(sink.events.len(), 1);
    assert_eq!(sink.events[0].1, vec![0x90, 0x3e, 0x7f]);
}

#[test]
fn queue_overflow_skips_to_the_end_of_the_message() {
    let (producer, consumer) = ring_buffer(8192);
    let mut o2h = DeviceToHostMidi::new();
    let mut sink = CollectingSink::default();

    // A SysEx long enough to overflow the 4096-byte reassembly queue,
    // fed as continuation packets across several cycles.
    let mut remaining = 1500_usize;
    while remaining > 0 {
        let batch = remaining.min(300);
        for _ in 0..batch {
            push_packet(&producer, 0, 0x04, &[0x01, 0x02, 0x03]);
        }
        o2h.run(&consumer, &HostClock, &mut sink, 256, 256);
        remaining -= batch;
    }
    assert!(sink.events.is_empty());

    // The terminal packet clears the skip without emitting the truncated
    // message; the next message flows normally.
    push_packet(&producer, 0, 0x05, &[0xf7]);
    push_packet(&producer, 0, 0x09, &[0x90, 0x40, 0x40]);
    o2h.run(&consumer, &HostClock, &mut sink, 256, 256);
    assert_eq!(sink.events.len(), 1);
    assert_eq!(sink.events[0].1, vec![0x90, 0x40, 0x40]);
}
