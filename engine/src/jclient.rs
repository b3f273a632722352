//! JACK side of the bridge: ports, callbacks, and the per-cycle
//! orchestration of MIDI translation, ratio tracking, and the two
//! converter passes.

use crate::converter::Quality;
use crate::devices::DeviceDescriptor;
use crate::engine::{Engine, EngineStatus, OPT_P2O_AUDIO};
use crate::midi::{DeviceToHostMidi, EventSink, FrameClock, HostToDeviceMidi};
use crate::mutex::UnsafeMutex;
use crate::resampler::Resampler;
use crate::ring::{RingConsumer, RingProducer};
use crate::transport::{self, DEFAULT_RT_PRIORITY, TimeSource, Transport};
use jack::{
    AudioIn, AudioOut, Client, ClientOptions, ClientStatus, Control, Frames, LatencyType, MidiIn,
    MidiOut, NotificationHandler, Port, PortId, ProcessHandler, ProcessScope, RawMidi,
};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Options recognised at bridge construction.
#[derive(Debug, Clone)]
pub struct Config {
    /// USB coordinates, for transports that address real hardware.
    pub bus: Option<u32>,
    pub address: Option<u32>,
    pub blocks_per_transfer: usize,
    pub xfr_timeout_ms: u32,
    pub quality: Quality,
    /// Transport thread RT priority; negative selects the default.
    pub priority: i32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bus: None,
            address: None,
            blocks_per_transfer: 24,
            xfr_timeout_ms: 10,
            quality: Quality::default(),
            priority: -1,
        }
    }
}

struct JackTime;

impl TimeSource for JackTime {
    fn time_us(&self) -> u64 {
        jack::get_time()
    }
}

struct CycleClock<'a> {
    client: &'a Client,
}

impl FrameClock for CycleClock<'_> {
    fn time_to_frames(&self, time_us: u64) -> u32 {
        self.client.time_to_frames(time_us)
    }

    fn frames_to_time(&self, frame: u32) -> u64 {
        self.client.frames_to_time(frame)
    }
}

struct PortSink<'r, 'p> {
    writer: jack::MidiWriter<'p>,
    refused: &'r mut u32,
}

impl EventSink for PortSink<'_, '_> {
    fn write(&mut self, frame: u32, bytes: &[u8]) -> Result<(), ()> {
        self.writer
            .write(&RawMidi { time: frame, bytes })
            .map_err(|_| {
                *self.refused += 1;
            })
    }

    fn lost_count(&self) -> u32 {
        *self.refused
    }
}

struct Process {
    engine: Arc<Engine>,
    resampler: Arc<UnsafeMutex<Resampler>>,
    output_ports: Vec<Port<AudioOut>>,
    input_ports: Vec<Port<AudioIn>>,
    midi_out_port: Port<MidiOut>,
    midi_in_port: Port<MidiIn>,
    o2h_midi: RingConsumer,
    h2o_midi: RingProducer,
    o2h_translator: DeviceToHostMidi,
    h2o_translator: HostToDeviceMidi,
    refused_events: u32,
    inputs: usize,
    outputs: usize,
}

impl Process {
    fn o2h_midi_cycle(&mut self, client: &Client, ps: &ProcessScope, nframes: Frames) {
        let clock = CycleClock { client };
        let writer = self.midi_out_port.writer(ps);
        let mut sink = PortSink {
            writer,
            refused: &mut self.refused_events,
        };
        self.o2h_translator.run(
            &self.o2h_midi,
            &clock,
            &mut sink,
            nframes,
            ps.last_frame_time(),
        );
    }

    fn h2o_midi_cycle(&mut self, client: &Client, ps: &ProcessScope, current_frames: Frames) {
        let time = client.frames_to_time(current_frames);
        let events = self.midi_in_port.iter(ps).map(|raw| (raw.time, raw.bytes));
        self.h2o_translator.run(events, &self.h2o_midi, time);
    }
}

impl ProcessHandler for Process {
    fn process(&mut self, client: &Client, ps: &ProcessScope) -> Control {
        let nframes = ps.n_frames();
        let (current_frames, current_usecs) = match ps.cycle_times() {
            Ok(times) => (times.current_frames, times.current_usecs),
            Err(e) => {
                error!("Error while getting JACK time: {e}");
                (ps.last_frame_time(), jack::get_time())
            }
        };

        // MIDI runs independently of the audio status.
        self.o2h_midi_cycle(client, ps, nframes);
        self.h2o_midi_cycle(client, ps, current_frames);

        let resampler = self.resampler.lock();
        if !resampler.compute_ratios(current_usecs) {
            return Control::Continue;
        }

        let frames = nframes as usize;
        if resampler.bufsize() as usize != frames {
            error!(
                "Cycle of {} frames does not match buffer size {}",
                frames,
                resampler.bufsize()
            );
            return Control::Continue;
        }

        resampler.read_audio();
        let src = resampler.o2h_output();
        for (ch, port) in self.output_ports.iter_mut().enumerate() {
            let dst = port.as_mut_slice(ps);
            for (i, sample) in dst.iter_mut().take(frames).enumerate() {
                *sample = src[i * self.outputs + ch];
            }
        }

        if self.engine.is_option(OPT_P2O_AUDIO) {
            let dst = resampler.h2o_input_mut();
            for (ch, port) in self.input_ports.iter().enumerate() {
                let samples = port.as_slice(ps);
                for (i, sample) in samples.iter().take(frames).enumerate() {
                    dst[i * self.inputs + ch] = *sample;
                }
            }
            resampler.write_audio();
        }

        Control::Continue
    }

    fn buffer_size(&mut self, _: &Client, size: Frames) -> Control {
        debug!("JACK buffer size: {size}");
        self.resampler.lock().set_buffer_size(size);
        Control::Continue
    }
}

struct Notifications {
    engine: Arc<Engine>,
    resampler: Arc<UnsafeMutex<Resampler>>,
    input_port_names: Vec<String>,
    output_port_names: Vec<String>,
}

impl Notifications {
    fn refresh_connections(&self, client: &Client) {
        let mut total = 0;
        for name in &self.input_port_names {
            if let Some(port) = client.port_by_name(name) {
                total += port.connected_count().unwrap_or(0);
            }
        }
        self.engine.set_option(OPT_P2O_AUDIO, total != 0);

        for name in &self.output_port_names {
            if let Some(port) = client.port_by_name(name) {
                total += port.connected_count().unwrap_or(0);
            }
        }
        if total == 0 {
            self.resampler.lock().clear_buffers();
        }
    }
}

impl NotificationHandler for Notifications {
    unsafe fn shutdown(&mut self, _status: ClientStatus, reason: &str) {
        debug!("JACK is shutting down: {reason}");
        self.resampler.lock().report_status();
        self.engine.stop();
    }

    fn freewheel(&mut self, _: &Client, enabled: bool) {
        debug!("JACK in freewheel mode: {enabled}");
    }

    fn sample_rate(&mut self, _: &Client, srate: Frames) -> Control {
        debug!("JACK sample rate: {srate}");
        self.resampler.lock().set_samplerate(srate);
        Control::Continue
    }

    fn client_registration(&mut self, _: &Client, name: &str, registered: bool) {
        debug!(
            "JACK client {} is being {}...",
            name,
            if registered {
                "registered"
            } else {
                "unregistered"
            }
        );
    }

    fn ports_connected(&mut self, client: &Client, _a: PortId, _b: PortId, _connected: bool) {
        self.refresh_connections(client);
    }

    fn graph_reorder(&mut self, _: &Client) -> Control {
        debug!("JACK calling graph order...");
        Control::Continue
    }

    fn xrun(&mut self, _: &Client) -> Control {
        error!("JACK xrun");
        self.resampler.lock().inc_xruns();
        Control::Continue
    }

    fn latency(&mut self, client: &Client, mode: LatencyType) {
        debug!("JACK latency request");
        match mode {
            LatencyType::Playback => {
                let (current, max) = self.resampler.lock().o2h_latency();
                let base = self
                    .input_port_names
                    .first()
                    .and_then(|name| client.port_by_name(name))
                    .map(|port| port.get_latency_range(LatencyType::Playback))
                    .unwrap_or((0, 0));
                for name in &self.output_port_names {
                    if let Some(port) = client.port_by_name(name) {
                        port.set_latency_range(
                            LatencyType::Playback,
                            (base.0 + current as Frames, base.1 + max as Frames),
                        );
                    }
                }
            }
            LatencyType::Capture => {
                let (current, max) = self.resampler.lock().h2o_latency();
                let base = self
                    .output_port_names
                    .first()
                    .and_then(|name| client.port_by_name(name))
                    .map(|port| port.get_latency_range(LatencyType::Capture))
                    .unwrap_or((0, 0));
                for name in &self.input_port_names {
                    if let Some(port) = client.port_by_name(name) {
                        port.set_latency_range(
                            LatencyType::Capture,
                            (base.0 + current as Frames, base.1 + max as Frames),
                        );
                    }
                }
            }
        }
    }
}

/// One bridged device: owns the engine and the resampler, runs the JACK
/// client, and supervises the transport thread.
pub struct JackBridge {
    engine: Arc<Engine>,
    resampler: Arc<UnsafeMutex<Resampler>>,
    priority: i32,
}

impl JackBridge {
    pub fn new(desc: DeviceDescriptor, config: &Config) -> Self {
        let engine = Engine::new(desc, config.blocks_per_transfer);
        let resampler = Arc::new(UnsafeMutex::new(Resampler::new(
            engine.clone(),
            config.quality,
        )));
        let priority = if config.priority < 0 {
            DEFAULT_RT_PRIORITY
        } else {
            config.priority
        };
        Self {
            engine,
            resampler,
            priority,
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Reports status once and asks the engine to stop; `run` unwinds
    /// from there.
    pub fn stop(&self) {
        debug!("Stopping client...");
        self.resampler.lock().report_status();
        self.engine.stop();
    }

    /// Blocks until the bridge terminates. Fatal errors surface here;
    /// everything transient is logged and absorbed on the way.
    pub fn run(&self, transport: Box<dyn Transport>) -> Result<(), String> {
        let desc = self.engine.descriptor().clone();
        let (client, status) = Client::new(&desc.name, ClientOptions::NO_START_SERVER)
            .map_err(|e| format!("Unable to connect to JACK server: {e}"))?;
        if status.contains(ClientStatus::NAME_NOT_UNIQUE) {
            debug!("Client name in use. Using {}...", client.name());
        }

        {
            let resampler = self.resampler.lock();
            resampler.set_samplerate(client.sample_rate() as u32);
            resampler.set_buffer_size(client.buffer_size());
        }

        debug!("Registering ports...");
        let mut output_ports = Vec::with_capacity(desc.output_count());
        let mut output_port_names = Vec::with_capacity(desc.output_count());
        for name in &desc.outputs {
            let port = client
                .register_port(name, AudioOut::default())
                .map_err(|e| format!("Error while registering JACK port {name}: {e}"))?;
            output_port_names.push(port.name().map_err(|e| e.to_string())?);
            output_ports.push(port);
        }
        let mut input_ports = Vec::with_capacity(desc.input_count());
        let mut input_port_names = Vec::with_capacity(desc.input_count());
        for name in &desc.inputs {
            let port = client
                .register_port(name, AudioIn::default())
                .map_err(|e| format!("Error while registering JACK port {name}: {e}"))?;
            input_port_names.push(port.name().map_err(|e| e.to_string())?);
            input_ports.push(port);
        }
        let midi_out_port = client
            .register_port("MIDI out", MidiOut::default())
            .map_err(|e| format!("Error while registering JACK port MIDI out: {e}"))?;
        let midi_in_port = client
            .register_port("MIDI in", MidiIn::default())
            .map_err(|e| format!("Error while registering JACK port MIDI in: {e}"))?;

        debug!("Using RT priority {}...", self.priority);
        let (session, midi_ends) = self.resampler.lock().activate(Arc::new(JackTime));
        let transport_handle = transport::spawn(transport, session, self.priority);

        let process = Process {
            engine: self.engine.clone(),
            resampler: self.resampler.clone(),
            output_ports,
            input_ports,
            midi_out_port,
            midi_in_port,
            o2h_midi: midi_ends.o2h,
            h2o_midi: midi_ends.h2o,
            o2h_translator: DeviceToHostMidi::new(),
            h2o_translator: HostToDeviceMidi::new(),
            refused_events: 0,
            inputs: desc.input_count(),
            outputs: desc.output_count(),
        };
        let notifications = Notifications {
            engine: self.engine.clone(),
            resampler: self.resampler.clone(),
            input_port_names,
            output_port_names,
        };

        let active = match client.activate_async(notifications, process) {
            Ok(active) => active,
            Err(e) => {
                self.engine.stop();
                let _ = transport_handle.join();
                return Err(format!("Cannot activate client: {e}"));
            }
        };

        self.engine.wait();
        info!("Exiting...");

        let failed = self.engine.status() == EngineStatus::Error;
        if let Err(e) = active.deactivate() {
            error!("Error while deactivating JACK client: {e}");
        }
        let _ = transport_handle.join();

        if failed {
            Err("Engine terminated with an error".to_string())
        } else {
            Ok(())
        }
    }
}
