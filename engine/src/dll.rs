//! Delay-locked loops bridging the two clock domains.
//!
//! The transport thread feeds [`TransferDll`] one tick per USB transfer,
//! which smooths arrival jitter into a (time, frame) line for the device
//! clock. The audio callback snapshots that line into [`TrackingDll`],
//! which integrates the phase error between device frames produced and
//! frames consumed by the upstream converter into the running ratio
//! `device_rate / host_rate`.

// Arrival-time smoothing bandwidth for USB transfers.
const TRANSFER_BANDWIDTH_HZ: f64 = 1.0;

// Per-cycle loop gain of the ratio tracker at coefficient 1.0, and the
// integrator fraction that keeps the second-order loop critically damped.
const PROPORTIONAL_GAIN: f64 = 0.1;
const INTEGRAL_RATIO: f64 = 0.25;

/// Device-side stage, owned by the engine and updated under its lock.
#[derive(Debug, Clone, Copy)]
pub struct TransferDll {
    b: f64,
    c: f64,
    e2: f64,
    t0: f64,
    t1: f64,
    f0: f64,
    f1: f64,
    frames_per_transfer: usize,
    started: bool,
}

impl TransferDll {
    pub fn new(device_rate: f64, frames_per_transfer: usize) -> Self {
        let dt = frames_per_transfer as f64 / device_rate;
        let w = 2.0 * std::f64::consts::PI * TRANSFER_BANDWIDTH_HZ * dt;
        Self {
            b: std::f64::consts::SQRT_2 * w,
            c: w * w,
            e2: dt,
            t0: 0.0,
            t1: 0.0,
            f0: 0.0,
            f1: 0.0,
            frames_per_transfer,
            started: false,
        }
    }

    pub fn started(&self) -> bool {
        self.started
    }

    /// First transfer: anchors the line at the observed wallclock.
    pub fn start(&mut self, time_us: u64) {
        let t = time_us as f64 * 1.0e-6;
        self.t0 = t;
        self.t1 = t + self.e2;
        self.f0 = 0.0;
        self.f1 = self.frames_per_transfer as f64;
        self.started = true;
    }

    /// Subsequent transfers: predict, correct by the observed error.
    pub fn inc(&mut self, frames: usize, time_us: u64) {
        let t = time_us as f64 * 1.0e-6;
        let e = t - self.t1;
        self.t0 = self.t1;
        self.t1 += self.b * e + self.e2;
        self.e2 += self.c * e;
        self.f0 = self.f1;
        self.f1 += frames as f64;
    }
}

/// Host-side stage, owned by the resampler and advanced once per cycle.
#[derive(Debug, Clone, Copy)]
pub struct TrackingDll {
    ratio_ref: f64,
    pub ratio: f64,
    pub ratio_avg: f64,
    pub last_ratio_avg: f64,
    ratio_sum: f64,
    kj: f64,
    err: f64,
    z1: f64,
    z2: f64,
    z3: f64,
    w0: f64,
    w1: f64,
    w2: f64,
    t0: f64,
    t1: f64,
    f0: f64,
    f1: f64,
}

impl Default for TrackingDll {
    fn default() -> Self {
        Self::new(48_000, 48_000, 256)
    }
}

impl TrackingDll {
    pub fn new(samplerate: u32, device_rate: u32, bufsize: u32) -> Self {
        let ratio_ref = f64::from(device_rate) / f64::from(samplerate);
        let mut dll = Self {
            ratio_ref,
            ratio: ratio_ref,
            ratio_avg: 0.0,
            last_ratio_avg: 0.0,
            ratio_sum: 0.0,
            kj: 0.0,
            err: 0.0,
            z1: 0.0,
            z2: 0.0,
            z3: 0.0,
            w0: 0.0,
            w1: 0.0,
            w2: 0.0,
            t0: 0.0,
            t1: 0.0,
            f0: 0.0,
            f1: 0.0,
        };
        dll.set_loop_filter(1.0, bufsize, samplerate);
        dll
    }

    pub fn set_loop_filter(&mut self, coeff: f64, bufsize: u32, samplerate: u32) {
        let w = 2.0 * std::f64::consts::PI * coeff * f64::from(bufsize) / f64::from(samplerate);
        self.w0 = 1.0 - (-20.0 * w).exp();
        self.w1 = PROPORTIONAL_GAIN * coeff / f64::from(bufsize);
        self.w2 = PROPORTIONAL_GAIN * coeff * INTEGRAL_RATIO;
    }

    /// Copies the transfer-side line; call with the engine lock held.
    pub fn load_transfer(&mut self, transfer: &TransferDll) {
        if !transfer.started() {
            return;
        }
        self.t0 = transfer.t0;
        self.t1 = transfer.t1;
        self.f0 = transfer.f0;
        self.f1 = transfer.f1;
    }

    /// Phase error at host-cycle time: frames consumed minus the device
    /// frame count interpolated on the transfer line.
    pub fn update_err(&mut self, time_us: u64) {
        if self.t1 <= self.t0 {
            self.err = 0.0;
            return;
        }
        let tj = time_us as f64 * 1.0e-6;
        let frames_at = self.f0 + (tj - self.t0) * (self.f1 - self.f0) / (self.t1 - self.t0);
        self.err = self.kj - frames_at;
    }

    /// Zeroes the phase so tracking starts without a startup offset.
    pub fn first_time_run(&mut self) {
        self.kj -= self.err;
        self.err = 0.0;
        self.z1 = 0.0;
        self.z2 = 0.0;
        self.z3 = 0.0;
    }

    pub fn update(&mut self) {
        self.z1 += self.w0 * (self.w1 * self.err - self.z1);
        self.z2 += self.w0 * (self.z1 - self.z2);
        self.z3 += self.w2 * self.z2;
        self.ratio = self.ratio_ref - self.z2 - self.z3;
        self.ratio_sum += self.ratio;
    }

    /// Device frames handed to the upstream converter.
    pub fn add_consumed(&mut self, frames: usize) {
        self.kj += frames as f64;
    }

    pub fn calc_avg(&mut self, window: u32) {
        self.last_ratio_avg = self.ratio_avg;
        self.ratio_avg = self.ratio_sum / f64::from(window);
        self.ratio_sum = 0.0;
    }

    /// Host sample rate changed while running: carry the converged ratio
    /// over, scaled by the rate change, and restart the loop around it.
    pub fn rescale(&mut self, factor: f64) {
        let base = if self.last_ratio_avg > 0.0 {
            self.last_ratio_avg
        } else {
            self.ratio
        };
        self.ratio_ref = base * factor;
        self.ratio = self.ratio_ref;
        self.ratio_sum = 0.0;
        self.err = 0.0;
        self.z1 = 0.0;
        self.z2 = 0.0;
        self.z3 = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::{TrackingDll, TransferDll};

    // Runs both stages against ideal clocks: transfers arrive at the real
    // device rate, cycles at the host rate, and consumption follows the
    // published ratio the way the upstream converter does. The loop
    // filter narrows at 5 s and 10 s like the boot/tune/run staging.
    fn simulate(device_rate_real: f64, host_rate: f64, seconds: f64) -> TrackingDll {
        let bufsize = 256_u32;
        let frames_per_transfer = 168_usize;
        let mut transfer = TransferDll::new(48_000.0, frames_per_transfer);
        let mut dll = TrackingDll::new(host_rate as u32, 48_000, bufsize);

        let transfer_period = frames_per_transfer as f64 / device_rate_real;
        let cycle_period = f64::from(bufsize) / host_rate;
        let mut next_transfer = 0.0_f64;
        let mut next_cycle = cycle_period;
        let mut t = 0.0_f64;
        let mut started = false;
        let mut carry = 0.0_f64;
        let mut tuned = false;
        let mut narrowed = false;

        while t < seconds {
            if next_transfer <= next_cycle {
                t = next_transfer;
                let us = (t * 1.0e6) as u64;
                if transfer.started() {
                    transfer.inc(frames_per_transfer, us);
                } else {
                    transfer.start(us);
                }
                next_transfer += transfer_period;
            } else {
                t = next_cycle;
                let us = (t * 1.0e6) as u64;
                if !tuned && t > 5.0 {
                    dll.set_loop_filter(0.05, bufsize, host_rate as u32);
                    tuned = true;
                }
                if !narrowed && t > 10.0 {
                    dll.set_loop_filter(0.02, bufsize, host_rate as u32);
                    narrowed = true;
                }
                dll.load_transfer(&transfer);
                dll.update_err(us);
                if !started {
                    dll.first_time_run();
                    started = true;
                } else {
                    dll.update();
                    let wanted = f64::from(bufsize) * dll.ratio + carry;
                    let consumed = wanted.floor().max(0.0);
                    carry = wanted - consumed;
                    dll.add_consumed(consumed as usize);
                }
                next_cycle += cycle_period;
            }
        }
        dll
    }

    #[test]
    fn locks_on_equal_rates() {
        let dll = simulate(48_000.0, 48_000.0, 12.0);
        assert!((dll.ratio - 1.0).abs() < 1.0e-4, "ratio {}", dll.ratio);
    }

    #[test]
    fn tracks_device_drift() {
        let dll = simulate(48_048.0, 48_000.0, 20.0);
        let expected = 48_048.0 / 48_000.0;
        assert!(
            (dll.ratio - expected).abs() < 1.0e-4,
            "ratio {} expected {}",
            dll.ratio,
            expected
        );
    }

    #[test]
    fn rescale_carries_the_average() {
        let mut dll = simulate(48_000.0, 48_000.0, 12.0);
        // Flush the accumulated sum, then fill two aligned windows so the
        // rolling averages are meaningful.
        dll.calc_avg(1);
        for _ in 0..200 {
            dll.update();
        }
        dll.calc_avg(200);
        for _ in 0..200 {
            dll.update();
        }
        dll.calc_avg(200);
        let base = dll.last_ratio_avg;
        assert!((base - 1.0).abs() < 1.0e-3, "window average {base}");

        dll.rescale(48_000.0 / 96_000.0);
        assert!((dll.ratio - base * 0.5).abs() < 1.0e-9);
    }
}
