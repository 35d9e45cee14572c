//! Driver collaborator: what wakes the process cycle
//!
//! A driver decides when a period of data is available and moves it between
//! the device and the port buffers. Hardware backends live outside this
//! crate; two software drivers are provided.

use std::time::{Duration, Instant};

use crate::error::DriverError;

/// What [`Driver::wait`] reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitStatus {
    /// Frames available this cycle
    pub nframes: u32,
    /// How late the wakeup was [µs]
    pub delayed_usecs: u64,
}

/// Period source for the process cycle.
///
/// `wait`, `read` and `write` run on the process thread every cycle and
/// must not allocate. `set_buffer_size` and `set_sample_rate` run between
/// cycles.
pub trait Driver: Send + 'static {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Prepare for the first `wait`.
    fn start(&mut self) -> Result<(), DriverError>;

    /// Stop producing periods.
    fn stop(&mut self) -> Result<(), DriverError>;

    /// Block until the next period is due.
    fn wait(&mut self) -> Result<WaitStatus, DriverError>;

    /// Capture: device → port buffers.
    fn read(&mut self, _nframes: u32) -> Result<(), DriverError> {
        Ok(())
    }

    /// Playback: port buffers → device.
    fn write(&mut self, _nframes: u32) -> Result<(), DriverError> {
        Ok(())
    }

    /// Change the period size.
    fn set_buffer_size(&mut self, nframes: u32) -> Result<(), DriverError>;

    /// Change the sample rate.
    fn set_sample_rate(&mut self, rate: u32) -> Result<(), DriverError>;

    /// Current period size.
    fn period_frames(&self) -> u32;

    /// Current sample rate.
    fn sample_rate(&self) -> u32;
}

fn check_geometry(nframes: u32, rate: u32) -> Result<(), DriverError> {
    if nframes == 0 {
        return Err(DriverError::Unsupported {
            what: "period_frames",
            value: nframes,
        });
    }
    if rate == 0 {
        return Err(DriverError::Unsupported {
            what: "sample_rate",
            value: rate,
        });
    }
    Ok(())
}

/// Paces cycles with the system clock, no device.
///
/// Sleeps to an absolute deadline per period. A wakeup more than one full
/// period late resynchronises to "now" instead of bursting to catch up.
#[derive(Debug)]
pub struct DummyDriver {
    period_frames: u32,
    sample_rate: u32,
    next_deadline: Option<Instant>,
}

impl DummyDriver {
    /// Timer driver at the given geometry.
    pub fn new(period_frames: u32, sample_rate: u32) -> Result<Self, DriverError> {
        check_geometry(period_frames, sample_rate)?;
        Ok(Self {
            period_frames,
            sample_rate,
            next_deadline: None,
        })
    }

    /// Length of one period.
    pub fn period(&self) -> Duration {
        Duration::from_nanos(self.period_frames as u64 * 1_000_000_000 / self.sample_rate as u64)
    }
}

impl Driver for DummyDriver {
    fn name(&self) -> &'static str {
        "dummy"
    }

    fn start(&mut self) -> Result<(), DriverError> {
        self.next_deadline = None;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), DriverError> {
        self.next_deadline = None;
        Ok(())
    }

    fn wait(&mut self) -> Result<WaitStatus, DriverError> {
        let period = self.period();
        let deadline = self
            .next_deadline
            .unwrap_or_else(|| Instant::now() + period);

        let now = Instant::now();
        if deadline > now {
            std::thread::sleep(deadline - now);
        }

        let woke = Instant::now();
        let late = woke.saturating_duration_since(deadline);
        self.next_deadline = Some(if late > period {
            woke + period
        } else {
            deadline + period
        });

        Ok(WaitStatus {
            nframes: self.period_frames,
            delayed_usecs: late.as_micros() as u64,
        })
    }

    fn set_buffer_size(&mut self, nframes: u32) -> Result<(), DriverError> {
        check_geometry(nframes, self.sample_rate)?;
        self.period_frames = nframes;
        Ok(())
    }

    fn set_sample_rate(&mut self, rate: u32) -> Result<(), DriverError> {
        check_geometry(self.period_frames, rate)?;
        self.sample_rate = rate;
        Ok(())
    }

    fn period_frames(&self) -> u32 {
        self.period_frames
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

/// Runs cycles back to back with no pacing ("freewheeling").
#[derive(Debug)]
pub struct FreewheelDriver {
    period_frames: u32,
    sample_rate: u32,
}

impl FreewheelDriver {
    /// Freewheel driver at the given geometry.
    pub fn new(period_frames: u32, sample_rate: u32) -> Result<Self, DriverError> {
        check_geometry(period_frames, sample_rate)?;
        Ok(Self {
            period_frames,
            sample_rate,
        })
    }
}

impl Driver for FreewheelDriver {
    fn name(&self) -> &'static str {
        "freewheel"
    }

    fn start(&mut self) -> Result<(), DriverError> {
        Ok(())
    }

    fn stop(&mut self) -> Result<(), DriverError> {
        Ok(())
    }

    fn wait(&mut self) -> Result<WaitStatus, DriverError> {
        Ok(WaitStatus {
            nframes: self.period_frames,
            delayed_usecs: 0,
        })
    }

    fn set_buffer_size(&mut self, nframes: u32) -> Result<(), DriverError> {
        check_geometry(nframes, self.sample_rate)?;
        self.period_frames = nframes;
        Ok(())
    }

    fn set_sample_rate(&mut self, rate: u32) -> Result<(), DriverError> {
        check_geometry(self.period_frames, rate)?;
        self.sample_rate = rate;
        Ok(())
    }

    fn period_frames(&self) -> u32 {
        self.period_frames
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}
