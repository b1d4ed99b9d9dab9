//! The tracing session: all per-target mutable state behind one lock, per
//! the concurrency model's single `Mutex<TraceSession>` + `Condvar` pair.

use std::path::Path;
use std::sync::{Condvar, Mutex};

use nix::unistd::Pid;

use crate::address_space::AddressSpaceTracker;
use crate::cpu_topology;
use crate::decoder::{CoverageBitmap, Decoder};
use crate::device::{HardwareDevices, TraceController};
use crate::error::{Result, TraceError};
use crate::log::{LogDebug, LogWarn};
use crate::scoped_fd::ScopedFd;
use crate::trace_buffer::TraceBuffer;

/// Options relevant to session behaviour, independent of how they were
/// parsed (CLI in one-shot mode, same defaults in forkserver mode).
#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub board: String,
    pub udmabuf: String,
    pub forced_cpu: Option<usize>,
    pub tracing: bool,
    pub polling: bool,
    pub decoding: bool,
    pub export_config: bool,
    pub etf_stop_on_flush: bool,
    pub etf_threshold: f64,
}

/// Physical address and size of the sink's backing DMA region, as
/// published by the u-dma-buf driver.
#[derive(Copy, Clone, Debug)]
pub struct UdmabufInfo {
    pub phys_addr: u64,
    pub size: u64,
}

fn read_udmabuf(name: &str) -> Result<UdmabufInfo> {
    let base = format!("/sys/class/u-dma-buf/{}", name);
    let phys_addr = ScopedFd::open_read(Path::new(&format!("{}/phys_addr", base)))?
        .read_to_string()?;
    let size = ScopedFd::open_read(Path::new(&format!("{}/size", base)))?.read_to_string()?;

    let phys_addr = u64::from_str_radix(phys_addr.trim_start_matches("0x"), 16)
        .map_err(|_| TraceError::Init(format!("malformed phys_addr for {}", name)))?;
    let size: u64 = size
        .parse()
        .map_err(|_| TraceError::Init(format!("malformed size for {}", name)))?;

    Ok(UdmabufInfo { phys_addr, size })
}

/// Everything the Supervisor and Forkserver Adapter need for one target:
/// the device controller, the executable-range tracker, the trace buffer,
/// and session bookkeeping (`started`, `needs_rerun`, `run_count`).
pub struct TraceSession {
    config: SessionConfig,
    controller: TraceController,
    tracker: AddressSpaceTracker,
    buffer: TraceBuffer,
    decoder: Option<Decoder>,
    udmabuf: UdmabufInfo,
    trace_cpu: usize,
    trace_id: i32,
    started: bool,
    needs_rerun: bool,
    run_count: u64,
}

impl TraceSession {
    pub fn new(config: SessionConfig) -> Result<TraceSession> {
        let mut controller =
            TraceController::new(Box::new(HardwareDevices::new()), config.etf_stop_on_flush);
        if config.tracing {
            controller.discover(&config.board)?;
        }
        let udmabuf = if config.tracing {
            read_udmabuf(&config.udmabuf)?
        } else {
            UdmabufInfo {
                phys_addr: 0,
                size: 0,
            }
        };
        Ok(TraceSession {
            config,
            controller,
            tracker: AddressSpaceTracker::new(),
            buffer: TraceBuffer::new(),
            decoder: None,
            udmabuf,
            trace_cpu: 0,
            trace_id: -1,
            started: false,
            needs_rerun: false,
            run_count: 0,
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Pins the session to a specific trace CPU for every subsequent
    /// `begin_target` call, as the forkserver boot path does relative to
    /// the fuzzer's own affinity.
    pub fn lock_trace_cpu(&mut self, cpu: usize) {
        self.config.forced_cpu = Some(cpu);
    }

    pub fn udmabuf(&self) -> UdmabufInfo {
        self.udmabuf
    }

    pub fn started(&self) -> bool {
        self.started
    }

    pub fn needs_rerun(&self) -> bool {
        self.needs_rerun
    }

    pub fn mark_needs_rerun(&mut self) {
        self.needs_rerun = true;
    }

    pub fn run_count(&self) -> u64 {
        self.run_count
    }

    pub fn trace_cpu(&self) -> usize {
        self.trace_cpu
    }

    pub fn trace_id(&self) -> i32 {
        self.trace_id
    }

    pub fn tracker_mut(&mut self) -> &mut AddressSpaceTracker {
        &mut self.tracker
    }

    pub fn buffer(&self) -> &TraceBuffer {
        &self.buffer
    }

    pub fn buffer_mut(&mut self) -> &mut TraceBuffer {
        &mut self.buffer
    }

    pub fn controller_mut(&mut self) -> &mut TraceController {
        &mut self.controller
    }

    /// Lazily constructs the decoder over a fresh coverage bitmap. Only
    /// ever runs once per process per invariant 5.
    pub fn decoder_mut(&mut self) -> Result<&mut Decoder> {
        if self.decoder.is_none() {
            self.decoder = Some(Decoder::new(CoverageBitmap::new()?));
        }
        Ok(self.decoder.as_mut().unwrap())
    }

    /// Selects (or accepts the forced) trace CPU, pins `pid` to it, seeds
    /// the executable-range tracker, and, if tracing is enabled, programs
    /// and enables the hardware. `pid_for_filter` is `None` in forkserver
    /// mode, where filtering is by address range only.
    pub fn begin_target(&mut self, pid: Pid, pid_for_filter: Option<Pid>) -> Result<()> {
        let selected = match self.config.forced_cpu {
            Some(cpu) => Some(cpu),
            None => cpu_topology::select_trace_cpu(pid)?,
        };
        self.trace_cpu = cpu_topology::pin_to_cpu(pid, selected)?;

        self.tracker = AddressSpaceTracker::new();
        self.tracker.seed(pid)?;
        self.buffer = TraceBuffer::new();

        if self.config.tracing {
            self.trace_id = self.controller.trace_id(self.trace_cpu as i32)?;
            self.controller
                .configure(self.tracker.ranges(), pid_for_filter)?;
            self.controller.enable()?;
            self.started = true;
        }
        Ok(())
    }

    /// Stops hardware tracing (if started) and drains whatever the sink
    /// still holds into the buffer. Leaves `started = false`; callers that
    /// want to resume call `resume()` afterwards.
    pub fn stop_and_drain(&mut self) -> Result<()> {
        if !self.started {
            return Ok(());
        }
        let sink = self.controller.sink_state()?;
        if sink.wrapped {
            crate::log!(
                LogWarn,
                "sink wrapped before drain, {} bytes lost",
                sink.unread_bytes
            );
        }
        self.controller.stop()?;
        let n = self.buffer.drain_from(&mut self.controller)?;
        self.started = false;
        crate::log!(LogDebug, "drained {} bytes", n);
        Ok(())
    }

    /// Re-enables hardware tracing after a Watchdog-initiated drain,
    /// without reconfiguring (filters are already programmed).
    pub fn resume(&mut self) -> Result<()> {
        self.controller.enable()?;
        self.started = true;
        Ok(())
    }

    pub fn finish_run(&mut self) {
        self.run_count += 1;
    }
}

/// Bundled lock + condition variable shared between the Supervisor and
/// the Sink Watchdog.
pub struct Shared {
    pub session: Mutex<TraceSession>,
    pub drained: Condvar,
}

impl Shared {
    pub fn new(session: TraceSession) -> Shared {
        Shared {
            session: Mutex::new(session),
            drained: Condvar::new(),
        }
    }
}
