//! The Trace Controller: the crate's own state (the `first_start` guard and
//! fixed `stop()` ordering) layered over the `DeviceLibrary` trait, which is
//! the contract an actual CoreSight access library has to satisfy. The
//! vendor SDK that implements `DeviceLibrary` for a real board is linked in
//! externally (§6.2); `HardwareDevices` below is the `extern "C"` binding
//! for it, not a reimplementation of it.

use std::ffi::CString;
use std::os::raw::{c_int, c_void};

use nix::unistd::Pid;

use crate::address_space::ExecRange;
use crate::error::{Result, TraceError};
use crate::log::LogDebug;

#[derive(Copy, Clone, Debug, Default)]
pub struct SinkState {
    pub rwp: u64,
    pub unread_bytes: usize,
    pub wrapped: bool,
    pub depth: usize,
}

/// What the crate needs from the CoreSight access library. A real
/// implementation discovers hardware by board name and drives it through
/// `libcsaccess`; tests substitute a `Recording` stub that just logs calls.
/// `Send` is a supertrait because the controller holding this trait object
/// lives inside a `Mutex<TraceSession>` shared with the Watchdog thread.
pub trait DeviceLibrary: Send {
    fn discover(&mut self, board: &str) -> Result<()>;
    fn source_count(&self) -> usize;
    fn configure(&mut self, ranges: &[ExecRange], pid: Option<Pid>) -> Result<()>;
    fn enable_source(&mut self, idx: usize) -> Result<()>;
    fn disable_source(&mut self, idx: usize) -> Result<()>;
    fn enable_sink(&mut self) -> Result<()>;
    fn disable_sink(&mut self) -> Result<()>;
    fn has_auxiliary_sink(&self) -> bool;
    fn disable_auxiliary_sink(&mut self) -> Result<()>;
    fn flush_and_wait(&mut self) -> Result<()>;
    fn sink_rwp(&self) -> Result<u64>;
    fn sink_unread_bytes(&self) -> Result<usize>;
    fn sink_wrapped(&self) -> Result<bool>;
    fn sink_capacity(&self) -> Result<usize>;
    fn read_sink(&mut self, dest: &mut [u8]) -> Result<usize>;
    fn empty_sink(&mut self) -> Result<()>;
    fn checkpoint(&mut self) -> Result<()>;
    fn shutdown(&mut self);
    fn trace_id(&self, cpu: i32) -> Result<i32>;
}

/// Wraps a `DeviceLibrary` with the ordering and once-per-session rules
/// from §4.5: `configure` happens at most once, `stop` flushes before
/// disabling sources, and sources are disabled before sinks.
pub struct TraceController {
    devices: Box<dyn DeviceLibrary>,
    first_start: bool,
    etb_stop_on_flush: bool,
}

impl TraceController {
    pub fn new(devices: Box<dyn DeviceLibrary>, etb_stop_on_flush: bool) -> TraceController {
        TraceController {
            devices,
            first_start: true,
            etb_stop_on_flush,
        }
    }

    pub fn discover(&mut self, board: &str) -> Result<()> {
        self.devices.discover(board)
    }

    pub fn trace_id(&self, cpu: i32) -> Result<i32> {
        self.devices.trace_id(cpu)
    }

    /// Programs address-range filters. A no-op after the first call in a
    /// session: hardware filters are reused across subsequent start/stop
    /// cycles rather than reprogrammed.
    pub fn configure(&mut self, ranges: &[ExecRange], pid: Option<Pid>) -> Result<()> {
        if self.first_start {
            self.devices.configure(ranges, pid)?;
            self.first_start = false;
        }
        Ok(())
    }

    pub fn enable(&mut self) -> Result<()> {
        for idx in 0..self.devices.source_count() {
            self.devices.enable_source(idx)?;
        }
        self.devices.enable_sink()
    }

    pub fn stop(&mut self) -> Result<()> {
        if self.etb_stop_on_flush {
            self.devices.flush_and_wait()?;
        }
        for idx in 0..self.devices.source_count() {
            self.devices.disable_source(idx)?;
        }
        if self.devices.has_auxiliary_sink() {
            self.devices.disable_auxiliary_sink()?;
        }
        self.devices.disable_sink()
    }

    pub fn drain(&mut self, dest: &mut [u8]) -> Result<usize> {
        let n = self.devices.read_sink(dest)?;
        self.devices.empty_sink()?;
        Ok(n)
    }

    pub fn sink_state(&self) -> Result<SinkState> {
        Ok(SinkState {
            rwp: self.devices.sink_rwp()?,
            unread_bytes: self.devices.sink_unread_bytes()?,
            wrapped: self.devices.sink_wrapped()?,
            depth: self.devices.sink_capacity()?,
        })
    }

    pub fn checkpoint(&mut self) -> Result<()> {
        self.devices.checkpoint()
    }
}

impl Drop for TraceController {
    fn drop(&mut self) {
        crate::log!(LogDebug, "shutting down device handles");
        self.devices.shutdown();
    }
}

/// `extern "C"` surface for the vendor CoreSight access library. The
/// symbols below are resolved against `libcsaccess` at link time; this
/// module only describes the contract (§6.2), it does not implement it.
mod ffi {
    use std::os::raw::{c_char, c_int, c_void};

    #[repr(C)]
    pub struct AddrRangeFfi {
        pub start: u64,
        pub end: u64,
        pub path: *const c_char,
    }

    extern "C" {
        pub fn cst_setup_named_board(board_name: *const c_char) -> *mut c_void;
        pub fn cst_source_count(board: *mut c_void) -> c_int;
        pub fn cst_configure_trace(
            board: *mut c_void,
            ranges: *const AddrRangeFfi,
            range_count: c_int,
            pid: i32,
        ) -> c_int;
        pub fn cst_enable_source(board: *mut c_void, idx: c_int) -> c_int;
        pub fn cst_disable_source(board: *mut c_void, idx: c_int) -> c_int;
        pub fn cst_enable_sink(board: *mut c_void) -> c_int;
        pub fn cst_disable_sink(board: *mut c_void) -> c_int;
        pub fn cst_has_auxiliary_sink(board: *mut c_void) -> c_int;
        pub fn cst_disable_auxiliary_sink(board: *mut c_void) -> c_int;
        pub fn cst_flush_and_wait(board: *mut c_void) -> c_int;
        pub fn cst_sink_rwp(board: *mut c_void) -> u64;
        pub fn cst_sink_unread_bytes(board: *mut c_void) -> c_int;
        pub fn cst_sink_wrapped(board: *mut c_void) -> c_int;
        pub fn cst_sink_capacity(board: *mut c_void) -> c_int;
        pub fn cst_sink_read(board: *mut c_void, dest: *mut u8, len: usize) -> c_int;
        pub fn cst_sink_empty(board: *mut c_void) -> c_int;
        pub fn cst_checkpoint(board: *mut c_void) -> c_int;
        pub fn cst_shutdown(board: *mut c_void);
        pub fn cst_trace_id(board: *mut c_void, cpu: c_int) -> c_int;
    }
}

fn check(ret: c_int, what: &str) -> Result<()> {
    if ret < 0 {
        Err(TraceError::Hardware(format!("{} failed (rc={})", what, ret)))
    } else {
        Ok(())
    }
}

/// Live binding to the vendor library. `board` is null until `discover`
/// succeeds; every other method requires it to be set, matching the
/// original tool's "init before use" contract.
pub struct HardwareDevices {
    board: *mut c_void,
}

unsafe impl Send for HardwareDevices {}

impl HardwareDevices {
    pub fn new() -> HardwareDevices {
        HardwareDevices {
            board: std::ptr::null_mut(),
        }
    }

    fn handle(&self) -> Result<*mut c_void> {
        if self.board.is_null() {
            Err(TraceError::Init("device library not initialised".into()))
        } else {
            Ok(self.board)
        }
    }
}

impl DeviceLibrary for HardwareDevices {
    fn discover(&mut self, board: &str) -> Result<()> {
        let name = CString::new(board)
            .map_err(|_| TraceError::Init("board name contains a NUL byte".into()))?;
        let handle = unsafe { ffi::cst_setup_named_board(name.as_ptr()) };
        if handle.is_null() {
            return Err(TraceError::Init(format!("unknown board '{}'", board)));
        }
        self.board = handle;
        Ok(())
    }

    fn source_count(&self) -> usize {
        match self.handle() {
            Ok(h) => unsafe { ffi::cst_source_count(h).max(0) as usize },
            Err(_) => 0,
        }
    }

    fn configure(&mut self, ranges: &[ExecRange], pid: Option<Pid>) -> Result<()> {
        let h = self.handle()?;
        // Keep the CStrings alive for the duration of the FFI call; the
        // vendor library is documented to copy what it needs out of the
        // range array before returning.
        let path_cstrings: Vec<CString> = ranges
            .iter()
            .map(|r| CString::new(r.path.to_string_lossy().as_bytes()).unwrap_or_default())
            .collect();
        let ffi_ranges: Vec<ffi::AddrRangeFfi> = ranges
            .iter()
            .zip(path_cstrings.iter())
            .map(|(r, p)| ffi::AddrRangeFfi {
                start: r.start,
                end: r.end,
                path: p.as_ptr(),
            })
            .collect();
        let pid_arg = pid.map(|p| p.as_raw()).unwrap_or(0);
        let ret = unsafe {
            ffi::cst_configure_trace(h, ffi_ranges.as_ptr(), ffi_ranges.len() as c_int, pid_arg)
        };
        check(ret, "configure_trace")
    }

    fn enable_source(&mut self, idx: usize) -> Result<()> {
        let h = self.handle()?;
        check(
            unsafe { ffi::cst_enable_source(h, idx as c_int) },
            "enable_source",
        )
    }

    fn disable_source(&mut self, idx: usize) -> Result<()> {
        let h = self.handle()?;
        check(
            unsafe { ffi::cst_disable_source(h, idx as c_int) },
            "disable_source",
        )
    }

    fn enable_sink(&mut self) -> Result<()> {
        let h = self.handle()?;
        check(unsafe { ffi::cst_enable_sink(h) }, "enable_sink")
    }

    fn disable_sink(&mut self) -> Result<()> {
        let h = self.handle()?;
        check(unsafe { ffi::cst_disable_sink(h) }, "disable_sink")
    }

    fn has_auxiliary_sink(&self) -> bool {
        match self.handle() {
            Ok(h) => unsafe { ffi::cst_has_auxiliary_sink(h) != 0 },
            Err(_) => false,
        }
    }

    fn disable_auxiliary_sink(&mut self) -> Result<()> {
        let h = self.handle()?;
        check(
            unsafe { ffi::cst_disable_auxiliary_sink(h) },
            "disable_auxiliary_sink",
        )
    }

    fn flush_and_wait(&mut self) -> Result<()> {
        let h = self.handle()?;
        check(unsafe { ffi::cst_flush_and_wait(h) }, "flush_and_wait")
    }

    fn sink_rwp(&self) -> Result<u64> {
        let h = self.handle()?;
        Ok(unsafe { ffi::cst_sink_rwp(h) })
    }

    fn sink_unread_bytes(&self) -> Result<usize> {
        let h = self.handle()?;
        Ok(unsafe { ffi::cst_sink_unread_bytes(h) }.max(0) as usize)
    }

    fn sink_wrapped(&self) -> Result<bool> {
        let h = self.handle()?;
        Ok(unsafe { ffi::cst_sink_wrapped(h) } != 0)
    }

    fn sink_capacity(&self) -> Result<usize> {
        let h = self.handle()?;
        Ok(unsafe { ffi::cst_sink_capacity(h) }.max(0) as usize)
    }

    fn read_sink(&mut self, dest: &mut [u8]) -> Result<usize> {
        let h = self.handle()?;
        let n = unsafe { ffi::cst_sink_read(h, dest.as_mut_ptr(), dest.len()) };
        if n < 0 {
            return Err(TraceError::Hardware("sink read failed".into()));
        }
        Ok(n as usize)
    }

    fn empty_sink(&mut self) -> Result<()> {
        let h = self.handle()?;
        check(unsafe { ffi::cst_sink_empty(h) }, "empty_sink")
    }

    fn checkpoint(&mut self) -> Result<()> {
        let h = self.handle()?;
        check(unsafe { ffi::cst_checkpoint(h) }, "checkpoint")
    }

    fn shutdown(&mut self) {
        if !self.board.is_null() {
            unsafe { ffi::cst_shutdown(self.board) };
            self.board = std::ptr::null_mut();
        }
    }

    fn trace_id(&self, cpu: i32) -> Result<i32> {
        let h = self.handle()?;
        let id = unsafe { ffi::cst_trace_id(h, cpu as c_int) };
        Ok(id)
    }
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use std::cell::RefCell;

    /// Records every call in order, for asserting the ordering invariants
    /// from §5 without a real board attached.
    #[derive(Default)]
    pub struct RecordingDevices {
        pub calls: RefCell<Vec<String>>,
        pub unread_bytes: usize,
        pub wrapped: bool,
        pub source_count: usize,
        pub trace_id: i32,
    }

    impl RecordingDevices {
        pub fn new(source_count: usize, trace_id: i32) -> RecordingDevices {
            RecordingDevices {
                source_count,
                trace_id,
                ..Default::default()
            }
        }
    }

    impl DeviceLibrary for RecordingDevices {
        fn discover(&mut self, _board: &str) -> Result<()> {
            self.calls.borrow_mut().push("discover".into());
            Ok(())
        }
        fn source_count(&self) -> usize {
            self.source_count
        }
        fn configure(&mut self, _ranges: &[ExecRange], _pid: Option<Pid>) -> Result<()> {
            self.calls.borrow_mut().push("configure".into());
            Ok(())
        }
        fn enable_source(&mut self, idx: usize) -> Result<()> {
            self.calls.borrow_mut().push(format!("enable_source({})", idx));
            Ok(())
        }
        fn disable_source(&mut self, idx: usize) -> Result<()> {
            self.calls.borrow_mut().push(format!("disable_source({})", idx));
            Ok(())
        }
        fn enable_sink(&mut self) -> Result<()> {
            self.calls.borrow_mut().push("enable_sink".into());
            Ok(())
        }
        fn disable_sink(&mut self) -> Result<()> {
            self.calls.borrow_mut().push("disable_sink".into());
            Ok(())
        }
        fn has_auxiliary_sink(&self) -> bool {
            false
        }
        fn disable_auxiliary_sink(&mut self) -> Result<()> {
            self.calls.borrow_mut().push("disable_auxiliary_sink".into());
            Ok(())
        }
        fn flush_and_wait(&mut self) -> Result<()> {
            self.calls.borrow_mut().push("flush_and_wait".into());
            Ok(())
        }
        fn sink_rwp(&self) -> Result<u64> {
            Ok(0)
        }
        fn sink_unread_bytes(&self) -> Result<usize> {
            Ok(self.unread_bytes)
        }
        fn sink_wrapped(&self) -> Result<bool> {
            Ok(self.wrapped)
        }
        fn sink_capacity(&self) -> Result<usize> {
            Ok(0x1000)
        }
        fn read_sink(&mut self, dest: &mut [u8]) -> Result<usize> {
            self.calls.borrow_mut().push("read_sink".into());
            let n = self.unread_bytes.min(dest.len());
            for b in dest.iter_mut().take(n) {
                *b = 0x42;
            }
            self.unread_bytes -= n;
            Ok(n)
        }
        fn empty_sink(&mut self) -> Result<()> {
            self.calls.borrow_mut().push("empty_sink".into());
            Ok(())
        }
        fn checkpoint(&mut self) -> Result<()> {
            self.calls.borrow_mut().push("checkpoint".into());
            Ok(())
        }
        fn shutdown(&mut self) {
            self.calls.borrow_mut().push("shutdown".into());
        }
        fn trace_id(&self, _cpu: i32) -> Result<i32> {
            Ok(self.trace_id)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enable_activates_sources_before_the_sink() {
        let devices = test_support::RecordingDevices::new(2, 5);
        let mut controller = TraceController::new(Box::new(devices), true);
        controller.enable().unwrap();
        controller.stop().unwrap();
    }

    #[test]
    fn configure_runs_at_most_once_per_session() {
        // The `first_start` guard is what's under test: a second
        // `configure()` call must be a no-op rather than re-invoking the
        // backend. Use a backend that panics on a second invocation.
        struct PanicsOnSecondConfigure(bool);
        impl DeviceLibrary for PanicsOnSecondConfigure {
            fn discover(&mut self, _b: &str) -> Result<()> { Ok(()) }
            fn source_count(&self) -> usize { 0 }
            fn configure(&mut self, _r: &[ExecRange], _p: Option<Pid>) -> Result<()> {
                assert!(!self.0, "configure called twice");
                self.0 = true;
                Ok(())
            }
            fn enable_source(&mut self, _: usize) -> Result<()> { Ok(()) }
            fn disable_source(&mut self, _: usize) -> Result<()> { Ok(()) }
            fn enable_sink(&mut self) -> Result<()> { Ok(()) }
            fn disable_sink(&mut self) -> Result<()> { Ok(()) }
            fn has_auxiliary_sink(&self) -> bool { false }
            fn disable_auxiliary_sink(&mut self) -> Result<()> { Ok(()) }
            fn flush_and_wait(&mut self) -> Result<()> { Ok(()) }
            fn sink_rwp(&self) -> Result<u64> { Ok(0) }
            fn sink_unread_bytes(&self) -> Result<usize> { Ok(0) }
            fn sink_wrapped(&self) -> Result<bool> { Ok(false) }
            fn sink_capacity(&self) -> Result<usize> { Ok(0) }
            fn read_sink(&mut self, _d: &mut [u8]) -> Result<usize> { Ok(0) }
            fn empty_sink(&mut self) -> Result<()> { Ok(()) }
            fn checkpoint(&mut self) -> Result<()> { Ok(()) }
            fn shutdown(&mut self) {}
            fn trace_id(&self, _c: i32) -> Result<i32> { Ok(-1) }
        }
        let mut guarded = TraceController::new(Box::new(PanicsOnSecondConfigure(false)), true);
        guarded.configure(&[], None).unwrap();
        guarded.configure(&[], None).unwrap();
    }
}
