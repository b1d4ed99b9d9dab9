//! The Supervisor: the ptrace loop that drives one target from exec to
//! exit, correlating stop reasons with Trace Controller actions.

use std::os::raw::c_int;
use std::os::unix::process::CommandExt;
use std::process::Command;
use std::sync::Arc;
use std::thread;

use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;

use crate::address_space::SyscallEvent;
use crate::error::Result;
use crate::finalize;
use crate::log::{LogDebug, LogInfo};
use crate::registers;
use crate::session::Shared;
use crate::watchdog;

/// Spawns `program` with `PTRACE_TRACEME` armed and blocks for the
/// post-exec stop, which every tracee reports as its first `waitpid`
/// event regardless of what eventually traps there.
pub fn spawn_traced(program: &str, args: &[String]) -> Result<Pid> {
    let mut command = Command::new(program);
    command.args(args);
    unsafe {
        command.pre_exec(|| ptrace::traceme().map_err(|_| std::io::Error::last_os_error()));
    }
    let child = command.spawn()?;
    let pid = Pid::from_raw(child.id() as i32);
    // Leak the std::process::Child handle: we manage the process ourselves
    // from here via ptrace/waitpid, and dropping it would try to reap it.
    std::mem::forget(child);

    match waitpid(pid, None)? {
        WaitStatus::Stopped(_, Signal::SIGTRAP) => Ok(pid),
        other => Err(crate::error::TraceError::Init(format!(
            "unexpected post-exec stop: {:?}",
            other
        ))),
    }
}

fn wait_raw(pid: Pid) -> Result<(WaitStatus, c_int)> {
    let mut status: c_int = 0;
    let ret = unsafe { libc::waitpid(pid.as_raw(), &mut status, 0) };
    if ret < 0 {
        return Err(nix::Error::last().into());
    }
    let parsed = WaitStatus::from_raw(Pid::from_raw(ret), status)?;
    Ok((parsed, status))
}

/// Drives one target from its post-exec stop to exit. `shared` must
/// already hold a session initialised for this pid (`begin_target` called).
/// Spawns and joins its own Sink Watchdog thread. `run_index` is `Some(n)`
/// in forkserver mode (selecting suffixed export filenames and bumping
/// the session's run counter), `None` in one-shot mode. Returns the raw
/// wait status, for the forkserver status word.
pub fn run(shared: Arc<Shared>, pid: Pid, run_index: Option<u64>) -> Result<c_int> {
    let watchdog_shared = shared.clone();
    let (polling_enabled, threshold) = {
        let session = shared.session.lock().unwrap_or_else(|e| e.into_inner());
        (session.config().polling, session.config().etf_threshold)
    };
    let watchdog_handle = if polling_enabled {
        Some(thread::spawn(move || {
            watchdog::run(watchdog_shared, pid, threshold)
        }))
    } else {
        None
    };

    ptrace::syscall(pid, None)?;
    let raw_status;
    loop {
        let (status, raw) = wait_raw(pid)?;
        match status {
            WaitStatus::Exited(_, code) => {
                crate::log!(LogInfo, "target exited with code {}", code);
                finalize_session(&shared, run_index)?;
                raw_status = raw;
                break;
            }
            WaitStatus::Signaled(_, sig, _) => {
                crate::log!(LogInfo, "target killed by {:?}", sig);
                finalize_session(&shared, run_index)?;
                raw_status = raw;
                break;
            }
            WaitStatus::PtraceSyscall(_) => {
                handle_syscall_stop(&shared, pid)?;
                ptrace::syscall(pid, None)?;
            }
            WaitStatus::Stopped(_, Signal::SIGTRAP) => {
                // Some kernels report syscall-stops as a plain SIGTRAP
                // rather than PtraceSyscall depending on PTRACE_O_TRACESYSGOOD.
                handle_syscall_stop(&shared, pid)?;
                ptrace::syscall(pid, None)?;
            }
            WaitStatus::Stopped(_, Signal::SIGSTOP) => {
                handle_watchdog_stop(&shared)?;
                ptrace::syscall(pid, None)?;
            }
            WaitStatus::Stopped(_, sig) => {
                // Forward anything we didn't generate ourselves.
                ptrace::syscall(pid, Some(sig))?;
            }
            other => {
                crate::log!(LogDebug, "unhandled wait status {:?}", other);
                ptrace::syscall(pid, None)?;
            }
        }
    }

    if let Some(handle) = watchdog_handle {
        let _ = handle.join();
    }
    Ok(raw_status)
}

fn handle_syscall_stop(shared: &Arc<Shared>, pid: Pid) -> Result<()> {
    let regs = match registers::read_syscall_registers(pid) {
        Ok(r) => r,
        Err(e) => {
            crate::log!(LogDebug, "register read failed at syscall-stop: {}", e);
            return Ok(());
        }
    };
    let mut session = shared.session.lock().unwrap_or_else(|e| e.into_inner());
    match session.tracker_mut().on_syscall_stop(pid, &regs) {
        SyscallEvent::ExitGroupEntered => {
            crate::log!(LogDebug, "exit_group entered, target will exit shortly");
        }
        SyscallEvent::None => {}
    }
    Ok(())
}

fn handle_watchdog_stop(shared: &Arc<Shared>) -> Result<()> {
    let mut session = shared.session.lock().unwrap_or_else(|e| e.into_inner());
    session.stop_and_drain()?;
    session.resume()?;
    shared.drained.notify_all();
    Ok(())
}

fn finalize_session(shared: &Arc<Shared>, run_index: Option<u64>) -> Result<()> {
    let mut session = shared.session.lock().unwrap_or_else(|e| e.into_inner());
    session.stop_and_drain()?;
    finalize::finalize(&mut session, run_index)?;
    if run_index.is_some() {
        session.finish_run();
    }
    Ok(())
}
