//! Forkserver Adapter: the persistent-tracer entry points and the
//! target-side AFL-style handshake loop that drives them (§4.7).

use std::os::unix::io::RawFd;
use std::sync::Arc;

use nix::unistd::{self, Pid};

use crate::cpu_topology;
use crate::error::Result;
use crate::log::LogInfo;
use crate::session::Shared;
use crate::supervisor;

const FORKSRV_FD_CTL: RawFd = 198;
const FORKSRV_FD_ST: RawFd = 199;

fn write_u32(fd: RawFd, value: u32) -> Result<()> {
    unistd::write(fd, &value.to_ne_bytes())?;
    Ok(())
}

/// Reads one 4-byte control word. `Ok(None)` means the harness closed its
/// end (EOF), which ends the handshake loop cleanly.
fn read_u32(fd: RawFd) -> Result<Option<u32>> {
    let mut buf = [0u8; 4];
    let mut read = 0;
    while read < buf.len() {
        let n = unistd::read(fd, &mut buf[read..])?;
        if n == 0 {
            return Ok(None);
        }
        read += n;
    }
    Ok(Some(u32::from_ne_bytes(buf)))
}

/// Called once, before the handshake loop starts: picks a trace CPU
/// disjoint from the *fuzzer's* own affinity (not the first target's),
/// since every subsequent forked target inherits the same pinning.
pub fn on_forkserver_boot(shared: &Arc<Shared>) -> Result<()> {
    let forksrv_pid = unistd::getpid();
    let mut session = shared.session.lock().unwrap_or_else(|e| e.into_inner());
    if session.config().forced_cpu.is_none() {
        if let Some(cpu) = cpu_topology::select_trace_cpu(forksrv_pid)? {
            session.lock_trace_cpu(cpu);
        }
    }
    Ok(())
}

/// The target-side handshake loop. Writes the hello word, then repeatedly:
/// reads a control word, forks+traces the target, reports its pid, drives
/// it to completion, and reports the packed wait status.
pub fn run_handshake_loop(shared: Arc<Shared>, program: String, args: Vec<String>) -> Result<()> {
    write_u32(FORKSRV_FD_ST, 0)?;
    on_forkserver_boot(&shared)?;

    let mut run_index: u64 = 0;
    loop {
        if read_u32(FORKSRV_FD_CTL)?.is_none() {
            crate::log!(LogInfo, "forkserver control pipe closed, exiting");
            break;
        }

        let pid = supervisor::spawn_traced(&program, &args)?;
        write_u32(FORKSRV_FD_ST, pid.as_raw() as u32)?;

        on_run_start(&shared, pid)?;
        let raw_status = supervisor::run(shared.clone(), pid, Some(run_index))?;
        write_u32(FORKSRV_FD_ST, raw_status as u32)?;

        run_index += 1;
    }
    Ok(())
}

/// Pins the new target to the already-selected trace CPU, seeds the
/// address-space tracker, and (re)programs/enables hardware. `configure`
/// only actually runs hardware setup on the session's first call; in
/// forkserver mode it is always invoked with no pid context since
/// successive runs have different pids.
fn on_run_start(shared: &Arc<Shared>, pid: Pid) -> Result<()> {
    let mut session = shared.session.lock().unwrap_or_else(|e| e.into_inner());
    session.begin_target(pid, None)
}
