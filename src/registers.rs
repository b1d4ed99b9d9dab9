//! Register access for the aarch64 target.
//!
//! `nix::sys::ptrace::getregs` only exists for x86_64 (the `user_regs_struct`
//! layout is architecture-specific), so for aarch64 we go straight to
//! `PTRACE_GETREGSET` with `NT_PRSTATUS`, exactly as the original C tracer
//! does via `struct user_pt_regs`.

use libc::{c_void, iovec, pid_t};
use nix::unistd::Pid;

use crate::error::Result;

const NT_PRSTATUS: i32 = 1;

/// Layout of `struct user_pt_regs` from `<sys/user.h>` on aarch64: 31
/// general-purpose registers, stack pointer, program counter, pstate.
#[repr(C)]
#[derive(Copy, Clone, Default)]
struct UserPtRegs {
    regs: [u64; 31],
    sp: u64,
    pc: u64,
    pstate: u64,
}

static_assertions::const_assert_eq!(std::mem::size_of::<UserPtRegs>(), 34 * 8);

/// Syscall number, argument registers and (at syscall-exit) return value,
/// as seen through the AArch64 ptrace ABI: `x8` holds the syscall number,
/// `x0..=x5` the arguments, and `x0` the return value on exit.
#[derive(Copy, Clone, Debug)]
pub struct SyscallRegs {
    pub number: i64,
    pub args: [u64; 6],
    pub return_value: i64,
}

fn read_user_regs(pid: Pid) -> Result<UserPtRegs> {
    let mut regs = UserPtRegs::default();
    let mut iov = iovec {
        iov_base: &mut regs as *mut UserPtRegs as *mut c_void,
        iov_len: std::mem::size_of::<UserPtRegs>(),
    };
    let ret = unsafe {
        libc::ptrace(
            libc::PTRACE_GETREGSET,
            pid.as_raw() as pid_t,
            NT_PRSTATUS as *mut c_void,
            &mut iov as *mut iovec as *mut c_void,
        )
    };
    if ret < 0 {
        return Err(nix::Error::last().into());
    }
    Ok(regs)
}

/// Reads the current syscall registers for `pid`. Valid at both
/// syscall-entry and syscall-exit stops; `return_value` only carries a
/// meaningful value at exit (`x0` holds the syscall argument at entry).
pub fn read_syscall_registers(pid: Pid) -> Result<SyscallRegs> {
    let regs = read_user_regs(pid)?;
    Ok(SyscallRegs {
        number: regs.regs[8] as i64,
        args: [
            regs.regs[0],
            regs.regs[1],
            regs.regs[2],
            regs.regs[3],
            regs.regs[4],
            regs.regs[5],
        ],
        return_value: regs.regs[0] as i64,
    })
}

pub const SYS_MMAP: i64 = 222;
pub const SYS_EXIT_GROUP: i64 = 94;
