//! Discovery and tracking of the target's executable memory ranges.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;

use nix::unistd::Pid;

use crate::error::{Result, TraceError};
use crate::log::LogDebug;
use crate::registers::{SyscallRegs, SYS_EXIT_GROUP, SYS_MMAP};

pub const PAGE_SIZE: u64 = 0x1000;
pub const RANGE_MAX: usize = 32;

const PROT_EXEC: u64 = 0x4;

fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

/// An executable memory mapping backed by a file, as seen by the decoder.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecRange {
    pub start: u64,
    pub end: u64,
    pub path: PathBuf,
}

impl ExecRange {
    pub fn new(start: u64, length: u64, path: PathBuf) -> ExecRange {
        ExecRange {
            start,
            end: align_up(start + length, PAGE_SIZE),
            path,
        }
    }
}

/// Parameters captured from the argument registers at `mmap` syscall entry.
#[derive(Copy, Clone, Debug)]
struct MmapParams {
    length: u64,
    prot: u64,
    fd: i64,
}

/// Explicit two-state machine replacing an implicit "in mmap" toggle bit:
/// "exit without a matching entry" is unrepresentable this way.
enum MmapState {
    Outside,
    Entered(MmapParams),
}

/// What a syscall-stop turned out to be, for the Supervisor to act on.
pub enum SyscallEvent {
    /// Not a syscall we care about (or the matching half of mmap entry).
    None,
    /// `exit_group` was entered; the process will exit shortly.
    ExitGroupEntered,
}

/// Owns the range table and the mmap-interception state machine for one
/// target. `mprotect`-introduced executable regions are not tracked: only
/// ranges that arrive via a successful `mmap(..., PROT_EXEC, ...)` with a
/// real backing file are recorded, matching the documented limitation.
pub struct AddressSpaceTracker {
    ranges: Vec<ExecRange>,
    mmap_state: MmapState,
}

impl AddressSpaceTracker {
    pub fn new() -> AddressSpaceTracker {
        AddressSpaceTracker {
            ranges: Vec::new(),
            mmap_state: MmapState::Outside,
        }
    }

    pub fn ranges(&self) -> &[ExecRange] {
        &self.ranges
    }

    /// Seeds the range table from `/proc/<pid>/maps`.
    pub fn seed(&mut self, pid: Pid) -> Result<()> {
        let path = format!("/proc/{}/maps", pid.as_raw());
        let file = File::open(&path)?;
        for line in BufReader::new(file).lines() {
            let line = line?;
            if let Some(range) = parse_maps_line(&line) {
                self.push(range);
            }
        }
        Ok(())
    }

    fn push(&mut self, range: ExecRange) {
        if self.ranges.len() >= RANGE_MAX {
            crate::log!(
                LogDebug,
                "dropping executable range {:#x}-{:#x}, table is full",
                range.start,
                range.end
            );
            return;
        }
        self.ranges.push(range);
    }

    /// Called by the Supervisor on every syscall-stop. `pid` is used only
    /// to resolve `/proc/<pid>/fd/<fd>` on the matching exit half of an
    /// `mmap` pair.
    pub fn on_syscall_stop(&mut self, pid: Pid, regs: &SyscallRegs) -> SyscallEvent {
        match self.mmap_state {
            MmapState::Outside => {
                if regs.number == SYS_MMAP {
                    self.mmap_state = MmapState::Entered(MmapParams {
                        length: regs.args[1],
                        prot: regs.args[2],
                        fd: regs.args[4] as i64,
                    });
                    SyscallEvent::None
                } else if regs.number == SYS_EXIT_GROUP {
                    SyscallEvent::ExitGroupEntered
                } else {
                    SyscallEvent::None
                }
            }
            MmapState::Entered(params) => {
                self.mmap_state = MmapState::Outside;
                if params.prot & PROT_EXEC != 0 && params.fd >= 3 {
                    let start = regs.return_value as u64;
                    let path = resolve_fd_path(pid, params.fd).unwrap_or_else(|_| PathBuf::new());
                    self.push(ExecRange::new(start, params.length, path));
                }
                SyscallEvent::None
            }
        }
    }
}

fn resolve_fd_path(pid: Pid, fd: i64) -> Result<PathBuf> {
    let link = format!("/proc/{}/fd/{}", pid.as_raw(), fd);
    std::fs::read_link(&link).map_err(TraceError::from)
}

/// Parses one `/proc/<pid>/maps` line into an `ExecRange` if it describes
/// an executable, file-backed mapping.
fn parse_maps_line(line: &str) -> Option<ExecRange> {
    let mut fields = line.splitn(6, ' ').filter(|s| !s.is_empty());
    let addr_range = fields.next()?;
    let perms = fields.next()?;
    fields.next()?; // offset
    fields.next()?; // dev
    fields.next()?; // inode
    let path = fields.next().map(str::trim).unwrap_or("");

    if !perms.contains('x') || path.is_empty() || path.starts_with('[') {
        return None;
    }

    let mut parts = addr_range.splitn(2, '-');
    let start = u64::from_str_radix(parts.next()?, 16).ok()?;
    let end = u64::from_str_radix(parts.next()?, 16).ok()?;
    Some(ExecRange {
        start,
        end: align_up(end, PAGE_SIZE),
        path: PathBuf::from(path),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_is_page_aligned() {
        let r = ExecRange::new(0x1000, 0x10, PathBuf::from("/lib/libfoo.so"));
        assert_eq!(r.start, 0x1000);
        assert_eq!(r.end, 0x2000);
        assert!(r.start < r.end);
        assert_eq!(r.end % PAGE_SIZE, 0);
    }

    #[test]
    fn table_caps_at_range_max() {
        let mut tracker = AddressSpaceTracker::new();
        for i in 0..40u64 {
            tracker.push(ExecRange::new(i * PAGE_SIZE, 1, PathBuf::from("/lib/x.so")));
        }
        assert_eq!(tracker.ranges().len(), RANGE_MAX);
    }

    #[test]
    fn mmap_pair_without_matching_entry_is_a_noop_exit() {
        let mut tracker = AddressSpaceTracker::new();
        // An exit with no preceding entry just flips back to Outside; it
        // must not be mistaken for the matching exit of a later mmap.
        let exit_regs = SyscallRegs {
            number: SYS_MMAP,
            args: [0; 6],
            return_value: 0x4000,
        };
        let _ = tracker.on_syscall_stop(Pid::from_raw(1), &exit_regs);
        assert_eq!(tracker.ranges().len(), 0);
    }

    #[test]
    fn non_exec_mmap_is_not_recorded() {
        let mut tracker = AddressSpaceTracker::new();
        let entry = SyscallRegs {
            number: SYS_MMAP,
            args: [0, 0x1000, 0x3 /* PROT_READ|PROT_WRITE */, 0, 3, 0],
            return_value: 0,
        };
        tracker.on_syscall_stop(Pid::from_raw(1), &entry);
        let exit = SyscallRegs {
            number: SYS_MMAP,
            args: [0; 6],
            return_value: 0x7f0000,
        };
        tracker.on_syscall_stop(Pid::from_raw(1), &exit);
        assert_eq!(tracker.ranges().len(), 0);
    }

    #[test]
    fn exit_group_is_reported() {
        let mut tracker = AddressSpaceTracker::new();
        let regs = SyscallRegs {
            number: SYS_EXIT_GROUP,
            args: [0; 6],
            return_value: 0,
        };
        match tracker.on_syscall_stop(Pid::from_raw(1), &regs) {
            SyscallEvent::ExitGroupEntered => {}
            SyscallEvent::None => panic!("expected ExitGroupEntered"),
        }
    }
}
