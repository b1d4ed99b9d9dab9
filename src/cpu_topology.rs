//! CPU selection: picking a trace CPU disjoint from a pid's running set,
//! and pinning a pid to a single CPU.

use std::path::Path;

use nix::sched::{self, CpuSet};
use nix::unistd::Pid;

use crate::error::Result;
use crate::scoped_fd::ScopedFd;

const DEFAULT_CPU: usize = 0;

/// Reads the sibling list for `cpu` from
/// `/sys/devices/system/cpu/cpuN/topology/core_cpus_list`, e.g. `"4,5"` or
/// `"4-7"`, and returns the individual CPU numbers.
fn read_core_siblings(cpu: usize) -> Result<Vec<usize>> {
    let path = format!(
        "/sys/devices/system/cpu/cpu{}/topology/core_cpus_list",
        cpu
    );
    let fd = ScopedFd::open_read(Path::new(&path))?;
    let contents = fd.read_to_string()?;
    Ok(parse_cpu_list(&contents))
}

fn parse_cpu_list(s: &str) -> Vec<usize> {
    let mut out = Vec::new();
    for part in s.trim().split(',') {
        if part.is_empty() {
            continue;
        }
        if let Some((lo, hi)) = part.split_once('-') {
            if let (Ok(lo), Ok(hi)) = (lo.parse::<usize>(), hi.parse::<usize>()) {
                out.extend(lo..=hi);
            }
        } else if let Ok(n) = part.parse::<usize>() {
            out.push(n);
        }
    }
    out
}

/// Picks the lowest-numbered CPU out of `0..nprocs` that is not a sibling
/// of any CPU the given pid is currently allowed to run on. Returns `None`
/// if every CPU is occupied by some sibling group of the affinity set.
pub fn select_trace_cpu(pid: Pid) -> Result<Option<usize>> {
    let affinity = sched::sched_getaffinity(pid)?;
    let nprocs = num_possible_cpus();

    let mut occupied = vec![false; nprocs];
    for cpu in 0..nprocs {
        if affinity.is_set(cpu)? {
            for sibling in read_core_siblings(cpu)? {
                if sibling < nprocs {
                    occupied[sibling] = true;
                }
            }
        }
    }

    Ok((0..nprocs).find(|&cpu| !occupied[cpu]))
}

/// Pins `pid` to a singleton affinity set. Falls back to CPU 0 if no
/// trace CPU was selected.
pub fn pin_to_cpu(pid: Pid, trace_cpu: Option<usize>) -> Result<usize> {
    let cpu = trace_cpu.unwrap_or(DEFAULT_CPU);
    let mut set = CpuSet::new();
    set.set(cpu)?;
    sched::sched_setaffinity(pid, &set)?;
    Ok(cpu)
}

fn num_possible_cpus() -> usize {
    // `sysconf(_SC_NPROCESSORS_CONF)` counts CPUs the kernel knows about,
    // which may exceed those currently online; that's fine here since we
    // only ever read topology files for CPUs present in an affinity mask.
    let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_CONF) };
    if n > 0 {
        n as usize
    } else {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_comma_list() {
        assert_eq!(parse_cpu_list("4,5,6"), vec![4, 5, 6]);
    }

    #[test]
    fn parses_range() {
        assert_eq!(parse_cpu_list("4-7"), vec![4, 5, 6, 7]);
    }

    #[test]
    fn parses_mixed_list() {
        assert_eq!(parse_cpu_list("0,2-3,9"), vec![0, 2, 3, 9]);
    }

    #[test]
    fn empty_list_is_empty() {
        assert!(parse_cpu_list("").is_empty());
    }
}
