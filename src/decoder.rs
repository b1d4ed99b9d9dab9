//! Trace decoding: turning drained bytes plus a memory map into coverage
//! bitmap updates. The decoder itself lives in a vendor library
//! (`libcsdec`); this module is the `extern "C"` binding plus the shared
//! coverage bitmap it writes into.

use std::ffi::CString;
use std::os::raw::{c_char, c_int};

use crate::address_space::ExecRange;
use crate::error::{Result, TraceError};

pub const BITMAP_SIZE: usize = 1 << 16;

mod ffi {
    use super::*;

    #[repr(C)]
    pub struct MapEntryFfi {
        pub start: u64,
        pub end: u64,
        pub path: *const c_char,
    }

    extern "C" {
        pub fn csd_decode(
            buffer: *const u8,
            len: usize,
            trace_id: c_int,
            ranges: *const MapEntryFfi,
            range_count: c_int,
            bitmap: *mut u8,
            bitmap_len: usize,
        ) -> c_int;
    }
}

/// Owns the coverage bitmap a decode run writes into: either a mapping of
/// a System V shared-memory segment named by `__AFL_SHM_ID` (so an AFL-style
/// harness can read it directly), or, standalone, a private anonymous
/// mapping of the same size.
pub struct CoverageBitmap {
    ptr: *mut u8,
    len: usize,
    owns_shm: bool,
}

unsafe impl Send for CoverageBitmap {}

impl CoverageBitmap {
    /// Attaches the bitmap named by `__AFL_SHM_ID` if set, else allocates a
    /// private mapping. Either way the mapping is zeroed by the kernel on
    /// creation/attach.
    pub fn new() -> Result<CoverageBitmap> {
        if let Ok(id) = std::env::var("__AFL_SHM_ID") {
            let shm_id: i32 = id
                .parse()
                .map_err(|_| TraceError::Init("__AFL_SHM_ID is not an integer".into()))?;
            let ptr = unsafe { libc::shmat(shm_id, std::ptr::null(), 0) };
            if ptr as isize == -1 {
                return Err(TraceError::Os(nix::Error::last()));
            }
            Ok(CoverageBitmap {
                ptr: ptr as *mut u8,
                len: BITMAP_SIZE,
                owns_shm: false,
            })
        } else {
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    BITMAP_SIZE,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                    -1,
                    0,
                )
            };
            if ptr == libc::MAP_FAILED {
                return Err(TraceError::Os(nix::Error::last()));
            }
            Ok(CoverageBitmap {
                ptr: ptr as *mut u8,
                len: BITMAP_SIZE,
                owns_shm: true,
            })
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr
    }
}

impl Drop for CoverageBitmap {
    fn drop(&mut self) {
        unsafe {
            if self.owns_shm {
                libc::munmap(self.ptr as *mut _, self.len);
            } else {
                libc::shmdt(self.ptr as *const _);
            }
        }
    }
}

/// Constructed once per session (§4.8, invariant 5) over the bitmap and
/// reused across however many `decode` calls the session makes.
pub struct Decoder {
    bitmap: CoverageBitmap,
}

impl Decoder {
    pub fn new(bitmap: CoverageBitmap) -> Decoder {
        Decoder { bitmap }
    }

    pub fn bitmap(&self) -> &[u8] {
        self.bitmap.as_slice()
    }

    /// Decodes `buffer` (drained trace bytes) against `ranges`, attributing
    /// packets to `trace_id`. Keeps the path `CString`s alive for the
    /// duration of the call.
    pub fn decode(&mut self, buffer: &[u8], trace_id: i32, ranges: &[ExecRange]) -> Result<()> {
        let paths: Vec<CString> = ranges
            .iter()
            .map(|r| CString::new(r.path.to_string_lossy().as_bytes()).unwrap_or_default())
            .collect();
        let entries: Vec<ffi::MapEntryFfi> = ranges
            .iter()
            .zip(paths.iter())
            .map(|(r, p)| ffi::MapEntryFfi {
                start: r.start,
                end: r.end,
                path: p.as_ptr(),
            })
            .collect();

        let rc = unsafe {
            ffi::csd_decode(
                buffer.as_ptr(),
                buffer.len(),
                trace_id,
                entries.as_ptr(),
                entries.len() as c_int,
                self.bitmap.as_mut_ptr(),
                self.bitmap.len,
            )
        };

        if rc == 0 {
            Ok(())
        } else {
            Err(TraceError::Decode(format!("decoder returned {}", rc)))
        }
    }
}
