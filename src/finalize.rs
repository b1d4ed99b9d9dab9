//! Decode-or-dump policy at the end of a run: §4.8.

use std::fs::File;
use std::io::Write;

use serde::Serialize;

use crate::error::Result;
use crate::log::LogWarn;
use crate::session::TraceSession;

/// JSON-serialisable descriptor for offline decoding, written to
/// `decoderargs.txt` (or `decoderargsN.txt` in forkserver mode).
#[derive(Serialize)]
struct RangeEntry {
    start: u64,
    end: u64,
    path: String,
}

#[derive(Serialize)]
struct DecoderArgs {
    board: String,
    trace_cpu: usize,
    trace_id: i32,
    ranges: Vec<RangeEntry>,
    trace_file: String,
}

fn suffixed(base: &str, ext: &str, run_index: Option<u64>) -> String {
    match run_index {
        Some(n) => format!("{}{}.{}", base, n, ext),
        None => format!("{}.{}", base, ext),
    }
}

/// Called after the Supervisor has already stopped and drained tracing for
/// this run/session. Decodes (if enabled), exports (if requested or the
/// decode needs a rerun), and releases the buffer and device handles.
pub fn finalize(session: &mut TraceSession, run_index: Option<u64>) -> Result<()> {
    let decoding = session.config().decoding;
    let export_config = session.config().export_config;
    let trace_id = session.trace_id();
    let trace_cpu = session.trace_cpu();
    let board = session.config().board.clone();

    if decoding && trace_id >= 0 {
        let ranges = session.tracker_mut().ranges().to_vec();
        let contents: Vec<u8> = session.buffer().contents().to_vec();
        let decoder = session.decoder_mut()?;
        if let Err(e) = decoder.decode(&contents, trace_id, &ranges) {
            crate::log!(LogWarn, "decode failed, marking session for rerun: {}", e);
            session.mark_needs_rerun();
        }
    }

    let should_export = export_config || session.needs_rerun();
    if should_export {
        let trace_file = suffixed("cstrace", "bin", run_index);
        File::create(&trace_file)?.write_all(session.buffer().contents())?;

        if export_config {
            let ranges = session
                .tracker_mut()
                .ranges()
                .iter()
                .map(|r| RangeEntry {
                    start: r.start,
                    end: r.end,
                    path: r.path.to_string_lossy().into_owned(),
                })
                .collect();
            let args = DecoderArgs {
                board,
                trace_cpu,
                trace_id,
                ranges,
                trace_file: trace_file.clone(),
            };
            let json = serde_json::to_string_pretty(&args)
                .map_err(|e| crate::error::TraceError::Decode(e.to_string()))?;
            let args_file = suffixed("decoderargs", "txt", run_index);
            File::create(&args_file)?.write_all(json.as_bytes())?;
        }
    }

    session.buffer_mut().release();
    Ok(())
}
