//! Command-line parsing: §4.9/§6.1.

use structopt::StructOpt;

use crate::error::{Result, TraceError};
use crate::session::SessionConfig;

#[derive(StructOpt, Debug)]
#[structopt(name = "cstrace", about = "hardware-assisted CoreSight process tracer")]
pub struct Options {
    /// Enable persistent forkserver mode.
    #[structopt(long, default_value = "0")]
    pub forkserver: u32,

    /// Board descriptor name.
    #[structopt(long, default_value = "Marvell ThunderX2")]
    pub board: String,

    /// Force trace CPU (else auto-select).
    #[structopt(long)]
    pub cpu: Option<usize>,

    /// Master enable of hardware programming.
    #[structopt(long, default_value = "1")]
    pub tracing: u32,

    /// Enable the Sink Watchdog.
    #[structopt(long, default_value = "1")]
    pub polling: u32,

    /// Decode drained bytes into the coverage bitmap inline.
    #[structopt(long, default_value = "1")]
    pub decoding: u32,

    /// Emit decoder-args and raw trace files.
    #[structopt(long = "export-config", default_value = "0")]
    pub export_config: u32,

    /// Use flush-and-wait during stop.
    #[structopt(long = "etf-stop-on-flush", default_value = "1")]
    pub etf_stop_on_flush: u32,

    /// Sink occupancy threshold in (0,1).
    #[structopt(long = "etf-threshold", default_value = "0.8")]
    pub etf_threshold: f64,

    /// u-dma-buf device name.
    #[structopt(long, default_value = "udmabuf0")]
    pub udmabuf: String,

    /// Diagnostic verbosity; each step lowers the log floor by one level.
    #[structopt(long, default_value = "0")]
    pub verbose: u32,

    /// Target executable and its arguments.
    #[structopt(last = true)]
    pub target: Vec<String>,
}

impl Options {
    fn is_set(flag: u32) -> bool {
        flag != 0
    }

    /// Re-checks what `structopt`/`clap` can't express as a range
    /// constraint, plus "a target is required".
    pub fn validate(&self) -> Result<()> {
        if self.etf_threshold <= 0.0 || self.etf_threshold >= 1.0 {
            return Err(TraceError::Init(
                "--etf-threshold must be strictly between 0 and 1".into(),
            ));
        }
        if self.target.is_empty() {
            return Err(TraceError::Init(
                "no target executable given (use `-- EXE [ARGS]`)".into(),
            ));
        }
        Ok(())
    }

    pub fn is_forkserver(&self) -> bool {
        Self::is_set(self.forkserver)
    }

    pub fn program(&self) -> &str {
        &self.target[0]
    }

    pub fn program_args(&self) -> &[String] {
        &self.target[1..]
    }

    pub fn to_session_config(&self) -> SessionConfig {
        SessionConfig {
            board: self.board.clone(),
            udmabuf: self.udmabuf.clone(),
            forced_cpu: self.cpu,
            tracing: Self::is_set(self.tracing),
            polling: Self::is_set(self.polling),
            decoding: Self::is_set(self.decoding),
            export_config: Self::is_set(self.export_config),
            etf_stop_on_flush: Self::is_set(self.etf_stop_on_flush),
            etf_threshold: self.etf_threshold,
        }
    }
}
