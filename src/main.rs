mod address_space;
mod cpu_topology;
mod decoder;
mod device;
mod error;
mod finalize;
mod forkserver;
#[macro_use]
mod log;
mod options;
mod registers;
mod scoped_fd;
mod session;
mod supervisor;
mod trace_buffer;
mod watchdog;

use std::sync::Arc;

use structopt::StructOpt;

use error::Result;
use log::LogInfo;
use options::Options;
use session::{Shared, TraceSession};

fn run(options: Options) -> Result<()> {
    options.validate()?;

    let config = options.to_session_config();
    let session = TraceSession::new(config)?;
    let shared = Arc::new(Shared::new(session));

    if options.is_forkserver() {
        forkserver::run_handshake_loop(
            shared,
            options.program().to_string(),
            options.program_args().to_vec(),
        )
    } else {
        let pid = supervisor::spawn_traced(options.program(), options.program_args())?;
        {
            let mut session = shared.session.lock().unwrap_or_else(|e| e.into_inner());
            session.begin_target(pid, Some(pid))?;
        }
        crate::log!(LogInfo, "tracing pid {}", pid);
        supervisor::run(shared, pid, None)?;
        Ok(())
    }
}

fn main() {
    log::init_from_env();
    let options = Options::from_args();
    log::raise_verbosity(options.verbose);

    if let Err(e) = run(options) {
        crate::fatal!("{}", e);
    }
}
