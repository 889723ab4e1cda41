use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

// the only process global, signal handlers cannot reach anything else
static STOP: AtomicBool = AtomicBool::new(false);

extern "C" fn request_stop(_: nix::libc::c_int) {
    STOP.store(true, Ordering::SeqCst);
}

/// Route SIGINT and SIGTERM to the stop flag. The run loop finishes its current
/// iteration, checkpoints and exits.
pub fn install() {
    let action = SigAction::new(
        SigHandler::Handler(request_stop),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );

    for signal in [Signal::SIGINT, Signal::SIGTERM] {
        // SAFETY: the handler only stores into an atomic
        match unsafe { sigaction(signal, &action) } {
            Ok(_) => debug!(signal = ?signal, "Installed stop handler"),
            Err(errno) => warn!(signal = ?signal, errno = %errno, "Failed to install stop handler"),
        }
    }
}

pub fn stop_requested() -> bool {
    STOP.load(Ordering::SeqCst)
}
