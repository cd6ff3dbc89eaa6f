//! SIGINT/SIGTERM handling for `testloop run`.
//!
//! The first signal asks the pipeline to stop at its next step boundary and
//! restores the default disposition, so a second Ctrl-C terminates at once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use testloop_core::CancelToken;
use tracing::warn;

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

#[cfg(unix)]
extern "C" fn on_signal(signal: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
    // SAFETY: signal(2) is async-signal-safe.
    unsafe {
        libc::signal(signal, libc::SIG_DFL);
    }
}

/// Routes SIGINT and SIGTERM into `token`. Call once per process.
pub fn install(token: CancelToken) {
    #[cfg(unix)]
    {
        let handler = on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
        // SAFETY: the handler only touches an atomic and calls signal(2).
        unsafe {
            libc::signal(libc::SIGINT, handler);
            libc::signal(libc::SIGTERM, handler);
        }
    }

    thread::spawn(move || loop {
        if INTERRUPTED.load(Ordering::SeqCst) {
            warn!("interrupt received, stopping after the current step");
            token.cancel();
            return;
        }
        thread::sleep(Duration::from_millis(100));
    });
}
