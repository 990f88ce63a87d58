//! Ctrl-C handling
//!
//! First Ctrl-C requests a clean stop (observed between files and batches);
//! the second one force-exits.

use std::sync::atomic::{AtomicBool, Ordering};

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

pub fn setup_signal_handler() {
    let result = ctrlc::set_handler(|| {
        if INTERRUPTED.swap(true, Ordering::SeqCst) {
            std::process::exit(130);
        }
        eprintln!("\nInterrupted. Finishing the current file...");
    });
    if let Err(e) = result {
        tracing::warn!(error = %e, "Failed to install Ctrl-C handler");
    }
}

pub fn check_interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}
