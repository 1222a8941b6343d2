// src/shutdown.rs
//
// Cooperative stop flag shared by the training loop and runtime sessions.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Flag set on the first Ctrl+C. Must be called from inside a tokio runtime.
pub fn stop_on_ctrl_c(component: &'static str) -> Arc<AtomicBool> {
    let stop = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&stop);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                eprintln!("[{component}] interrupt received; stopping after the current step");
                flag.store(true, Ordering::SeqCst);
            }
            Err(err) => eprintln!("[{component}] WARN: cannot listen for Ctrl+C: {err}"),
        }
    });
    stop
}
