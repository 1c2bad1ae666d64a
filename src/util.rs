//! Some utilities.

use failure::Error;

/// Logs an error, including its causes and backtrace (if possible).
pub fn log_err(err: Error) {
    let mut causes = err.iter_chain();
    if let Some(first) = causes.next() {
        error!("{}", first);
    }
    for cause in causes {
        error!("caused by: {}", cause);
    }

    let bt = err.backtrace().to_string();
    if !bt.is_empty() {
        error!("{}", bt);
    }
}
