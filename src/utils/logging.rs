//! Conditional logging macros that check a module-level `ENABLE_LOGS` flag.
//!
//! Usage:
//! ```rust,ignore
//! // In your module, define the flag first:
//! const ENABLE_LOGS: bool = true;
//!
//! // Then use the macros (they're exported at the crate root):
//! use crate::{log_diag, log_info, log_warn, log_error};
//!
//! log_info!("Clicked template {}", id);
//! log_diag!(quiet; "Scan found nothing");
//! ```
//!
//! `log_info!`, `log_warn!` and `log_error!` are for things the operator always
//! sees: clicks, promotions, mode changes, blacklist blocking. `log_diag!` is
//! for chatter that quiet mode suppresses.

/// Macro for conditional info logging.
/// Checks the `ENABLE_LOGS` const in the calling module.
#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::info!($($arg)*);
        }
    };
}

/// Macro for conditional warn logging.
/// Checks the `ENABLE_LOGS` const in the calling module.
#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::warn!($($arg)*);
        }
    };
}

/// Macro for conditional error logging.
/// Checks the `ENABLE_LOGS` const in the calling module.
#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::error!($($arg)*);
        }
    };
}

/// Diagnostic logging, silenced when the first argument (the quiet flag) is true.
///
/// ```rust,ignore
/// log_diag!(self.mode.is_quiet(); "New observation recorded: {}", group_id);
/// ```
#[macro_export]
macro_rules! log_diag {
    ($quiet:expr; $($arg:tt)*) => {
        if ENABLE_LOGS && !$quiet {
            log::info!($($arg)*);
        }
    };
}
