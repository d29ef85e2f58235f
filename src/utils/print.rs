//! Logging macros that tag every line with the printing component's
//! identity (node ID, machine name, etc.).

/// Internal dispatcher; not for direct use.
#[doc(hidden)]
#[macro_export]
macro_rules! pf_log {
    ($lvl:expr, $prefix:expr; $($arg:tt)*) => {
        log::log!($lvl, "({}) {}", $prefix, format_args!($($arg)*))
    };
}

/// Log TRACE message with parenthesized identity prefix.
///
/// Example:
/// ```ignore
/// pf_trace!(id; "got {} to print", msg);
/// ```
#[macro_export]
macro_rules! pf_trace {
    ($prefix:expr; $($arg:tt)*) => {
        $crate::pf_log!(log::Level::Trace, $prefix; $($arg)*)
    };
}

/// Log DEBUG message with parenthesized identity prefix.
#[macro_export]
macro_rules! pf_debug {
    ($prefix:expr; $($arg:tt)*) => {
        $crate::pf_log!(log::Level::Debug, $prefix; $($arg)*)
    };
}

/// Log INFO message with parenthesized identity prefix.
#[macro_export]
macro_rules! pf_info {
    ($prefix:expr; $($arg:tt)*) => {
        $crate::pf_log!(log::Level::Info, $prefix; $($arg)*)
    };
}

/// Log WARN message with parenthesized identity prefix.
#[macro_export]
macro_rules! pf_warn {
    ($prefix:expr; $($arg:tt)*) => {
        $crate::pf_log!(log::Level::Warn, $prefix; $($arg)*)
    };
}

/// Log ERROR message with parenthesized identity prefix.
#[macro_export]
macro_rules! pf_error {
    ($prefix:expr; $($arg:tt)*) => {
        $crate::pf_log!(log::Level::Error, $prefix; $($arg)*)
    };
}

/// Log an error string to logger and then return a `ConclaveError`
/// containing the same string (prefix included).
///
/// Example:
/// ```ignore
/// let e = logged_err!(id; "got {} to print", msg);
/// ```
#[macro_export]
macro_rules! logged_err {
    ($prefix:expr; $($arg:tt)*) => {{
        $crate::pf_error!($prefix; $($arg)*);
        Err($crate::ConclaveError(format!(
            "({}) {}",
            $prefix,
            format_args!($($arg)*)
        )))
    }};
}
