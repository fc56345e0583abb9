//! Logging shims.
//!
//! Forward to `tracing` when the `tracing` feature is enabled; otherwise the
//! arguments are type-checked and discarded.
#![allow(unused_macros)]

macro_rules! trace {
    ($($t:tt)*) => {
        log!(trace, $($t)*)
    }
}

macro_rules! debug {
    ($($t:tt)*) => {
        log!(debug, $($t)*)
    }
}

macro_rules! info {
    ($($t:tt)*) => {
        log!(info, $($t)*)
    }
}

macro_rules! warn {
    ($($t:tt)*) => {
        log!(warn, $($t)*)
    }
}

macro_rules! error {
    ($($t:tt)*) => {
        log!(error, $($t)*)
    }
}

macro_rules! log {
    ($level: ident, $($t:tt)*) => {{
        #[cfg(feature = "tracing")]
        { tracing::$level!(target: "rsmusicdl", $($t)*) }
        #[cfg(not(feature = "tracing"))]
        { if false { let _ = format_args!($($t)*); } }
    }}
}
