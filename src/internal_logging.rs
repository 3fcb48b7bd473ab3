#![allow(unused_macros)]
//! Self-diagnostic macros.
//!
//! These are for weft's own plumbing (scope misuse, reporter failures,
//! rejected wire input), not for application logging. They emit through the
//! [`tracing`](https://docs.rs/tracing) facade when the default-on
//! `internal-logs` feature is enabled, print to stdout under `cargo test
//! -- --nocapture`, and compile to nothing otherwise.

/// Logs a debug-level diagnostic with a `name` and optional fields.
#[macro_export]
macro_rules! weft_debug {
    (name: $name:expr $(,)?) => {
        #[cfg(feature = "internal-logs")]
        {
            $crate::_private::debug!(name: $name, target: env!("CARGO_PKG_NAME"), name = $name);
        }

        #[cfg(all(not(feature = "internal-logs"), not(test)))]
        {
            let _ = $name;
        }
    };
    (name: $name:expr, $($key:ident = $value:expr),+ $(,)?) => {
        #[cfg(feature = "internal-logs")]
        {
            $crate::_private::debug!(name: $name, target: env!("CARGO_PKG_NAME"), name = $name, $($key = $value),+);
        }

        #[cfg(all(not(feature = "internal-logs"), not(test)))]
        {
            let _ = ($name, $($value),+);
        }
    };
}

/// Logs a warning-level diagnostic with a `name` and optional fields.
#[macro_export]
macro_rules! weft_warn {
    (name: $name:expr $(,)?) => {
        #[cfg(feature = "internal-logs")]
        {
            $crate::_private::warn!(name: $name, target: env!("CARGO_PKG_NAME"), name = $name);
        }

        #[cfg(all(not(feature = "internal-logs"), test))]
        {
            print!("weft_warn: name={}\n", $name);
        }

        #[cfg(all(not(feature = "internal-logs"), not(test)))]
        {
            let _ = $name;
        }
    };
    (name: $name:expr, $($key:ident = $value:expr),+ $(,)?) => {
        #[cfg(feature = "internal-logs")]
        {
            $crate::_private::warn!(name: $name, target: env!("CARGO_PKG_NAME"), name = $name, $($key = $value),+);
        }

        #[cfg(all(not(feature = "internal-logs"), test))]
        {
            print!("weft_warn: name={}", $name);
            $(
                print!(", {}={}", stringify!($key), $value);
            )+
            print!("\n");
        }

        #[cfg(all(not(feature = "internal-logs"), not(test)))]
        {
            let _ = ($name, $($value),+);
        }
    };
}
