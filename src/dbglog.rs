// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Minimal debug logging support.
//!
//! If we end up needing more elaborate logging later, it is worth considering
//! switching to the `log` crate and a corresponding subscriber. However, for
//! our current needs this seemed overkill.

use std::sync::atomic::AtomicBool;

// Re-export to make the macros show up in this module in rustdoc.
pub use crate::{debug, warn};

/// Determines whether [`debug`] messages are actually printed or not.
pub static ENABLED: AtomicBool = AtomicBool::new(false);

/// Print to stderr if debug printing is enabled.
///
/// See [`eprintln`] documentation for usage.
#[macro_export]
macro_rules! debug {
    ( $($args:tt)* ) => {
        if $crate::dbglog::ENABLED.load(::std::sync::atomic::Ordering::Relaxed) {
            ::std::eprintln!( $($args)* );
        }
    }
}

/// Print a warning to stderr.
///
/// Unlike [`debug`], warnings are always printed: they flag input problems
/// that processing recovers from but that the operator should know about.
#[macro_export]
macro_rules! warn {
    ( $($args:tt)* ) => {
        ::std::eprintln!("warning: {}", ::std::format_args!( $($args)* ));
    }
}
