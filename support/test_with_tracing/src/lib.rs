// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A drop-in replacement for `#[test]` that installs a [`tracing`]
//! subscriber before the test body runs.
//!
//! Events are written through the libtest output capture, so they only show
//! up for failing tests (or with `--nocapture`).
//!
//! ```ignore
//! use test_with_tracing::test;
//!
//! #[test]
//! fn logs_are_captured() {
//!     tracing::info!("visible when the test fails");
//! }
//! ```

#![forbid(unsafe_code)]

pub use test_with_tracing_macro::test;

use std::sync::Once;

/// Installs the global test subscriber. Called by the expansion of
/// [`macro@test`]; safe to call any number of times.
#[doc(hidden)]
pub fn init() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        // Another subscriber may already be installed by the test binary.
        let _ = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_max_level(tracing::Level::TRACE)
            .with_test_writer()
            .try_init();
    });
}
