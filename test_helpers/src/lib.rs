//! Bits and bobs shared by the tests in this workspace.

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use observability_deps::tracing::{info, subscriber};
use std::sync::Once;
use tracing_log::LogTracer;
use tracing_subscriber::{fmt, EnvFilter};

static LOG_SETUP: Once = Once::new();

/// Enables debug logging if the `RUST_LOG` environment variable is set.
/// Does nothing if `RUST_LOG` is not set. If logging has been enabled
/// previously, does nothing.
pub fn maybe_start_logging() {
    if std::env::var("RUST_LOG").is_ok() {
        start_logging()
    }
}

/// Enables debug logging regardless of the value of the `RUST_LOG` environment
/// variable. If `RUST_LOG` isn't specified, defaults to "debug".
pub fn start_logging() {
    // ensure the global has been initialized
    LOG_SETUP.call_once(|| {
        // honor any existing RUST_LOG level
        if std::env::var("RUST_LOG").is_err() {
            std::env::set_var("RUST_LOG", "debug");
        }

        let subscriber = fmt::Subscriber::builder()
            .with_env_filter(EnvFilter::from_default_env())
            .with_writer(std::io::stderr)
            .with_test_writer()
            .finish();

        LogTracer::init().expect("tracing log init");
        subscriber::set_global_default(subscriber).expect("setting tracing default");

        info!("logging enabled");
    })
}

/// Return a temporary directory that is deleted when the handle is dropped.
pub fn tmp_dir() -> std::io::Result<tempfile::TempDir> {
    tempfile::Builder::new().prefix("ripple").tempdir()
}

/// Assert that `actual` contains the substring `expected`, with a readable
/// failure message when it does not.
#[macro_export]
macro_rules! assert_contains {
    ($actual:expr, $expected:expr) => {
        let actual_value: String = $actual.to_string();
        let expected_value: String = $expected.to_string();
        assert!(
            actual_value.contains(&expected_value),
            "Can not find expected value in actual value\n\
             Expected (contains):\n{}\nActual:\n{}",
            expected_value,
            actual_value,
        );
    };
}

/// Assert that `actual` does not contain the substring `expected`.
#[macro_export]
macro_rules! assert_not_contains {
    ($actual:expr, $expected:expr) => {
        let actual_value: String = $actual.to_string();
        let expected_value: String = $expected.to_string();
        assert!(
            !actual_value.contains(&expected_value),
            "Found unexpected value in actual value\n\
             Unexpected (contains):\n{}\nActual:\n{}",
            expected_value,
            actual_value,
        );
    };
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_assert_contains() {
        assert_contains!("hello world", "hello");
    }

    #[test]
    #[should_panic]
    fn test_assert_contains_missing() {
        assert_contains!("hello world", "goodbye");
    }

    #[test]
    fn test_assert_not_contains() {
        assert_not_contains!("hello world", "goodbye");
    }
}
