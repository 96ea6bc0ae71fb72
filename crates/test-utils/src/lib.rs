//! Shared fixtures for `reductor` tests: row and config builders, a scripted
//! executor, and minimal stage implementations.

pub mod builders;
pub mod fake_executor;
pub mod stages;

use std::future::Future;
use std::sync::Once;
use std::time::Duration;

use tracing_subscriber::{EnvFilter, fmt};

static INIT: Once = Once::new();

/// Default per-test deadline for [`with_timeout`].
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Install a test-captured subscriber once per test binary.
///
/// Filter comes from `RUST_LOG`; without it only warnings from dependencies
/// and debug output from `reductor` are shown. Output is printed for failing
/// tests only unless run with `--nocapture`.
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("warn,reductor=debug"));

        // Another harness may already own the global subscriber.
        let _ = fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_target(true)
            .try_init();
    });
}

/// Await `f`, panicking if it takes longer than [`TEST_TIMEOUT`].
pub async fn with_timeout<F, T>(f: F) -> T
where
    F: Future<Output = T>,
{
    with_deadline(TEST_TIMEOUT, f).await
}

/// Await `f`, panicking if it takes longer than `limit`.
pub async fn with_deadline<F, T>(limit: Duration, f: F) -> T
where
    F: Future<Output = T>,
{
    tokio::time::timeout(limit, f)
        .await
        .unwrap_or_else(|_| panic!("test timed out after {limit:?}"))
}
