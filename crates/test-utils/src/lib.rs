pub mod builders;
pub mod fake_kernel;
pub mod recording_sink;

pub use builders::{ConfigFileBuilder, Harness, HarnessBuilder};
pub use fake_kernel::{FakeKernel, FakeLauncher, FakeTransport};
pub use recording_sink::{Lifecycle, RecordingObserver, RecordingSink};

use std::sync::Once;
use tracing_subscriber::{EnvFilter, fmt};

static INIT: Once = Once::new();

/// Initialise tracing for tests.
///
/// Logs go through `with_test_writer()`, so they only show up for failing
/// tests unless run with `-- --nocapture`. Set `RUST_LOG=debug` for more.
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_target(true)
            .init();
    });
}

/// Run a future with a 5-second timeout.
pub async fn with_timeout<F, T>(f: F) -> T
where
    F: std::future::Future<Output = T>,
{
    tokio::time::timeout(std::time::Duration::from_secs(5), f)
        .await
        .expect("Test timed out after 5 seconds")
}
