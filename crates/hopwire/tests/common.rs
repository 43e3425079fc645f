//! Shared fixtures for the hopwire integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Once};

use hopwire::{Endpoint, FailedEndpointCache, FailedEndpointConfig, ManualClock};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

static TRACING: Once = Once::new();

/// Routes tracing output through the test harness. Set `RUST_LOG` to see it.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::registry()
            .with(fmt::layer().with_test_writer())
            .with(EnvFilter::from_default_env())
            .try_init();
    });
}

/// A failed-endpoint cache on a manual clock starting at one second.
pub fn manual_cache() -> (Arc<FailedEndpointCache>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(1_000));
    let cache = Arc::new(FailedEndpointCache::new(
        FailedEndpointConfig::default(),
        clock.clone(),
    ));
    (cache, clock)
}

pub fn endpoint(uri: &str) -> Endpoint {
    Endpoint::parse(uri).unwrap()
}
