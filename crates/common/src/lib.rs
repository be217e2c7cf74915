pub mod nats;
pub mod telemetry;

// Re-export mocks when testing feature is enabled
#[cfg(any(test, feature = "testing"))]
pub use nats::MockErrorReporter;
