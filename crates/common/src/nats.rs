mod client;
mod envelope;
mod error;
#[cfg(any(test, feature = "testing"))]
mod in_memory;
mod middleware;
mod trace_context;
mod tower_consumer;
mod traits;

pub use client::*;
pub use envelope::*;
pub use error::*;
#[cfg(any(test, feature = "testing"))]
pub use in_memory::*;
pub use middleware::*;
pub use trace_context::*;
pub use tower_consumer::*;
pub use traits::*;
