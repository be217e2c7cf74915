pub mod domain;
pub mod nats;
pub mod sms_worker;

pub use domain::*;
pub use nats::*;
pub use sms_worker::*;
