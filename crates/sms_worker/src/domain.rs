mod error;
mod handler;
mod notification;
mod outcome_policy;

pub use error::*;
pub use handler::*;
pub use notification::*;
pub use outcome_policy::*;
