//! Kernel module - scheduling infrastructure and dependency seams.

pub mod clock;
pub mod service_host;
pub mod tasks;
pub mod traits;

pub use clock::{Clock, ManualClock, SystemClock};
pub use service_host::{Service, ServiceHost};
pub use traits::*;
