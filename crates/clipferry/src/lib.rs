//! Relay assembly: delivery sink and the runner that binds delivery to
//! the scheduler<->executor seam.

pub mod delivery;
pub mod runner;

pub use delivery::{Delivery, DeliveryError, DeliverySink, FileHost};
pub use runner::DeliveringRunner;
