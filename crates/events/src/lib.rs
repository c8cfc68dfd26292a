//! Job lifecycle events and the bus they are published on.

pub mod bus;
pub mod event;
pub mod in_memory_bus;

pub use bus::{BusError, EventBus, Subscription};
pub use event::{JobEvent, JobEventKind};
pub use in_memory_bus::{DEFAULT_SUBSCRIBER_CAPACITY, InMemoryEventBus};
