//! Processors of the propagation pipeline.
//!
//! - `UserContactWriter`: updates a user, then publishes a `ChangeEvent`
//! - `EventPublisher`: hands change events to the broker
//! - `Dispatcher`: receives change events and settles each delivery
//! - `PropagationApplier`: overwrites contact copies on derived orders
//! - `ConsumerSupervisor`: restarts the dispatcher when it crashes

pub mod applier;
pub mod contact_writer;
pub mod dispatcher;
pub mod publisher;
pub mod supervisor;

pub use applier::{ApplyError, ChangeEventHandler, PropagationApplier};
pub use contact_writer::{ContactUpdateOutcome, ContactWriteError, UserContactWriter};
pub use dispatcher::{DispatchError, Dispatcher};
pub use publisher::{EventPublisher, PerCallPublisher, PooledPublisher, PublishError};
pub use supervisor::{ConsumerSupervisor, SupervisorExit, SupervisorHandle};
