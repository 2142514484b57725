//! The device/channel/paramset/parameter model (a process-wide
//! [`Container`] of [`Device`]s) and the device-layer RPC handler that
//! serves the Controller's queries over it.

pub mod container;
pub mod device;
pub mod event;
pub mod flags;
pub mod handler;
pub mod kind;
pub mod param;
pub mod paramset;

pub use container::{Container, NullSynchronizer, Synchronizer};
pub use device::{Channel, Device};
pub use event::Event;
pub use flags::{OperationFlags, PresentationFlags};
pub use handler::{DeviceHandler, NullRegistrationSink, RegistrationSink};
pub use kind::Kind;
pub use param::{ParamDescription, Parameter};
pub use paramset::{Paramset, ParamsetKey};
