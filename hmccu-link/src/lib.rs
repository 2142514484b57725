//! Binds a device [`hmccu_device::Container`] to external logic
//! layers: the registration state machine ([`registered_client`]) that
//! keeps us visible to an interface process, the servant
//! ([`servant`]) that reconciles and forwards device events to it, and
//! the inbound RPC surface ([`logic_layer`]) a logic layer calls on us
//! once registered.

pub mod logic_layer;
pub mod registered_client;
pub mod servant;
pub mod servant_registry;

pub use logic_layer::LogicLayerDispatcher;
pub use registered_client::{spawn as spawn_registered_client, Handle as RegisteredClientHandle, RegisteredClient, State};
pub use servant::{spawn as spawn_servant, Handle as ServantHandle, Servant};
pub use servant_registry::{caller_for, ServantRegistry};
