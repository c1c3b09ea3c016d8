//! Network layer: bootstrap registry, election and message relay.
//!
//! This module provides the address book, the name server that arbitrates
//! the chat server role, and the per-peer network manager with its outbound
//! queue and shutdown coordinator.

pub mod address_book;
pub mod manager;
pub mod name_server;
pub mod queue;
pub mod shutdown;

pub use address_book::*;
pub use manager::{BootstrapOutcome, NetworkEvent, NetworkManager, PeerRole};
pub use name_server::{ElectionPhase, NameServer};
pub use queue::{DeliveryObserver, DeliveryPolicy, DeliveryWorker, OutboundQueue, QueueItem};
pub use shutdown::{ShutdownCoordinator, ShutdownStage};
