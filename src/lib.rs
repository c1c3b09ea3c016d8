//! # Relay Chat
//!
//! A peer-to-peer chat library in which independent peers discover each
//! other through a bootstrap name server, elect a single chat server peer,
//! relay encrypted messages and keep a shared address book consistent.
//!
//! ## Features
//!
//! - **Name Server**: bootstrap registry holding at most one chat server claim
//! - **Election**: bounded-retry negotiation of the chat server role
//! - **Address Book Sync**: prefer-existing bulk merge, replace-on-announce
//! - **Queued Delivery**: one FIFO drained by a single worker with retry
//! - **Ordered Shutdown**: staged cancellation tokens and a join bound
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use relay_chat::{App, ChatConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ChatConfig::default();
//!     let app = App::new(config)?;
//!     app.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`crypto`]: the encryption capability and local key material
//! - [`transport`]: wire protocol, envelope codec and TCP connection layer
//! - [`network`]: address book, name server, network manager, queue, shutdown
//! - [`utils`]: configuration and error handling

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod app;
pub mod crypto;
pub mod network;
pub mod transport;
pub mod utils;

// Re-export commonly used types for convenience
pub use app::{App, AppEvent};
pub use crypto::{KeyPair, TextbookRsa, UserProfile};
pub use network::{AddressBook, AddressRecord, NameServer, NetworkManager};
pub use transport::{Command, Envelope, Message};
pub use utils::{ChatConfig, ChatError, Result};

/// Maximum frame size in bytes (1MB)
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Default configuration values
pub mod defaults {
    /// Default name server host
    pub const NAME_SERVER_HOST: &str = "127.0.0.1";

    /// Default name server port
    pub const NAME_SERVER_PORT: u16 = 8888;

    /// Default client listener port
    pub const CLIENT_PORT: u16 = 8889;

    /// Default server-role listener port
    pub const CHAT_SERVER_PORT: u16 = 8888;

    /// Address book key of the elected chat server
    pub const CHAT_SERVER_KEY: &str = "chat_server";

    /// Sender name and address book key of the name server
    pub const NAME_SERVER_NAME: &str = "name_server";
}
