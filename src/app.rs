//! Main application lifecycle and coordination.
//!
//! This module wires the user profile, the persisted address book and the
//! network manager together, turns network events into user-facing output
//! and reads chat input from stdin until a shutdown signal arrives.

use crate::{
    crypto::{TextbookRsa, UserProfile},
    network::{AddressBook, JsonFileStore, NameServer, NetworkEvent, NetworkManager, PeerRole},
    utils::{ChatConfig, Result},
};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Main application structure
pub struct App {
    /// Application configuration
    config: ChatConfig,
    /// User profile (name and keys)
    profile: UserProfile,
}

/// Application events
#[derive(Debug, Clone, PartialEq)]
pub enum AppEvent {
    /// New message received
    MessageReceived {
        sender: String,
        text: String,
        sent_at: chrono::DateTime<chrono::Utc>,
    },
    /// Message acknowledged by its recipient
    MessageSent {
        recipient: String,
        message_id: Option<Uuid>,
    },
    /// Delivery attempt failed
    SendFailed {
        recipient: String,
        attempts: u32,
        reason: String,
    },
    /// Peer announced itself
    PeerJoined { name: String, address: String },
    /// Address book grew through a sync
    AddressBookUpdated { added: usize },
    /// Local role changed
    RoleChanged { role: PeerRole },
}

impl From<NetworkEvent> for AppEvent {
    fn from(event: NetworkEvent) -> Self {
        match event {
            NetworkEvent::MessageReceived { from, message } => AppEvent::MessageReceived {
                sender: from,
                text: message.text,
                sent_at: message.sent_at,
            },
            NetworkEvent::Delivered { target, message_id } => AppEvent::MessageSent {
                recipient: target,
                message_id,
            },
            NetworkEvent::SendFailed {
                target,
                attempts,
                reason,
            } => AppEvent::SendFailed {
                recipient: target,
                attempts,
                reason,
            },
            NetworkEvent::PeerJoined(record) => AppEvent::PeerJoined {
                address: record.socket_address(),
                name: record.name,
            },
            NetworkEvent::AddressBookUpdated { added } => AppEvent::AddressBookUpdated { added },
            NetworkEvent::RoleChanged(role) => AppEvent::RoleChanged { role },
        }
    }
}

/// One line of user input
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    /// `@target text`
    Send { target: String, text: String },
    /// `/peers`
    Peers,
    /// `/quit`
    Quit,
}

impl Input {
    /// Parse a stdin line; `None` for blank or unrecognised input
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        match line {
            "" => None,
            "/peers" => Some(Input::Peers),
            "/quit" | "/exit" => Some(Input::Quit),
            _ => {
                let rest = line.strip_prefix('@')?;
                let (target, text) = rest.split_once(char::is_whitespace)?;
                let text = text.trim();
                if target.is_empty() || text.is_empty() {
                    return None;
                }
                Some(Input::Send {
                    target: target.to_string(),
                    text: text.to_string(),
                })
            }
        }
    }
}

impl App {
    /// Create a new application instance
    pub fn new(config: ChatConfig) -> Result<Self> {
        let profile = UserProfile::load_or_create(&config.storage.profile_file, &config.peer.name)?;
        Ok(Self { config, profile })
    }

    /// The loaded profile
    pub fn profile(&self) -> &UserProfile {
        &self.profile
    }

    /// Run the peer until Ctrl-C, `/quit` or end of the event stream
    pub async fn run(self) -> Result<()> {
        log::info!("Starting relay chat peer");
        log::info!("User: {}", self.profile.username);

        let (event_sender, mut event_receiver) = mpsc::unbounded_channel();
        let store = Arc::new(JsonFileStore::new(&self.config.storage.address_book_file));
        let manager = NetworkManager::start(
            self.config.clone(),
            &self.profile,
            Arc::new(TextbookRsa),
            AddressBook::load(store),
            event_sender,
        )
        .await?;
        log::info!("Listening for peers on {}", manager.local_record().socket_address());

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut stdin_open = true;

        // Main application loop
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    log::info!("Interrupt received");
                    break;
                }

                event = event_receiver.recv() => match event {
                    Some(event) => Self::handle_app_event(AppEvent::from(event)),
                    None => break,
                },

                line = lines.next_line(), if stdin_open => match line {
                    Ok(Some(line)) => {
                        if !Self::handle_input(&manager, &line).await {
                            break;
                        }
                    }
                    Ok(None) => {
                        log::debug!("stdin closed, running until interrupted");
                        stdin_open = false;
                    }
                    Err(e) => {
                        log::warn!("Failed to read stdin: {}", e);
                        stdin_open = false;
                    }
                },
            }
        }

        Self::shutdown(&manager).await;
        Ok(())
    }

    /// Returns false when the user asked to quit
    async fn handle_input(manager: &NetworkManager, line: &str) -> bool {
        match Input::parse(line) {
            Some(Input::Send { target, text }) => {
                let id = manager.send_message(&target, &text).await;
                log::debug!("Queued message {} for {}", id, target);
            }
            Some(Input::Peers) => {
                let mut names: Vec<_> = manager.address_book().await.into_values().collect();
                names.sort_by(|a, b| a.name.cmp(&b.name));
                for record in names {
                    println!("{:<16} {}", record.name, record.socket_address());
                }
            }
            Some(Input::Quit) => return false,
            None => println!("Usage: @name message | /peers | /quit"),
        }
        true
    }

    /// Handle application events
    fn handle_app_event(event: AppEvent) {
        match event {
            AppEvent::MessageReceived {
                sender,
                text,
                sent_at,
            } => {
                println!("[{}] {}: {}", sent_at.format("%H:%M:%S"), sender, text);
            }
            AppEvent::MessageSent {
                recipient,
                message_id,
            } => {
                log::info!("Message {:?} delivered to {}", message_id, recipient);
            }
            AppEvent::SendFailed {
                recipient,
                attempts,
                reason,
            } => {
                println!("! failed to send to {} (attempt {}): {}", recipient, attempts, reason);
            }
            AppEvent::PeerJoined { name, address } => {
                log::info!("{} joined at {}", name, address);
            }
            AppEvent::AddressBookUpdated { added } => {
                log::info!("Learned {} new address(es)", added);
            }
            AppEvent::RoleChanged { role } => {
                log::info!("Role is now {:?}", role);
            }
        }
    }

    /// Shutdown the application gracefully
    async fn shutdown(manager: &NetworkManager) {
        log::info!("Shutting down application");
        if !manager.shutdown().await {
            log::error!("Some tasks had to be aborted during shutdown");
        }
    }
}

/// Run a name server until Ctrl-C
pub async fn run_name_server(config: ChatConfig) -> Result<()> {
    let store = Arc::new(JsonFileStore::new(&config.name_server.address_book_file));
    let server = Arc::new(NameServer::new(config.name_server, config.network, store));
    let listener = server.bind().await?;

    let cancel = CancellationToken::new();
    let task = tokio::spawn(Arc::clone(&server).run(listener, cancel.clone()));

    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Failed to listen for Ctrl-C: {}", e);
    }
    log::info!("Stopping name server");
    cancel.cancel();
    if let Err(e) = task.await {
        log::error!("Name server task failed: {}", e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyStore;
    use crate::network::AddressRecord;
    use crate::transport::ChatMessage;
    use tempfile::TempDir;

    fn create_test_app() -> (App, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let mut config = ChatConfig::default();
        config.set_data_dir(temp_dir.path().to_path_buf());
        config.peer.name = "alice".to_string();

        let app = App::new(config).unwrap();
        (app, temp_dir)
    }

    #[test]
    fn test_app_creation() {
        let (app, temp_dir) = create_test_app();
        assert_eq!(app.profile().username, "alice");
        assert!(temp_dir.path().join("profile.json").exists());
    }

    #[test]
    fn test_profile_is_reused() {
        let (app, temp_dir) = create_test_app();
        let mut config = ChatConfig::default();
        config.set_data_dir(temp_dir.path().to_path_buf());
        let again = App::new(config).unwrap();

        assert_eq!(
            again.profile().public_key().unwrap(),
            app.profile().public_key().unwrap()
        );
    }

    #[test]
    fn test_input_parsing() {
        assert_eq!(
            Input::parse("@bob hello there"),
            Some(Input::Send {
                target: "bob".to_string(),
                text: "hello there".to_string()
            })
        );
        assert_eq!(Input::parse("  /peers "), Some(Input::Peers));
        assert_eq!(Input::parse("/quit"), Some(Input::Quit));
        assert_eq!(Input::parse("@bob"), None);
        assert_eq!(Input::parse("@ hello"), None);
        assert_eq!(Input::parse("hello"), None);
        assert_eq!(Input::parse(""), None);
    }

    #[test]
    fn test_network_event_conversion() {
        let chat = ChatMessage::new("hi");
        let event = AppEvent::from(NetworkEvent::MessageReceived {
            from: "bob".to_string(),
            message: chat.clone(),
        });
        assert_eq!(
            event,
            AppEvent::MessageReceived {
                sender: "bob".to_string(),
                text: "hi".to_string(),
                sent_at: chat.sent_at,
            }
        );

        let record = AddressRecord::plaintext("carol", "10.0.0.3", 9000);
        let event = AppEvent::from(NetworkEvent::PeerJoined(record));
        assert_eq!(
            event,
            AppEvent::PeerJoined {
                name: "carol".to_string(),
                address: "10.0.0.3:9000".to_string(),
            }
        );
    }
}
