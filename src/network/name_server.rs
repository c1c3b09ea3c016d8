//! Bootstrap registry arbitrating the chat server role.
//!
//! The name server holds at most one `chat_server` record. A granted
//! privilege request locks the role until the winner confirms it with
//! `server established` or releases it. Only the claimant may confirm or
//! release its claim. Only one name server may run per network; the lock is a
//! mutual-exclusion guard, not a consensus protocol.

use crate::defaults::{CHAT_SERVER_KEY, NAME_SERVER_NAME};
use crate::network::{AddressBook, AddressBookStore, AddressRecord};
use crate::transport::{self, Envelope, FrameHandler, Message};
use crate::utils::{NameServerConfig, NetworkConfig, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Where the chat server role currently stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionPhase {
    /// Nobody holds or claims the role
    Idle,
    /// A claim was accepted but not yet confirmed
    Locked,
    /// A chat server is registered
    Active,
}

#[derive(Debug)]
struct ElectionState {
    server_locked_in: bool,
    locked_at: Option<Instant>,
    /// Claimant the lock was granted to; unknown for a restored registration
    holder: Option<AddressRecord>,
    book: AddressBook,
}

impl ElectionState {
    fn phase(&self) -> ElectionPhase {
        if self.book.contains(CHAT_SERVER_KEY) {
            ElectionPhase::Active
        } else if self.server_locked_in {
            ElectionPhase::Locked
        } else {
            ElectionPhase::Idle
        }
    }

    fn lock(&mut self, claimant: AddressRecord) {
        self.server_locked_in = true;
        self.locked_at = Some(Instant::now());
        self.holder = Some(claimant);
    }

    fn held_by(&self, sender: &str) -> bool {
        self.holder.as_ref().is_some_and(|holder| holder.name == sender)
    }

    fn release(&mut self) {
        self.book.remove_address(CHAT_SERVER_KEY);
        self.server_locked_in = false;
        self.locked_at = None;
        self.holder = None;
    }
}

/// Name server process state and request handling
pub struct NameServer {
    state: Mutex<ElectionState>,
    settings: NameServerConfig,
    network: NetworkConfig,
}

impl NameServer {
    /// Name server whose registry is persisted through `store`
    pub fn new(
        settings: NameServerConfig,
        network: NetworkConfig,
        store: Arc<dyn AddressBookStore>,
    ) -> Self {
        let book = AddressBook::load(store);
        // A persisted chat server survives restarts; the probe clears it if stale
        let server_locked_in = book.contains(CHAT_SERVER_KEY);
        if server_locked_in {
            log::info!("Restored registered chat server from address book");
        }

        Self {
            state: Mutex::new(ElectionState {
                server_locked_in,
                locked_at: server_locked_in.then(Instant::now),
                holder: None,
                book,
            }),
            settings,
            network,
        }
    }

    /// Bind the configured listening address
    pub async fn bind(&self) -> Result<TcpListener> {
        transport::bind(&self.settings.host, self.settings.port).await
    }

    /// Serve requests on `listener` until `cancel` fires
    pub async fn run(self: Arc<Self>, listener: TcpListener, cancel: CancellationToken) {
        let network = self.network.clone();
        transport::serve(listener, self, network, cancel, "Name server").await;
    }

    /// Current phase of the state machine
    pub async fn phase(&self) -> ElectionPhase {
        self.state.lock().await.phase()
    }

    /// The registered chat server, if any
    pub async fn chat_server(&self) -> Option<AddressRecord> {
        self.state.lock().await.book.get(CHAT_SERVER_KEY).cloned()
    }

    /// Handle one decoded request, returning the reply if the command has one
    pub async fn handle_message(&self, message: Message, sender: &str) -> Option<Message> {
        match message {
            Message::RequestServerPrivileges(claim) => Some(self.request_privileges(claim, sender).await),
            Message::ServerEstablished(record) => {
                self.server_established(record, sender).await;
                None
            }
            Message::ServerTerminated | Message::ChatServerShutdown => Some(self.release_role(sender).await),
            Message::RequestCurrentServer => {
                let state = self.state.lock().await;
                match state.book.get(CHAT_SERVER_KEY) {
                    Some(record) => {
                        log::info!("Server exists, sending address to {}", sender);
                        Some(Message::ServerExists(record.clone()))
                    }
                    None => {
                        log::info!("No chat server, answering {} ({:?})", sender, state.phase());
                        Some(Message::NoChatServer)
                    }
                }
            }
            Message::ChatServerTerminated => Some(self.probe_chat_server(sender).await),
            Message::Ping => Some(Message::Pong),
            other => {
                log::warn!("Unexpected '{}' from {}", other.command(), sender);
                None
            }
        }
    }

    async fn request_privileges(&self, claim: AddressRecord, sender: &str) -> Message {
        let mut state = self.state.lock().await;
        let phase = state.phase();

        if phase == ElectionPhase::Locked {
            let expired = state
                .locked_at
                .is_some_and(|at| at.elapsed() >= self.settings.lock_timeout());
            if expired {
                log::warn!("Unconfirmed chat server claim timed out, releasing lock");
                state.release();
            }
        }

        if state.phase() == ElectionPhase::Idle {
            state.lock(claim.renamed(sender));
            log::info!(
                "Granted chat server privileges to {} at {}",
                sender,
                claim.socket_address()
            );
            Message::Accepted
        } else {
            log::info!("Rejected privilege request from {} ({:?})", sender, state.phase());
            Message::Rejected
        }
    }

    async fn server_established(&self, record: AddressRecord, sender: &str) {
        let mut state = self.state.lock().await;
        if !state.server_locked_in {
            log::warn!(
                "Ignoring 'server established' from {} without granted privileges",
                sender
            );
            return;
        }
        if !state.held_by(sender) {
            log::warn!(
                "Ignoring 'server established' from {}, privileges were granted to {}",
                sender,
                state.holder.as_ref().map_or("nobody", |holder| holder.name.as_str())
            );
            return;
        }
        log::info!("Chat server established at {}", record.socket_address());
        state.book.replace(record.renamed(CHAT_SERVER_KEY));
        state.locked_at = None;
    }

    async fn release_role(&self, sender: &str) -> Message {
        let mut state = self.state.lock().await;
        if state.phase() == ElectionPhase::Idle {
            log::info!("{} released a role nobody holds", sender);
            return Message::ChatServerDead;
        }
        if !state.held_by(sender) {
            log::warn!("Refusing role release from {}, it does not hold the role", sender);
            return Message::Rejected;
        }
        state.release();
        log::info!("Chat server role released by {}", sender);
        Message::ChatServerDead
    }

    async fn probe_chat_server(&self, sender: &str) -> Message {
        let Some(registered) = self.chat_server().await else {
            log::info!("Probe requested by {} but no chat server is registered", sender);
            return Message::ChatServerDead;
        };

        log::info!("Pinging chat server at {}", registered.socket_address());
        if self.ping(&registered).await {
            log::info!("Chat server is still alive");
            return Message::ServerExists(registered);
        }

        let mut state = self.state.lock().await;
        // Only clear the record that was probed; a new server may have taken over meanwhile
        if state.book.get(CHAT_SERVER_KEY) == Some(&registered) {
            log::info!("Chat server is dead, releasing the role");
            state.release();
            Message::ChatServerDead
        } else {
            match state.book.get(CHAT_SERVER_KEY) {
                Some(current) => Message::ServerExists(current.clone()),
                None => Message::ChatServerDead,
            }
        }
    }

    async fn ping(&self, record: &AddressRecord) -> bool {
        let ping = match Message::Ping.into_plain_envelope(NAME_SERVER_NAME) {
            Ok(envelope) => envelope,
            Err(e) => {
                log::error!("Failed to frame ping: {}", e);
                return false;
            }
        };
        let probe_addr = record.socket_address();
        let probe = transport::request_once(&probe_addr, &ping, &self.network);
        match tokio::time::timeout(self.settings.probe_timeout(), probe).await {
            Ok(Ok(reply)) => reply.command == crate::transport::Command::Pong,
            Ok(Err(e)) => {
                log::warn!("Chat server probe failed: {}", e);
                false
            }
            Err(_) => {
                log::warn!("Chat server did not answer the probe within {:?}", self.settings.probe_timeout());
                false
            }
        }
    }
}

impl FrameHandler for NameServer {
    async fn handle(&self, envelope: Envelope, peer: SocketAddr) -> Option<Envelope> {
        let sender = if envelope.sender.is_empty() {
            peer.to_string()
        } else {
            envelope.sender.clone()
        };

        let message = match Message::from_plain_envelope(envelope) {
            Ok(message) => message,
            Err(e) => {
                log::warn!("Dropping request from {}: {}", sender, e);
                return None;
            }
        };
        log::debug!("Received '{}' from {}", message.command(), sender);

        let reply = self.handle_message(message, &sender).await?;
        match reply.into_plain_envelope(NAME_SERVER_NAME) {
            Ok(envelope) => Some(envelope),
            Err(e) => {
                log::error!("Failed to frame reply for {}: {}", sender, e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::MemoryStore;

    fn name_server() -> NameServer {
        NameServer::new(
            NameServerConfig::default(),
            NetworkConfig::default(),
            Arc::new(MemoryStore::new()),
        )
    }

    fn claim(name: &str, port: u16) -> Message {
        Message::RequestServerPrivileges(AddressRecord::plaintext(name, "127.0.0.1", port))
    }

    #[tokio::test]
    async fn test_state_machine() {
        let server = name_server();
        assert_eq!(server.phase().await, ElectionPhase::Idle);

        let reply = server.handle_message(claim("alice", 9000), "alice").await;
        assert_eq!(reply, Some(Message::Accepted));
        assert_eq!(server.phase().await, ElectionPhase::Locked);

        // Locked but unconfirmed reads as vacant
        let reply = server.handle_message(Message::RequestCurrentServer, "bob").await;
        assert_eq!(reply, Some(Message::NoChatServer));

        let record = AddressRecord::plaintext("alice", "127.0.0.1", 9000);
        let reply = server
            .handle_message(Message::ServerEstablished(record.clone()), "alice")
            .await;
        assert_eq!(reply, None);
        assert_eq!(server.phase().await, ElectionPhase::Active);

        let reply = server.handle_message(Message::RequestCurrentServer, "bob").await;
        assert_eq!(reply, Some(Message::ServerExists(record.renamed(CHAT_SERVER_KEY))));

        let reply = server.handle_message(Message::ServerTerminated, "alice").await;
        assert_eq!(reply, Some(Message::ChatServerDead));
        assert_eq!(server.phase().await, ElectionPhase::Idle);
    }

    #[tokio::test]
    async fn test_rejections_do_not_change_state() {
        let server = name_server();
        server.handle_message(claim("alice", 9000), "alice").await;

        let reply = server.handle_message(claim("bob", 9001), "bob").await;
        assert_eq!(reply, Some(Message::Rejected));
        assert_eq!(server.phase().await, ElectionPhase::Locked);
        assert!(server.chat_server().await.is_none());
    }

    #[tokio::test]
    async fn test_established_without_lock_is_ignored() {
        let server = name_server();
        let record = AddressRecord::plaintext("mallory", "127.0.0.1", 9000);

        server.handle_message(Message::ServerEstablished(record), "mallory").await;
        assert_eq!(server.phase().await, ElectionPhase::Idle);
    }

    #[tokio::test]
    async fn test_established_only_from_claimant() {
        let server = name_server();
        server.handle_message(claim("alice", 9000), "alice").await;
        assert_eq!(server.handle_message(claim("bob", 9001), "bob").await, Some(Message::Rejected));

        let bob = AddressRecord::plaintext(CHAT_SERVER_KEY, "127.0.0.1", 9001);
        server.handle_message(Message::ServerEstablished(bob), "bob").await;
        assert_eq!(server.phase().await, ElectionPhase::Locked);
        assert!(server.chat_server().await.is_none());

        let alice = AddressRecord::plaintext(CHAT_SERVER_KEY, "127.0.0.1", 9000);
        server.handle_message(Message::ServerEstablished(alice.clone()), "alice").await;
        assert_eq!(server.chat_server().await, Some(alice));
    }

    #[tokio::test]
    async fn test_release_only_by_holder() {
        let server = name_server();
        server.handle_message(claim("bob", 9001), "bob").await;
        let bob = AddressRecord::plaintext(CHAT_SERVER_KEY, "127.0.0.1", 9001);
        server.handle_message(Message::ServerEstablished(bob.clone()), "bob").await;

        // A former chat server leaving must not unseat its successor
        let reply = server.handle_message(Message::ChatServerShutdown, "alice").await;
        assert_eq!(reply, Some(Message::Rejected));
        assert_eq!(server.phase().await, ElectionPhase::Active);
        assert_eq!(server.chat_server().await, Some(bob));

        let reply = server.handle_message(Message::ServerTerminated, "mallory").await;
        assert_eq!(reply, Some(Message::Rejected));
        assert_eq!(server.phase().await, ElectionPhase::Active);

        let reply = server.handle_message(Message::ChatServerShutdown, "bob").await;
        assert_eq!(reply, Some(Message::ChatServerDead));
        assert_eq!(server.phase().await, ElectionPhase::Idle);

        // Releasing a vacant role is harmless
        let reply = server.handle_message(Message::ServerTerminated, "bob").await;
        assert_eq!(reply, Some(Message::ChatServerDead));
    }

    #[tokio::test]
    async fn test_timed_out_claimant_cannot_confirm() {
        let mut settings = NameServerConfig::default();
        settings.lock_timeout_secs = 0;
        let server = NameServer::new(settings, NetworkConfig::default(), Arc::new(MemoryStore::new()));

        server.handle_message(claim("alice", 9000), "alice").await;
        server.handle_message(claim("bob", 9001), "bob").await;

        let alice = AddressRecord::plaintext(CHAT_SERVER_KEY, "127.0.0.1", 9000);
        server.handle_message(Message::ServerEstablished(alice), "alice").await;
        assert_eq!(server.phase().await, ElectionPhase::Locked);
    }

    #[tokio::test]
    async fn test_stale_lock_times_out() {
        let mut settings = NameServerConfig::default();
        settings.lock_timeout_secs = 0;
        let server = NameServer::new(settings, NetworkConfig::default(), Arc::new(MemoryStore::new()));

        assert_eq!(server.handle_message(claim("alice", 9000), "alice").await, Some(Message::Accepted));
        assert_eq!(server.handle_message(claim("bob", 9001), "bob").await, Some(Message::Accepted));
    }

    #[tokio::test]
    async fn test_probe_clears_dead_server() {
        let server = name_server();
        // Grab a port nobody listens on
        let port = {
            let listener = transport::bind("127.0.0.1", 0).await.unwrap();
            listener.local_addr().unwrap().port()
        };
        server.handle_message(claim("alice", port), "alice").await;
        let record = AddressRecord::plaintext("alice", "127.0.0.1", port);
        server.handle_message(Message::ServerEstablished(record), "alice").await;

        let reply = server.handle_message(Message::ChatServerTerminated, "bob").await;
        assert_eq!(reply, Some(Message::ChatServerDead));
        assert_eq!(server.phase().await, ElectionPhase::Idle);
    }

    #[tokio::test]
    async fn test_restored_chat_server_is_active() {
        let mut snapshot = crate::network::AddressBookSnapshot::new();
        snapshot.insert(
            CHAT_SERVER_KEY.to_string(),
            AddressRecord::plaintext(CHAT_SERVER_KEY, "127.0.0.1", 9000),
        );
        let server = NameServer::new(
            NameServerConfig::default(),
            NetworkConfig::default(),
            Arc::new(MemoryStore::with_snapshot(snapshot)),
        );

        assert_eq!(server.phase().await, ElectionPhase::Active);
        assert_eq!(server.handle_message(claim("bob", 9001), "bob").await, Some(Message::Rejected));
    }

    #[tokio::test]
    async fn test_handler_rejects_encrypted_requests() {
        let server = name_server();
        let envelope = Envelope {
            command: crate::transport::Command::RequestServerPrivileges,
            content: serde_json::Value::String("[1,2,3]".to_string()),
            sender: "alice".to_string(),
        };
        let peer: SocketAddr = "127.0.0.1:5000".parse().unwrap();

        assert!(server.handle(envelope, peer).await.is_none());
        assert_eq!(server.phase().await, ElectionPhase::Idle);
    }
}
