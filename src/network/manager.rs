//! Per-peer network manager.
//!
//! Owns the peer's address book and outbound queue, runs the bootstrap
//! election against the name server, and hosts the client-role listener
//! (always) and the server-role listener (only while elected).
//!
//! Bootstrap:
//! 1. Ask the name server for the current chat server. An unreachable name
//!    server counts as "no server" for this step but is logged as a fault.
//! 2. If one exists, record it under `chat_server` and register with it.
//! 3. Otherwise request privileges. On `accepted`, bind the server listener,
//!    confirm with `server established` and point `chat_server` at ourselves.
//!    On `rejected`, back off with jitter and go back to step 1.

use crate::crypto::{Cipher, KeyStore};
use crate::defaults::{CHAT_SERVER_KEY, NAME_SERVER_NAME};
use crate::network::{
    AddressBook, AddressBookSnapshot, AddressRecord, DeliveryObserver, DeliveryPolicy,
    DeliveryWorker, OutboundQueue, QueueItem, ShutdownCoordinator, ShutdownStage,
};
use crate::transport::{self, ChatMessage, Envelope, FrameHandler, Message, MessageCodec};
use crate::utils::{ChatConfig, ChatError, ElectionError, NetworkError, ProtocolError, Result};
use rand::Rng;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// What this peer currently is in the network
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    /// Bootstrap has not finished
    Starting,
    /// Elected; the server-role listener is running
    ChatServer,
    /// Registered with another peer's chat server
    Client,
    /// No name server or chat server could be reached
    Isolated,
    /// Shut down
    Stopped,
}

/// Result of a bootstrap run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootstrapOutcome {
    /// This peer won the election and serves at the record's address
    Elected(AddressRecord),
    /// Another peer is the chat server
    Following(AddressRecord),
    /// Bootstrap failed; the client listener keeps running
    Isolated,
}

/// Events surfaced to the user interface
#[derive(Debug, Clone)]
pub enum NetworkEvent {
    /// A relayed chat message arrived
    MessageReceived {
        /// Sender name from the envelope
        from: String,
        /// The decrypted message
        message: ChatMessage,
    },
    /// A peer announced itself with `new client`
    PeerJoined(AddressRecord),
    /// A bulk sync added entries to the address book
    AddressBookUpdated {
        /// How many names were new
        added: usize,
    },
    /// The peer's role changed
    RoleChanged(PeerRole),
    /// An outbound message was acknowledged
    Delivered {
        /// Recipient name
        target: String,
        /// Chat message id, when the item was a chat message
        message_id: Option<Uuid>,
    },
    /// An outbound delivery attempt failed; the message stays queued unless
    /// the retry cap was reached
    SendFailed {
        /// Recipient name
        target: String,
        /// Attempts so far
        attempts: u32,
        /// Failure description
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListenerRole {
    Client,
    Server,
}

/// Forwards delivery outcomes into the event channel
struct EventObserver {
    events: mpsc::UnboundedSender<NetworkEvent>,
}

fn message_id(item: &QueueItem) -> Option<Uuid> {
    match &item.message {
        Message::Chat(chat) => Some(chat.id),
        _ => None,
    }
}

impl DeliveryObserver for EventObserver {
    fn notify_send_failure(&self, item: &QueueItem, error: &ChatError) {
        let _ = self.events.send(NetworkEvent::SendFailed {
            target: item.target.clone(),
            attempts: item.attempts,
            reason: error.to_string(),
        });
    }

    fn notify_delivered(&self, item: &QueueItem) {
        let _ = self.events.send(NetworkEvent::Delivered {
            target: item.target.clone(),
            message_id: message_id(item),
        });
    }
}

/// Network manager for one peer process
pub struct NetworkManager {
    config: ChatConfig,
    local: AddressRecord,
    codec: MessageCodec,
    book: Arc<RwLock<AddressBook>>,
    queue: Arc<OutboundQueue>,
    role: RwLock<PeerRole>,
    election: Mutex<()>,
    events: mpsc::UnboundedSender<NetworkEvent>,
    shutdown: ShutdownCoordinator,
}

impl std::fmt::Debug for NetworkManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkManager")
            .field("local", &self.local)
            .field("queue", &self.queue.len())
            .finish_non_exhaustive()
    }
}

impl NetworkManager {
    /// Bind the client listener, join the network and start background tasks
    ///
    /// Only a failure to bind the client listener is an error; every
    /// bootstrap fault degrades to [`PeerRole::Isolated`].
    pub async fn start(
        config: ChatConfig,
        keys: &dyn KeyStore,
        cipher: Arc<dyn Cipher>,
        book: AddressBook,
        events: mpsc::UnboundedSender<NetworkEvent>,
    ) -> Result<Arc<Self>> {
        let listener = transport::bind(&config.peer.host, config.peer.client_port).await?;
        let port = listener.local_addr()?.port();

        let public_key = keys.public_key()?;
        let private_key = keys.private_key().ok();
        if private_key.is_none() {
            log::warn!("No private key available, peers will send to us in plaintext");
        }

        let local = AddressRecord::new(&config.peer.name, &config.peer.host, port, public_key);
        let codec = MessageCodec::new(&config.peer.name, private_key, cipher);
        let shutdown = ShutdownCoordinator::new(config.network.shutdown_grace());

        let manager = Arc::new(Self {
            local,
            codec,
            book: Arc::new(RwLock::new(book)),
            queue: Arc::new(OutboundQueue::new()),
            role: RwLock::new(PeerRole::Starting),
            election: Mutex::new(()),
            events,
            shutdown,
            config,
        });

        {
            let mut book = manager.book.write().await;
            // The chat server is rediscovered on every boot
            book.remove_address(CHAT_SERVER_KEY);
            book.replace(manager.local.clone());
            let (host, port) = (&manager.config.name_server.host, manager.config.name_server.port);
            book.replace(AddressRecord::plaintext(NAME_SERVER_NAME, host.as_str(), port));
        }

        let handler = Arc::new(PeerHandler {
            manager: Arc::clone(&manager),
            role: ListenerRole::Client,
        });
        manager.shutdown.spawn(
            ShutdownStage::ClientRole,
            "client listener",
            transport::serve(
                listener,
                handler,
                manager.config.network.clone(),
                manager.shutdown.token(ShutdownStage::ClientRole),
                "Client listener",
            ),
        );

        let worker = DeliveryWorker::new(
            Arc::clone(&manager.queue),
            Arc::clone(&manager.book),
            manager.codec.clone(),
            manager.config.network.clone(),
            DeliveryPolicy::from(&manager.config.delivery),
            Arc::new(EventObserver {
                events: manager.events.clone(),
            }),
        );
        manager.shutdown.spawn(
            ShutdownStage::ServerRole,
            "delivery worker",
            worker.run(manager.shutdown.token(ShutdownStage::ServerRole)),
        );

        let outcome = manager.join_network().await;
        log::info!("Bootstrap finished: {:?}", outcome);

        let refresh = Arc::clone(&manager);
        manager.shutdown.spawn(
            ShutdownStage::ServerRole,
            "address book refresh",
            refresh.refresh_loop(manager.shutdown.token(ShutdownStage::ServerRole)),
        );

        Ok(manager)
    }

    /// This peer's client-listener record
    pub fn local_record(&self) -> &AddressRecord {
        &self.local
    }

    /// Current role
    pub async fn role(&self) -> PeerRole {
        *self.role.read().await
    }

    /// The chat server this peer knows about
    pub async fn chat_server(&self) -> Option<AddressRecord> {
        self.book.read().await.get(CHAT_SERVER_KEY).cloned()
    }

    /// Copy of the address book
    pub async fn address_book(&self) -> AddressBookSnapshot {
        self.book.read().await.snapshot()
    }

    /// Insert or replace one record
    pub async fn add_address(&self, record: AddressRecord) {
        self.book.write().await.replace(record);
    }

    /// The outbound queue
    pub fn queue(&self) -> &Arc<OutboundQueue> {
        &self.queue
    }

    /// Queue a chat message for `target`, returning its id
    pub async fn send_message(&self, target: &str, text: &str) -> Uuid {
        let chat = ChatMessage::new(text);
        let id = chat.id;
        if !self.book.read().await.contains(target) {
            log::warn!("{} is not in the address book yet, queueing anyway", target);
        }
        self.queue.enqueue(Message::Chat(chat), target);
        id
    }

    /// Run bootstrap and, when following, register with the chat server
    pub async fn join_network(self: &Arc<Self>) -> BootstrapOutcome {
        let outcome = self.bootstrap().await;
        if let BootstrapOutcome::Following(server) = &outcome {
            match self.register().await {
                Ok(added) => log::info!(
                    "Registered with chat server at {} ({} new entries)",
                    server.socket_address(),
                    added
                ),
                Err(e) => log::warn!("Registration with chat server failed: {}", e),
            }
        }
        outcome
    }

    /// Determine the chat server, claiming the role if nobody holds it
    pub async fn bootstrap(self: &Arc<Self>) -> BootstrapOutcome {
        let _running = self.election.lock().await;
        match self.elect().await {
            Ok(outcome) => outcome,
            Err(e) => {
                if e.is_connection_fault() {
                    log::error!(
                        "Name server at {} is unreachable, continuing without a chat server: {}",
                        self.config.name_server.address(),
                        e
                    );
                } else {
                    log::error!("Election failed: {}", e);
                }
                self.set_role(PeerRole::Isolated).await;
                BootstrapOutcome::Isolated
            }
        }
    }

    async fn elect(self: &Arc<Self>) -> Result<BootstrapOutcome> {
        let attempts = self.config.election.max_attempts;

        for attempt in 1..=attempts {
            match self.query_current_server().await {
                Ok(Some(server)) => {
                    log::info!("Chat server exists at {}", server.socket_address());
                    self.follow(server.clone()).await;
                    return Ok(BootstrapOutcome::Following(server));
                }
                Ok(None) => log::info!("No chat server registered, requesting privileges"),
                Err(e) if e.is_connection_fault() => {
                    log::warn!("Name server unreachable during lookup: {}", e);
                }
                Err(e) => log::warn!("Invalid lookup reply from name server: {}", e),
            }

            match self.request_privileges().await {
                Ok(true) => match self.claim().await {
                    Ok(server) => return Ok(BootstrapOutcome::Elected(server)),
                    Err(e) => log::error!("Could not take the chat server role: {}", e),
                },
                Ok(false) => log::info!(
                    "Privileges rejected, another peer holds the role (attempt {}/{})",
                    attempt,
                    attempts
                ),
                Err(e) if e.is_connection_fault() => return Err(e),
                Err(e) => log::error!("Election attempt {} failed: {}", attempt, e),
            }

            if attempt < attempts {
                tokio::time::sleep(backoff(self.config.election.retry_backoff_ms, attempt)).await;
            }
        }

        Err(ElectionError::RetriesExhausted { attempts }.into())
    }

    async fn query_current_server(&self) -> Result<Option<AddressRecord>> {
        match self.ask_name_server(Message::RequestCurrentServer).await? {
            Message::ServerExists(server) => Ok(Some(server)),
            Message::NoChatServer | Message::ChatServerDead => Ok(None),
            other => Err(unexpected("server exists or no chat server", &other)),
        }
    }

    async fn request_privileges(&self) -> Result<bool> {
        let claim = AddressRecord::new(
            &self.config.peer.name,
            &self.config.peer.host,
            self.config.peer.chat_server_port,
            self.local.public_key(),
        );
        match self.ask_name_server(Message::RequestServerPrivileges(claim)).await? {
            Message::Accepted => Ok(true),
            Message::Rejected => Ok(false),
            other => Err(ElectionError::InvalidResponse {
                response: other.command().to_string(),
            }
            .into()),
        }
    }

    async fn claim(self: &Arc<Self>) -> Result<AddressRecord> {
        let peer = &self.config.peer;
        let listener = match transport::bind(&peer.host, peer.chat_server_port).await {
            Ok(listener) => listener,
            Err(e) => {
                // The name server stays locked to us until told otherwise
                self.release_role(Message::ServerTerminated).await;
                return Err(ElectionError::ListenerUnavailable {
                    reason: e.to_string(),
                }
                .into());
            }
        };
        let port = listener.local_addr()?.port();

        let server = AddressRecord::new(CHAT_SERVER_KEY, &peer.host, port, self.local.public_key());
        let handler = Arc::new(PeerHandler {
            manager: Arc::clone(self),
            role: ListenerRole::Server,
        });
        self.shutdown.spawn(
            ShutdownStage::ServerRole,
            "server listener",
            transport::serve(
                listener,
                handler,
                self.config.network.clone(),
                self.shutdown.token(ShutdownStage::ServerRole),
                "Server listener",
            ),
        );

        let established = Message::ServerEstablished(server.clone()).into_plain_envelope(self.codec.sender())?;
        if let Err(e) = transport::notify_once(
            &self.config.name_server.address(),
            &established,
            &self.config.network,
        )
        .await
        {
            log::error!("Failed to confirm the chat server role: {}", e);
        }

        self.book.write().await.replace(server.clone());
        self.set_role(PeerRole::ChatServer).await;
        log::info!("This peer is now the chat server at {}", server.socket_address());
        Ok(server)
    }

    async fn follow(&self, server: AddressRecord) {
        self.book.write().await.replace(server.renamed(CHAT_SERVER_KEY));
        self.set_role(PeerRole::Client).await;
    }

    /// Announce this peer to the chat server and merge the returned book
    pub async fn register(&self) -> Result<usize> {
        match self.ask_chat_server(Message::NewClient(self.local.clone())).await? {
            Message::AddressBookData(snapshot) => Ok(self.merge(snapshot).await),
            other => Err(unexpected("address book data", &other)),
        }
    }

    /// Exchange address books with the chat server
    pub async fn sync_address_book(&self) -> Result<usize> {
        let snapshot = self.book.read().await.snapshot();
        match self.ask_chat_server(Message::UpdateAddressBook(snapshot)).await? {
            Message::AddressBookData(merged) => Ok(self.merge(merged).await),
            other => Err(unexpected("address book data", &other)),
        }
    }

    async fn merge(&self, snapshot: AddressBookSnapshot) -> usize {
        let added = self.book.write().await.merge(snapshot);
        if added > 0 {
            self.emit(NetworkEvent::AddressBookUpdated { added });
        }
        added
    }

    async fn ask_name_server(&self, message: Message) -> Result<Message> {
        let envelope = message.into_plain_envelope(self.codec.sender())?;
        let reply = transport::request_once(
            &self.config.name_server.address(),
            &envelope,
            &self.config.network,
        )
        .await?;
        Message::from_plain_envelope(reply)
    }

    async fn ask_chat_server(&self, message: Message) -> Result<Message> {
        let server = self
            .chat_server()
            .await
            .ok_or_else(|| NetworkError::UnknownPeer {
                name: CHAT_SERVER_KEY.to_string(),
            })?;
        let envelope = self.codec.seal(&message, &server.public_key())?;
        let reply = transport::request_once(&server.socket_address(), &envelope, &self.config.network).await?;
        self.codec.open(reply)
    }

    /// Release the role at the name server unless another peer already holds it
    async fn release_role(&self, message: Message) {
        if self.succeeded_by_other().await {
            log::info!("Chat server role already passed to another peer, nothing to release");
        } else {
            match self.ask_name_server(message).await {
                Ok(Message::ChatServerDead) => log::info!("Name server released the chat server role"),
                Ok(Message::Rejected) => log::warn!("Name server refused the release, the role is not ours"),
                Ok(other) => log::warn!("Unexpected reply '{}' to role release", other.command()),
                Err(e) => log::error!("Failed to release the chat server role: {}", e),
            }
        }
        self.book.write().await.remove_address(CHAT_SERVER_KEY);
    }

    /// Whether the name server lists a chat server other than this peer
    async fn succeeded_by_other(&self) -> bool {
        let ours = self.chat_server().await;
        match self.query_current_server().await {
            Ok(Some(registered)) => !ours.is_some_and(|ours| {
                ours.same_endpoint(&registered) && ours.public_key() == registered.public_key()
            }),
            // Vacant or only locked: a release is either ours or harmless
            Ok(None) => false,
            Err(e) => {
                log::warn!("Could not check the registered chat server: {}", e);
                false
            }
        }
    }

    async fn refresh_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.peer.refresh_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // First tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.refresh() => {}
            }
        }
        log::debug!("Address book refresh stopped");
    }

    async fn refresh(self: &Arc<Self>) {
        match self.role().await {
            PeerRole::Client => match self.sync_address_book().await {
                Ok(added) => log::debug!("Address book refreshed, {} new entries", added),
                Err(e) if e.is_connection_fault() => {
                    log::warn!("Chat server unreachable: {}", e);
                    self.recover_chat_server().await;
                }
                Err(e) => log::warn!("Address book refresh failed: {}", e),
            },
            PeerRole::Isolated => {
                log::info!("Retrying bootstrap");
                self.join_network().await;
            }
            PeerRole::Starting | PeerRole::ChatServer | PeerRole::Stopped => {}
        }
    }

    /// Ask the name server to probe the chat server and re-elect if it is gone
    async fn recover_chat_server(self: &Arc<Self>) {
        match self.ask_name_server(Message::ChatServerTerminated).await {
            Ok(Message::ServerExists(server)) => {
                if self.chat_server().await.as_ref() == Some(&server) {
                    log::info!("Name server reports the chat server alive");
                } else {
                    log::info!("Chat server moved to {}", server.socket_address());
                    self.follow(server).await;
                    if let Err(e) = self.register().await {
                        log::warn!("Registration with new chat server failed: {}", e);
                    }
                }
            }
            Ok(Message::ChatServerDead | Message::NoChatServer) => {
                log::warn!("Chat server is gone, re-running election");
                self.book.write().await.remove_address(CHAT_SERVER_KEY);
                self.join_network().await;
            }
            Ok(other) => log::warn!("Unexpected probe reply '{}'", other.command()),
            Err(e) => log::warn!("Name server unreachable for probe: {}", e),
        }
    }

    /// Stop every task in order and release the chat server role if held
    pub async fn shutdown(&self) -> bool {
        if self.role().await == PeerRole::Stopped {
            return true;
        }
        log::info!("Shutting down network manager");

        let clean = self.shutdown.shutdown().await;
        if self.role().await == PeerRole::ChatServer {
            self.release_role(Message::ChatServerShutdown).await;
        }
        self.set_role(PeerRole::Stopped).await;
        clean
    }

    async fn set_role(&self, role: PeerRole) {
        let mut current = self.role.write().await;
        if *current != role {
            log::debug!("Role {:?} -> {:?}", *current, role);
            *current = role;
            self.emit(NetworkEvent::RoleChanged(role));
        }
    }

    fn emit(&self, event: NetworkEvent) {
        if self.events.send(event).is_err() {
            log::trace!("Event receiver dropped");
        }
    }

    async fn handle_message(&self, message: Message, sender: &str, listener: ListenerRole) -> Option<Message> {
        match message {
            Message::Chat(chat) => {
                log::info!("Message from {}", sender);
                self.emit(NetworkEvent::MessageReceived {
                    from: sender.to_string(),
                    message: chat,
                });
                Some(Message::MessageSent)
            }
            Message::NewClient(record) => {
                if record.name == CHAT_SERVER_KEY || record.name == NAME_SERVER_NAME {
                    log::warn!("{} tried to register reserved name '{}'", sender, record.name);
                    return None;
                }
                // The role may have changed while this connection was open
                if listener == ListenerRole::Server && self.role().await != PeerRole::ChatServer {
                    log::warn!("Ignoring registration from {}, no longer the chat server", sender);
                    return None;
                }

                self.book.write().await.replace(record.clone());
                self.emit(NetworkEvent::PeerJoined(record));
                match listener {
                    ListenerRole::Server => Some(Message::AddressBookData(self.address_book().await)),
                    ListenerRole::Client => None,
                }
            }
            Message::UpdateAddressBook(snapshot) => {
                self.merge(snapshot).await;
                Some(Message::AddressBookData(self.address_book().await))
            }
            Message::Ping => Some(Message::Pong),
            other => {
                log::warn!("Unexpected '{}' from {}", other.command(), sender);
                None
            }
        }
    }

    /// Seal a reply for `sender`, in plaintext when the sender is unknown
    async fn seal_reply(&self, reply: &Message, sender: &str) -> Result<Envelope> {
        let key = self
            .book
            .read()
            .await
            .get(sender)
            .map(AddressRecord::public_key)
            .unwrap_or(crate::crypto::PublicKey::PLAINTEXT);
        self.codec.seal(reply, &key)
    }
}

struct PeerHandler {
    manager: Arc<NetworkManager>,
    role: ListenerRole,
}

impl FrameHandler for PeerHandler {
    async fn handle(&self, envelope: Envelope, peer: SocketAddr) -> Option<Envelope> {
        let sender = if envelope.sender.is_empty() {
            peer.to_string()
        } else {
            envelope.sender.clone()
        };

        let message = match self.manager.codec.open(envelope) {
            Ok(message) => message,
            Err(e) => {
                log::warn!("Dropping frame from {} ({}): {}", sender, peer, e);
                return None;
            }
        };
        log::debug!("{:?} listener received '{}' from {}", self.role, message.command(), sender);

        let reply = self.manager.handle_message(message, &sender, self.role).await?;
        match self.manager.seal_reply(&reply, &sender).await {
            Ok(envelope) => Some(envelope),
            Err(e) => {
                log::error!("Failed to seal reply for {}: {}", sender, e);
                None
            }
        }
    }
}

fn unexpected(expected: &str, actual: &Message) -> ChatError {
    ProtocolError::UnexpectedReply {
        expected: expected.to_string(),
        actual: actual.command().to_string(),
    }
    .into()
}

/// Linear backoff plus up to one base step of jitter
fn backoff(base_ms: u64, attempt: u32) -> Duration {
    let jitter = rand::thread_rng().gen_range(0..=base_ms);
    Duration::from_millis(base_ms.saturating_mul(u64::from(attempt)) + jitter)
}
