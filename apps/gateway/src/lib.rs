pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod gateway;
pub mod models;
pub mod routes;
pub mod store;

use std::sync::Arc;

use auth::tokens::TokenValidator;
use config::Config;
use gateway::bus::{BroadcastBus, LocalBus};
use gateway::presence::PresenceTracker;
use gateway::registry::SessionRegistry;
use store::{MessageStore, RoomDirectory, UserDirectory};

/// Shared application state available to all route handlers and sessions.
#[derive(Clone)]
pub struct AppState {
    pub rooms: Arc<dyn RoomDirectory>,
    pub messages: Arc<dyn MessageStore>,
    pub tokens: Arc<TokenValidator>,
    pub bus: Arc<dyn BroadcastBus>,
    pub presence: Arc<PresenceTracker>,
    pub sessions: Arc<SessionRegistry>,
    pub config: Arc<Config>,
}

impl AppState {
    /// Wire the gateway around one store that serves every collaborator
    /// role, with an in-process bus.
    pub fn new<S>(config: Config, store: Arc<S>) -> Self
    where
        S: UserDirectory + RoomDirectory + MessageStore + 'static,
    {
        let bus: Arc<dyn BroadcastBus> = Arc::new(LocalBus::new(config.subscriber_buffer));
        Self::with_bus(config, store, bus)
    }

    pub fn with_bus<S>(config: Config, store: Arc<S>, bus: Arc<dyn BroadcastBus>) -> Self
    where
        S: UserDirectory + RoomDirectory + MessageStore + 'static,
    {
        let users: Arc<dyn UserDirectory> = store.clone();
        let rooms: Arc<dyn RoomDirectory> = store.clone();
        let messages: Arc<dyn MessageStore> = store;
        let tokens = Arc::new(TokenValidator::new(&config.jwt_secret, users));

        Self {
            rooms,
            messages,
            tokens,
            bus,
            presence: Arc::new(PresenceTracker::new()),
            sessions: Arc::new(SessionRegistry::new()),
            config: Arc::new(config),
        }
    }
}
