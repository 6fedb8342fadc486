use std::sync::Arc;

use haggle_domain::chat::ChatService;
use haggle_domain::ports::listings::ListingDirectory;
use haggle_infra::config::AppConfig;
use haggle_infra::listings::build_listing_directory;
use haggle_infra::realtime::{Broadcaster, PresenceRegistry, RoomDirectory};
use haggle_infra::repositories::InMemoryConversationRepository;

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub chat: ChatService,
    pub presence: PresenceRegistry,
    pub rooms: RoomDirectory,
    pub broadcaster: Broadcaster,
}

impl AppState {
    pub fn new(config: AppConfig) -> anyhow::Result<Self> {
        let listings = build_listing_directory(&config)?;
        Ok(Self::with_listing_directory(config, listings))
    }

    pub fn with_listing_directory(config: AppConfig, listings: Arc<dyn ListingDirectory>) -> Self {
        let presence = PresenceRegistry::new();
        let rooms = RoomDirectory::new();
        let broadcaster = Broadcaster::new(presence.clone(), rooms.clone());
        let chat = ChatService::new(
            Arc::new(InMemoryConversationRepository::new()),
            listings,
            Arc::new(broadcaster.clone()),
        );
        Self {
            config,
            chat,
            presence,
            rooms,
            broadcaster,
        }
    }
}
