use crate::access::AccessGate;
use crate::api::ModelProxy;
use crate::blob::{BlobStore, LocalBlobStore};
use crate::config::AppConfig;
use crate::engine::{ChatEngine, SessionKind};
use crate::identity::{IdentityProvider, LocalIdentity};
use crate::models::{ChatMode, CurrentUser};
use crate::persistence::SessionPersistence;
use crate::quota::{GuestQuotaTracker, LocalStore};
use crate::settings::SettingsStore;
use crate::storage::ChatStore;
use std::sync::Arc;

// Shared collaborators every chat view is built from
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub storage: Arc<dyn ChatStore>,
    pub api_provider: Arc<dyn ModelProxy>,
    pub blob_store: Arc<dyn BlobStore>,
    pub settings: SettingsStore,
    pub identity: Arc<LocalIdentity>,
    // Browser-local storage stand-in shared by all views
    pub local_store: Arc<dyn LocalStore>,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        storage: Arc<dyn ChatStore>,
        api_provider: Arc<dyn ModelProxy>,
        local_store: Arc<dyn LocalStore>,
    ) -> Self {
        let blob_store: Arc<dyn BlobStore> = Arc::new(LocalBlobStore::new(config.upload_dir.clone()));
        Self {
            config: Arc::new(config),
            storage,
            api_provider,
            blob_store,
            settings: SettingsStore::default(),
            identity: Arc::new(LocalIdentity::new()),
            local_store,
        }
    }

    pub fn access_gate(&self) -> AccessGate {
        AccessGate::new(self.settings.subscribe())
    }

    pub fn current_user(&self) -> Option<CurrentUser> {
        self.identity.current_user()
    }

    /// Opens a chat view for whoever is signed in right now (or a guest).
    pub fn open_chat(&self, mode: ChatMode) -> ChatEngine {
        let kind = match self.current_user() {
            Some(user) => {
                let persistence = Arc::new(SessionPersistence::new(self.storage.clone(), user.id));
                SessionKind::Authenticated { user, persistence }
            }
            None => SessionKind::Guest(GuestQuotaTracker::new(self.local_store.clone())),
        };

        ChatEngine::new(
            self.config.chat_context(mode),
            kind,
            self.api_provider.clone(),
            self.access_gate(),
        )
    }
}
