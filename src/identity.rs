use crate::models::{CurrentUser, UserRole};
use tokio::sync::watch;
use uuid::Uuid;

/// Opaque source of "who is using the app right now".
pub trait IdentityProvider: Send + Sync {
    fn current_user(&self) -> Option<CurrentUser>;

    /// Fires whenever the user signs in or out.
    fn on_auth_change(&self) -> watch::Receiver<Option<CurrentUser>>;
}

/// In-process identity used by the terminal front end and tests.
pub struct LocalIdentity {
    tx: watch::Sender<Option<CurrentUser>>,
}

impl Default for LocalIdentity {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalIdentity {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    pub fn sign_in(&self, role: UserRole, access_token: Option<String>) -> CurrentUser {
        let user = CurrentUser {
            id: Uuid::new_v4(),
            role,
            access_token,
        };
        log::info!("Signed in as {:?} ({})", role, user.id);
        self.tx.send_replace(Some(user.clone()));
        user
    }

    pub fn sign_out(&self) {
        if self.tx.send_replace(None).is_some() {
            log::info!("Signed out");
        }
    }
}

impl IdentityProvider for LocalIdentity {
    fn current_user(&self) -> Option<CurrentUser> {
        self.tx.borrow().clone()
    }

    fn on_auth_change(&self) -> watch::Receiver<Option<CurrentUser>> {
        self.tx.subscribe()
    }
}
