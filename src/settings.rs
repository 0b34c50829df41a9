use crate::access::Capability;
use crate::models::CurrentUser;
use crate::storage::ChatStore;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::watch;

const SETTINGS_KEY: &str = "platform_settings";

/// Platform-wide AI switches. Everything defaults to enabled.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PlatformSettings {
    pub global_ai_enabled: bool,
    pub mentor_chat_enabled: bool,
    pub group_chat_ai_enabled: bool,
    pub notes_ai_enabled: bool,
    pub tools_ai_enabled: bool,
    pub ai_for_students: bool,
    pub ai_for_teachers: bool,
    pub ai_for_free_plan: bool,
}

impl Default for PlatformSettings {
    fn default() -> Self {
        Self {
            global_ai_enabled: true,
            mentor_chat_enabled: true,
            group_chat_ai_enabled: true,
            notes_ai_enabled: true,
            tools_ai_enabled: true,
            ai_for_students: true,
            ai_for_teachers: true,
            ai_for_free_plan: true,
        }
    }
}

impl PlatformSettings {
    pub fn capability_enabled(&self, capability: Capability) -> bool {
        match capability {
            Capability::MentorChat => self.mentor_chat_enabled,
            Capability::GroupChatAi => self.group_chat_ai_enabled,
            Capability::Notes => self.notes_ai_enabled,
            Capability::Tools => self.tools_ai_enabled,
        }
    }

    fn field_mut(&mut self, key: &str) -> Option<&mut bool> {
        let field = match key {
            "globalAiEnabled" => &mut self.global_ai_enabled,
            "mentorChatEnabled" => &mut self.mentor_chat_enabled,
            "groupChatAiEnabled" => &mut self.group_chat_ai_enabled,
            "notesAiEnabled" => &mut self.notes_ai_enabled,
            "toolsAiEnabled" => &mut self.tools_ai_enabled,
            "aiForStudents" => &mut self.ai_for_students,
            "aiForTeachers" => &mut self.ai_for_teachers,
            "aiForFreePlan" => &mut self.ai_for_free_plan,
            _ => return None,
        };
        Some(field)
    }

    /// Overlays a loosely shaped JSON object onto these settings.
    ///
    /// Unknown keys are ignored and values that are not booleans are skipped
    /// with a warning, so a partially broken blob never resets good values.
    pub fn merged_with(&self, patch: &Value) -> Self {
        let mut merged = self.clone();
        let Some(object) = patch.as_object() else {
            log::warn!("Ignoring settings patch that is not a JSON object: {}", patch);
            return merged;
        };

        for (key, value) in object {
            match (merged.field_mut(key), value.as_bool()) {
                (Some(field), Some(flag)) => *field = flag,
                (Some(_), None) => {
                    log::warn!("Ignoring non-boolean value for setting '{}': {}", key, value)
                }
                (None, _) => log::debug!("Ignoring unknown setting '{}'", key),
            }
        }
        merged
    }
}

/// Single source of truth for the settings snapshot, with change notification.
#[derive(Clone)]
pub struct SettingsStore {
    tx: Arc<watch::Sender<PlatformSettings>>,
}

impl Default for SettingsStore {
    fn default() -> Self {
        Self::new(PlatformSettings::default())
    }
}

impl SettingsStore {
    pub fn new(initial: PlatformSettings) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    pub fn snapshot(&self) -> PlatformSettings {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PlatformSettings> {
        self.tx.subscribe()
    }

    /// Publishes a new snapshot; subscribers are only woken on actual change.
    pub fn replace(&self, settings: PlatformSettings) {
        self.tx.send_if_modified(|current| {
            if *current == settings {
                false
            } else {
                *current = settings;
                true
            }
        });
    }

    /// Refreshes the snapshot from storage, merging the stored blob over defaults.
    pub async fn load(&self, store: &dyn ChatStore) -> Result<PlatformSettings> {
        let stored = store
            .get_setting(SETTINGS_KEY)
            .await
            .context("Failed to read platform settings")?;

        let settings = match stored {
            Some(raw) => match serde_json::from_str::<Value>(&raw) {
                Ok(blob) => PlatformSettings::default().merged_with(&blob),
                Err(e) => {
                    log::error!("Stored platform settings are not valid JSON, using defaults: {}", e);
                    PlatformSettings::default()
                }
            },
            None => PlatformSettings::default(),
        };

        log::info!("Loaded platform settings: {:?}", settings);
        self.replace(settings.clone());
        Ok(settings)
    }

    /// Applies an admin toggle and persists the result.
    pub async fn update_as(
        &self,
        caller: Option<&CurrentUser>,
        patch: &Value,
        store: &dyn ChatStore,
    ) -> Result<PlatformSettings> {
        let Some(user) = caller.filter(|u| u.role.is_privileged()) else {
            log::warn!("Rejected settings update from non-admin caller");
            return Err(anyhow::anyhow!("Only admins can change platform settings"));
        };

        let updated = self.snapshot().merged_with(patch);
        let raw = serde_json::to_string(&updated).context("Failed to serialize platform settings")?;
        store
            .put_setting(SETTINGS_KEY, &raw)
            .await
            .context("Failed to save platform settings")?;

        log::info!("User {} updated platform settings", user.id);
        self.replace(updated.clone());
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::UserRole;
    use crate::storage::StorageManager;
    use serde_json::json;
    use uuid::Uuid;

    fn user(role: UserRole) -> CurrentUser {
        CurrentUser {
            id: Uuid::new_v4(),
            role,
            access_token: None,
        }
    }

    #[test]
    fn merge_overrides_known_keys_only() {
        let merged = PlatformSettings::default().merged_with(&json!({
            "globalAiEnabled": false,
            "aiForFreePlan": "no",
            "somethingElse": true,
        }));
        assert!(!merged.global_ai_enabled);
        assert!(merged.ai_for_free_plan);
        assert!(merged.mentor_chat_enabled);
    }

    #[test]
    fn merge_ignores_non_objects() {
        let base = PlatformSettings {
            notes_ai_enabled: false,
            ..PlatformSettings::default()
        };
        assert_eq!(base.merged_with(&json!([1, 2, 3])), base);
    }

    #[tokio::test]
    async fn subscribers_see_replacements() {
        let store = SettingsStore::default();
        let mut rx = store.subscribe();
        store.replace(PlatformSettings {
            tools_ai_enabled: false,
            ..PlatformSettings::default()
        });
        rx.changed().await.unwrap();
        assert!(!rx.borrow().tools_ai_enabled);
    }

    #[tokio::test]
    async fn admin_update_is_persisted_and_reloaded() {
        let db = StorageManager::in_memory().await.unwrap();
        let settings = SettingsStore::default();

        let err = settings
            .update_as(Some(&user(UserRole::Teacher)), &json!({"aiForStudents": false}), &db)
            .await;
        assert!(err.is_err());
        assert!(settings.snapshot().ai_for_students);

        settings
            .update_as(Some(&user(UserRole::Founder)), &json!({"aiForStudents": false}), &db)
            .await
            .unwrap();
        assert!(!settings.snapshot().ai_for_students);

        let fresh = SettingsStore::default();
        let loaded = fresh.load(&db).await.unwrap();
        assert!(!loaded.ai_for_students);
        assert!(loaded.global_ai_enabled);
    }
}
