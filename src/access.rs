//! Client-side gate deciding whether an AI capability may be invoked.
//!
//! This mirrors the platform switches for a nicer UX; the datastore's own
//! access rules are the real enforcement.

use crate::models::UserRole;
use crate::settings::PlatformSettings;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::watch;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    MentorChat,
    GroupChatAi,
    Notes,
    Tools,
}

impl Capability {
    pub const ALL: [Capability; 4] = [
        Capability::MentorChat,
        Capability::GroupChatAi,
        Capability::Notes,
        Capability::Tools,
    ];
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Capability::MentorChat => "mentor chat",
            Capability::GroupChatAi => "group chat",
            Capability::Notes => "notes",
            Capability::Tools => "tools",
        };
        f.write_str(name)
    }
}

/// Pure policy: `caller` is `None` for visitors without an account.
pub fn is_allowed(settings: &PlatformSettings, capability: Capability, caller: Option<UserRole>) -> bool {
    let privileged = caller.is_some_and(|role| role.is_privileged());

    if !settings.global_ai_enabled || !settings.capability_enabled(capability) {
        return privileged;
    }

    match caller {
        Some(UserRole::Admin) | Some(UserRole::Founder) => true,
        Some(UserRole::Teacher) => settings.ai_for_teachers,
        Some(UserRole::Student) => settings.ai_for_students,
        None => settings.ai_for_free_plan,
    }
}

/// Guests have no role, so only the conjunction of switches applies.
pub fn guest_chat_allowed(settings: &PlatformSettings) -> bool {
    settings.global_ai_enabled && settings.mentor_chat_enabled && settings.ai_for_free_plan
}

/// Reactive view over the live settings snapshot.
#[derive(Clone, Debug)]
pub struct AccessGate {
    settings: watch::Receiver<PlatformSettings>,
}

impl AccessGate {
    pub fn new(settings: watch::Receiver<PlatformSettings>) -> Self {
        Self { settings }
    }

    pub fn allows(&self, capability: Capability, caller: Option<UserRole>) -> bool {
        is_allowed(&self.settings.borrow(), capability, caller)
    }

    pub fn guest_allowed(&self) -> bool {
        guest_chat_allowed(&self.settings.borrow())
    }

    pub fn can_use_mentor_chat(&self, caller: Option<UserRole>) -> bool {
        self.allows(Capability::MentorChat, caller)
    }

    pub fn can_use_group_chat_ai(&self, caller: Option<UserRole>) -> bool {
        self.allows(Capability::GroupChatAi, caller)
    }

    pub fn can_use_notes(&self, caller: Option<UserRole>) -> bool {
        self.allows(Capability::Notes, caller)
    }

    pub fn can_use_tools(&self, caller: Option<UserRole>) -> bool {
        self.allows(Capability::Tools, caller)
    }
}
