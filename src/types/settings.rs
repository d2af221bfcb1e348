//! Per-user reminder settings as seen by the scheduler and the settings cache.

use serde::{Deserialize, Serialize};

/// The reminder settings captured when the scheduler scanned a user.
///
/// Times are local clock times (`HH:MM:SS`) in `timezone`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingsSnapshot {
    pub remind_at: String,
    pub deadline: String,
    pub grace_until: String,
    pub timezone: String,
}

/// The latest known reminder settings for a user.
///
/// Written by the settings-update flow on every change; `updated_at` is the
/// epoch second of that change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSettingsCacheEntry {
    pub daily_check_in_enabled: bool,
    pub remind_at: String,
    pub deadline: String,
    pub grace_until: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    pub updated_at: i64,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

impl UserSettingsCacheEntry {
    /// The settings as a fresh scan would have captured them.
    pub fn to_snapshot(&self) -> SettingsSnapshot {
        SettingsSnapshot {
            remind_at: self.remind_at.clone(),
            deadline: self.deadline.clone(),
            grace_until: self.grace_until.clone(),
            timezone: self.timezone.clone(),
        }
    }
}
