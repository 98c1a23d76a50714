use std::fmt::{Debug, Formatter};
use std::path::PathBuf;
use std::time::Duration;

use contact_sync_store_carddav::{CardDavSettings, DEFAULT_TIMEOUT};

pub const DEFAULT_BUCKETS_ROOT: &str = "./buckets";
pub const DEFAULT_PHOTO_MAP: &str = "photo-map.json";
pub const DEFAULT_SYNCED_TABLE: &str = "all-contacts-synced.md";

/// Everything a command needs from the environment, resolved once at startup.
#[derive(Clone, PartialEq, Eq)]
pub struct ContactSyncConfig {
    pub base_url: String,
    pub collection: String,
    pub user: String,
    pub pass: String,
    pub buckets_root: PathBuf,
    pub photo_map: PathBuf,
    pub gravatar: bool,
    pub synced_table: PathBuf,
    pub timeout: Duration,
}

impl Default for ContactSyncConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            collection: String::new(),
            user: String::new(),
            pass: String::new(),
            buckets_root: PathBuf::from(DEFAULT_BUCKETS_ROOT),
            photo_map: PathBuf::from(DEFAULT_PHOTO_MAP),
            gravatar: false,
            synced_table: PathBuf::from(DEFAULT_SYNCED_TABLE),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl Debug for ContactSyncConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContactSyncConfig")
            .field("base_url", &self.base_url)
            .field("collection", &self.collection)
            .field("user", &self.user)
            .field("pass", &"<redacted>")
            .field("buckets_root", &self.buckets_root)
            .field("photo_map", &self.photo_map)
            .field("gravatar", &self.gravatar)
            .field("synced_table", &self.synced_table)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl ContactSyncConfig {
    /// Load `.env` from the working directory (existing variables win), then
    /// read the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Resolve configuration through an arbitrary key lookup. Blank values
    /// count as unset.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).map(|value| value.trim().to_string());
        let set = |key: &str| get(key).filter(|value| !value.is_empty());
        let defaults = Self::default();

        Self {
            base_url: set("CARDDAV_BASE_URL").unwrap_or_default(),
            collection: set("CARDDAV_COLLECTION").unwrap_or_default(),
            user: set("CARDDAV_USER").unwrap_or_default(),
            pass: lookup("CARDDAV_PASS").unwrap_or_default(),
            buckets_root: set("CONTACT_BUCKETS").map_or(defaults.buckets_root, PathBuf::from),
            photo_map: set("PHOTO_MAP").map_or(defaults.photo_map, PathBuf::from),
            gravatar: set("ENABLE_GRAVATAR").is_some_and(|value| value != "0"),
            synced_table: set("SYNCED_TABLE").map_or(defaults.synced_table, PathBuf::from),
            timeout: set("CARDDAV_TIMEOUT_SECS")
                .and_then(|value| value.parse::<u64>().ok())
                .filter(|secs| *secs > 0)
                .map_or(defaults.timeout, Duration::from_secs),
        }
    }

    #[must_use]
    pub fn carddav_settings(&self) -> CardDavSettings {
        CardDavSettings {
            base_url: self.base_url.clone(),
            collection: self.collection.clone(),
            user: self.user.clone(),
            pass: self.pass.clone(),
            timeout: self.timeout,
        }
    }
}
