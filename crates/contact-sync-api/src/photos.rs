use std::collections::BTreeMap;
use std::io::Read as _;
use std::path::Path;
use std::time::Duration;

use base64::{engine::general_purpose, Engine as _};
use contact_sync_core::{AvatarSource, PhotoLoader, PhotoMap, SyncError};

pub const GRAVATAR_BASE_URL: &str = "https://www.gravatar.com";
const MAX_AVATAR_BYTES: u64 = 2 * 1024 * 1024;

/// Reads photo-map images straight from disk.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsPhotoLoader;

impl PhotoLoader for FsPhotoLoader {
    fn load(&self, path: &Path) -> Option<Vec<u8>> {
        match std::fs::read(path) {
            Ok(bytes) => Some(bytes),
            Err(err) => {
                tracing::debug!("photo {} unavailable: {err}", path.display());
                None
            }
        }
    }
}

/// Load a JSON object of `name -> image path`. A missing or malformed file
/// yields an empty map.
#[must_use]
pub fn load_photo_map(path: &Path) -> PhotoMap {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) => {
            tracing::debug!("photo map {} not loaded: {err}", path.display());
            return PhotoMap::default();
        }
    };
    match serde_json::from_str::<BTreeMap<String, String>>(&text) {
        Ok(pairs) => PhotoMap::from_pairs(pairs),
        Err(err) => {
            let path = path.display();
            tracing::debug!("photo map {path} is not a JSON object of strings: {err}");
            PhotoMap::default()
        }
    }
}

/// Gravatar lookups; `d=404` makes the service answer 404 instead of a
/// generated placeholder.
pub struct GravatarClient {
    agent: ureq::Agent,
    base_url: String,
}

impl GravatarClient {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self::with_base_url(GRAVATAR_BASE_URL, timeout)
    }

    #[must_use]
    pub fn with_base_url(base_url: &str, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(timeout)
            .timeout_read(timeout)
            .timeout_write(timeout)
            .build();
        Self { agent, base_url: base_url.trim_end_matches('/').to_string() }
    }

    #[must_use]
    pub fn avatar_url(&self, key: &str) -> String {
        format!("{}/avatar/{key}?d=404&s=256", self.base_url)
    }
}

impl AvatarSource for GravatarClient {
    fn lookup(&self, key: &str) -> Result<Option<String>, SyncError> {
        let response = match self.agent.get(&self.avatar_url(key)).call() {
            Ok(response) => response,
            Err(ureq::Error::Status(404, _)) => return Ok(None),
            Err(ureq::Error::Status(code, _)) => {
                return Err(SyncError::Transport(format!("avatar status {code}")));
            }
            Err(ureq::Error::Transport(transport)) => {
                return Err(SyncError::Transport(format!("avatar lookup: {transport}")));
            }
        };

        let mut bytes = Vec::new();
        response
            .into_reader()
            .take(MAX_AVATAR_BYTES)
            .read_to_end(&mut bytes)
            .map_err(|err| SyncError::Transport(format!("avatar body: {err}")))?;
        if bytes.is_empty() {
            return Ok(None);
        }
        Ok(Some(general_purpose::STANDARD.encode(bytes)))
    }
}
