use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose, Engine as _};
use sha2::{Digest, Sha256};

use crate::{NameKey, Photo, RemoteRecord, SyncError};

/// Reads a local image referenced by the photo map. `None` means the file is
/// missing or unreadable, which is not an error.
pub trait PhotoLoader {
    fn load(&self, path: &Path) -> Option<Vec<u8>>;
}

/// Remote avatar lookup keyed by [`avatar_key`].
pub trait AvatarSource {
    /// Returns base64 image data, or `None` when the service has no avatar.
    ///
    /// # Errors
    /// Returns [`SyncError::Transport`] for failures other than "not found".
    fn lookup(&self, key: &str) -> Result<Option<String>, SyncError>;
}

/// Name key to local image path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PhotoMap {
    entries: BTreeMap<NameKey, PathBuf>,
}

impl PhotoMap {
    /// Build from raw `name -> path` pairs; blank paths are skipped.
    #[must_use]
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<PathBuf>,
    {
        let mut entries = BTreeMap::new();
        for (name, path) in pairs {
            let path = path.into();
            if path.as_os_str().is_empty() {
                continue;
            }
            entries.insert(NameKey::of(name.as_ref()), path);
        }
        Self { entries }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Path> {
        self.entries.get(&NameKey::of(name)).map(PathBuf::as_path)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Hex SHA-256 of the lowercase, trimmed email.
#[must_use]
pub fn avatar_key(email: &str) -> String {
    let digest = Sha256::digest(email.trim().to_lowercase().as_bytes());
    hex::encode(digest)
}

/// Decides whether and which photo to attach to a record.
pub struct PhotoPolicy<'a> {
    photo_map: &'a PhotoMap,
    loader: &'a dyn PhotoLoader,
    avatars: Option<&'a dyn AvatarSource>,
    force: bool,
}

impl<'a> PhotoPolicy<'a> {
    #[must_use]
    pub fn new(photo_map: &'a PhotoMap, loader: &'a dyn PhotoLoader) -> Self {
        Self { photo_map, loader, avatars: None, force: false }
    }

    /// Enable the remote avatar fallback.
    #[must_use]
    pub fn with_avatars(mut self, avatars: &'a dyn AvatarSource) -> Self {
        self.avatars = Some(avatars);
        self
    }

    #[must_use]
    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Attach a photo when the record lacks one (or `force` is set). Returns
    /// whether the record changed. An avatar transport failure leaves the
    /// record untouched and is returned to the caller.
    ///
    /// # Errors
    /// Returns [`SyncError::Transport`] from the avatar source.
    pub fn assign(
        &self,
        record: &mut RemoteRecord,
        name: &str,
        emails: &[String],
    ) -> Result<bool, SyncError> {
        if record.has_photo() && !self.force {
            return Ok(false);
        }

        if let Some(path) = self.photo_map.get(name) {
            if let Some(bytes) = self.loader.load(path) {
                record.photo = Some(Photo::jpeg_base64(general_purpose::STANDARD.encode(bytes)));
                return Ok(true);
            }
            tracing::debug!("photo for {} not readable at {}", name, path.display());
        }

        let Some(avatars) = self.avatars else {
            return Ok(false);
        };
        let Some(first_email) = emails.iter().find(|email| !email.trim().is_empty()) else {
            return Ok(false);
        };
        match avatars.lookup(&avatar_key(first_email))? {
            Some(data) if !data.is_empty() => {
                record.photo = Some(Photo::jpeg_base64(data));
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
