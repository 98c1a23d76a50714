use std::fmt::{Debug, Formatter};
use std::time::Duration;

use base64::{engine::general_purpose, Engine as _};
use contact_sync_core::{ContactStore, RecordRef, RemoteRecord, SyncError};
use quick_xml::events::Event;
use quick_xml::reader::Reader;
use ulid::Ulid;

pub mod vcard;

pub use vcard::{decode, decode_all, encode, encode_all};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

const PROPFIND_BODY: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<d:propfind xmlns:d="DAV:">
  <d:prop><d:getetag/><d:resourcetype/></d:prop>
</d:propfind>"#;

#[derive(Clone, PartialEq, Eq)]
pub struct CardDavSettings {
    pub base_url: String,
    /// Collection path below the base URL; may be empty.
    pub collection: String,
    pub user: String,
    pub pass: String,
    pub timeout: Duration,
}

impl Debug for CardDavSettings {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CardDavSettings")
            .field("base_url", &self.base_url)
            .field("collection", &self.collection)
            .field("user", &self.user)
            .field("pass", &"<redacted>")
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Contact store backed by one CardDAV address-book collection.
pub struct CardDavClient {
    agent: ureq::Agent,
    base: String,
    collection: String,
    authorization: String,
}

impl CardDavClient {
    /// # Errors
    /// Returns [`SyncError::Validation`] when the base URL or the credentials
    /// are missing.
    pub fn new(settings: &CardDavSettings) -> Result<Self, SyncError> {
        if settings.base_url.trim().is_empty() {
            return Err(SyncError::Validation("CardDAV base URL is required".to_string()));
        }
        if settings.user.is_empty() || settings.pass.is_empty() {
            return Err(SyncError::Validation(
                "CardDAV user and password are required".to_string(),
            ));
        }

        let agent = ureq::AgentBuilder::new()
            .timeout_connect(settings.timeout)
            .timeout_read(settings.timeout)
            .timeout_write(settings.timeout)
            .build();
        let credentials = format!("{}:{}", settings.user, settings.pass);
        Ok(Self {
            agent,
            base: format!("{}/", settings.base_url.trim().trim_end_matches('/')),
            collection: settings.collection.trim().trim_matches('/').to_string(),
            authorization: format!("Basic {}", general_purpose::STANDARD.encode(credentials)),
        })
    }

    #[must_use]
    pub fn collection_url(&self) -> String {
        collection_url(&self.base, &self.collection)
    }

    fn url_for(&self, href: &str) -> String {
        resolve_href(&self.base, href)
    }
}

fn collection_url(base: &str, collection: &str) -> String {
    if collection.is_empty() {
        base.to_string()
    } else {
        format!("{base}{collection}/")
    }
}

/// Absolute hrefs pass through; server-relative ones are joined to `base`.
#[must_use]
pub fn resolve_href(base: &str, href: &str) -> String {
    if href.starts_with("http://") || href.starts_with("https://") {
        href.to_string()
    } else {
        format!("{base}{}", href.trim_start_matches('/'))
    }
}

/// Token usable in `If-Match`. Weak tags never satisfy the strong comparison
/// `If-Match` requires, so they are treated as absent.
fn strong_etag(etag: &str) -> Option<String> {
    let etag = etag.trim();
    if etag.starts_with("W/") {
        return None;
    }
    Some(etag.trim_matches('"').to_string()).filter(|etag| !etag.is_empty())
}

fn map_error(action: &str, href: &str, err: ureq::Error) -> SyncError {
    match err {
        ureq::Error::Status(412, _) => SyncError::Conflict {
            reference: href.to_string(),
            message: format!("{action} precondition failed"),
        },
        ureq::Error::Status(code, response) => {
            let body = response.into_string().unwrap_or_default();
            SyncError::Transport(format!("{action} status {code}: {}", body.trim()))
        }
        ureq::Error::Transport(transport) => {
            SyncError::Transport(format!("{action} {href}: {transport}"))
        }
    }
}

/// Extract card references from a `PROPFIND` multistatus body. Collection
/// entries and non-`.vcf` resources are skipped.
///
/// # Errors
/// Returns [`SyncError::Decode`] when the body is not well-formed XML.
pub fn parse_multistatus(xml: &str) -> Result<Vec<RecordRef>, SyncError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut references = Vec::new();
    let mut current_element = String::new();
    let mut href = String::new();
    let mut etag = String::new();

    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                current_element = String::from_utf8_lossy(e.local_name().into_inner()).to_string();
                if current_element == "response" {
                    href.clear();
                    etag.clear();
                }
            }
            Ok(Event::Text(ref e)) => {
                let text = e.unescape().unwrap_or_default().to_string();
                match current_element.as_str() {
                    "href" => href.push_str(&text),
                    "getetag" => etag.push_str(&text),
                    _ => {}
                }
            }
            Ok(Event::End(ref e)) => {
                if e.local_name().into_inner() == b"response" {
                    let candidate = href.trim();
                    if !candidate.ends_with('/') && candidate.to_lowercase().ends_with(".vcf") {
                        let mut reference = RecordRef::new(candidate);
                        reference.etag = strong_etag(&etag);
                        references.push(reference);
                    }
                }
                current_element.clear();
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(SyncError::Decode(format!("multistatus parse error: {e}"))),
            _ => {}
        }
        buf.clear();
    }
    Ok(references)
}

impl ContactStore for CardDavClient {
    fn list(&self) -> Result<Vec<RecordRef>, SyncError> {
        let url = self.collection_url();
        let response = self
            .agent
            .request("PROPFIND", &url)
            .set("Depth", "1")
            .set("Content-Type", "text/xml; charset=utf-8")
            .set("Authorization", &self.authorization)
            .send_string(PROPFIND_BODY)
            .map_err(|err| map_error("propfind", &url, err))?;
        let body = response
            .into_string()
            .map_err(|err| SyncError::Transport(format!("propfind body: {err}")))?;
        let references = parse_multistatus(&body)?;
        tracing::debug!("listed {} cards in {}", references.len(), url);
        Ok(references)
    }

    fn get(&self, reference: &RecordRef) -> Result<RemoteRecord, SyncError> {
        let response = self
            .agent
            .get(&self.url_for(&reference.href))
            .set("Authorization", &self.authorization)
            .call()
            .map_err(|err| map_error("get", &reference.href, err))?;
        let etag = response.header("ETag").and_then(strong_etag);
        let body = response
            .into_string()
            .map_err(|err| SyncError::Transport(format!("get {}: {err}", reference.href)))?;

        let mut record = vcard::decode(&body).map_err(|err| match err {
            SyncError::Decode(message) => {
                SyncError::Decode(format!("{}: {message}", reference.href))
            }
            other => other,
        })?;
        record.reference = Some(RecordRef {
            href: reference.href.clone(),
            etag: etag.or_else(|| reference.etag.clone()),
        });
        Ok(record)
    }

    fn put(
        &mut self,
        reference: &RecordRef,
        record: &RemoteRecord,
    ) -> Result<Option<String>, SyncError> {
        let mut request = self
            .agent
            .put(&self.url_for(&reference.href))
            .set("Content-Type", "text/vcard; charset=utf-8")
            .set("Authorization", &self.authorization);
        if let Some(etag) = reference.etag.as_deref() {
            request = request.set("If-Match", &format!("\"{etag}\""));
        }
        let response = request
            .send_string(&vcard::encode(record))
            .map_err(|err| map_error("put", &reference.href, err))?;
        Ok(response.header("ETag").and_then(strong_etag))
    }

    fn delete(&mut self, reference: &RecordRef) -> Result<(), SyncError> {
        self.agent
            .delete(&self.url_for(&reference.href))
            .set("Authorization", &self.authorization)
            .call()
            .map_err(|err| map_error("delete", &reference.href, err))?;
        Ok(())
    }

    fn allocate(&self) -> RecordRef {
        RecordRef::new(format!(
            "{}{}.vcf",
            self.collection_url(),
            Ulid::new().to_string().to_lowercase()
        ))
    }
}
