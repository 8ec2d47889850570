//! Core domain models and strongly-typed identifiers.
//!
//! Defines relay events, destinations and the newtype wrappers that keep
//! identifiers from being mixed up. Events are immutable once built and are
//! shared read-only between every dispatcher they fan out to.

use std::{collections::BTreeMap, fmt, time::Duration};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;

/// Longest accepted idempotency key, in bytes.
pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 256;

/// Content type used when the producer does not supply one.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Strongly-typed event identifier.
///
/// Assigned by the relay when an event is built. Follows the event through
/// every dispatcher queue, delivery attempt and completion record.
///
/// # Example
///
/// ```
/// use hermes_core::models::EventId;
/// let event_id = EventId::new();
/// println!("relaying event: {}", event_id);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub Uuid);

impl EventId {
    /// Creates a new random event ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for EventId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Producer-supplied key used to recognise redelivered events.
///
/// Keys are opaque, but must be non-empty, at most
/// [`MAX_IDEMPOTENCY_KEY_LEN`] bytes, and free of whitespace and control
/// characters so they can travel in headers and log fields unescaped.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Parses and validates a raw key.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::MalformedIdempotencyKey` if the key is
    /// empty, too long, or contains whitespace or control characters.
    pub fn parse(raw: impl Into<String>) -> Result<Self, ValidationError> {
        let raw = raw.into();

        if raw.is_empty() {
            return Err(ValidationError::malformed_key("idempotency key is empty"));
        }

        if raw.len() > MAX_IDEMPOTENCY_KEY_LEN {
            return Err(ValidationError::malformed_key(format!(
                "idempotency key is {} bytes, limit is {MAX_IDEMPOTENCY_KEY_LEN}",
                raw.len()
            )));
        }

        if raw.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(ValidationError::malformed_key(
                "idempotency key contains whitespace or control characters",
            ));
        }

        Ok(Self(raw))
    }

    /// Returns the key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One unit of payload to be relayed.
///
/// The payload is opaque to the relay. Metadata (source, attributes) drives
/// routing. Fields are private so an event cannot change after it has been
/// handed to the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    id: EventId,
    source: String,
    idempotency_key: String,
    created_at: DateTime<Utc>,
    content_type: String,
    attributes: BTreeMap<String, String>,
    payload: Bytes,
}

impl Event {
    /// Starts building an event from its required parts.
    ///
    /// Nothing is validated here; the relay validates on submit so that
    /// malformed input is rejected at the ingress boundary with a reason.
    pub fn builder(
        source: impl Into<String>,
        idempotency_key: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> EventBuilder {
        EventBuilder {
            id: None,
            source: source.into(),
            idempotency_key: idempotency_key.into(),
            created_at: None,
            content_type: None,
            attributes: BTreeMap::new(),
            payload: payload.into(),
        }
    }

    /// Unique identifier of this event.
    pub fn id(&self) -> EventId {
        self.id
    }

    /// Identifier of the producer that emitted the event.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Raw idempotency key as supplied by the producer.
    pub fn idempotency_key(&self) -> &str {
        &self.idempotency_key
    }

    /// When the event was created.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// MIME type of the payload.
    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    /// Routing attributes.
    pub fn attributes(&self) -> &BTreeMap<String, String> {
        &self.attributes
    }

    /// Looks up a single routing attribute.
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    /// Opaque payload bytes. Cloning is cheap.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Payload size in bytes.
    pub fn payload_size(&self) -> usize {
        self.payload.len()
    }

    /// Checks the event against the relay's acceptance rules.
    ///
    /// # Errors
    ///
    /// Returns the first rule the event breaks: empty payload, empty source,
    /// or a malformed idempotency key.
    pub fn validate(&self) -> Result<IdempotencyKey, ValidationError> {
        if self.payload.is_empty() {
            return Err(ValidationError::EmptyPayload);
        }

        if self.source.trim().is_empty() {
            return Err(ValidationError::MissingSource);
        }

        IdempotencyKey::parse(self.idempotency_key.clone())
    }
}

/// Builder for [`Event`].
#[derive(Debug, Clone)]
pub struct EventBuilder {
    id: Option<EventId>,
    source: String,
    idempotency_key: String,
    created_at: Option<DateTime<Utc>>,
    content_type: Option<String>,
    attributes: BTreeMap<String, String>,
    payload: Bytes,
}

impl EventBuilder {
    /// Uses a fixed event ID instead of a random one.
    pub fn id(mut self, id: EventId) -> Self {
        self.id = Some(id);
        self
    }

    /// Sets the creation timestamp.
    pub fn created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }

    /// Sets the payload MIME type.
    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Adds a routing attribute.
    pub fn attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    /// Adds several routing attributes.
    pub fn attributes<I, K, V>(mut self, attributes: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.attributes.extend(attributes.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Finishes the event.
    pub fn build(self) -> Event {
        Event {
            id: self.id.unwrap_or_default(),
            source: self.source,
            idempotency_key: self.idempotency_key,
            created_at: self.created_at.unwrap_or_else(Utc::now),
            content_type: self.content_type.unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
            attributes: self.attributes,
            payload: self.payload,
        }
    }
}

/// Identity key of a destination.
///
/// Events are routed to dispatchers by this key, and destinations are
/// deduplicated by it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DestinationKey(String);

impl DestinationKey {
    /// Creates a key from any string.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Returns the key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DestinationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DestinationKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

impl From<String> for DestinationKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

/// Wire transport used to reach a destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// TLS-secured HTTP request/response.
    Https,
    /// SSH-authenticated git protocol exchange.
    SshGit,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Https => write!(f, "https"),
            Self::SshGit => write!(f, "ssh_git"),
        }
    }
}

/// A resolved delivery target.
///
/// Created once per identity key and cached for the lifetime of the process.
/// The address is not validated here: a malformed address is reported by the
/// transport as a permanent failure rather than refusing to start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    /// Identity key used for routing and deduplication.
    pub key: DestinationKey,
    /// Transport used for delivery.
    pub transport: TransportKind,
    /// URL (HTTPS) or remote (SSH git) to deliver to.
    pub address: String,
    /// Overrides the relay's default maximum attempt count.
    #[serde(default)]
    pub max_attempts: Option<u32>,
    /// Overrides the client's per-attempt timeout.
    #[serde(default, with = "optional_millis")]
    pub timeout: Option<Duration>,
    /// Secret for the outbound HMAC signature header.
    #[serde(default, skip_serializing)]
    pub signing_secret: Option<String>,
    /// Extra headers sent with HTTPS deliveries.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl Destination {
    /// Creates a destination with no per-destination overrides.
    pub fn new(
        key: impl Into<DestinationKey>,
        transport: TransportKind,
        address: impl Into<String>,
    ) -> Self {
        Self {
            key: key.into(),
            transport,
            address: address.into(),
            max_attempts: None,
            timeout: None,
            signing_secret: None,
            headers: BTreeMap::new(),
        }
    }

    /// Sets the maximum attempt count for this destination.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Sets the per-attempt timeout for this destination.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets the outbound signing secret.
    pub fn with_signing_secret(mut self, secret: impl Into<String>) -> Self {
        self.signing_secret = Some(secret.into());
        self
    }

    /// Adds an extra HTTPS header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

mod optional_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(duration) => {
                serializer.serialize_some(&u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
            },
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idempotency_key_accepts_opaque_tokens() {
        assert!(IdempotencyKey::parse("delivery-72d3162e-cc78-11e3-81ab-4c9367dc0958").is_ok());
        assert!(IdempotencyKey::parse("a").is_ok());
        assert!(IdempotencyKey::parse("x".repeat(MAX_IDEMPOTENCY_KEY_LEN)).is_ok());
    }

    #[test]
    fn idempotency_key_rejects_malformed_input() {
        assert!(IdempotencyKey::parse("").is_err());
        assert!(IdempotencyKey::parse("has space").is_err());
        assert!(IdempotencyKey::parse("tab\there").is_err());
        assert!(IdempotencyKey::parse("nul\0").is_err());
        assert!(IdempotencyKey::parse("x".repeat(MAX_IDEMPOTENCY_KEY_LEN + 1)).is_err());
    }

    #[test]
    fn validate_rejects_empty_payload_first() {
        let event = Event::builder("github", "", Bytes::new()).build();
        assert_eq!(event.validate(), Err(ValidationError::EmptyPayload));
    }

    #[test]
    fn validate_rejects_blank_source() {
        let event = Event::builder("  ", "key-1", "payload").build();
        assert_eq!(event.validate(), Err(ValidationError::MissingSource));
    }

    #[test]
    fn builder_applies_defaults() {
        let event = Event::builder("ci", "key-1", "payload").attribute("repository", "api").build();

        assert_eq!(event.content_type(), DEFAULT_CONTENT_TYPE);
        assert_eq!(event.attribute("repository"), Some("api"));
        assert_eq!(event.payload_size(), 7);
        assert!(event.validate().is_ok());
    }

    #[test]
    fn destination_timeout_serializes_as_millis() {
        let destination = Destination::new("ci", TransportKind::Https, "https://ci.example.com")
            .with_timeout(Duration::from_millis(2500))
            .with_signing_secret("hidden");

        let json = serde_json::to_value(&destination).unwrap();
        assert_eq!(json["timeout"], 2500);
        assert_eq!(json["transport"], "https");
        assert!(json.get("signing_secret").is_none());

        let parsed: Destination = serde_json::from_value(serde_json::json!({
            "key": "mirror",
            "transport": "ssh_git",
            "address": "git@github.com:org/repo.git",
            "timeout": 500
        }))
        .unwrap();
        assert_eq!(parsed.timeout, Some(Duration::from_millis(500)));
        assert_eq!(parsed.transport, TransportKind::SshGit);
    }
}
