//! Topic-to-schema map.
//!
//! Payloads on the wire are opaque bytes; the topic a payload arrives under
//! decides how it is decoded. The map is built once, before the fabric
//! starts, and shared read-only by every worker and listener.

use std::any::{type_name, Any};
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use hashbrown::HashMap;
use serde::de::DeserializeOwned;

use crate::error::DecodeError;

type DecodeFn = dyn Fn(&Bytes) -> Result<Arc<dyn Any + Send + Sync>, String> + Send + Sync;

#[derive(Clone)]
struct Schema {
    name: &'static str,
    decode: Arc<DecodeFn>,
}

/// Mapping from topic to the message type its payloads decode to.
///
/// # Examples
///
/// ```
/// use wharf_core::schema::TopicSchemas;
/// use bytes::Bytes;
///
/// #[derive(serde::Deserialize, Debug, PartialEq)]
/// struct Ping { seq: u32 }
///
/// let schemas = TopicSchemas::new()
///     .with_json::<Ping>("ping")
///     .with_raw("blob");
///
/// let decoded = schemas.decode("ping", Bytes::from_static(br#"{"seq":7}"#)).unwrap();
/// assert_eq!(decoded.downcast_ref::<Ping>(), Some(&Ping { seq: 7 }));
///
/// assert!(schemas.decode("nope", Bytes::new()).is_err());
/// ```
#[derive(Clone, Default)]
pub struct TopicSchemas {
    schemas: HashMap<String, Schema>,
}

impl TopicSchemas {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode `topic` payloads as JSON into `M`.
    pub fn with_json<M>(mut self, topic: impl Into<String>) -> Self
    where
        M: DeserializeOwned + Send + Sync + 'static,
    {
        self.register_json::<M>(topic);
        self
    }

    /// Pass `topic` payloads through as [`Bytes`].
    pub fn with_raw(mut self, topic: impl Into<String>) -> Self {
        self.register_raw(topic);
        self
    }

    /// Decode `topic` payloads as JSON into `M`, replacing any previous entry.
    pub fn register_json<M>(&mut self, topic: impl Into<String>)
    where
        M: DeserializeOwned + Send + Sync + 'static,
    {
        let decode: Arc<DecodeFn> = Arc::new(|payload: &Bytes| {
            serde_json::from_slice::<M>(payload)
                .map(|msg| Arc::new(msg) as Arc<dyn Any + Send + Sync>)
                .map_err(|e| e.to_string())
        });
        self.schemas.insert(
            topic.into(),
            Schema {
                name: type_name::<M>(),
                decode,
            },
        );
    }

    /// Pass `topic` payloads through as [`Bytes`], replacing any previous entry.
    pub fn register_raw(&mut self, topic: impl Into<String>) {
        let decode: Arc<DecodeFn> = Arc::new(|payload: &Bytes| {
            Ok(Arc::new(payload.clone()) as Arc<dyn Any + Send + Sync>)
        });
        self.schemas.insert(
            topic.into(),
            Schema {
                name: type_name::<Bytes>(),
                decode,
            },
        );
    }

    /// Whether `topic` has a schema.
    pub fn contains(&self, topic: &str) -> bool {
        self.schemas.contains_key(topic)
    }

    /// Name of the type `topic` decodes to.
    pub fn schema_name(&self, topic: &str) -> Option<&'static str> {
        self.schemas.get(topic).map(|s| s.name)
    }

    /// Number of registered topics.
    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    /// Whether no topic is registered.
    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }

    /// Decode a payload received under `topic`.
    ///
    /// Unknown topics always fail with [`DecodeError::UnknownTopic`].
    pub fn decode(&self, topic: &str, payload: Bytes) -> Result<Decoded, DecodeError> {
        let schema = self
            .schemas
            .get(topic)
            .ok_or_else(|| DecodeError::UnknownTopic(topic.to_string()))?;

        let value = (schema.decode)(&payload).map_err(|reason| DecodeError::Malformed {
            topic: topic.to_string(),
            schema: schema.name,
            reason,
        })?;

        Ok(Decoded {
            topic: topic.to_string(),
            schema: schema.name,
            payload,
            value,
        })
    }
}

impl fmt::Debug for TopicSchemas {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.schemas.iter().map(|(topic, s)| (topic, s.name)))
            .finish()
    }
}

/// A payload together with the value its topic's schema decoded it to.
#[derive(Clone)]
pub struct Decoded {
    topic: String,
    schema: &'static str,
    payload: Bytes,
    value: Arc<dyn Any + Send + Sync>,
}

impl Decoded {
    /// Topic the payload was decoded under.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Name of the decoded type.
    pub fn schema(&self) -> &'static str {
        self.schema
    }

    /// Raw payload bytes.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Take the raw payload bytes.
    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// Borrow the decoded value if it is a `T`.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }

    /// Share the decoded value if it is a `T`.
    pub fn value<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        Arc::clone(&self.value).downcast::<T>().ok()
    }
}

impl fmt::Debug for Decoded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Decoded")
            .field("topic", &self.topic)
            .field("schema", &self.schema)
            .field("len", &self.payload.len())
            .finish()
    }
}
