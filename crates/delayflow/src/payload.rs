use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::DeserializationError;

/// A unit of deferred work.
///
/// Execution itself is the caller's concern; the store only needs the
/// payload to round-trip through the `handler` column and, optionally, to
/// announce a singleton class.
#[async_trait]
pub trait Payload: Send + Sync {
    /// Stable name codecs key their decoders on.
    fn kind(&self) -> &'static str;

    async fn perform(&self) -> anyhow::Result<()>;

    /// Serialize into the `handler` blob.
    fn encode(&self) -> Result<String, DeserializationError>;

    /// Singleton-class capability. Payloads that return a name here are
    /// mutually exclusive with every other live-locked job sharing that
    /// name, across the whole fleet.
    fn singleton_queue_name(&self) -> Option<String> {
        None
    }
}

/// Decodes `handler` blobs back into payloads.
pub trait PayloadCodec: Send + Sync {
    fn decode(&self, handler: &str) -> Result<Box<dyn Payload>, DeserializationError>;
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    kind: String,
    data: serde_json::Value,
}

/// The JSON form payloads are stored in: `{"kind": ..., "data": ...}`.
pub fn encode_envelope<T: Serialize>(kind: &str, data: &T) -> Result<String, DeserializationError> {
    let data =
        serde_json::to_value(data).map_err(|err| DeserializationError(err.to_string()))?;
    serde_json::to_string(&Envelope {
        kind: kind.to_string(),
        data,
    })
    .map_err(|err| DeserializationError(err.to_string()))
}

type DecodeFn =
    dyn Fn(&serde_json::Value) -> Result<Box<dyn Payload>, DeserializationError> + Send + Sync;

/// Registry-backed codec for [`encode_envelope`]-style handler blobs.
#[derive(Clone, Default)]
pub struct JsonCodec {
    decoders: HashMap<String, Arc<DecodeFn>>,
}

impl JsonCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<P, F>(&mut self, kind: &str, decode: F)
    where
        P: Payload + 'static,
        F: Fn(&serde_json::Value) -> Result<P, serde_json::Error> + Send + Sync + 'static,
    {
        self.decoders.insert(
            kind.to_string(),
            Arc::new(move |data| {
                decode(data)
                    .map(|payload| Box::new(payload) as Box<dyn Payload>)
                    .map_err(|err| DeserializationError(err.to_string()))
            }),
        );
    }
}

impl PayloadCodec for JsonCodec {
    fn decode(&self, handler: &str) -> Result<Box<dyn Payload>, DeserializationError> {
        let envelope: Envelope =
            serde_json::from_str(handler).map_err(|err| DeserializationError(err.to_string()))?;
        let decoder = self
            .decoders
            .get(&envelope.kind)
            .ok_or_else(|| DeserializationError(format!("no decoder for kind {:?}", envelope.kind)))?;
        decoder(&envelope.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Ping {
        target: String,
    }

    #[async_trait]
    impl Payload for Ping {
        fn kind(&self) -> &'static str {
            "ping"
        }

        async fn perform(&self) -> anyhow::Result<()> {
            Ok(())
        }

        fn encode(&self) -> Result<String, DeserializationError> {
            encode_envelope(self.kind(), self)
        }
    }

    fn codec() -> JsonCodec {
        let mut codec = JsonCodec::new();
        codec.register("ping", |data| serde_json::from_value::<Ping>(data.clone()));
        codec
    }

    #[test]
    fn round_trips_through_the_envelope() {
        let payload = Ping {
            target: "db-01".to_string(),
        };
        let handler = payload.encode().unwrap();
        let decoded = codec().decode(&handler).unwrap();
        assert_eq!(decoded.kind(), "ping");
        assert_eq!(decoded.singleton_queue_name(), None);
    }

    #[test]
    fn unknown_kind_and_garbage_both_fail_to_decode() {
        let codec = codec();
        assert!(codec.decode(r#"{"kind":"pong","data":{}}"#).is_err());
        assert!(codec.decode("not json at all").is_err());
    }
}
