use std::sync::Arc;

use async_trait::async_trait;
use delayflow::payload::{encode_envelope, JsonCodec, Payload, PayloadCodec};
use delayflow::{connect, DeserializationError, JobStore, Settings, SharedSettings};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestPayload {
    pub body: String,
    #[serde(default)]
    pub singleton: Option<String>,
}

impl TestPayload {
    #[allow(dead_code)]
    pub fn plain(body: &str) -> Self {
        Self {
            body: body.to_string(),
            singleton: None,
        }
    }

    #[allow(dead_code)]
    pub fn singleton(body: &str, class: &str) -> Self {
        Self {
            body: body.to_string(),
            singleton: Some(class.to_string()),
        }
    }
}

#[async_trait]
impl Payload for TestPayload {
    fn kind(&self) -> &'static str {
        "test"
    }

    async fn perform(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn encode(&self) -> Result<String, DeserializationError> {
        encode_envelope(self.kind(), self)
    }

    fn singleton_queue_name(&self) -> Option<String> {
        self.singleton.clone()
    }
}

pub fn codec() -> Arc<dyn PayloadCodec> {
    let mut codec = JsonCodec::new();
    codec.register("test", |data| {
        serde_json::from_value::<TestPayload>(data.clone())
    });
    Arc::new(codec)
}

/// Fresh in-memory store per test; no external services involved.
#[allow(dead_code)]
pub async fn sqlite_store() -> (Arc<dyn JobStore>, SharedSettings) {
    let settings = Settings::default().into_shared();
    let store = connect("sqlite::memory:", settings.clone(), Some(codec()))
        .await
        .expect("sqlite store should open");
    store.create_table().await.expect("create_table failed");
    (store, settings)
}
