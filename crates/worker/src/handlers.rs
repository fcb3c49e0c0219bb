use async_trait::async_trait;
use delayflow::payload::{encode_envelope, JsonCodec, Payload};
use delayflow::{DeserializationError, EnqueueOptions, JobStore};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendNewsletter {
    pub recipient: String,
    pub subject: String,
}

#[async_trait]
impl Payload for SendNewsletter {
    fn kind(&self) -> &'static str {
        "send_newsletter"
    }

    async fn perform(&self) -> anyhow::Result<()> {
        info!(recipient = %self.recipient, subject = %self.subject, "sending newsletter");
        Ok(())
    }

    fn encode(&self) -> Result<String, DeserializationError> {
        encode_envelope(self.kind(), self)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebuildSearchIndex {
    pub index: String,
}

#[async_trait]
impl Payload for RebuildSearchIndex {
    fn kind(&self) -> &'static str {
        "rebuild_search_index"
    }

    async fn perform(&self) -> anyhow::Result<()> {
        info!(index = %self.index, "rebuilding search index");
        Ok(())
    }

    fn encode(&self) -> Result<String, DeserializationError> {
        encode_envelope(self.kind(), self)
    }

    /// At most one rebuild per index runs across the whole fleet.
    fn singleton_queue_name(&self) -> Option<String> {
        Some(format!("rebuild_search_index/{}", self.index))
    }
}

pub fn build_codec() -> JsonCodec {
    let mut codec = JsonCodec::new();
    codec.register("send_newsletter", |data| {
        serde_json::from_value::<SendNewsletter>(data.clone())
    });
    codec.register("rebuild_search_index", |data| {
        serde_json::from_value::<RebuildSearchIndex>(data.clone())
    });
    codec
}

/// A couple of rows to watch the loop chew through when trying the worker
/// out locally.
pub async fn seed_demo_jobs(store: &dyn JobStore) -> delayflow::Result<()> {
    store
        .enqueue(
            &SendNewsletter {
                recipient: "ops@example.com".to_string(),
                subject: "delayflow is up".to_string(),
            },
            EnqueueOptions::default(),
        )
        .await?;
    store
        .enqueue(
            &RebuildSearchIndex {
                index: "places".to_string(),
            },
            EnqueueOptions {
                queue: Some("maintenance".to_string()),
                ..Default::default()
            },
        )
        .await?;
    Ok(())
}
