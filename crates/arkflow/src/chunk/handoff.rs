//! Forwarding chunks to the embedding-ingest worker.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info_span, Instrument};

use super::chunk_text;
use crate::config::ChunkingConfig;
use crate::error::{ArkflowError, Result};
use crate::worker::EmbeddingSink;

/// What a handoff sent and what the sink accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandoffReport {
    pub chunks: usize,
    pub inserted: usize,
}

pub struct ChunkHandoff {
    sink: Arc<dyn EmbeddingSink>,
    max_chars: usize,
    timeout: Duration,
}

impl ChunkHandoff {
    pub fn new(sink: Arc<dyn EmbeddingSink>, max_chars: usize, timeout: Duration) -> Self {
        Self {
            sink,
            max_chars,
            timeout,
        }
    }

    pub fn from_config(sink: Arc<dyn EmbeddingSink>, config: &ChunkingConfig) -> Self {
        Self::new(sink, config.max_chars, config.ingest_timeout())
    }

    /// Chunks `text` and sends every chunk of the material in one batch.
    pub async fn hand_off(
        &self,
        material_id: &str,
        user_id: &str,
        source: &str,
        text: &str,
    ) -> Result<HandoffReport> {
        let chunks = chunk_text(text, self.max_chars, material_id, user_id, source);
        if chunks.is_empty() {
            return Ok(HandoffReport {
                chunks: 0,
                inserted: 0,
            });
        }

        let span = info_span!("chunk_handoff", material_id, chunks = chunks.len());
        let inserted = match tokio::time::timeout(
            self.timeout,
            self.sink.upsert_chunks(material_id, user_id, &chunks),
        )
        .instrument(span)
        .await
        {
            Ok(Ok(inserted)) => inserted,
            Ok(Err(e)) => return Err(ArkflowError::Ingestion(e.to_string())),
            Err(_) => {
                return Err(ArkflowError::Ingestion(format!(
                    "embedding ingest did not answer within {}s",
                    self.timeout.as_secs()
                )))
            }
        };

        log::info!(
            "Handed {} chunks of material {} to embedding ingest ({} inserted)",
            chunks.len(),
            material_id,
            inserted
        );
        Ok(HandoffReport {
            chunks: chunks.len(),
            inserted,
        })
    }
}
