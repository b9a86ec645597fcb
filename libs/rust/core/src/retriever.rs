//! Secure retriever: fetch an envelope by content hash, authenticate and decrypt
//! it, then decode the plaintext through the package schema.
//!
//! Only [`SecureRetriever::fetch`] suspends. Decryption and decoding are
//! synchronous and keep the plaintext in memory, wiped on drop; nothing is
//! written to disk.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use fedagg_resilience::{retry_async, RetryConfig};
use tracing::{debug, instrument, warn};
use zeroize::Zeroizing;

use crate::config::GatewayConfig;
use crate::crypto::{self, SymmetricKey};
use crate::error::{PipelineError, RetrievalFailure};
use crate::package::{decode_package, ContentHash, EncryptedBlob, ModelParameterPackage, ParticipantReference};
use crate::telemetry::PIPELINE_METRICS;

#[async_trait]
pub trait BlobSource: Send + Sync {
    async fn fetch(&self, hash: &ContentHash) -> Result<EncryptedBlob, RetrievalFailure>;
}

/// Content-addressed HTTP gateway: `GET {base_url}/ipfs/{hash}`.
pub struct HttpGateway {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
    max_blob_bytes: u64,
    retry: RetryConfig,
}

impl HttpGateway {
    pub fn new(cfg: &GatewayConfig) -> Result<Self, RetrievalFailure> {
        let client = reqwest::Client::builder()
            .timeout(cfg.timeout())
            .build()
            .map_err(|e| RetrievalFailure::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            timeout: cfg.timeout(),
            max_blob_bytes: cfg.max_blob_bytes,
            retry: cfg.retry(),
        })
    }

    pub fn url_for(&self, hash: &ContentHash) -> String { format!("{}/ipfs/{}", self.base_url, hash) }

    async fn fetch_once(&self, hash: &ContentHash) -> Result<EncryptedBlob, RetrievalFailure> {
        let mut resp = self.client.get(self.url_for(hash)).send().await.map_err(|e| self.classify(e))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(RetrievalFailure::BadStatus(status.as_u16()));
        }
        let limit = self.max_blob_bytes;
        if let Some(len) = resp.content_length() {
            if len > limit { return Err(RetrievalFailure::TooLarge { size: len, limit }); }
        }
        // Content-Length may be absent or wrong; enforce the cap on what actually arrives.
        let mut bytes = Vec::with_capacity(resp.content_length().unwrap_or(0) as usize);
        while let Some(chunk) = resp.chunk().await.map_err(|e| self.classify(e))? {
            let received = (bytes.len() + chunk.len()) as u64;
            if received > limit {
                return Err(RetrievalFailure::TooLarge { size: received, limit });
            }
            bytes.extend_from_slice(&chunk);
        }
        Ok(EncryptedBlob { content_hash: hash.clone(), bytes })
    }

    fn classify(&self, e: reqwest::Error) -> RetrievalFailure {
        if e.is_timeout() { RetrievalFailure::Timeout(self.timeout) } else { RetrievalFailure::Transport(e.to_string()) }
    }
}

#[async_trait]
impl BlobSource for HttpGateway {
    async fn fetch(&self, hash: &ContentHash) -> Result<EncryptedBlob, RetrievalFailure> {
        retry_async(&self.retry, "gateway_fetch", |_attempt| self.fetch_once(hash), RetrievalFailure::is_retryable).await
    }
}

#[derive(Clone)]
pub struct SecureRetriever {
    source: Arc<dyn BlobSource>,
}

impl SecureRetriever {
    pub fn new(source: Arc<dyn BlobSource>) -> Self { Self { source } }

    /// `fetch`, `decrypt` and `decode` in sequence for one participant.
    #[instrument(skip(self, reference), fields(participant = %reference.participant_id, hash = %reference.content_hash))]
    pub async fn retrieve(&self, reference: &ParticipantReference) -> Result<ModelParameterPackage, PipelineError> {
        let blob = self.fetch(reference).await?;
        let plaintext = Self::decrypt(reference, &blob)?;
        Self::decode(reference, &plaintext)
    }

    pub async fn fetch(&self, reference: &ParticipantReference) -> Result<EncryptedBlob, PipelineError> {
        let started = Instant::now();
        let res = self.source.fetch(&reference.content_hash).await;
        PIPELINE_METRICS.fetch_latency_ms.record(started.elapsed().as_secs_f64() * 1000.0, &[]);
        match res {
            Ok(blob) if blob.content_hash != reference.content_hash => {
                warn!(participant = %reference.participant_id, "source returned a blob for a different hash");
                Err(PipelineError::Retrieval {
                    participant: reference.participant_id.clone(),
                    source: RetrievalFailure::InvalidContentHash(blob.content_hash.to_string()),
                })
            }
            Ok(blob) => {
                debug!(participant = %reference.participant_id, bytes = blob.bytes.len(), "blob fetched");
                Ok(blob)
            }
            Err(source) => Err(PipelineError::Retrieval { participant: reference.participant_id.clone(), source }),
        }
    }

    pub fn decrypt(reference: &ParticipantReference, blob: &EncryptedBlob) -> Result<Zeroizing<Vec<u8>>, PipelineError> {
        let wrap = |source| PipelineError::Decryption { participant: reference.participant_id.clone(), source };
        let key = SymmetricKey::from_material(&reference.key_material).map_err(wrap)?;
        crypto::open(&blob.bytes, &key).map_err(wrap)
    }

    pub fn decode(reference: &ParticipantReference, plaintext: &[u8]) -> Result<ModelParameterPackage, PipelineError> {
        decode_package(plaintext).map_err(|source| PipelineError::MalformedPackage { participant: reference.participant_id.clone(), source })
    }
}
