//! One aggregation run: locate, fetch, decrypt, decode, validate, combine, evaluate.
//!
//! Fetches run concurrently on a bounded window; everything after the fetch is
//! synchronous and works on packages in the locator's canonical order. A run is
//! either fully successful ([`RunReport`]) or fully failed ([`RunFailure`]).
//! Participant-local failures are only tolerated in quorum mode.

use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::aggregator;
use crate::config::PipelineConfig;
use crate::error::{AggregationFailure, EvaluationFailure, LocatorFailure, PipelineError, Stage};
use crate::evaluator::{EvaluationMetrics, Evaluator, LabeledDataset};
use crate::locator::{HttpRegistry, ParameterLocator, StaticRegistry};
use crate::package::{EncryptedBlob, GlobalModelSpec, ParticipantPackage, ParticipantReference};
use crate::retriever::{HttpGateway, SecureRetriever};
use crate::telemetry::PIPELINE_METRICS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Pending,
    Fetched,
    Decrypted,
    Validated,
    Aggregated,
    Evaluated,
    Failed { stage: Stage, kind: &'static str },
}

impl RunState {
    pub fn is_terminal(&self) -> bool { matches!(self, RunState::Evaluated | RunState::Failed { .. }) }

    fn successor(&self) -> Option<RunState> {
        match self {
            RunState::Pending => Some(RunState::Fetched),
            RunState::Fetched => Some(RunState::Decrypted),
            RunState::Decrypted => Some(RunState::Validated),
            RunState::Validated => Some(RunState::Aggregated),
            RunState::Aggregated => Some(RunState::Evaluated),
            RunState::Evaluated | RunState::Failed { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Transition {
    pub state: RunState,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("illegal run transition {from:?} -> {to:?}")]
pub struct IllegalTransition {
    pub from: RunState,
    pub to: RunState,
}

/// Per-run state. Nothing here outlives the run.
#[derive(Debug)]
pub struct RunContext {
    pub run_id: Uuid,
    pub model_id: String,
    pub started_at: DateTime<Utc>,
    state: RunState,
    history: Vec<Transition>,
}

impl RunContext {
    pub fn new(model_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            model_id: model_id.into(),
            started_at: now,
            state: RunState::Pending,
            history: vec![Transition { state: RunState::Pending, at: now }],
        }
    }

    pub fn state(&self) -> RunState { self.state }

    pub fn history(&self) -> &[Transition] { &self.history }

    /// Moves to `to`, which must be the direct successor of the current state.
    pub fn advance(&mut self, to: RunState) -> Result<(), IllegalTransition> {
        if self.state.successor() != Some(to) {
            return Err(IllegalTransition { from: self.state, to });
        }
        self.enter(to);
        Ok(())
    }

    /// Moves to `FAILED` from any non-terminal state.
    pub fn fail(&mut self, err: &PipelineError) -> Result<(), IllegalTransition> {
        let to = RunState::Failed { stage: err.stage(), kind: err.kind() };
        if self.state.is_terminal() {
            return Err(IllegalTransition { from: self.state, to });
        }
        self.enter(to);
        Ok(())
    }

    fn enter(&mut self, state: RunState) {
        self.state = state;
        self.history.push(Transition { state, at: Utc::now() });
    }

    fn step(&mut self, to: RunState) {
        if let Err(e) = self.advance(to) {
            warn!(run_id = %self.run_id, error = %e, "run state not advanced");
        }
    }
}

/// A participant dropped in quorum mode.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExcludedParticipant {
    pub participant_id: String,
    pub stage: Stage,
    pub kind: &'static str,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub model_id: String,
    pub spec: GlobalModelSpec,
    pub metrics: EvaluationMetrics,
    pub excluded: Vec<ExcludedParticipant>,
    pub history: Vec<Transition>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Error)]
#[error("run {run_id} for model {model_id:?} failed: {error}")]
pub struct RunFailure {
    pub run_id: Uuid,
    pub model_id: String,
    pub stage: Stage,
    pub participant: Option<String>,
    pub kind: &'static str,
    pub message: String,
    pub history: Vec<Transition>,
    #[serde(skip)]
    pub error: PipelineError,
}

pub struct FederationPipeline {
    locator: Arc<dyn ParameterLocator>,
    retriever: SecureRetriever,
    evaluator: Evaluator,
    quorum_min: Option<usize>,
    max_concurrency: usize,
}

struct Outcome {
    spec: GlobalModelSpec,
    metrics: EvaluationMetrics,
    excluded: Vec<ExcludedParticipant>,
}

impl FederationPipeline {
    pub fn new(locator: Arc<dyn ParameterLocator>, retriever: SecureRetriever, evaluator: Evaluator) -> Self {
        Self { locator, retriever, evaluator, quorum_min: None, max_concurrency: 8 }
    }

    /// Enables partial aggregation: participant-local failures are excluded while at least `min` participants survive.
    pub fn with_quorum(mut self, min: Option<usize>) -> Self {
        self.quorum_min = min;
        self
    }

    pub fn with_max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = n.max(1);
        self
    }

    pub fn from_config(cfg: &PipelineConfig) -> anyhow::Result<Self> {
        let gateway = HttpGateway::new(&cfg.gateway).context("building gateway client")?;
        let locator: Arc<dyn ParameterLocator> = match (&cfg.locator.registry_file, &cfg.locator.registry_url) {
            (Some(path), _) => Arc::new(StaticRegistry::from_file(path).context("loading participant registry")?),
            (None, Some(url)) => Arc::new(HttpRegistry::new(url.as_str(), cfg.gateway.timeout()).context("building registry client")?),
            (None, None) => anyhow::bail!("no participant registry configured"),
        };
        Ok(Self::new(locator, SecureRetriever::new(Arc::new(gateway)), Evaluator::from_config(&cfg.evaluation))
            .with_quorum(cfg.aggregation.quorum_min)
            .with_max_concurrency(cfg.retrieval.max_concurrency))
    }

    /// Picks up registry edits between runs; on failure the previous entries stay in use.
    pub fn refresh_registry(&self) -> Result<(), LocatorFailure> { self.locator.refresh() }

    #[instrument(skip(self, dataset), fields(run_id = tracing::field::Empty))]
    pub async fn run(&self, model_id: &str, dataset: Arc<LabeledDataset>) -> Result<RunReport, RunFailure> {
        let mut ctx = RunContext::new(model_id);
        tracing::Span::current().record("run_id", tracing::field::display(ctx.run_id));
        info!(quorum_min = ?self.quorum_min, "aggregation run started");

        match self.execute(&mut ctx, dataset).await {
            Ok(out) => {
                PIPELINE_METRICS.record_outcome("success");
                info!(
                    participants = out.spec.participants.len(),
                    excluded = out.excluded.len(),
                    n_estimators = out.spec.n_estimators,
                    accuracy = out.metrics.accuracy,
                    "aggregation run finished"
                );
                Ok(RunReport {
                    run_id: ctx.run_id,
                    model_id: ctx.model_id.clone(),
                    spec: out.spec,
                    metrics: out.metrics,
                    excluded: out.excluded,
                    history: ctx.history().to_vec(),
                    started_at: ctx.started_at,
                    finished_at: Utc::now(),
                })
            }
            Err(err) => {
                if let Err(e) = ctx.fail(&err) {
                    warn!(error = %e, "run already terminal");
                }
                PIPELINE_METRICS.record_failure(&err);
                PIPELINE_METRICS.record_outcome("failure");
                error!(stage = %err.stage(), participant = err.participant().unwrap_or("-"), kind = err.kind(), error = %err, "aggregation run failed");
                Err(RunFailure {
                    run_id: ctx.run_id,
                    model_id: ctx.model_id.clone(),
                    stage: err.stage(),
                    participant: err.participant().map(str::to_string),
                    kind: err.kind(),
                    message: err.to_string(),
                    history: ctx.history().to_vec(),
                    error: err,
                })
            }
        }
    }

    async fn execute(&self, ctx: &mut RunContext, dataset: Arc<LabeledDataset>) -> Result<Outcome, PipelineError> {
        let refs = self
            .locator
            .locate(&ctx.model_id)
            .await
            .map_err(|source| PipelineError::Locate { model_id: ctx.model_id.clone(), source })?;
        if refs.is_empty() {
            return Err(AggregationFailure::EmptyInput.into());
        }
        let mut excluded = Vec::new();

        let blobs = self.fetch_all(&refs, &mut excluded).await?;
        ctx.step(RunState::Fetched);

        let mut plaintexts: Vec<(&ParticipantReference, Zeroizing<Vec<u8>>)> = Vec::with_capacity(blobs.len());
        for (r, blob) in blobs {
            match SecureRetriever::decrypt(r, &blob) {
                Ok(pt) => plaintexts.push((r, pt)),
                Err(e) => self.exclude_or_fail(e, &mut excluded)?,
            }
        }
        ctx.step(RunState::Decrypted);

        let mut packages = Vec::with_capacity(plaintexts.len());
        for (r, pt) in plaintexts {
            match SecureRetriever::decode(r, &pt) {
                Ok(package) => packages.push(ParticipantPackage { participant_id: r.participant_id.clone(), package }),
                Err(e) => self.exclude_or_fail(e, &mut excluded)?,
            }
        }
        if let Some(required) = self.quorum_min {
            if packages.len() < required {
                return Err(AggregationFailure::QuorumNotMet { required, available: packages.len() }.into());
            }
        }
        aggregator::validate_shapes(&packages)?;
        ctx.step(RunState::Validated);

        let spec = aggregator::combine(&packages)?;
        PIPELINE_METRICS.participants_aggregated_total.add(packages.len() as u64, &[]);
        ctx.step(RunState::Aggregated);

        let evaluator = self.evaluator.clone();
        let for_eval = spec.clone();
        let metrics = tokio::task::spawn_blocking(move || evaluator.evaluate(&for_eval, &dataset))
            .await
            .map_err(|e| EvaluationFailure::Aborted(e.to_string()))??;
        ctx.step(RunState::Evaluated);

        Ok(Outcome { spec, metrics, excluded })
    }

    /// Concurrent fetch with at most `max_concurrency` requests in flight.
    /// Results come back in `refs` order. Returning early drops the stream, which cancels pending fetches.
    async fn fetch_all<'r>(
        &self,
        refs: &'r [ParticipantReference],
        excluded: &mut Vec<ExcludedParticipant>,
    ) -> Result<Vec<(&'r ParticipantReference, EncryptedBlob)>, PipelineError> {
        let retriever = &self.retriever;
        let mut in_flight = stream::iter(refs.iter().enumerate())
            .map(|(i, r)| async move { (i, retriever.fetch(r).await) })
            .buffer_unordered(self.max_concurrency);

        let mut slots: Vec<Option<EncryptedBlob>> = vec![None; refs.len()];
        while let Some((i, res)) = in_flight.next().await {
            match res {
                Ok(blob) => slots[i] = Some(blob),
                Err(e) => self.exclude_or_fail(e, excluded)?,
            }
        }
        Ok(refs.iter().zip(slots).filter_map(|(r, b)| b.map(|b| (r, b))).collect())
    }

    fn exclude_or_fail(&self, err: PipelineError, excluded: &mut Vec<ExcludedParticipant>) -> Result<(), PipelineError> {
        if self.quorum_min.is_none() || !err.is_participant_local() {
            return Err(err);
        }
        let participant_id = err.participant().unwrap_or_default().to_string();
        warn!(participant = %participant_id, stage = %err.stage(), kind = err.kind(), error = %err, "participant excluded");
        PIPELINE_METRICS.record_failure(&err);
        excluded.push(ExcludedParticipant { participant_id, stage: err.stage(), kind: err.kind(), reason: err.to_string() });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{self, SymmetricKey};
    use crate::error::{DecryptionFailure, RetrievalFailure};
    use crate::package::{MaxDepth, MaxFeatures};
    use crate::retriever::tests::{package, publish, MemorySource};
    use std::time::Duration;

    fn dataset() -> Arc<LabeledDataset> {
        let mut csv = String::from("x,y,Class\n");
        for i in 0..60 {
            csv.push_str(&format!("{},{},{}\n", i, i % 7, u8::from(i > 40)));
        }
        Arc::new(LabeledDataset::from_reader(csv.as_bytes(), "Class").unwrap())
    }

    fn pipeline(source: Arc<MemorySource>, refs: Vec<ParticipantReference>) -> FederationPipeline {
        let locator = Arc::new(StaticRegistry::from_entries([("fraud".to_string(), refs)]));
        FederationPipeline::new(locator, SecureRetriever::new(source), Evaluator::default())
    }

    fn states(history: &[Transition]) -> Vec<RunState> { history.iter().map(|t| t.state).collect() }

    #[test]
    fn transitions_follow_the_run_order() {
        let mut ctx = RunContext::new("m");
        assert_eq!(ctx.state(), RunState::Pending);
        assert!(ctx.advance(RunState::Decrypted).is_err());
        ctx.advance(RunState::Fetched).unwrap();
        ctx.advance(RunState::Decrypted).unwrap();
        let err = PipelineError::Decryption { participant: "p".into(), source: DecryptionFailure::Tampered("tag") };
        ctx.fail(&err).unwrap();
        assert_eq!(ctx.state(), RunState::Failed { stage: Stage::Decrypt, kind: "tampered" });
        assert!(ctx.fail(&err).is_err());
        assert!(ctx.advance(RunState::Validated).is_err());
        assert_eq!(ctx.history().len(), 4);
    }

    #[tokio::test]
    async fn run_reports_spec_metrics_and_history() {
        let source = Arc::new(MemorySource::default());
        let mut a = package(vec![0.2, 0.8], 100);
        let mut b = package(vec![0.4, 0.6], 150);
        let mut c = package(vec![0.3, 0.7], 200);
        a.max_depth = MaxDepth::Limited(10);
        b.max_depth = MaxDepth::Limited(20);
        c.max_depth = MaxDepth::Unbounded;
        let refs = vec![publish(&source, "a", &a), publish(&source, "bb", &b), publish(&source, "ccc", &c)];

        let report = pipeline(source, refs).run("fraud", dataset()).await.unwrap();
        assert_eq!(report.spec.n_estimators, 150);
        // unbounded depth excluded from the mean
        assert_eq!(report.spec.max_depth, MaxDepth::Limited(15));
        assert_eq!(report.spec.participants, vec!["a", "bb", "ccc"]);
        assert_eq!(report.metrics.test_samples, 12);
        assert!(report.excluded.is_empty());
        assert_eq!(
            states(&report.history),
            vec![RunState::Pending, RunState::Fetched, RunState::Decrypted, RunState::Validated, RunState::Aggregated, RunState::Evaluated]
        );
    }

    #[tokio::test]
    async fn canonical_order_survives_out_of_order_fetches() {
        let source = Arc::new(MemorySource::default());
        let mut first = package(vec![0.5, 0.5], 10);
        first.max_features = MaxFeatures::Named("log2".into());
        let refs = vec![publish(&source, "slow", &first), publish(&source, "fast", &package(vec![0.5, 0.5], 10))];
        source.delays.lock().insert("Qmslow".into(), Duration::from_millis(50));

        let report = pipeline(source, refs).run("fraud", dataset()).await.unwrap();
        assert_eq!(report.spec.participants, vec!["slow", "fast"]);
        assert_eq!(report.spec.max_features, MaxFeatures::Named("log2".into()));
    }

    #[tokio::test]
    async fn fetches_never_exceed_max_concurrency() {
        let source = Arc::new(MemorySource::default());
        let refs: Vec<_> = (0..5)
            .map(|i| {
                let r = publish(&source, &format!("p{i}"), &package(vec![0.5, 0.5], 10));
                source.delays.lock().insert(format!("Qmp{i}"), Duration::from_millis(20));
                r
            })
            .collect();

        let report = pipeline(source.clone(), refs).with_max_concurrency(2).run("fraud", dataset()).await.unwrap();
        assert_eq!(report.spec.participants, vec!["p0", "p1", "p2", "p3", "p4"]);
        assert_eq!(source.peak_in_flight.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn refreshed_registry_file_applies_to_the_next_run() {
        let source = Arc::new(MemorySource::default());
        let a = publish(&source, "a", &package(vec![0.2], 100));
        let b = publish(&source, "bb", &package(vec![0.4], 300));
        let path = std::env::temp_dir().join(format!("fedagg-pipeline-{}.json", Uuid::new_v4()));
        let write = |refs: &[ParticipantReference]| {
            std::fs::write(&path, serde_json::json!({ "models": { "fraud": refs } }).to_string()).unwrap();
        };
        write(&[a.clone()]);
        let locator = Arc::new(StaticRegistry::from_file(&path).unwrap());
        let p = FederationPipeline::new(locator, SecureRetriever::new(source), Evaluator::default());
        assert_eq!(p.run("fraud", dataset()).await.unwrap().spec.n_estimators, 100);

        write(&[a, b]);
        p.refresh_registry().unwrap();
        let report = p.run("fraud", dataset()).await.unwrap();
        assert_eq!(report.spec.participants, vec!["a", "bb"]);
        assert_eq!(report.spec.n_estimators, 200);
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn tampered_participant_fails_the_whole_run() {
        let source = Arc::new(MemorySource::default());
        let refs = vec![publish(&source, "a", &package(vec![0.1], 10)), publish(&source, "b", &package(vec![0.2], 10))];
        if let Some(Ok(blob)) = source.blobs.lock().get_mut("Qmb") {
            let last = blob.len() - 1;
            blob[last] ^= 0xff;
        }
        let failure = pipeline(source, refs).run("fraud", dataset()).await.unwrap_err();
        assert_eq!(failure.stage, Stage::Decrypt);
        assert_eq!(failure.participant.as_deref(), Some("b"));
        assert_eq!(failure.kind, "tampered");
        assert_eq!(states(&failure.history).last(), Some(&RunState::Failed { stage: Stage::Decrypt, kind: "tampered" }));
    }

    #[tokio::test]
    async fn fetch_failure_is_fatal_without_quorum() {
        let source = Arc::new(MemorySource::default());
        let refs = vec![publish(&source, "a", &package(vec![0.1], 10)), publish(&source, "b", &package(vec![0.2], 10))];
        source.blobs.lock().insert("Qma".into(), Err(RetrievalFailure::Timeout(Duration::from_secs(10))));
        let failure = pipeline(source, refs).run("fraud", dataset()).await.unwrap_err();
        assert_eq!((failure.stage, failure.kind), (Stage::Fetch, "timeout"));
        assert_eq!(states(&failure.history), vec![RunState::Pending, RunState::Failed { stage: Stage::Fetch, kind: "timeout" }]);
    }

    #[tokio::test]
    async fn quorum_mode_excludes_local_failures() {
        let source = Arc::new(MemorySource::default());
        let mut refs = vec![
            publish(&source, "a", &package(vec![0.2], 10)),
            publish(&source, "b", &package(vec![0.4], 20)),
            publish(&source, "c", &package(vec![0.9], 30)),
        ];
        refs[1].key_material = SymmetricKey::from_bytes([0x55; crypto::KEY_LEN]).to_material();
        source.blobs.lock().remove("Qmc");

        let report = pipeline(source.clone(), refs.clone()).with_quorum(Some(1)).run("fraud", dataset()).await.unwrap();
        assert_eq!(report.spec.participants, vec!["a"]);
        let ex: Vec<_> = report.excluded.iter().map(|e| (e.participant_id.as_str(), e.kind)).collect();
        assert_eq!(ex, vec![("c", "bad-status"), ("b", "bad-key")]);

        let failure = pipeline(source, refs).with_quorum(Some(2)).run("fraud", dataset()).await.unwrap_err();
        assert_eq!(failure.error, PipelineError::Aggregation(AggregationFailure::QuorumNotMet { required: 2, available: 1 }));
    }

    #[tokio::test]
    async fn shape_mismatch_stays_fatal_in_quorum_mode() {
        let source = Arc::new(MemorySource::default());
        let refs = vec![publish(&source, "a", &package(vec![0.2, 0.3], 10)), publish(&source, "b", &package(vec![0.4], 20))];
        let failure = pipeline(source, refs).with_quorum(Some(1)).run("fraud", dataset()).await.unwrap_err();
        assert_eq!((failure.stage, failure.kind), (Stage::Validate, "shape-mismatch"));
        assert_eq!(failure.participant.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn unknown_model_and_empty_registry_entry() {
        let failure = pipeline(Arc::new(MemorySource::default()), vec![]).run("other", dataset()).await.unwrap_err();
        assert_eq!((failure.stage, failure.kind), (Stage::Locate, "unknown-model"));
        let failure = pipeline(Arc::new(MemorySource::default()), vec![]).run("fraud", dataset()).await.unwrap_err();
        assert_eq!((failure.stage, failure.kind), (Stage::Aggregate, "empty-input"));
    }
}
