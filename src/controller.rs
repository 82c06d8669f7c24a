//! Drives a session through `Loaded → … → Described`.
//!
//! Mandatory single-path stages (load, background removal) abort the call and
//! leave the session at its last good stage. Detection, enhancement and
//! description degrade instead: their failures are written into the session
//! as status data and the pipeline keeps going.
//!
//! Stage work for a call runs in its own spawned task holding the session's
//! exclusive guard, so a client that disconnects mid-stage does not cancel it;
//! the results are committed and available to the next call.

use crate::adapters::{
    Adapters, Candidate, CropRect, ImageTransform, ListingDescription, TransformError,
    detector::DETECTION_VOCABULARY,
};
use crate::codec::{self, ImageHandle};
use crate::config::ServiceConfig;
use crate::models::{SessionSummary, StageReport};
use crate::session::{
    DescribedView, DescriptionOutcome, DescriptionStatus, EnhancementOutcome, EnhancementStatus,
    PipelineSession, ProcessedView, SessionId, Stage, TransitionError,
};
use crate::store::{SessionStore, StoreError};
use chrono::Utc;
use serde_json::{Value, json};
use std::{
    future::Future,
    sync::Arc,
    time::{Duration, Instant},
};
use thiserror::Error;
use tokio::sync::OwnedMutexGuard;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct PipelinePolicy {
    pub adapter_timeout: Duration,
    pub confidence_floor: f32,
    pub vocabulary: &'static [&'static str],
    pub default_tone: &'static str,
    pub default_lang: &'static str,
}

impl Default for PipelinePolicy {
    fn default() -> Self {
        Self {
            adapter_timeout: Duration::from_secs(60),
            confidence_floor: 0.05,
            vocabulary: DETECTION_VOCABULARY,
            default_tone: "professional",
            default_lang: "en",
        }
    }
}

impl PipelinePolicy {
    pub fn from_config(config: &ServiceConfig) -> Self {
        Self {
            adapter_timeout: config.adapter_timeout,
            confidence_floor: config.confidence_floor,
            ..Self::default()
        }
    }
}

#[derive(Clone)]
pub struct PipelineController {
    store: SessionStore,
    adapters: Arc<Adapters>,
    policy: Arc<PipelinePolicy>,
}

impl PipelineController {
    pub fn new(store: SessionStore, adapters: Adapters, policy: PipelinePolicy) -> Self {
        Self {
            store,
            adapters: Arc::new(adapters),
            policy: Arc::new(policy),
        }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub async fn active_sessions(&self) -> usize {
        self.store.len().await
    }

    /// Create a session and decode the upload into it. An undecodable upload
    /// removes the session again; the caller never sees its id.
    pub async fn upload(&self, bytes: Vec<u8>) -> Result<(SessionId, (u32, u32)), PipelineError> {
        let id = self.store.create().await;
        match self.load(id, bytes).await {
            Ok(dims) => {
                info!(target = "studio.pipeline", session_id = %id, width = dims.0, height = dims.1, "upload_loaded");
                Ok((id, dims))
            }
            Err(err) => {
                let _ = self.store.delete(id).await;
                warn!(target = "studio.pipeline", session_id = %id, error = %err, "upload_rejected");
                Err(err)
            }
        }
    }

    async fn load(&self, id: SessionId, bytes: Vec<u8>) -> Result<(u32, u32), PipelineError> {
        let mut guard = self.store.checkout(id).await?;
        let session = &mut *guard;
        let raw = self
            .capture_stage("load", &mut session.reports, async move {
                let raw = tokio::task::spawn_blocking(move || codec::decode(&bytes))
                    .await
                    .map_err(|err| PipelineError::internal("load", err.to_string()))?
                    .map_err(|err| PipelineError::decode(err.to_string()))?;
                let (width, height) = raw.dimensions();
                Ok(StageOutcome::new(
                    raw,
                    json!({ "width": width, "height": height }),
                ))
            })
            .await?;
        let dims = raw.dimensions();
        session
            .record_loaded(raw)
            .map_err(|err| PipelineError::transition("load", err))?;
        Ok(dims)
    }

    /// Run detection, background removal and enhancement. A session already
    /// at `Enhanced` answers from its stored artifacts.
    pub async fn process(&self, id: SessionId) -> Result<ProcessedView, PipelineError> {
        let guard = self.store.checkout(id).await?;
        match guard.stage {
            Stage::Created => {
                return Err(PipelineError::illegal_transition(
                    "process",
                    "no image has been loaded for this session",
                ));
            }
            Stage::Enhanced => {
                return guard.processed_view(true).ok_or_else(|| {
                    PipelineError::internal("process", "enhanced session is missing artifacts")
                });
            }
            stage if stage > Stage::Enhanced => {
                return Err(PipelineError::illegal_transition(
                    "process",
                    format!("session is already at `{stage}`"),
                ));
            }
            _ => {}
        }

        let this = self.clone();
        tokio::spawn(async move { this.advance_to_enhanced(guard).await })
            .await
            .map_err(|err| PipelineError::internal("process", err.to_string()))?
    }

    async fn advance_to_enhanced(
        &self,
        mut guard: OwnedMutexGuard<PipelineSession>,
    ) -> Result<ProcessedView, PipelineError> {
        let session = &mut *guard;
        if session.stage == Stage::Loaded {
            self.detect(session).await?;
        }
        if session.stage == Stage::Detected {
            self.remove_background(session).await?;
        }
        if session.stage == Stage::BackgroundRemoved {
            self.enhance(session).await?;
        }
        session.touch(Utc::now());
        session
            .processed_view(false)
            .ok_or_else(|| PipelineError::internal("process", "enhancement left no artifacts"))
    }

    async fn detect(&self, session: &mut PipelineSession) -> Result<(), PipelineError> {
        let raw = session
            .raw_image
            .clone()
            .ok_or_else(|| PipelineError::illegal_transition("detect", "raw image missing"))?;
        let session_id = session.id;
        let detector = self.adapters.detector.clone();
        let policy = self.policy.clone();

        let (detection, crop) = self
            .capture_stage("detect", &mut session.reports, async move {
                let call = {
                    let (detector, raw) = (detector.clone(), raw.clone());
                    let vocabulary = policy.vocabulary;
                    async move { detector.detect(&raw, vocabulary).await }
                };
                let candidates = match isolated(policy.adapter_timeout, call).await {
                    Ok(found) => found,
                    Err(err) => {
                        warn!(
                            target = "studio.adapters",
                            session_id = %session_id,
                            adapter = detector.name(),
                            error = %err,
                            "detector_failed_using_full_frame"
                        );
                        Vec::new()
                    }
                };
                let (width, height) = raw.dimensions();
                let (detection, crop) =
                    match pick_candidate(&candidates, policy.confidence_floor, width, height) {
                        Some((candidate, rect)) => {
                            let cropped =
                                raw.image().crop_imm(rect.x, rect.y, rect.width, rect.height);
                            (Some(candidate), ImageHandle::new(cropped))
                        }
                        None => (None, raw.clone()),
                    };
                let (crop_w, crop_h) = crop.dimensions();
                let output = json!({
                    "candidates": candidates.len(),
                    "selected": detection,
                    "used_full_frame": detection.is_none(),
                    "crop": { "width": crop_w, "height": crop_h },
                });
                Ok(StageOutcome::new((detection, crop), output))
            })
            .await?;

        session
            .record_detected(detection, crop)
            .map_err(|err| PipelineError::transition("detect", err))
    }

    async fn remove_background(&self, session: &mut PipelineSession) -> Result<(), PipelineError> {
        let crop = session.cropped_image.clone().ok_or_else(|| {
            PipelineError::illegal_transition("remove_background", "crop missing")
        })?;
        let session_id = session.id;
        let remover = self.adapters.background.clone();
        let limit = self.policy.adapter_timeout;

        let image = self
            .capture_stage("remove_background", &mut session.reports, async move {
                let call = {
                    let remover = remover.clone();
                    async move { remover.transform(&crop).await }
                };
                let image = isolated(limit, call)
                    .await
                    .map_err(|err| {
                        warn!(
                            target = "studio.adapters",
                            session_id = %session_id,
                            adapter = remover.name(),
                            error = %err,
                            "background_removal_failed"
                        );
                        PipelineError::segmentation(format!("{}: {err}", remover.name()))
                    })?;
                let (width, height) = image.dimensions();
                let output = json!({
                    "adapter": remover.name(),
                    "width": width,
                    "height": height,
                    "has_alpha": image.has_alpha(),
                });
                Ok(StageOutcome::new(image, output))
            })
            .await?;

        session
            .record_background_removed(image)
            .map_err(|err| PipelineError::transition("remove_background", err))
    }

    async fn enhance(&self, session: &mut PipelineSession) -> Result<(), PipelineError> {
        let base = session.no_background_image.clone().ok_or_else(|| {
            PipelineError::illegal_transition("enhance", "background-free image missing")
        })?;
        let session_id = session.id;
        let limit = self.policy.adapter_timeout;
        let [first, second, third] = self.adapters.enhancers.clone();

        let outcomes = self
            .capture_stage("enhance", &mut session.reports, async move {
                let (a, b, c) = tokio::join!(
                    attempt(first, base.clone(), limit, session_id),
                    attempt(second, base.clone(), limit, session_id),
                    attempt(third, base, limit, session_id),
                );
                let outcomes = [a, b, c];
                let slots: Vec<Value> = outcomes
                    .iter()
                    .map(|slot| json!({ "strategy": slot.strategy, "status": slot.status }))
                    .collect();
                Ok(StageOutcome::new(outcomes, json!({ "slots": slots })))
            })
            .await?;

        session
            .record_enhanced(outcomes)
            .map_err(|err| PipelineError::transition("enhance", err))
    }

    /// Record the client's pick (1-based) and generate the listing copy for it.
    pub async fn select(
        &self,
        id: SessionId,
        option: i64,
        tone: Option<String>,
        lang: Option<String>,
    ) -> Result<DescribedView, PipelineError> {
        let guard = self.store.checkout(id).await?;
        let option = slot_number(option)?;

        match guard.stage {
            stage if stage < Stage::Enhanced => {
                return Err(PipelineError::illegal_transition(
                    "select",
                    format!("renditions are not ready; session is at `{stage}`"),
                ));
            }
            Stage::Enhanced => {}
            _ => {
                if let Some(chosen) = guard.chosen_index
                    && chosen != option
                {
                    return Err(PipelineError::illegal_transition(
                        "select",
                        format!("option {chosen} was already chosen"),
                    ));
                }
                if guard.stage == Stage::Described {
                    return guard.described_view(true).ok_or_else(|| {
                        PipelineError::internal("select", "described session is missing artifacts")
                    });
                }
            }
        }

        let tone = non_blank(tone).unwrap_or_else(|| self.policy.default_tone.to_string());
        let lang = non_blank(lang).unwrap_or_else(|| self.policy.default_lang.to_string());
        let this = self.clone();
        tokio::spawn(async move { this.choose_and_describe(guard, option, tone, lang).await })
            .await
            .map_err(|err| PipelineError::internal("select", err.to_string()))?
    }

    async fn choose_and_describe(
        &self,
        mut guard: OwnedMutexGuard<PipelineSession>,
        option: u8,
        tone: String,
        lang: String,
    ) -> Result<DescribedView, PipelineError> {
        let session = &mut *guard;
        if session.stage == Stage::Enhanced {
            let slot = session
                .enhancements
                .as_ref()
                .and_then(|slots| slots.get(usize::from(option) - 1))
                .ok_or_else(|| {
                    PipelineError::invalid_selection(format!("slot {option} holds no rendition"))
                })?;
            let output = json!({ "option": option, "strategy": slot.strategy, "status": slot.status });
            self.capture_stage("select", &mut session.reports, async move {
                Ok(StageOutcome::new((), output))
            })
            .await?;
            session
                .record_selected(option)
                .map_err(|err| PipelineError::transition("select", err))?;
        }

        self.describe(session, tone, lang).await?;
        session.touch(Utc::now());
        session
            .described_view(false)
            .ok_or_else(|| PipelineError::internal("describe", "description left no artifacts"))
    }

    async fn describe(
        &self,
        session: &mut PipelineSession,
        tone: String,
        lang: String,
    ) -> Result<(), PipelineError> {
        let chosen = session
            .chosen()
            .map(|slot| slot.image.clone())
            .ok_or_else(|| PipelineError::illegal_transition("describe", "no rendition chosen"))?;
        let session_id = session.id;
        let describer = self.adapters.describer.clone();
        let limit = self.policy.adapter_timeout;

        let outcome = self
            .capture_stage("describe", &mut session.reports, async move {
                let call = {
                    let (describer, tone, lang) = (describer.clone(), tone.clone(), lang.clone());
                    async move { describer.describe(&chosen, &tone, &lang).await }
                };
                let outcome = match isolated(limit, call).await {
                    Ok(listing @ ListingDescription::Structured(_)) => DescriptionOutcome {
                        listing,
                        status: DescriptionStatus::Generated,
                    },
                    Ok(listing @ ListingDescription::RawText { .. }) => {
                        warn!(
                            target = "studio.adapters",
                            session_id = %session_id,
                            adapter = describer.name(),
                            "description_unparsed"
                        );
                        DescriptionOutcome {
                            listing,
                            status: DescriptionStatus::FallbackUsed {
                                reason: "model output was not well-formed listing JSON".into(),
                            },
                        }
                    }
                    Err(err) => {
                        warn!(
                            target = "studio.adapters",
                            session_id = %session_id,
                            adapter = describer.name(),
                            error = %err,
                            "description_failed"
                        );
                        DescriptionOutcome {
                            listing: ListingDescription::RawText {
                                text: format!("Error generating description: {err}"),
                            },
                            status: DescriptionStatus::FallbackUsed {
                                reason: err.to_string(),
                            },
                        }
                    }
                };
                let output = json!({
                    "tone": tone,
                    "lang": lang,
                    "description": outcome.status,
                });
                Ok(StageOutcome::new(outcome, output))
            })
            .await?;

        session
            .record_described(outcome)
            .map_err(|err| PipelineError::transition("describe", err))
    }

    /// Waits for any stage in flight to commit, then reads without refreshing
    /// the idle timer.
    pub async fn summary(&self, id: SessionId) -> Result<SessionSummary, PipelineError> {
        let handle = self.store.get(id).await?;
        let session = handle.lock().await;
        Ok(session.summary())
    }

    pub async fn cleanup(&self, id: SessionId) -> Result<(), PipelineError> {
        self.store.delete(id).await?;
        info!(target = "studio.pipeline", session_id = %id, "session_cleaned_up");
        Ok(())
    }

    async fn capture_stage<T, Fut>(
        &self,
        name: &'static str,
        reports: &mut Vec<StageReport>,
        fut: Fut,
    ) -> Result<T, PipelineError>
    where
        Fut: Future<Output = Result<StageOutcome<T>, PipelineError>>,
    {
        let started = Instant::now();
        let outcome = fut.await?;
        let elapsed_ms = started.elapsed().as_millis();
        crate::metrics::stage_elapsed(name, elapsed_ms);
        reports.push(StageReport::new(name, elapsed_ms, outcome.output));
        Ok(outcome.value)
    }
}

/// One strategy under [`isolated`]. Whatever happens, the slot is filled:
/// errors, timeouts and panics fall back to `base`.
async fn attempt(
    strategy: Arc<dyn ImageTransform>,
    base: ImageHandle,
    limit: Duration,
    session_id: SessionId,
) -> EnhancementOutcome {
    let name = strategy.name();
    let input = base.clone();
    let call = async move { strategy.transform(&input).await };
    let outcome = match isolated(limit, call).await {
        Ok(image) => EnhancementOutcome::success(name, image),
        Err(TransformError::Unavailable(reason)) => EnhancementOutcome::fallback(name, base, reason),
        Err(err) => EnhancementOutcome::failed(name, base, err.to_string()),
    };
    if outcome.status != EnhancementStatus::Success {
        warn!(
            target = "studio.adapters",
            session_id = %session_id,
            strategy = name,
            status = ?outcome.status,
            "enhancement_degraded"
        );
    }
    crate::metrics::enhancement_outcome(name, outcome.status_label());
    outcome
}

/// Run an adapter call on its own task under `limit`. A panic inside the
/// adapter comes back as [`TransformError::Panicked`] instead of unwinding
/// into the stage.
async fn isolated<T, F>(limit: Duration, fut: F) -> Result<T, TransformError>
where
    T: Send + 'static,
    F: Future<Output = Result<T, TransformError>> + Send + 'static,
{
    match tokio::spawn(bounded(limit, fut)).await {
        Ok(result) => result,
        Err(join) if join.is_panic() => Err(TransformError::Panicked),
        Err(join) => Err(TransformError::Processing(join.to_string())),
    }
}

async fn bounded<T, F>(limit: Duration, fut: F) -> Result<T, TransformError>
where
    F: Future<Output = Result<T, TransformError>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .unwrap_or_else(|_| Err(TransformError::TimedOut(limit)))
}

/// Highest confidence at or above `floor` wins; on equal confidence the
/// candidate the detector listed first is kept. Boxes that fall outside the
/// image are ignored.
pub fn pick_candidate(
    candidates: &[Candidate],
    floor: f32,
    width: u32,
    height: u32,
) -> Option<(Candidate, CropRect)> {
    let mut best: Option<(&Candidate, CropRect)> = None;
    for candidate in candidates {
        if !(candidate.confidence >= floor) {
            continue;
        }
        let Some(rect) = candidate.bbox.clamp_to(width, height) else {
            continue;
        };
        match best {
            Some((current, _)) if candidate.confidence <= current.confidence => {}
            _ => best = Some((candidate, rect)),
        }
    }
    best.map(|(candidate, rect)| (candidate.clone(), rect))
}

fn slot_number(option: i64) -> Result<u8, PipelineError> {
    match u8::try_from(option) {
        Ok(n @ 1..=3) => Ok(n),
        _ => Err(PipelineError::invalid_selection(format!(
            "option {option} is outside 1..=3"
        ))),
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[derive(Debug, Error)]
#[error("stage `{stage}` failed: {message}")]
pub struct PipelineError {
    stage: &'static str,
    message: String,
    kind: PipelineErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineErrorKind {
    Decode,
    Segmentation,
    SessionNotFound,
    InvalidSelection,
    IllegalStageTransition,
    Internal,
}

impl PipelineErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineErrorKind::Decode => "decode_error",
            PipelineErrorKind::Segmentation => "segmentation_error",
            PipelineErrorKind::SessionNotFound => "session_not_found",
            PipelineErrorKind::InvalidSelection => "invalid_selection",
            PipelineErrorKind::IllegalStageTransition => "illegal_stage_transition",
            PipelineErrorKind::Internal => "internal",
        }
    }
}

impl PipelineError {
    fn new(stage: &'static str, kind: PipelineErrorKind, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind,
        }
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::new("load", PipelineErrorKind::Decode, message)
    }

    pub fn segmentation(message: impl Into<String>) -> Self {
        Self::new("remove_background", PipelineErrorKind::Segmentation, message)
    }

    pub fn not_found(stage: &'static str, message: impl Into<String>) -> Self {
        Self::new(stage, PipelineErrorKind::SessionNotFound, message)
    }

    pub fn invalid_selection(message: impl Into<String>) -> Self {
        Self::new("select", PipelineErrorKind::InvalidSelection, message)
    }

    pub fn illegal_transition(stage: &'static str, message: impl Into<String>) -> Self {
        Self::new(stage, PipelineErrorKind::IllegalStageTransition, message)
    }

    pub fn internal(stage: &'static str, message: impl Into<String>) -> Self {
        Self::new(stage, PipelineErrorKind::Internal, message)
    }

    fn transition(stage: &'static str, err: TransitionError) -> Self {
        Self::illegal_transition(stage, err.to_string())
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    pub fn kind(&self) -> PipelineErrorKind {
        self.kind
    }

    pub fn detail(&self) -> &str {
        &self.message
    }
}

impl From<StoreError> for PipelineError {
    fn from(value: StoreError) -> Self {
        Self::not_found("session", value.to_string())
    }
}

#[derive(Debug)]
pub struct StageOutcome<T> {
    pub value: T,
    pub output: Value,
}

impl<T> StageOutcome<T> {
    fn new(value: T, output: Value) -> Self {
        Self { value, output }
    }
}
