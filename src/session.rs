//! Per-upload progress record.
//!
//! A [`PipelineSession`] only moves forward: every `record_*` method checks
//! that the session sits exactly one stage before the target and refuses
//! otherwise, so no stage is ever re-entered and artifacts are written once.

use crate::adapters::{Candidate, ListingDescription};
use crate::codec::ImageHandle;
use crate::models::{SessionSummary, SlotSummary, StageReport};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

pub type SessionId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Created,
    Loaded,
    Detected,
    BackgroundRemoved,
    Enhanced,
    Selected,
    Described,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Created => "created",
            Stage::Loaded => "loaded",
            Stage::Detected => "detected",
            Stage::BackgroundRemoved => "background_removed",
            Stage::Enhanced => "enhanced",
            Stage::Selected => "selected",
            Stage::Described => "described",
        }
    }

    pub fn next(self) -> Option<Stage> {
        match self {
            Stage::Created => Some(Stage::Loaded),
            Stage::Loaded => Some(Stage::Detected),
            Stage::Detected => Some(Stage::BackgroundRemoved),
            Stage::BackgroundRemoved => Some(Stage::Enhanced),
            Stage::Enhanced => Some(Stage::Selected),
            Stage::Selected => Some(Stage::Described),
            Stage::Described => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("cannot move from `{from}` to `{to}`")]
pub struct TransitionError {
    pub from: Stage,
    pub to: Stage,
}

/// How an enhancement slot was filled. Anything but `Success` carries the
/// background-removed image as a pass-through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EnhancementStatus {
    Success,
    /// The strategy is not available in this deployment; nothing was attempted.
    FallbackUsed { reason: String },
    /// The strategy was attempted and errored, timed out or panicked.
    Failed { reason: String },
}

#[derive(Debug, Clone)]
pub struct EnhancementOutcome {
    pub strategy: String,
    pub image: ImageHandle,
    pub status: EnhancementStatus,
}

impl EnhancementOutcome {
    pub fn success(strategy: &str, image: ImageHandle) -> Self {
        Self {
            strategy: strategy.to_string(),
            image,
            status: EnhancementStatus::Success,
        }
    }

    pub fn fallback(strategy: &str, passthrough: ImageHandle, reason: impl Into<String>) -> Self {
        Self {
            strategy: strategy.to_string(),
            image: passthrough,
            status: EnhancementStatus::FallbackUsed {
                reason: reason.into(),
            },
        }
    }

    pub fn failed(strategy: &str, passthrough: ImageHandle, reason: impl Into<String>) -> Self {
        Self {
            strategy: strategy.to_string(),
            image: passthrough,
            status: EnhancementStatus::Failed {
                reason: reason.into(),
            },
        }
    }

    pub fn status_label(&self) -> &'static str {
        match self.status {
            EnhancementStatus::Success => "success",
            EnhancementStatus::FallbackUsed { .. } => "fallback_used",
            EnhancementStatus::Failed { .. } => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DescriptionStatus {
    Generated,
    FallbackUsed { reason: String },
}

#[derive(Debug, Clone)]
pub struct DescriptionOutcome {
    pub listing: ListingDescription,
    pub status: DescriptionStatus,
}

#[derive(Debug)]
pub struct PipelineSession {
    pub id: SessionId,
    pub stage: Stage,
    pub raw_image: Option<ImageHandle>,
    pub detection: Option<Candidate>,
    pub used_full_frame: bool,
    pub cropped_image: Option<ImageHandle>,
    pub no_background_image: Option<ImageHandle>,
    pub enhancements: Option<[EnhancementOutcome; 3]>,
    pub chosen_index: Option<u8>,
    pub description: Option<DescriptionOutcome>,
    pub created_at: DateTime<Utc>,
    pub last_touched_at: DateTime<Utc>,
    pub reports: Vec<StageReport>,
}

impl PipelineSession {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            stage: Stage::Created,
            raw_image: None,
            detection: None,
            used_full_frame: false,
            cropped_image: None,
            no_background_image: None,
            enhancements: None,
            chosen_index: None,
            description: None,
            created_at: now,
            last_touched_at: now,
            reports: Vec::new(),
        }
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.last_touched_at {
            self.last_touched_at = now;
        }
    }

    pub fn is_idle(&self, now: DateTime<Utc>, ttl: chrono::Duration) -> bool {
        now - self.last_touched_at > ttl
    }

    fn advance(&mut self, to: Stage) -> Result<(), TransitionError> {
        if self.stage.next() != Some(to) {
            return Err(TransitionError {
                from: self.stage,
                to,
            });
        }
        self.stage = to;
        Ok(())
    }

    pub fn record_loaded(&mut self, raw: ImageHandle) -> Result<(), TransitionError> {
        self.advance(Stage::Loaded)?;
        self.raw_image = Some(raw);
        Ok(())
    }

    pub fn record_detected(
        &mut self,
        detection: Option<Candidate>,
        crop: ImageHandle,
    ) -> Result<(), TransitionError> {
        self.advance(Stage::Detected)?;
        self.used_full_frame = detection.is_none();
        self.detection = detection;
        self.cropped_image = Some(crop);
        Ok(())
    }

    pub fn record_background_removed(&mut self, image: ImageHandle) -> Result<(), TransitionError> {
        self.advance(Stage::BackgroundRemoved)?;
        self.no_background_image = Some(image);
        Ok(())
    }

    pub fn record_enhanced(
        &mut self,
        outcomes: [EnhancementOutcome; 3],
    ) -> Result<(), TransitionError> {
        self.advance(Stage::Enhanced)?;
        self.enhancements = Some(outcomes);
        Ok(())
    }

    /// `option` is the 1-based slot number, already validated by the caller.
    pub fn record_selected(&mut self, option: u8) -> Result<(), TransitionError> {
        self.advance(Stage::Selected)?;
        self.chosen_index = Some(option);
        Ok(())
    }

    pub fn record_described(&mut self, outcome: DescriptionOutcome) -> Result<(), TransitionError> {
        self.advance(Stage::Described)?;
        self.description = Some(outcome);
        Ok(())
    }

    pub fn chosen(&self) -> Option<&EnhancementOutcome> {
        let option = self.chosen_index?;
        self.enhancements
            .as_ref()?
            .get(usize::from(option).checked_sub(1)?)
    }

    pub fn processed_view(&self, cached: bool) -> Option<ProcessedView> {
        Some(ProcessedView {
            session_id: self.id,
            original: self.raw_image.clone()?,
            no_background: self.no_background_image.clone()?,
            enhancements: self.enhancements.clone()?,
            detection: self.detection.clone(),
            used_full_frame: self.used_full_frame,
            stages: self.reports.clone(),
            cached,
        })
    }

    pub fn described_view(&self, cached: bool) -> Option<DescribedView> {
        let chosen = self.chosen()?;
        let description = self.description.clone()?;
        Some(DescribedView {
            session_id: self.id,
            option_number: self.chosen_index?,
            chosen: chosen.clone(),
            description,
            cached,
        })
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.id.to_string(),
            stage: self.stage,
            created_at: self.created_at,
            last_touched_at: self.last_touched_at,
            used_full_frame: self.used_full_frame,
            chosen_index: self.chosen_index,
            enhancements: self
                .enhancements
                .iter()
                .flatten()
                .map(|slot| SlotSummary {
                    strategy: slot.strategy.clone(),
                    status: slot.status.clone(),
                })
                .collect(),
        }
    }
}

/// Artifacts handed back once the session has reached `Enhanced`.
#[derive(Debug, Clone)]
pub struct ProcessedView {
    pub session_id: SessionId,
    pub original: ImageHandle,
    pub no_background: ImageHandle,
    pub enhancements: [EnhancementOutcome; 3],
    pub detection: Option<Candidate>,
    pub used_full_frame: bool,
    pub stages: Vec<StageReport>,
    pub cached: bool,
}

#[derive(Debug, Clone)]
pub struct DescribedView {
    pub session_id: SessionId,
    pub option_number: u8,
    pub chosen: EnhancementOutcome,
    pub description: DescriptionOutcome,
    pub cached: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::DynamicImage;

    fn img() -> ImageHandle {
        ImageHandle::new(DynamicImage::new_rgb8(2, 2))
    }

    fn enhanced_session() -> PipelineSession {
        let mut s = PipelineSession::new(Utc::now());
        s.record_loaded(img()).unwrap();
        s.record_detected(None, img()).unwrap();
        s.record_background_removed(img()).unwrap();
        let base = img();
        s.record_enhanced([
            EnhancementOutcome::success("gentle", img()),
            EnhancementOutcome::failed("upscale", base.clone(), "HTTP 503"),
            EnhancementOutcome::fallback("retouch", base, "not deployed"),
        ])
        .unwrap();
        s
    }

    #[test]
    fn stages_are_ordered() {
        assert!(Stage::Created < Stage::Loaded);
        assert!(Stage::Enhanced < Stage::Selected);
        assert_eq!(Stage::Described.next(), None);
    }

    #[test]
    fn skipping_a_stage_is_refused() {
        let mut s = PipelineSession::new(Utc::now());
        let err = s.record_detected(None, img()).unwrap_err();
        assert_eq!(
            err,
            TransitionError {
                from: Stage::Created,
                to: Stage::Detected
            }
        );
        assert_eq!(s.stage, Stage::Created);
        assert!(s.cropped_image.is_none());
    }

    #[test]
    fn stage_never_reentered() {
        let mut s = PipelineSession::new(Utc::now());
        s.record_loaded(img()).unwrap();
        assert!(s.record_loaded(img()).is_err());
    }

    #[test]
    fn full_frame_flag_follows_detection() {
        let mut s = PipelineSession::new(Utc::now());
        s.record_loaded(img()).unwrap();
        s.record_detected(None, img()).unwrap();
        assert!(s.used_full_frame);
    }

    #[test]
    fn chosen_index_is_written_once() {
        let mut s = enhanced_session();
        s.record_selected(2).unwrap();
        assert!(s.record_selected(3).is_err());
        assert_eq!(s.chosen_index, Some(2));
        let chosen = s.chosen().expect("slot 2");
        assert_eq!(chosen.strategy, "upscale");
        assert_eq!(chosen.status_label(), "failed");
    }

    #[test]
    fn processed_view_requires_enhancements() {
        let mut s = PipelineSession::new(Utc::now());
        s.record_loaded(img()).unwrap();
        assert!(s.processed_view(false).is_none());
        let view = enhanced_session().processed_view(true).expect("view");
        assert_eq!(view.enhancements.len(), 3);
        assert!(view.cached);
    }

    #[test]
    fn idle_measured_from_last_touch() {
        let start = Utc::now();
        let mut s = PipelineSession::new(start);
        let ttl = chrono::Duration::seconds(60);
        assert!(!s.is_idle(start + chrono::Duration::seconds(30), ttl));
        assert!(s.is_idle(start + chrono::Duration::seconds(61), ttl));
        s.touch(start + chrono::Duration::seconds(50));
        assert!(!s.is_idle(start + chrono::Duration::seconds(61), ttl));
    }
}
