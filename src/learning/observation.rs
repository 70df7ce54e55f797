use std::path::PathBuf;

use image::DynamicImage;
use uuid::Uuid;

use crate::errors::AgentResult;
use crate::templates::{CleanupOptions, CleanupSummary, TemplateStore};
use crate::utils::fs::remove_if_exists;
use crate::vision::fingerprint::HashFingerprint;

const ENABLE_LOGS: bool = true;

use crate::{log_diag, log_info, log_warn};

/// A cluster of similar manual clicks that has not been promoted yet.
#[derive(Debug, Clone)]
pub struct Observation {
    pub group_id: String,
    /// Fingerprint of the first capture; later captures are compared to it.
    pub fingerprint: HashFingerprint,
    /// Asset that becomes the learned template on promotion.
    pub representative: PathBuf,
    /// Later captures kept as supporting evidence.
    pub evidence: Vec<PathBuf>,
    pub count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObservationOutcome {
    Started { group_id: String },
    Reinforced { group_id: String, count: u32 },
    Promoted { template_id: String, cleanup: CleanupSummary },
}

pub struct ObservationTracker {
    pending: Vec<Observation>,
    confidence_threshold: u32,
    duplicate_tolerance: u32,
}

impl ObservationTracker {
    pub fn new(confidence_threshold: u32, duplicate_tolerance: u32) -> Self {
        Self {
            pending: Vec::new(),
            confidence_threshold: confidence_threshold.max(1),
            duplicate_tolerance,
        }
    }

    pub fn set_limits(&mut self, confidence_threshold: u32, duplicate_tolerance: u32) {
        self.confidence_threshold = confidence_threshold.max(1);
        self.duplicate_tolerance = duplicate_tolerance;
    }

    pub fn pending(&self) -> &[Observation] {
        &self.pending
    }

    /// Fingerprints a manual-click capture and folds it into the pending set.
    pub fn observe(
        &mut self,
        store: &mut TemplateStore,
        capture: &DynamicImage,
        cleanup: CleanupOptions,
    ) -> AgentResult<ObservationOutcome> {
        let fingerprint = store.fingerprints().hash(capture);
        self.observe_fingerprinted(store, capture, fingerprint, cleanup)
    }

    /// Same as [`observe`](Self::observe) with the fingerprint already known.
    ///
    /// The first pending observation within `duplicate_tolerance` wins, even if
    /// a later one is closer. Evidence is persisted before the count moves, so
    /// a failed write leaves the observation exactly as it was.
    pub fn observe_fingerprinted(
        &mut self,
        store: &mut TemplateStore,
        capture: &DynamicImage,
        fingerprint: HashFingerprint,
        cleanup: CleanupOptions,
    ) -> AgentResult<ObservationOutcome> {
        let matched = self
            .pending
            .iter()
            .position(|obs| obs.fingerprint.within(&fingerprint, self.duplicate_tolerance));

        let Some(index) = matched else {
            let group_id = Uuid::new_v4().simple().to_string();
            let representative = store.write_pending(&group_id, capture)?;
            self.pending.push(Observation {
                group_id: group_id.clone(),
                fingerprint,
                representative,
                evidence: Vec::new(),
                count: 1,
            });
            log_diag!(cleanup.quiet; "New observation {group_id} (1/{})", self.confidence_threshold);
            return Ok(ObservationOutcome::Started { group_id });
        };

        let observation = &mut self.pending[index];
        let evidence_name = format!("{}_{}", observation.group_id, observation.count + 1);
        let evidence = store.write_pending(&evidence_name, capture)?;
        observation.evidence.push(evidence);
        observation.count += 1;

        let count = observation.count;
        let group_id = observation.group_id.clone();
        log_diag!(cleanup.quiet; "Observation {group_id} reinforced ({count}/{})", self.confidence_threshold);

        if count < self.confidence_threshold {
            return Ok(ObservationOutcome::Reinforced { group_id, count });
        }

        let template_id = store.promote(&self.pending[index].representative)?;
        let promoted = self.pending.remove(index);
        for path in &promoted.evidence {
            if let Err(err) = remove_if_exists(path) {
                log_warn!("Could not remove evidence {}: {err}", path.display());
            }
        }
        log_info!("Learned new template {template_id} after {count} similar clicks");

        let summary = store.run_cleanup(cleanup);
        Ok(ObservationOutcome::Promoted {
            template_id,
            cleanup: summary,
        })
    }

    /// Drops every un-promoted observation together with its files.
    pub fn discard_all(&mut self, store: &TemplateStore) -> usize {
        let discarded = self.pending.len();
        self.pending.clear();
        store.discard_pending();
        discarded
    }
}
