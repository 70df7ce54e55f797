use std::collections::HashMap;
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::templates::Tier;
use crate::vision::matcher::TierMatch;
use crate::vision::region::Region;

/// A template that almost matched during the last scan.
#[derive(Debug, Clone, PartialEq)]
pub struct NearMiss {
    pub tier: Tier,
    pub template_id: String,
    pub score: f64,
    pub region: Region,
    pub expires_at: Instant,
}

/// A pending question for the operator: should this template be refreshed?
#[derive(Debug, Clone, PartialEq)]
pub struct RefinementRequest {
    pub request_id: String,
    pub near_miss: NearMiss,
    pub deadline: Instant,
}

/// Keeps the near misses of the most recent scan and turns a manual click on
/// one of them into a refinement request. Only one request is open at a time.
///
/// Clicks are judged at the moment they happened, not when they are handled:
/// a click that predates the latest scan is checked against the list that
/// scan replaced.
pub struct RefinementTracker {
    near_misses: Vec<NearMiss>,
    superseded: Vec<NearMiss>,
    last_scan_at: Option<Instant>,
    pending: Option<RefinementRequest>,
    window: Duration,
    prompt_timeout: Duration,
}

impl RefinementTracker {
    pub fn new(window: Duration, prompt_timeout: Duration) -> Self {
        Self {
            near_misses: Vec::new(),
            superseded: Vec::new(),
            last_scan_at: None,
            pending: None,
            window,
            prompt_timeout,
        }
    }

    pub fn set_timing(&mut self, window: Duration, prompt_timeout: Duration) {
        self.window = window;
        self.prompt_timeout = prompt_timeout;
    }

    /// Replaces the near-miss list with the ones from a scan that completed
    /// at `completed_at`.
    pub fn record_scan(&mut self, near_misses: &[TierMatch], completed_at: Instant) {
        let expires_at = completed_at + self.window;
        let latest = near_misses
            .iter()
            .map(|near| NearMiss {
                tier: near.tier,
                template_id: near.result.template_id.clone(),
                score: near.result.score,
                region: near.result.region,
                expires_at,
            })
            .collect();
        self.superseded = std::mem::replace(&mut self.near_misses, latest);
        self.last_scan_at = Some(completed_at);
    }

    pub fn near_misses(&self) -> &[NearMiss] {
        &self.near_misses
    }

    pub fn pending(&self) -> Option<&RefinementRequest> {
        self.pending.as_ref()
    }

    /// Opens a request when a click made at `at` lands inside a near miss
    /// that was live at that moment.
    pub fn on_manual_click(&mut self, x: i32, y: i32, at: Instant) -> Option<RefinementRequest> {
        if self.pending.is_some() {
            return None;
        }

        let live = if self.last_scan_at.is_some_and(|scan| at < scan) {
            &self.superseded
        } else {
            &self.near_misses
        };
        let near_miss = live
            .iter()
            .find(|near| at < near.expires_at && near.region.contains(x, y))?
            .clone();

        let request = RefinementRequest {
            request_id: Uuid::new_v4().simple().to_string(),
            near_miss,
            deadline: at + self.prompt_timeout,
        };
        self.pending = Some(request.clone());
        Some(request)
    }

    /// Closes the open request. The near-miss list is cleared whatever the
    /// answer; the near miss is returned only when it was accepted.
    pub fn resolve(&mut self, accepted: bool) -> Option<NearMiss> {
        let request = self.pending.take()?;
        self.forget_near_misses();
        accepted.then_some(request.near_miss)
    }

    /// Drops an unanswered request once its deadline has passed. Returns
    /// the request that timed out.
    pub fn expire(&mut self, now: Instant) -> Option<RefinementRequest> {
        if self.pending.as_ref().is_some_and(|request| now >= request.deadline) {
            self.forget_near_misses();
            return self.pending.take();
        }
        None
    }

    pub fn clear(&mut self) {
        self.forget_near_misses();
        self.pending = None;
    }

    fn forget_near_misses(&mut self) {
        self.near_misses.clear();
        self.superseded.clear();
    }
}

/// A template located near a manual click, with its block similarity to
/// what was clicked.
#[derive(Debug, Clone, PartialEq)]
pub struct AutoTrainCandidate {
    pub tier: Tier,
    pub template_id: String,
    pub region: Region,
    pub similarity: f64,
}

/// Counts how often the operator clicks on top of a located template and
/// reports when a template has been hit often enough to refresh it.
pub struct AutoTrainer {
    hits: HashMap<(Tier, String), u32>,
    match_threshold: f64,
    pixel_distance: f64,
    hit_threshold: u32,
}

impl AutoTrainer {
    pub fn new(match_threshold: f64, pixel_distance: f64, hit_threshold: u32) -> Self {
        Self {
            hits: HashMap::new(),
            match_threshold,
            pixel_distance,
            hit_threshold: hit_threshold.max(1),
        }
    }

    pub fn configure(&mut self, match_threshold: f64, pixel_distance: f64, hit_threshold: u32) {
        self.match_threshold = match_threshold;
        self.pixel_distance = pixel_distance;
        self.hit_threshold = hit_threshold.max(1);
    }

    /// The most similar candidate whose centre is within the pixel distance
    /// of the click and whose similarity clears the match threshold.
    pub fn best_candidate(
        &self,
        click: (i32, i32),
        candidates: Vec<AutoTrainCandidate>,
    ) -> Option<AutoTrainCandidate> {
        candidates
            .into_iter()
            .filter(|candidate| {
                let (cx, cy) = candidate.region.center();
                let dx = f64::from(cx) - f64::from(click.0);
                let dy = f64::from(cy) - f64::from(click.1);
                (dx * dx + dy * dy).sqrt() <= self.pixel_distance
            })
            .max_by(|a, b| a.similarity.total_cmp(&b.similarity))
            .filter(|best| best.similarity >= self.match_threshold)
    }

    /// Counts a hit. Returns the new count and whether it reached the
    /// threshold, in which case the counter starts over.
    pub fn register_hit(&mut self, tier: Tier, template_id: &str) -> (u32, bool) {
        let key = (tier, template_id.to_string());
        let count = self.hits.entry(key.clone()).or_insert(0);
        *count += 1;
        let current = *count;

        if current >= self.hit_threshold {
            self.hits.remove(&key);
            return (current, true);
        }
        (current, false)
    }

    pub fn reset(&mut self) {
        self.hits.clear();
    }
}
