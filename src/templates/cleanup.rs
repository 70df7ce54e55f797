use crate::errors::AgentError;
use crate::utils::fs::remove_if_exists;
use crate::vision::fingerprint::HashFingerprint;

use super::{store::TemplateStore, Template, Tier};

const ENABLE_LOGS: bool = true;

use crate::{log_diag, log_info, log_warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanupTolerances {
    /// Learned templates this close to a no_click template are deleted.
    pub forbidden: u32,
    /// Learned templates this close to each other are deduplicated.
    pub duplicate: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanupOptions {
    pub tolerances: CleanupTolerances,
    pub quiet: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FingerprintEntry {
    pub id: String,
    pub fingerprint: HashFingerprint,
    pub created_at: i64,
}

impl From<&Template> for FingerprintEntry {
    fn from(template: &Template) -> Self {
        Self {
            id: template.id.clone(),
            fingerprint: template.fingerprint.clone(),
            created_at: template.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateEviction {
    pub removed: String,
    pub kept: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupPlan {
    pub forbidden: Vec<String>,
    pub duplicates: Vec<DuplicateEviction>,
}

impl CleanupPlan {
    pub fn is_empty(&self) -> bool {
        self.forbidden.is_empty() && self.duplicates.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupSummary {
    pub forbidden_removed: usize,
    pub duplicates_removed: usize,
    pub failed: usize,
}

/// Decides which learned templates to delete.
///
/// Pass one removes every learned template within `forbidden` bits of any
/// no_click template. Pass two compares the survivors pairwise in list order
/// and, for each pair within `duplicate` bits, keeps the newer one (the
/// earlier-listed one on equal timestamps). A template marked for deletion is
/// not compared again, so chains like A~B, B~C with A≁C are resolved by
/// order rather than by closing over the whole group.
pub fn plan_cleanup(
    learned: &[FingerprintEntry],
    no_click: &[FingerprintEntry],
    tolerances: CleanupTolerances,
) -> CleanupPlan {
    let mut plan = CleanupPlan::default();

    let survivors: Vec<&FingerprintEntry> = learned
        .iter()
        .filter(|entry| {
            let forbidden = no_click
                .iter()
                .any(|blocked| entry.fingerprint.within(&blocked.fingerprint, tolerances.forbidden));
            if forbidden {
                plan.forbidden.push(entry.id.clone());
            }
            !forbidden
        })
        .collect();

    let mut deleted = vec![false; survivors.len()];
    for i in 0..survivors.len() {
        if deleted[i] {
            continue;
        }
        for j in (i + 1)..survivors.len() {
            if deleted[j] {
                continue;
            }
            let (a, b) = (survivors[i], survivors[j]);
            if !a.fingerprint.within(&b.fingerprint, tolerances.duplicate) {
                continue;
            }

            if a.created_at >= b.created_at {
                deleted[j] = true;
                plan.duplicates.push(DuplicateEviction {
                    removed: b.id.clone(),
                    kept: a.id.clone(),
                });
            } else {
                deleted[i] = true;
                plan.duplicates.push(DuplicateEviction {
                    removed: a.id.clone(),
                    kept: b.id.clone(),
                });
                break;
            }
        }
    }

    plan
}

impl TemplateStore {
    /// Runs both eviction passes over the learned tier and deletes the losers.
    /// Running it again on the result deletes nothing.
    pub fn run_cleanup(&mut self, options: CleanupOptions) -> CleanupSummary {
        let library = self.library();
        let learned: Vec<FingerprintEntry> = library.tier(Tier::Learned).iter().map(Into::into).collect();
        let no_click: Vec<FingerprintEntry> = library.tier(Tier::NoClick).iter().map(Into::into).collect();

        let plan = plan_cleanup(&learned, &no_click, options.tolerances);
        let mut summary = CleanupSummary::default();
        if plan.is_empty() {
            log_diag!(options.quiet; "Cleanup: nothing to remove among {} learned template(s)", learned.len());
            return summary;
        }

        for id in &plan.forbidden {
            if self.delete_learned(id) {
                summary.forbidden_removed += 1;
            } else {
                summary.failed += 1;
            }
        }
        for eviction in &plan.duplicates {
            if self.delete_learned(&eviction.removed) {
                summary.duplicates_removed += 1;
                log_diag!(options.quiet; "Removed duplicate {} (kept {})", eviction.removed, eviction.kept);
            } else {
                summary.failed += 1;
            }
        }

        log_info!(
            "Cleanup removed {} forbidden and {} duplicate template(s)",
            summary.forbidden_removed,
            summary.duplicates_removed
        );
        if summary.failed > 0 {
            log_warn!("Cleanup could not delete {} template(s); they are kept", summary.failed);
        }

        if summary.forbidden_removed + summary.duplicates_removed > 0 {
            self.reload();
        }
        summary
    }

    fn delete_learned(&self, id: &str) -> bool {
        let library = self.library();
        let Some(template) = library.find(Tier::Learned, id) else {
            return true;
        };

        match remove_if_exists(&template.path) {
            Ok(_) => true,
            Err(err) => {
                log_warn!("{}", AgentError::persist(&template.path, err));
                false
            }
        }
    }
}
