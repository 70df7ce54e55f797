pub mod cleanup;
pub mod store;

use std::{fmt, path::PathBuf};

use image::{DynamicImage, GrayImage};

use crate::vision::fingerprint::{BlockDescriptor, FingerprintEngine, HashFingerprint};

pub use cleanup::{CleanupOptions, CleanupSummary, CleanupTolerances};
pub use store::TemplateStore;

/// Storage tier of a template. Each tier is its own directory on disk and a
/// template lives in exactly one of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Tier {
    /// Hand-curated templates, clicked before anything else.
    Priority,
    /// Templates promoted from observations.
    Learned,
    /// Patterns that must never be learned; matches only warn.
    NoClick,
    /// Representatives of observations that have not been promoted yet.
    Pending,
}

impl Tier {
    pub const ALL: [Tier; 4] = [Tier::Priority, Tier::Learned, Tier::NoClick, Tier::Pending];

    pub fn dir_name(self) -> &'static str {
        match self {
            Tier::Priority => "user_priority",
            Tier::Learned => "learned",
            Tier::NoClick => "no_click",
            Tier::Pending => "temp_observed",
        }
    }

    pub fn is_clickable(self) -> bool {
        matches!(self, Tier::Priority | Tier::Learned)
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// A loaded template asset with its precomputed descriptors.
#[derive(Debug, Clone)]
pub struct Template {
    pub id: String,
    pub tier: Tier,
    pub path: PathBuf,
    /// Milliseconds since the Unix epoch.
    pub created_at: i64,
    pub fingerprint: HashFingerprint,
    pub blocks: BlockDescriptor,
    pub luma: GrayImage,
}

impl Template {
    pub fn from_image(
        id: impl Into<String>,
        tier: Tier,
        path: PathBuf,
        created_at: i64,
        image: &DynamicImage,
        fingerprints: &FingerprintEngine,
    ) -> Self {
        Self {
            id: id.into(),
            tier,
            path,
            created_at,
            fingerprint: fingerprints.hash(image),
            blocks: fingerprints.blocks(image),
            luma: image.to_luma8(),
        }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.luma.dimensions()
    }
}

/// In-memory snapshot of every tier, each sorted by id.
#[derive(Debug, Clone, Default)]
pub struct TemplateLibrary {
    priority: Vec<Template>,
    learned: Vec<Template>,
    no_click: Vec<Template>,
    pending: Vec<Template>,
}

impl TemplateLibrary {
    pub fn from_templates(templates: impl IntoIterator<Item = Template>) -> Self {
        let mut library = Self::default();
        for template in templates {
            library.tier_mut(template.tier).push(template);
        }
        for tier in Tier::ALL {
            library.tier_mut(tier).sort_by(|a, b| a.id.cmp(&b.id));
        }
        library
    }

    pub fn tier(&self, tier: Tier) -> &[Template] {
        match tier {
            Tier::Priority => &self.priority,
            Tier::Learned => &self.learned,
            Tier::NoClick => &self.no_click,
            Tier::Pending => &self.pending,
        }
    }

    fn tier_mut(&mut self, tier: Tier) -> &mut Vec<Template> {
        match tier {
            Tier::Priority => &mut self.priority,
            Tier::Learned => &mut self.learned,
            Tier::NoClick => &mut self.no_click,
            Tier::Pending => &mut self.pending,
        }
    }

    pub fn find(&self, tier: Tier, id: &str) -> Option<&Template> {
        self.tier(tier).iter().find(|template| template.id == id)
    }

    pub fn len(&self) -> usize {
        Tier::ALL.iter().map(|tier| self.tier(*tier).len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn template(id: &str, tier: Tier) -> Template {
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(8, 8, Rgb([10, 20, 30])));
        let engine = FingerprintEngine::new(8, (32, 32), (4, 4));
        Template::from_image(id, tier, PathBuf::from(format!("{id}.png")), 0, &image, &engine)
    }

    #[test]
    fn library_groups_by_tier_and_sorts_by_id() {
        let library = TemplateLibrary::from_templates([
            template("b", Tier::Learned),
            template("p", Tier::Priority),
            template("a", Tier::Learned),
            template("x", Tier::NoClick),
        ]);

        let learned: Vec<&str> = library.tier(Tier::Learned).iter().map(|t| t.id.as_str()).collect();
        assert_eq!(learned, vec!["a", "b"]);
        assert_eq!(library.tier(Tier::Priority).len(), 1);
        assert!(library.tier(Tier::Pending).is_empty());
        assert_eq!(library.len(), 4);
        assert!(library.find(Tier::NoClick, "x").is_some());
        assert!(library.find(Tier::Learned, "x").is_none());
    }

    #[test]
    fn only_priority_and_learned_are_clickable() {
        assert!(Tier::Priority.is_clickable());
        assert!(Tier::Learned.is_clickable());
        assert!(!Tier::NoClick.is_clickable());
        assert!(!Tier::Pending.is_clickable());
        assert_eq!(Tier::Pending.to_string(), "temp_observed");
    }
}
