use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::Arc,
    time::UNIX_EPOCH,
};

use chrono::Utc;
use image::{DynamicImage, ImageFormat};
use uuid::Uuid;

use crate::errors::{AgentError, AgentResult};
use crate::utils::fs::{list_images, remove_if_exists, write_atomically};
use crate::vision::fingerprint::FingerprintEngine;

use super::{Template, TemplateLibrary, Tier};

const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

/// Tiers that are loaded into the in-memory library. Pending assets are
/// only ever touched through the observation tracker.
const LOADED_TIERS: [Tier; 3] = [Tier::Priority, Tier::Learned, Tier::NoClick];

/// Owns the template directories and the library loaded from them.
pub struct TemplateStore {
    root: PathBuf,
    fingerprints: FingerprintEngine,
    library: Arc<TemplateLibrary>,
}

impl TemplateStore {
    /// Creates every tier directory under `root`, drops pending leftovers of a
    /// previous session and loads the library.
    pub fn open(root: impl Into<PathBuf>, fingerprints: FingerprintEngine) -> AgentResult<Self> {
        let root = root.into();
        for tier in Tier::ALL {
            let dir = root.join(tier.dir_name());
            fs::create_dir_all(&dir).map_err(|err| AgentError::persist(&dir, err))?;
        }

        let mut store = Self {
            root,
            fingerprints,
            library: Arc::new(TemplateLibrary::default()),
        };

        let stale = store.discard_pending();
        if stale > 0 {
            log_info!("Discarded {stale} stale pending capture(s) from a previous session");
        }

        store.reload();
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dir(&self, tier: Tier) -> PathBuf {
        self.root.join(tier.dir_name())
    }

    pub fn fingerprints(&self) -> &FingerprintEngine {
        &self.fingerprints
    }

    /// Shared snapshot of the library; cheap to hand to blocking workers.
    pub fn library(&self) -> Arc<TemplateLibrary> {
        Arc::clone(&self.library)
    }

    /// Rereads every loaded tier from disk. Unreadable assets are skipped.
    pub fn reload(&mut self) {
        let mut templates = Vec::new();

        for tier in LOADED_TIERS {
            let dir = self.dir(tier);
            let paths = match list_images(&dir) {
                Ok(paths) => paths,
                Err(err) => {
                    log_warn!("Could not list {}: {err}", dir.display());
                    continue;
                }
            };

            for path in paths {
                match self.load(tier, &path) {
                    Ok(template) => templates.push(template),
                    Err(err) => log_warn!("{err}"),
                }
            }
        }

        self.library = Arc::new(TemplateLibrary::from_templates(templates));
    }

    fn load(&self, tier: Tier, path: &Path) -> AgentResult<Template> {
        let image = image::open(path).map_err(|err| AgentError::TemplateLoadFailure {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?;
        let id = template_id(path);
        let created_at = created_at(&id, path);

        Ok(Template::from_image(
            id,
            tier,
            path.to_path_buf(),
            created_at,
            &image,
            &self.fingerprints,
        ))
    }

    /// Writes a capture into the pending directory as `<name>.png`.
    pub fn write_pending(&self, name: &str, image: &DynamicImage) -> AgentResult<PathBuf> {
        let path = self.dir(Tier::Pending).join(format!("{name}.png"));
        write_image(&path, image)?;
        Ok(path)
    }

    /// Moves a pending asset into the learned tier under a fresh id.
    /// The rename is the commit point: on failure the asset stays pending.
    pub fn promote(&mut self, pending: &Path) -> AgentResult<String> {
        let id = format!("{}-{}", Utc::now().timestamp_millis(), Uuid::new_v4().simple());
        let dest = self.dir(Tier::Learned).join(format!("{id}.png"));

        fs::rename(pending, &dest).map_err(|err| AgentError::persist(&dest, err))?;

        self.reload();
        Ok(id)
    }

    /// Replaces a template's pixels in place, keeping its tier, id and file
    /// format.
    pub fn overwrite(&mut self, tier: Tier, id: &str, image: &DynamicImage) -> AgentResult<Template> {
        let path = self
            .library
            .find(tier, id)
            .map(|template| template.path.clone())
            .ok_or_else(|| AgentError::UnknownTemplate(id.to_string()))?;

        write_image(&path, image)?;
        self.reload();

        self.library
            .find(tier, id)
            .cloned()
            .ok_or_else(|| AgentError::UnknownTemplate(id.to_string()))
    }

    /// Deletes every file in the pending directory and returns how many went.
    pub fn discard_pending(&self) -> usize {
        let dir = self.dir(Tier::Pending);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) => {
                log_warn!("Could not list {}: {err}", dir.display());
                return 0;
            }
        };

        let mut removed = 0;
        for path in entries.filter_map(|entry| entry.ok()).map(|entry| entry.path()) {
            if !path.is_file() {
                continue;
            }
            match remove_if_exists(&path) {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(err) => log_warn!("{}", AgentError::persist(&path, err)),
            }
        }
        removed
    }
}

/// Encodes in the format the extension names, since loading picks the
/// decoder the same way.
fn write_image(path: &Path, image: &DynamicImage) -> AgentResult<()> {
    let format = ImageFormat::from_path(path).unwrap_or(ImageFormat::Png);
    let rgb = DynamicImage::ImageRgb8(image.to_rgb8());
    write_atomically(path, |file| rgb.write_to(file, format).map_err(io::Error::other))
    .map_err(|err| AgentError::persist(path, err))
}

fn template_id(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Promoted ids are `{millis}-{uuid}`; anything else falls back to the file's
/// modification time.
fn created_at(id: &str, path: &Path) -> i64 {
    if let Some(millis) = promoted_millis(id) {
        return millis;
    }

    fs::metadata(path)
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|modified| modified.duration_since(UNIX_EPOCH).ok())
        .map(|since| since.as_millis() as i64)
        .unwrap_or(0)
}

fn promoted_millis(id: &str) -> Option<i64> {
    let (millis, suffix) = id.split_once('-')?;
    if suffix.len() != 32 || !millis.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Uuid::try_parse(suffix).ok()?;
    millis.parse().ok()
}
