use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
    sync::{PoisonError, RwLock},
};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::agent::blacklist::DEFAULT_FORBIDDEN_APPS;
use crate::errors::{AgentError, AgentResult};
use crate::utils::fs::write_atomically;
use crate::vision::matcher::ScoringMethod;

const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

/// Every tunable of the agent. Stored as one flat JSON object; keys that are
/// missing or malformed in the file fall back to these defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Canonical size for block descriptors.
    pub resize_width: u32,
    pub resize_height: u32,
    /// Perceptual hash side; the hash has `hash_size²` bits.
    pub hash_size: u32,
    pub block_grid_cols: u32,
    pub block_grid_rows: u32,
    pub max_color_distance: f64,
    pub scoring_method: ScoringMethod,
    /// Minimum correlation for a template to count as "found on screen"
    /// when locating it (block scoring, auto-train, refinement search).
    pub locate_confidence: f64,

    pub priority_threshold: f64,
    pub learned_threshold: f64,
    pub no_click_threshold: f64,
    pub refinement_floor: f64,

    pub confidence_threshold: u32,
    pub duplicate_tolerance: u32,
    pub forbidden_tolerance: u32,
    pub capture_width: u32,
    pub capture_height: u32,

    pub scan_interval_ms: u64,
    pub click_cooldown_ms: u64,
    pub refinement_window_ms: u64,
    pub refinement_prompt_timeout_ms: u64,

    pub auto_train_match_threshold: f64,
    pub auto_train_pixel_distance: f64,
    pub auto_train_hit_threshold: u32,

    pub forbidden_apps: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            resize_width: 32,
            resize_height: 32,
            hash_size: 8,
            block_grid_cols: 4,
            block_grid_rows: 4,
            max_color_distance: 50.0,
            scoring_method: ScoringMethod::Correlation,
            locate_confidence: 0.7,
            priority_threshold: 0.90,
            learned_threshold: 0.80,
            no_click_threshold: 0.75,
            refinement_floor: 0.60,
            confidence_threshold: 3,
            duplicate_tolerance: 10,
            forbidden_tolerance: 5,
            capture_width: 100,
            capture_height: 40,
            scan_interval_ms: 1000,
            click_cooldown_ms: 100,
            refinement_window_ms: 1000,
            refinement_prompt_timeout_ms: 10_000,
            auto_train_match_threshold: 0.5,
            auto_train_pixel_distance: 30.0,
            auto_train_hit_threshold: 2,
            forbidden_apps: DEFAULT_FORBIDDEN_APPS.iter().map(|app| app.to_string()).collect(),
        }
    }
}

impl Settings {
    /// Resets every group of fields that breaks an invariant back to its
    /// defaults and returns the names of the groups that were reset.
    pub fn sanitize(&mut self) -> Vec<&'static str> {
        let defaults = Settings::default();
        let mut reset = Vec::new();

        for (name, value, default) in [
            ("priority_threshold", &mut self.priority_threshold, defaults.priority_threshold),
            ("learned_threshold", &mut self.learned_threshold, defaults.learned_threshold),
            ("no_click_threshold", &mut self.no_click_threshold, defaults.no_click_threshold),
            ("refinement_floor", &mut self.refinement_floor, defaults.refinement_floor),
            ("locate_confidence", &mut self.locate_confidence, defaults.locate_confidence),
            (
                "auto_train_match_threshold",
                &mut self.auto_train_match_threshold,
                defaults.auto_train_match_threshold,
            ),
        ] {
            if !(0.0..=1.0).contains(&*value) {
                *value = default;
                reset.push(name);
            }
        }

        if self.priority_threshold <= self.learned_threshold
            || self.refinement_floor >= self.learned_threshold
        {
            self.priority_threshold = defaults.priority_threshold;
            self.learned_threshold = defaults.learned_threshold;
            self.refinement_floor = defaults.refinement_floor;
            reset.push("tier thresholds");
        }

        if self.forbidden_tolerance >= self.duplicate_tolerance {
            self.forbidden_tolerance = defaults.forbidden_tolerance;
            self.duplicate_tolerance = defaults.duplicate_tolerance;
            reset.push("tolerances");
        }

        for (name, value, default) in [
            ("resize_width", &mut self.resize_width, defaults.resize_width),
            ("resize_height", &mut self.resize_height, defaults.resize_height),
            ("hash_size", &mut self.hash_size, defaults.hash_size),
            ("capture_width", &mut self.capture_width, defaults.capture_width),
            ("capture_height", &mut self.capture_height, defaults.capture_height),
            ("confidence_threshold", &mut self.confidence_threshold, defaults.confidence_threshold),
            (
                "auto_train_hit_threshold",
                &mut self.auto_train_hit_threshold,
                defaults.auto_train_hit_threshold,
            ),
        ] {
            if *value == 0 {
                *value = default;
                reset.push(name);
            }
        }

        if self.block_grid_cols == 0
            || self.block_grid_rows == 0
            || self.block_grid_cols > self.resize_width
            || self.block_grid_rows > self.resize_height
        {
            self.block_grid_cols = defaults.block_grid_cols.min(self.resize_width);
            self.block_grid_rows = defaults.block_grid_rows.min(self.resize_height);
            reset.push("block grid");
        }

        if self.scan_interval_ms == 0 {
            self.scan_interval_ms = defaults.scan_interval_ms;
            reset.push("scan_interval_ms");
        }

        // NaN fails both comparisons
        if !(self.max_color_distance >= 0.0) {
            self.max_color_distance = defaults.max_color_distance;
            reset.push("max_color_distance");
        }
        if !(self.auto_train_pixel_distance >= 0.0) {
            self.auto_train_pixel_distance = defaults.auto_train_pixel_distance;
            reset.push("auto_train_pixel_distance");
        }

        reset
    }
}

/// Outcome of reading a settings file.
#[derive(Debug, Default)]
pub struct LoadReport {
    /// The whole file was unreadable as a JSON object.
    pub malformed: bool,
    /// Keys dropped because they were unknown or of the wrong type.
    pub rejected_keys: Vec<String>,
    /// Invariant groups reset to defaults.
    pub reset_groups: Vec<&'static str>,
}

/// Overlays the keys of `raw` onto the defaults, one key at a time, so a
/// single bad value never discards the rest of the file.
pub fn parse_settings(raw: &str) -> (Settings, LoadReport) {
    let mut report = LoadReport::default();

    let loaded = match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => map,
        _ => {
            report.malformed = true;
            return (Settings::default(), report);
        }
    };

    let defaults = match serde_json::to_value(Settings::default()) {
        Ok(Value::Object(map)) => map,
        _ => {
            report.malformed = true;
            return (Settings::default(), report);
        }
    };

    let mut merged = defaults.clone();
    for (key, value) in loaded {
        if !defaults.contains_key(&key) || !accepts(&defaults, &key, &value) {
            report.rejected_keys.push(key);
            continue;
        }
        merged.insert(key, value);
    }

    let mut settings = serde_json::from_value::<Settings>(Value::Object(merged)).unwrap_or_else(|_| {
        report.malformed = true;
        Settings::default()
    });
    report.reset_groups = settings.sanitize();
    (settings, report)
}

fn accepts(defaults: &Map<String, Value>, key: &str, value: &Value) -> bool {
    let mut probe = defaults.clone();
    probe.insert(key.to_string(), value.clone());
    serde_json::from_value::<Settings>(Value::Object(probe)).is_ok()
}

pub struct SettingsStore {
    path: PathBuf,
    data: RwLock<Settings>,
}

impl SettingsStore {
    /// Loads `path`, falling back to defaults for anything absent or
    /// malformed, and writes the normalized result straight back.
    pub fn open(path: PathBuf) -> anyhow::Result<Self> {
        let data = if path.exists() {
            match fs::read_to_string(&path) {
                Ok(contents) => {
                    let (settings, report) = parse_settings(&contents);
                    report_load(&path, &report);
                    settings
                }
                Err(err) => {
                    log_warn!(
                        "{}",
                        AgentError::ConfigParseFailure(format!(
                            "could not read {}: {err}; using defaults",
                            path.display()
                        ))
                    );
                    Settings::default()
                }
            }
        } else {
            log_info!("No settings at {}, creating it with defaults", path.display());
            Settings::default()
        };

        let store = Self {
            path,
            data: RwLock::new(data),
        };

        if let Err(err) = store.persist(&store.snapshot()) {
            log_warn!("{err}");
        }

        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot(&self) -> Settings {
        self.data
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Updates a single key from its textual value and persists the result.
    /// Values that do not parse, or that would break an invariant, are rejected
    /// and leave the stored settings untouched.
    pub fn update_value(&self, key: &str, raw: &str) -> AgentResult<Settings> {
        let mut guard = self.data.write().unwrap_or_else(PoisonError::into_inner);

        let mut object = match serde_json::to_value(&*guard) {
            Ok(Value::Object(map)) => map,
            _ => return Err(AgentError::ConfigParseFailure("settings are not an object".into())),
        };
        if !object.contains_key(key) {
            return Err(AgentError::ConfigParseFailure(format!("unknown setting '{key}'")));
        }

        let value = serde_json::from_str::<Value>(raw.trim())
            .unwrap_or_else(|_| Value::String(raw.trim().to_string()));
        object.insert(key.to_string(), value);

        let mut updated = serde_json::from_value::<Settings>(Value::Object(object)).map_err(|err| {
            AgentError::ConfigParseFailure(format!("invalid value for '{key}': {err}"))
        })?;
        let reset = updated.sanitize();
        if !reset.is_empty() {
            return Err(AgentError::ConfigParseFailure(format!(
                "'{key}' = {raw} violates {}",
                reset.join(", ")
            )));
        }

        self.persist(&updated)?;
        *guard = updated.clone();
        Ok(updated)
    }

    fn persist(&self, data: &Settings) -> AgentResult<()> {
        let serialized = serde_json::to_string_pretty(data)
            .map_err(|err| AgentError::ConfigParseFailure(err.to_string()))?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|err| AgentError::persist(parent, err))?;
        }

        write_atomically(&self.path, |file| file.write_all(serialized.as_bytes()))
            .map_err(|err| AgentError::persist(&self.path, err))
    }
}

fn report_load(path: &Path, report: &LoadReport) {
    if report.malformed {
        log_warn!(
            "{}",
            AgentError::ConfigParseFailure(format!(
                "{} is not a valid settings object; using defaults and rewriting it",
                path.display()
            ))
        );
    }
    if !report.rejected_keys.is_empty() {
        log_warn!(
            "{}",
            AgentError::ConfigParseFailure(format!(
                "ignored invalid settings keys: {}",
                report.rejected_keys.join(", ")
            ))
        );
    }
    if !report.reset_groups.is_empty() {
        log_warn!("Reset inconsistent settings to defaults: {}", report.reset_groups.join(", "));
    }
}
