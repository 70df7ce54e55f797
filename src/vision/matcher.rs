use std::sync::{Arc, OnceLock};

use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage, Luma};
use imageproc::definitions::Image;
use imageproc::template_matching::{match_template, match_template_parallel, MatchTemplateMethod};
use serde::{Deserialize, Serialize};

use crate::errors::{AgentError, AgentResult};
use crate::settings::Settings;
use crate::templates::{Template, TemplateLibrary, Tier};

use super::fingerprint::FingerprintEngine;
use super::region::Region;

const ENABLE_LOGS: bool = true;

use crate::log_warn;

/// Shortest template side the coarse pass keeps after downscaling.
const COARSE_MIN_SIDE: u32 = 16;
const MAX_COARSE_FACTOR: u32 = 4;
/// Coarse peaks checked again at full resolution.
const COARSE_CANDIDATES: usize = 4;

/// How a located template is scored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoringMethod {
    /// Peak normalized cross-correlation.
    Correlation,
    /// Block similarity of the region found by correlation.
    Blocks,
}

/// A captured screen image plus its grayscale copy for correlation.
/// Downscaled copies for the coarse pass are built on first use.
#[derive(Debug, Clone)]
pub struct Frame {
    image: DynamicImage,
    luma: GrayImage,
    coarse: [OnceLock<GrayImage>; MAX_COARSE_FACTOR as usize - 1],
}

impl Frame {
    pub fn new(image: DynamicImage) -> Self {
        let luma = image.to_luma8();
        Self {
            image,
            luma,
            coarse: Default::default(),
        }
    }

    fn coarse_luma(&self, factor: u32) -> &GrayImage {
        if factor <= 1 {
            return &self.luma;
        }
        let factor = factor.min(MAX_COARSE_FACTOR);
        self.coarse[factor as usize - 2].get_or_init(|| downscale(&self.luma, factor))
    }

    pub fn image(&self) -> &DynamicImage {
        &self.image
    }

    pub fn luma(&self) -> &GrayImage {
        &self.luma
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.luma.dimensions()
    }

    /// The part of the frame under `region`, clipped to the frame.
    pub fn crop(&self, region: Region) -> Option<DynamicImage> {
        let clipped = region.clip_to(self.dimensions())?;
        Some(
            self.image
                .crop_imm(clipped.x, clipped.y, clipped.width, clipped.height),
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub template_id: String,
    pub score: f64,
    pub region: Region,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TierMatch {
    pub tier: Tier,
    pub result: MatchResult,
}

/// Scores a single template against a frame. `Ok(None)` means the template
/// could not be placed on the frame at all.
pub trait TemplateScorer: Send + Sync {
    fn best_match(&self, frame: &Frame, template: &Template) -> AgentResult<Option<MatchResult>>;

    /// Finds the template by correlation alone, returning it only when the
    /// peak clears the locate confidence.
    fn locate(&self, frame: &Frame, template: &Template) -> AgentResult<Option<MatchResult>>;
}

pub struct ImageScorer {
    method: ScoringMethod,
    fingerprints: FingerprintEngine,
    max_color_distance: f64,
    locate_confidence: f64,
}

impl ImageScorer {
    pub fn new(
        method: ScoringMethod,
        fingerprints: FingerprintEngine,
        max_color_distance: f64,
        locate_confidence: f64,
    ) -> Self {
        Self {
            method,
            fingerprints,
            max_color_distance,
            locate_confidence,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            settings.scoring_method,
            FingerprintEngine::from_settings(settings),
            settings.max_color_distance,
            settings.locate_confidence,
        )
    }

    fn correlate(&self, frame: &Frame, template: &Template) -> AgentResult<Option<MatchResult>> {
        let (frame_w, frame_h) = frame.dimensions();
        let (template_w, template_h) = template.dimensions();
        if template_w == 0 || template_h == 0 || template_w > frame_w || template_h > frame_h {
            return Ok(None);
        }

        let factor = coarse_factor(template_w, template_h);
        let best = if factor == 1 {
            let scores = match_template_parallel(
                frame.luma(),
                &template.luma,
                MatchTemplateMethod::CrossCorrelationNormalized,
            );
            peak(&scores)
        } else {
            // rank positions on downscaled copies, then score the few best
            // neighbourhoods at full resolution
            let scores = match_template_parallel(
                frame.coarse_luma(factor),
                &downscale(&template.luma, factor),
                MatchTemplateMethod::CrossCorrelationNormalized,
            );
            coarse_peaks(&scores, COARSE_CANDIDATES)
                .into_iter()
                .filter_map(|(x, y)| {
                    refine_peak(frame.luma(), &template.luma, x * factor, y * factor, factor)
                })
                .max_by(|a, b| a.2.total_cmp(&b.2))
        };

        let Some((x, y, score)) = best else {
            return Err(AgentError::ComparisonFailure {
                template_id: template.id.clone(),
                reason: "correlation produced no finite score".to_string(),
            });
        };

        Ok(Some(MatchResult {
            template_id: template.id.clone(),
            score: f64::from(score).clamp(0.0, 1.0),
            region: Region::new(x, y, template_w, template_h),
        }))
    }
}

/// How far the coarse pass shrinks the frame and template.
fn coarse_factor(template_w: u32, template_h: u32) -> u32 {
    (template_w.min(template_h) / COARSE_MIN_SIDE).clamp(1, MAX_COARSE_FACTOR)
}

fn downscale(image: &GrayImage, factor: u32) -> GrayImage {
    let (width, height) = image.dimensions();
    imageops::resize(image, width / factor, height / factor, FilterType::Triangle)
}

/// Highest finite score. Flat regions divide by zero and produce NaN; those
/// positions are skipped.
fn peak(scores: &Image<Luma<f32>>) -> Option<(u32, u32, f32)> {
    scores
        .enumerate_pixels()
        .map(|(x, y, score)| (x, y, score.0[0]))
        .filter(|(_, _, score)| score.is_finite())
        .max_by(|a, b| a.2.total_cmp(&b.2))
}

/// The best `count` positions, at least three cells apart from each other.
fn coarse_peaks(scores: &Image<Luma<f32>>, count: usize) -> Vec<(u32, u32)> {
    let mut ranked: Vec<(u32, u32, f32)> = scores
        .enumerate_pixels()
        .map(|(x, y, score)| (x, y, score.0[0]))
        .filter(|(_, _, score)| score.is_finite())
        .collect();
    ranked.sort_unstable_by(|a, b| b.2.total_cmp(&a.2));

    let mut peaks: Vec<(u32, u32)> = Vec::with_capacity(count);
    for (x, y, _) in ranked {
        if peaks.len() == count {
            break;
        }
        if peaks.iter().all(|&(px, py)| px.abs_diff(x) > 2 || py.abs_diff(y) > 2) {
            peaks.push((x, y));
        }
    }
    peaks
}

/// Full-resolution correlation in a small window around a coarse peak.
fn refine_peak(
    luma: &GrayImage,
    template: &GrayImage,
    x: u32,
    y: u32,
    factor: u32,
) -> Option<(u32, u32, f32)> {
    let (frame_w, frame_h) = luma.dimensions();
    let (template_w, template_h) = template.dimensions();
    let reach = factor + 1;

    let x0 = x.saturating_sub(reach);
    let y0 = y.saturating_sub(reach);
    let x1 = (x + reach + template_w).min(frame_w);
    let y1 = (y + reach + template_h).min(frame_h);
    if x1 < x0 + template_w || y1 < y0 + template_h {
        return None;
    }

    let window = imageops::crop_imm(luma, x0, y0, x1 - x0, y1 - y0).to_image();
    let scores = match_template(&window, template, MatchTemplateMethod::CrossCorrelationNormalized);
    peak(&scores).map(|(px, py, score)| (x0 + px, y0 + py, score))
}

impl TemplateScorer for ImageScorer {
    fn best_match(&self, frame: &Frame, template: &Template) -> AgentResult<Option<MatchResult>> {
        match self.method {
            ScoringMethod::Correlation => self.correlate(frame, template),
            ScoringMethod::Blocks => {
                let Some(located) = self.locate(frame, template)? else {
                    return Ok(None);
                };
                let Some(crop) = frame.crop(located.region) else {
                    return Ok(None);
                };
                let blocks = self.fingerprints.blocks(&crop);
                Ok(Some(MatchResult {
                    score: blocks.similarity(&template.blocks, self.max_color_distance),
                    ..located
                }))
            }
        }
    }

    fn locate(&self, frame: &Frame, template: &Template) -> AgentResult<Option<MatchResult>> {
        Ok(self
            .correlate(frame, template)?
            .filter(|result| result.score >= self.locate_confidence))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TierThresholds {
    pub priority: f64,
    pub learned: f64,
    pub no_click: f64,
    pub refinement_floor: f64,
}

impl TierThresholds {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            priority: settings.priority_threshold,
            learned: settings.learned_threshold,
            no_click: settings.no_click_threshold,
            refinement_floor: settings.refinement_floor,
        }
    }

    pub fn for_tier(&self, tier: Tier) -> f64 {
        match tier {
            Tier::Priority => self.priority,
            Tier::Learned => self.learned,
            Tier::NoClick => self.no_click,
            // pending assets are never matched
            Tier::Pending => f64::INFINITY,
        }
    }
}

/// Result of one scan over the library.
#[derive(Debug, Clone, Default)]
pub struct ScanReport {
    /// The template to click, if any.
    pub hit: Option<TierMatch>,
    /// A no_click template that matched. Only reported.
    pub inhibitor: Option<MatchResult>,
    /// Scores in `[refinement_floor, threshold)` from clickable tiers.
    pub near_misses: Vec<TierMatch>,
    /// Templates whose comparison failed and were skipped.
    pub failures: usize,
}

#[derive(Clone)]
pub struct MatchEngine {
    scorer: Arc<dyn TemplateScorer>,
    thresholds: TierThresholds,
}

impl MatchEngine {
    pub fn new(scorer: Arc<dyn TemplateScorer>, thresholds: TierThresholds) -> Self {
        Self { scorer, thresholds }
    }

    pub fn thresholds(&self) -> TierThresholds {
        self.thresholds
    }

    pub fn set_thresholds(&mut self, thresholds: TierThresholds) {
        self.thresholds = thresholds;
    }

    /// Runs the tiers in order: no_click (warning only), then priority, then
    /// learned. Within a tier the first template at or above the threshold
    /// wins, and learned is skipped once priority has produced a hit.
    pub fn scan(&self, frame: &Frame, library: &TemplateLibrary) -> ScanReport {
        let mut report = ScanReport::default();

        for template in library.tier(Tier::NoClick) {
            if let Some(result) = self.score(frame, template, &mut report) {
                if result.score >= self.thresholds.no_click {
                    report.inhibitor = Some(result);
                    break;
                }
            }
        }

        for tier in [Tier::Priority, Tier::Learned] {
            let threshold = self.thresholds.for_tier(tier);
            for template in library.tier(tier) {
                let Some(result) = self.score(frame, template, &mut report) else {
                    continue;
                };
                if result.score >= threshold {
                    report.hit = Some(TierMatch { tier, result });
                    break;
                }
                if result.score >= self.thresholds.refinement_floor {
                    report.near_misses.push(TierMatch { tier, result });
                }
            }
            if report.hit.is_some() {
                break;
            }
        }

        report
    }

    /// Locates one template on the frame by correlation.
    pub fn locate(&self, frame: &Frame, template: &Template) -> AgentResult<Option<MatchResult>> {
        self.scorer.locate(frame, template)
    }

    /// Every clickable template that can be located on the frame.
    pub fn locate_all(&self, frame: &Frame, library: &TemplateLibrary) -> Vec<TierMatch> {
        let mut found = Vec::new();
        for tier in [Tier::Priority, Tier::Learned] {
            for template in library.tier(tier) {
                match self.scorer.locate(frame, template) {
                    Ok(Some(result)) => found.push(TierMatch { tier, result }),
                    Ok(None) => {}
                    Err(err) => log_warn!("{err}"),
                }
            }
        }
        found
    }

    fn score(
        &self,
        frame: &Frame,
        template: &Template,
        report: &mut ScanReport,
    ) -> Option<MatchResult> {
        match self.scorer.best_match(frame, template) {
            Ok(result) => result,
            Err(err) => {
                log_warn!("{err}");
                report.failures += 1;
                None
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::sync::Mutex;

    use image::{Rgb, RgbImage};
    use rand::{rngs::StdRng, Rng, SeedableRng};

    /// Scorer returning canned scores per template id and recording calls.
    #[derive(Default)]
    pub(crate) struct FakeScorer {
        pub scores: HashMap<String, f64>,
        pub failing: Vec<String>,
        pub calls: Mutex<Vec<String>>,
    }

    impl FakeScorer {
        pub fn with_scores(scores: &[(&str, f64)]) -> Self {
            Self {
                scores: scores.iter().map(|(id, s)| (id.to_string(), *s)).collect(),
                ..Self::default()
            }
        }

        pub fn called(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl TemplateScorer for FakeScorer {
        fn best_match(&self, _frame: &Frame, template: &Template) -> AgentResult<Option<MatchResult>> {
            self.calls.lock().unwrap().push(template.id.clone());
            if self.failing.contains(&template.id) {
                return Err(AgentError::ComparisonFailure {
                    template_id: template.id.clone(),
                    reason: "boom".to_string(),
                });
            }
            Ok(self.scores.get(&template.id).map(|score| MatchResult {
                template_id: template.id.clone(),
                score: *score,
                region: Region::new(10, 10, 20, 10),
            }))
        }

        fn locate(&self, frame: &Frame, template: &Template) -> AgentResult<Option<MatchResult>> {
            Ok(self
                .best_match(frame, template)?
                .filter(|result| result.score >= 0.7))
        }
    }

    pub(crate) fn noise(width: u32, height: u32, seed: u64) -> DynamicImage {
        let mut rng = StdRng::seed_from_u64(seed);
        DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |_, _| {
            Rgb([rng.gen(), rng.gen(), rng.gen()])
        }))
    }

    fn engine() -> FingerprintEngine {
        FingerprintEngine::new(8, (32, 32), (4, 4))
    }

    fn template(id: &str, tier: Tier, image: &DynamicImage) -> Template {
        Template::from_image(id, tier, PathBuf::from(format!("{id}.png")), 0, image, &engine())
    }

    fn library(entries: &[(&str, Tier)]) -> TemplateLibrary {
        let image = noise(4, 4, 1);
        TemplateLibrary::from_templates(entries.iter().map(|(id, tier)| template(id, *tier, &image)))
    }

    fn defaults() -> TierThresholds {
        TierThresholds::from_settings(&Settings::default())
    }

    fn blank_frame() -> Frame {
        Frame::new(noise(8, 8, 2))
    }

    #[test]
    fn score_between_floor_and_threshold_is_a_near_miss() {
        let scorer = Arc::new(FakeScorer::with_scores(&[("t1", 0.78)]));
        let engine = MatchEngine::new(scorer, defaults());

        let report = engine.scan(&blank_frame(), &library(&[("t1", Tier::Learned)]));

        assert!(report.hit.is_none());
        assert_eq!(report.near_misses.len(), 1);
        assert_eq!(report.near_misses[0].result.template_id, "t1");
        assert_eq!(report.near_misses[0].tier, Tier::Learned);
    }

    #[test]
    fn first_qualifying_template_wins_within_a_tier() {
        let scorer = Arc::new(FakeScorer::with_scores(&[("a", 0.81), ("b", 0.99)]));
        let engine = MatchEngine::new(scorer.clone(), defaults());

        let report = engine.scan(&blank_frame(), &library(&[("a", Tier::Learned), ("b", Tier::Learned)]));

        assert_eq!(report.hit.unwrap().result.template_id, "a");
        assert_eq!(scorer.called(), vec!["a"]);
    }

    #[test]
    fn priority_hit_skips_learned_tier() {
        let scorer = Arc::new(FakeScorer::with_scores(&[("p", 0.95), ("l", 0.99)]));
        let engine = MatchEngine::new(scorer.clone(), defaults());

        let report = engine.scan(&blank_frame(), &library(&[("p", Tier::Priority), ("l", Tier::Learned)]));

        let hit = report.hit.unwrap();
        assert_eq!(hit.tier, Tier::Priority);
        assert_eq!(hit.result.template_id, "p");
        assert!(!scorer.called().contains(&"l".to_string()));
    }

    #[test]
    fn priority_needs_its_own_higher_threshold() {
        let scorer = Arc::new(FakeScorer::with_scores(&[("p", 0.85), ("l", 0.85)]));
        let engine = MatchEngine::new(scorer, defaults());

        let report = engine.scan(&blank_frame(), &library(&[("p", Tier::Priority), ("l", Tier::Learned)]));

        let hit = report.hit.unwrap();
        assert_eq!(hit.tier, Tier::Learned);
        assert_eq!(report.near_misses.len(), 1);
        assert_eq!(report.near_misses[0].tier, Tier::Priority);
    }

    #[test]
    fn no_click_match_warns_without_suppressing() {
        let scorer = Arc::new(FakeScorer::with_scores(&[("n", 0.9), ("l", 0.9)]));
        let engine = MatchEngine::new(scorer, defaults());

        let report = engine.scan(&blank_frame(), &library(&[("n", Tier::NoClick), ("l", Tier::Learned)]));

        assert_eq!(report.inhibitor.unwrap().template_id, "n");
        assert_eq!(report.hit.unwrap().result.template_id, "l");
    }

    #[test]
    fn failing_template_is_skipped() {
        let mut scorer = FakeScorer::with_scores(&[("b", 0.9)]);
        scorer.failing.push("a".to_string());
        let engine = MatchEngine::new(Arc::new(scorer), defaults());

        let report = engine.scan(&blank_frame(), &library(&[("a", Tier::Learned), ("b", Tier::Learned)]));

        assert_eq!(report.failures, 1);
        assert_eq!(report.hit.unwrap().result.template_id, "b");
    }

    #[test]
    fn correlation_finds_an_exact_crop() {
        let screen = noise(60, 40, 7);
        let crop = screen.crop_imm(20, 10, 16, 12);
        let scorer = ImageScorer::new(ScoringMethod::Correlation, engine(), 50.0, 0.7);

        let result = scorer
            .best_match(&Frame::new(screen), &template("crop", Tier::Learned, &crop))
            .unwrap()
            .unwrap();

        assert!(result.score > 0.99, "score was {}", result.score);
        assert_eq!(result.region, Region::new(20, 10, 16, 12));
    }

    #[test]
    fn block_scoring_rates_an_exact_crop_fully() {
        let screen = noise(60, 40, 9);
        let crop = screen.crop_imm(5, 5, 32, 32);
        let scorer = ImageScorer::new(ScoringMethod::Blocks, engine(), 50.0, 0.7);

        let result = scorer
            .best_match(&Frame::new(screen), &template("crop", Tier::Learned, &crop))
            .unwrap()
            .unwrap();

        assert_eq!(result.score, 1.0);
        assert_eq!(result.region, Region::new(5, 5, 32, 32));
    }

    #[test]
    fn coarse_pass_still_lands_on_the_exact_position() {
        let screen = noise(640, 360, 21);
        let crop = screen.crop_imm(201, 117, 96, 64);
        let scorer = ImageScorer::new(ScoringMethod::Correlation, engine(), 50.0, 0.7);

        let result = scorer
            .best_match(&Frame::new(screen), &template("wide", Tier::Learned, &crop))
            .unwrap()
            .unwrap();

        assert!(result.score > 0.99, "score was {}", result.score);
        assert_eq!(result.region, Region::new(201, 117, 96, 64));
    }

    #[test]
    fn small_templates_skip_the_coarse_pass() {
        assert_eq!(coarse_factor(24, 16), 1);
        assert_eq!(coarse_factor(100, 40), 2);
        assert_eq!(coarse_factor(96, 64), 4);
        assert_eq!(coarse_factor(400, 300), MAX_COARSE_FACTOR);
    }

    #[test]
    fn oversized_template_is_not_found() {
        let scorer = ImageScorer::new(ScoringMethod::Correlation, engine(), 50.0, 0.7);
        let big = noise(20, 20, 3);

        let result = scorer
            .best_match(&Frame::new(noise(10, 10, 4)), &template("big", Tier::Learned, &big))
            .unwrap();

        assert!(result.is_none());
    }
}
