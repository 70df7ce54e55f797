use std::sync::Arc;
use std::time::{Duration, Instant};

use image::DynamicImage;

use crate::errors::{AgentError, AgentResult};
use crate::learning::{
    AutoTrainCandidate, AutoTrainer, ObservationOutcome, ObservationTracker, RefinementTracker,
};
use crate::settings::{Settings, SettingsStore};
use crate::templates::{CleanupOptions, CleanupTolerances, TemplateStore, Tier};
use crate::vision::matcher::{Frame, ImageScorer, MatchEngine, TemplateScorer, TierMatch, TierThresholds};
use crate::vision::region::Region;

use super::blacklist::AppBlacklist;
use super::bridge::{ClickInjector, ForegroundApp, InputEvent, OperatorPrompt, ScreenSource};
use super::commands::Command;
use super::mode::{Mode, ModeController, Transition};

const ENABLE_LOGS: bool = true;

use crate::{log_diag, log_error, log_info, log_warn};

/// Settings that shape fingerprints; the store has to be reopened for them.
const RESTART_KEYS: &[&str] = &[
    "resize_width",
    "resize_height",
    "hash_size",
    "block_grid_cols",
    "block_grid_rows",
];

/// Settings read by the image scorer, which is rebuilt when they change.
const SCORER_KEYS: &[&str] = &["scoring_method", "max_color_distance", "locate_confidence"];

/// The OS-facing collaborators the agent drives.
#[derive(Clone)]
pub struct Collaborators {
    pub screen: Arc<dyn ScreenSource>,
    pub injector: Arc<dyn ClickInjector>,
    pub foreground: Arc<dyn ForegroundApp>,
    pub prompt: Arc<dyn OperatorPrompt>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// All mutable agent state. Owned by the agent loop; nothing else touches it.
pub struct Agent {
    settings: SettingsStore,
    config: Settings,
    modes: ModeController,
    store: TemplateStore,
    matcher: MatchEngine,
    observations: ObservationTracker,
    refinement: RefinementTracker,
    auto_trainer: AutoTrainer,
    blacklist: AppBlacklist,
    io: Collaborators,
    last_click_at: Option<Instant>,
    blocked_app: Option<String>,
}

impl Agent {
    pub fn new(settings: SettingsStore, store: TemplateStore, io: Collaborators) -> Self {
        let scorer = Arc::new(ImageScorer::from_settings(&settings.snapshot()));
        Self::with_scorer(settings, store, io, scorer)
    }

    pub fn with_scorer(
        settings: SettingsStore,
        store: TemplateStore,
        io: Collaborators,
        scorer: Arc<dyn TemplateScorer>,
    ) -> Self {
        let config = settings.snapshot();

        Self {
            matcher: MatchEngine::new(scorer, TierThresholds::from_settings(&config)),
            observations: ObservationTracker::new(config.confidence_threshold, config.duplicate_tolerance),
            refinement: RefinementTracker::new(
                Duration::from_millis(config.refinement_window_ms),
                Duration::from_millis(config.refinement_prompt_timeout_ms),
            ),
            auto_trainer: AutoTrainer::new(
                config.auto_train_match_threshold,
                config.auto_train_pixel_distance,
                config.auto_train_hit_threshold,
            ),
            blacklist: AppBlacklist::new(&config.forbidden_apps),
            modes: ModeController::new(),
            settings,
            config,
            store,
            io,
            last_click_at: None,
            blocked_app: None,
        }
    }

    pub fn modes(&self) -> &ModeController {
        &self.modes
    }

    pub fn store(&self) -> &TemplateStore {
        &self.store
    }

    pub fn observations(&self) -> &ObservationTracker {
        &self.observations
    }

    pub fn refinement(&self) -> &RefinementTracker {
        &self.refinement
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.config.scan_interval_ms)
    }

    fn quiet(&self) -> bool {
        self.modes.is_quiet()
    }

    fn cleanup_options(&self) -> CleanupOptions {
        CleanupOptions {
            tolerances: CleanupTolerances {
                forbidden: self.config.forbidden_tolerance,
                duplicate: self.config.duplicate_tolerance,
            },
            quiet: self.quiet(),
        }
    }

    /// One polling cycle: time out a stale prompt, then scan and click if the
    /// mode and the click cooldown allow it.
    pub async fn tick(&mut self, now: Instant) {
        if let Some(expired) = self.refinement.expire(now) {
            log_info!(
                "Refinement of {} timed out without an answer",
                expired.near_miss.template_id
            );
        }

        if !self.modes.can_click() {
            return;
        }

        let cooldown = Duration::from_millis(self.config.click_cooldown_ms);
        if self
            .last_click_at
            .is_some_and(|last| now.saturating_duration_since(last) < cooldown)
        {
            return;
        }

        self.scan_and_click().await;
    }

    /// Scans the screen and clicks the winning template. Ignores the mode but
    /// not the application blacklist.
    pub async fn scan_and_click(&mut self) -> Option<TierMatch> {
        if self.blacklist_gate() {
            return None;
        }

        let frame = match self.capture_frame().await {
            Ok(frame) => frame,
            Err(err) => {
                log_warn!("{err}; skipping this cycle");
                return None;
            }
        };

        let matcher = self.matcher.clone();
        let library = self.store.library();
        let report = match tokio::task::spawn_blocking(move || matcher.scan(&frame, &library)).await {
            Ok(report) => report,
            Err(err) => {
                log_error!("scan worker join failed: {err}");
                return None;
            }
        };

        if let Some(inhibitor) = &report.inhibitor {
            log_warn!(
                "no_click template {} is on screen (score {:.2})",
                inhibitor.template_id,
                inhibitor.score
            );
        }

        self.refinement.record_scan(&report.near_misses, Instant::now());
        for near in &report.near_misses {
            log_diag!(self.quiet(); "Near miss: {} template {} scored {:.2}", near.tier, near.result.template_id, near.result.score);
        }

        let Some(hit) = report.hit else {
            log_diag!(self.quiet(); "No template matched");
            return None;
        };

        let (x, y) = hit.result.region.center();
        let injector = Arc::clone(&self.io.injector);
        let clicked = tokio::task::spawn_blocking(move || injector.inject_click(x, y))
            .await
            .map_err(|err| AgentError::InjectionFailure(err.to_string()))
            .and_then(|result| result);

        match clicked {
            Ok(()) => {
                self.last_click_at = Some(Instant::now());
                log_info!(
                    "Clicked {} template {} at ({x}, {y}), score {:.2}",
                    hit.tier,
                    hit.result.template_id,
                    hit.result.score
                );
                Some(hit)
            }
            Err(err) => {
                log_warn!("{err}");
                None
            }
        }
    }

    /// True while the focused application is blacklisted. Only transitions
    /// are reported.
    fn blacklist_gate(&mut self) -> bool {
        let blocked = self.blacklist.check(self.io.foreground.as_ref());
        if blocked != self.blocked_app {
            match &blocked {
                Some(app) => log_info!("Paused: {app} is in the foreground"),
                None => log_info!("Resumed: the foreground app is no longer blacklisted"),
            }
            self.blocked_app = blocked.clone();
        }
        blocked.is_some()
    }

    async fn capture_frame(&self) -> AgentResult<Arc<Frame>> {
        let screen = Arc::clone(&self.io.screen);
        tokio::task::spawn_blocking(move || screen.capture(None).map(|image| Arc::new(Frame::new(image))))
            .await
            .map_err(|err| AgentError::CaptureFailure(err.to_string()))?
    }

    /// The fixed-size capture box centred on a click, kept inside the screen.
    async fn capture_around(&self, x: i32, y: i32) -> AgentResult<DynamicImage> {
        let screen = Arc::clone(&self.io.screen);
        let (width, height) = (self.config.capture_width, self.config.capture_height);

        tokio::task::spawn_blocking(move || {
            let size = screen.screen_size()?;
            let region = Region::centered_on(x, y, width, height, size)
                .ok_or_else(|| AgentError::CaptureFailure("screen has no area".to_string()))?;
            screen.capture(Some(region))
        })
        .await
        .map_err(|err| AgentError::CaptureFailure(err.to_string()))?
    }

    pub async fn handle_event(&mut self, event: InputEvent) -> Flow {
        match event {
            InputEvent::Click {
                x,
                y,
                pressed: true,
                at,
            } => {
                self.on_manual_click(x, y, at).await;
                Flow::Continue
            }
            InputEvent::Click { .. } => Flow::Continue,
            InputEvent::Command(command) => self.apply_command(command).await,
            InputEvent::ListenerFailed(reason) => {
                log_error!("{}", AgentError::ListenerFailure(reason));
                self.modes.stop();
                Flow::Stop
            }
        }
    }

    /// A click the operator made at `at`. A click on a near miss that was
    /// live at that moment only opens a refinement prompt; otherwise it feeds
    /// auto-train and learning.
    pub async fn on_manual_click(&mut self, x: i32, y: i32, at: Instant) {
        if self.modes.is_stopped() || self.blacklist_gate() {
            return;
        }

        if let Some(request) = self.refinement.on_manual_click(x, y, at) {
            self.io.prompt.request_refinement(&request);
            return;
        }

        if self.modes.can_auto_train() {
            self.auto_train(x, y).await;
        }

        if self.modes.can_learn() {
            self.learn_from_click(x, y).await;
        }
    }

    async fn learn_from_click(&mut self, x: i32, y: i32) {
        let capture = match self.capture_around(x, y).await {
            Ok(capture) => capture,
            Err(err) => {
                log_warn!("{err}; click not learned");
                return;
            }
        };

        let options = self.cleanup_options();
        match self.observations.observe(&mut self.store, &capture, options) {
            Ok(ObservationOutcome::Promoted { .. }) => {
                log_diag!(self.quiet(); "{} pending observation(s) remain", self.observations.pending().len());
            }
            Ok(_) => {}
            Err(err) => log_warn!("{err}"),
        }
    }

    async fn auto_train(&mut self, x: i32, y: i32) {
        let frame = match self.capture_frame().await {
            Ok(frame) => frame,
            Err(err) => {
                log_warn!("{err}; auto-train skipped");
                return;
            }
        };

        let matcher = self.matcher.clone();
        let library = self.store.library();
        let fingerprints = *self.store.fingerprints();
        let (capture_w, capture_h) = (self.config.capture_width, self.config.capture_height);
        let max_distance = self.config.max_color_distance;
        let scan_frame = Arc::clone(&frame);

        let candidates = tokio::task::spawn_blocking(move || {
            let Some(clicked) = Region::centered_on(x, y, capture_w, capture_h, scan_frame.dimensions())
                .and_then(|region| scan_frame.crop(region))
            else {
                return Vec::new();
            };
            let clicked = fingerprints.blocks(&clicked);

            matcher
                .locate_all(&scan_frame, &library)
                .into_iter()
                .filter_map(|found| {
                    let template = library.find(found.tier, &found.result.template_id)?;
                    Some(AutoTrainCandidate {
                        tier: found.tier,
                        template_id: found.result.template_id,
                        region: found.result.region,
                        similarity: clicked.similarity(&template.blocks, max_distance),
                    })
                })
                .collect::<Vec<_>>()
        })
        .await;

        let candidates = match candidates {
            Ok(candidates) => candidates,
            Err(err) => {
                log_error!("auto-train worker join failed: {err}");
                return;
            }
        };

        let Some(best) = self.auto_trainer.best_candidate((x, y), candidates) else {
            return;
        };

        let (count, reached) = self.auto_trainer.register_hit(best.tier, &best.template_id);
        log_diag!(self.quiet(); "Auto-train hit on {} ({count}/{})", best.template_id, self.config.auto_train_hit_threshold);
        if reached {
            self.refine_from_frame(&frame, best.tier, &best.template_id, best.region);
        }
    }

    pub async fn apply_command(&mut self, command: Command) -> Flow {
        match command {
            Command::ToggleQuiet => {
                let quiet = self.modes.toggle_quiet();
                log_info!("Quiet mode {}", if quiet { "on" } else { "off" });
            }
            Command::SetMode(mode) => {
                let transition = self.modes.set_mode(mode);
                self.report_transition(transition);
                if mode == Mode::Stopped {
                    return Flow::Stop;
                }
            }
            Command::ToggleLearning => {
                let transition = self.modes.toggle_learning();
                self.report_transition(transition);
            }
            Command::ToggleAutoTrain => {
                let transition = self.modes.toggle_auto_train();
                if !self.modes.can_auto_train() {
                    self.auto_trainer.reset();
                }
                self.report_transition(transition);
            }
            Command::ForceStop => {
                self.modes.stop();
                log_info!("Stop requested");
                return Flow::Stop;
            }
            Command::ScanOnce => {
                if self.modes.is_stopped() {
                    return Flow::Stop;
                }
                log_info!("Forced scan");
                self.scan_and_click().await;
            }
            Command::Cleanup => {
                let options = self.cleanup_options();
                self.store.run_cleanup(options);
            }
            Command::ConfirmRefinement => match self.refinement.resolve(true) {
                Some(near) => self.refine(near.tier, &near.template_id, Some(near.region)).await,
                None => log_diag!(self.quiet(); "No refinement is waiting for an answer"),
            },
            Command::RejectRefinement => {
                if let Some(request) = self.refinement.pending() {
                    log_info!("Refinement of {} skipped", request.near_miss.template_id);
                }
                self.refinement.resolve(false);
            }
            Command::UpdateSetting { key, value } => match self.settings.update_value(&key, &value) {
                Ok(updated) => {
                    self.apply_settings(&key, updated);
                    log_info!("Setting {key} = {value}");
                }
                Err(err) => log_warn!("{err}"),
            },
        }
        Flow::Continue
    }

    fn report_transition(&self, transition: Transition) {
        match transition {
            Transition::Changed => log_info!("Mode: {}", self.modes.describe()),
            Transition::Unchanged => log_diag!(self.quiet(); "Mode unchanged: {}", self.modes.describe()),
            Transition::Ignored => log_warn!("Agent is stopped; mode change ignored"),
        }
    }

    fn apply_settings(&mut self, key: &str, updated: Settings) {
        self.matcher.set_thresholds(TierThresholds::from_settings(&updated));
        self.observations
            .set_limits(updated.confidence_threshold, updated.duplicate_tolerance);
        self.refinement.set_timing(
            Duration::from_millis(updated.refinement_window_ms),
            Duration::from_millis(updated.refinement_prompt_timeout_ms),
        );
        self.auto_trainer.configure(
            updated.auto_train_match_threshold,
            updated.auto_train_pixel_distance,
            updated.auto_train_hit_threshold,
        );
        self.blacklist = AppBlacklist::new(&updated.forbidden_apps);

        if SCORER_KEYS.contains(&key) {
            self.matcher = MatchEngine::new(
                Arc::new(ImageScorer::from_settings(&updated)),
                TierThresholds::from_settings(&updated),
            );
        }
        if RESTART_KEYS.contains(&key) {
            log_info!("{key} takes effect after a restart");
        }

        self.config = updated;
    }

    /// Rewrites a template from a fresh capture. Uses `region` when it lies
    /// fully on screen, otherwise searches the screen for the template.
    pub async fn refine(&mut self, tier: Tier, template_id: &str, region: Option<Region>) {
        let library = self.store.library();
        let Some(template) = library.find(tier, template_id).cloned() else {
            log_warn!("{}", AgentError::UnknownTemplate(template_id.to_string()));
            return;
        };

        let frame = match self.capture_frame().await {
            Ok(frame) => frame,
            Err(err) => {
                log_warn!("{err}; refinement skipped");
                return;
            }
        };

        let on_screen = region.filter(|region| region.clip_to(frame.dimensions()) == Some(*region));
        let target = match on_screen {
            Some(region) => region,
            None => {
                let matcher = self.matcher.clone();
                let search_frame = Arc::clone(&frame);
                let located =
                    tokio::task::spawn_blocking(move || matcher.locate(&search_frame, &template)).await;
                match located {
                    Ok(Ok(Some(found))) => found.region,
                    Ok(Ok(None)) => {
                        log_warn!("Could not find {template_id} on screen; refinement skipped");
                        return;
                    }
                    Ok(Err(err)) => {
                        log_warn!("{err}");
                        return;
                    }
                    Err(err) => {
                        log_error!("locate worker join failed: {err}");
                        return;
                    }
                }
            }
        };

        self.refine_from_frame(&frame, tier, template_id, target);
    }

    fn refine_from_frame(&mut self, frame: &Frame, tier: Tier, template_id: &str, region: Region) {
        let Some(capture) = frame.crop(region) else {
            log_warn!("{}", AgentError::CaptureFailure(format!("{region:?} is off screen")));
            return;
        };

        match self.store.overwrite(tier, template_id, &capture) {
            Ok(template) => log_info!(
                "Refined {} template {} ({})",
                tier,
                template.id,
                template.fingerprint.to_base64()
            ),
            Err(err) => log_warn!("{err}"),
        }
    }

    /// Releases everything a session leaves behind.
    pub fn teardown(&mut self) {
        self.refinement.clear();
        let discarded = self.observations.discard_all(&self.store);
        log_info!("Agent stopped; discarded {discarded} un-promoted observation(s)");
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::agent::bridge::LogPrompt;
    use crate::learning::RefinementRequest;
    use crate::vision::fingerprint::FingerprintEngine;
    use crate::vision::matcher::tests::{noise, FakeScorer};

    pub(crate) struct FakeScreen {
        pub image: Mutex<DynamicImage>,
    }

    impl ScreenSource for FakeScreen {
        fn screen_size(&self) -> AgentResult<(u32, u32)> {
            let image = self.image.lock().unwrap();
            Ok((image.width(), image.height()))
        }

        fn capture(&self, region: Option<Region>) -> AgentResult<DynamicImage> {
            let image = self.image.lock().unwrap();
            Ok(match region {
                Some(r) => image.crop_imm(r.x, r.y, r.width, r.height),
                None => image.clone(),
            })
        }
    }

    #[derive(Default)]
    pub(crate) struct FakeInjector {
        pub clicks: Mutex<Vec<(i32, i32)>>,
    }

    impl ClickInjector for FakeInjector {
        fn inject_click(&self, x: i32, y: i32) -> AgentResult<()> {
            self.clicks.lock().unwrap().push((x, y));
            Ok(())
        }
    }

    #[derive(Default)]
    pub(crate) struct FakeForeground {
        pub app: Mutex<Option<String>>,
    }

    impl ForegroundApp for FakeForeground {
        fn foreground_app_name(&self) -> Option<String> {
            self.app.lock().unwrap().clone()
        }
    }

    #[derive(Default)]
    pub(crate) struct RecordingPrompt {
        pub requests: Mutex<Vec<RefinementRequest>>,
    }

    impl OperatorPrompt for RecordingPrompt {
        fn request_refinement(&self, request: &RefinementRequest) {
            self.requests.lock().unwrap().push(request.clone());
        }
    }

    pub(crate) struct Harness {
        pub dir: tempfile::TempDir,
        pub screen: Arc<FakeScreen>,
        pub injector: Arc<FakeInjector>,
        pub foreground: Arc<FakeForeground>,
    }

    impl Harness {
        pub fn new(screen: DynamicImage) -> Self {
            Self {
                dir: tempfile::tempdir().unwrap(),
                screen: Arc::new(FakeScreen {
                    image: Mutex::new(screen),
                }),
                injector: Arc::new(FakeInjector::default()),
                foreground: Arc::new(FakeForeground::default()),
            }
        }

        pub fn learned_dir(&self) -> std::path::PathBuf {
            let dir = self.dir.path().join("templates").join("learned");
            std::fs::create_dir_all(&dir).unwrap();
            dir
        }

        fn io(&self, prompt: Arc<dyn OperatorPrompt>) -> Collaborators {
            Collaborators {
                screen: self.screen.clone(),
                injector: self.injector.clone(),
                foreground: self.foreground.clone(),
                prompt,
            }
        }

        fn parts(&self) -> (SettingsStore, TemplateStore) {
            let settings = SettingsStore::open(self.dir.path().join("config.json")).unwrap();
            let engine = FingerprintEngine::from_settings(&settings.snapshot());
            let store = TemplateStore::open(self.dir.path().join("templates"), engine).unwrap();
            (settings, store)
        }

        pub fn agent(&self) -> Agent {
            let (settings, store) = self.parts();
            Agent::new(settings, store, self.io(Arc::new(LogPrompt)))
        }

        pub fn agent_with(&self, scorer: Arc<dyn TemplateScorer>, prompt: Arc<dyn OperatorPrompt>) -> Agent {
            let (settings, store) = self.parts();
            Agent::with_scorer(settings, store, self.io(prompt), scorer)
        }

        pub fn clicks(&self) -> Vec<(i32, i32)> {
            self.injector.clicks.lock().unwrap().clone()
        }

        /// Same layout, every channel shifted; correlation still finds it.
        pub fn brighten_screen(&self, amount: i32) {
            let mut image = self.screen.image.lock().unwrap();
            *image = image.brighten(amount);
        }
    }

    fn learned_luma(agent: &Agent, id: &str) -> image::GrayImage {
        agent.store().library().find(Tier::Learned, id).unwrap().luma.clone()
    }

    #[tokio::test]
    async fn click_only_clicks_a_visible_template() {
        let screen = noise(200, 100, 1);
        let harness = Harness::new(screen.clone());
        screen
            .crop_imm(40, 30, 24, 16)
            .save(harness.learned_dir().join("button.png"))
            .unwrap();
        let mut agent = harness.agent();

        agent.tick(Instant::now()).await;

        assert_eq!(harness.clicks(), vec![(52, 38)]);
    }

    #[tokio::test]
    async fn learning_only_never_clicks() {
        let screen = noise(200, 100, 1);
        let harness = Harness::new(screen.clone());
        screen
            .crop_imm(40, 30, 24, 16)
            .save(harness.learned_dir().join("button.png"))
            .unwrap();
        let mut agent = harness.agent();
        agent.apply_command(Command::SetMode(Mode::LearningOnly)).await;

        agent.tick(Instant::now()).await;
        agent.on_manual_click(120, 50, Instant::now()).await;

        assert!(harness.clicks().is_empty());
        assert_eq!(agent.observations().pending().len(), 1);
    }

    #[tokio::test]
    async fn forced_scan_ignores_mode() {
        let screen = noise(200, 100, 1);
        let harness = Harness::new(screen.clone());
        screen
            .crop_imm(40, 30, 24, 16)
            .save(harness.learned_dir().join("button.png"))
            .unwrap();
        let mut agent = harness.agent();
        agent.apply_command(Command::SetMode(Mode::LearningOnly)).await;

        agent.apply_command(Command::ScanOnce).await;

        assert_eq!(harness.clicks(), vec![(52, 38)]);
    }

    #[tokio::test]
    async fn blacklisted_app_blocks_clicking_and_learning() {
        let screen = noise(200, 100, 1);
        let harness = Harness::new(screen.clone());
        screen
            .crop_imm(40, 30, 24, 16)
            .save(harness.learned_dir().join("button.png"))
            .unwrap();
        *harness.foreground.app.lock().unwrap() = Some("Code.exe".to_string());
        let mut agent = harness.agent();
        agent.apply_command(Command::SetMode(Mode::Both)).await;

        agent.tick(Instant::now()).await;
        agent.apply_command(Command::ScanOnce).await;
        agent.on_manual_click(120, 50, Instant::now()).await;

        assert!(harness.clicks().is_empty());
        assert!(agent.observations().pending().is_empty());

        *harness.foreground.app.lock().unwrap() = Some("game.exe".to_string());
        agent.tick(Instant::now()).await;
        assert_eq!(harness.clicks().len(), 1);
    }

    #[tokio::test]
    async fn three_similar_clicks_promote_a_template() {
        let harness = Harness::new(noise(300, 200, 2));
        let mut agent = harness.agent();
        agent.apply_command(Command::SetMode(Mode::LearningOnly)).await;

        for _ in 0..3 {
            agent.on_manual_click(150, 100, Instant::now()).await;
        }

        let library = agent.store().library();
        assert_eq!(library.tier(Tier::Learned).len(), 1);
        assert_eq!(library.tier(Tier::Learned)[0].dimensions(), (100, 40));
        assert!(agent.observations().pending().is_empty());
    }

    #[tokio::test]
    async fn confirmed_near_miss_refreshes_the_template() {
        let harness = Harness::new(noise(200, 100, 3));
        noise(20, 10, 4)
            .save(harness.learned_dir().join("T1.png"))
            .unwrap();
        let scorer = Arc::new(FakeScorer::with_scores(&[("T1", 0.78)]));
        let prompt = Arc::new(RecordingPrompt::default());
        let mut agent = harness.agent_with(scorer, prompt.clone());
        let before = agent.store().library().find(Tier::Learned, "T1").cloned().unwrap();

        agent.tick(Instant::now()).await;
        assert!(harness.clicks().is_empty());
        assert_eq!(agent.refinement().near_misses().len(), 1);

        agent.on_manual_click(15, 15, Instant::now()).await;
        assert_eq!(prompt.requests.lock().unwrap().len(), 1);
        assert!(agent.observations().pending().is_empty());

        agent.apply_command(Command::ConfirmRefinement).await;

        let after = agent.store().library().find(Tier::Learned, "T1").cloned().unwrap();
        assert_eq!(after.path, before.path);
        assert_ne!(after.luma, before.luma);
        assert!(agent.refinement().near_misses().is_empty());
        assert!(agent.refinement().pending().is_none());
    }

    #[tokio::test]
    async fn rejected_near_miss_changes_nothing() {
        let harness = Harness::new(noise(200, 100, 3));
        noise(20, 10, 4)
            .save(harness.learned_dir().join("T1.png"))
            .unwrap();
        let scorer = Arc::new(FakeScorer::with_scores(&[("T1", 0.78)]));
        let mut agent = harness.agent_with(scorer, Arc::new(RecordingPrompt::default()));
        let before = agent.store().library().find(Tier::Learned, "T1").cloned().unwrap();

        agent.tick(Instant::now()).await;
        agent.on_manual_click(15, 15, Instant::now()).await;
        agent.apply_command(Command::RejectRefinement).await;

        let after = agent.store().library().find(Tier::Learned, "T1").cloned().unwrap();
        assert_eq!(after.luma, before.luma);
        assert!(agent.refinement().near_misses().is_empty());
    }

    #[tokio::test]
    async fn repeated_clicks_on_a_located_template_retrain_it() {
        let screen = noise(300, 200, 5);
        let harness = Harness::new(screen.clone());
        screen
            .crop_imm(100, 80, 100, 40)
            .save(harness.learned_dir().join("banner.png"))
            .unwrap();
        let mut agent = harness.agent();
        agent.apply_command(Command::ToggleAutoTrain).await;
        let before = learned_luma(&agent, "banner");
        harness.brighten_screen(12);

        agent.on_manual_click(150, 100, Instant::now()).await;
        assert_eq!(learned_luma(&agent, "banner"), before);

        agent.on_manual_click(152, 101, Instant::now()).await;
        let after = learned_luma(&agent, "banner");
        assert_ne!(after, before);
        assert_eq!(after.dimensions(), (100, 40));
        assert!(agent.observations().pending().is_empty());
    }

    #[tokio::test]
    async fn auto_train_ignores_clicks_far_from_every_template() {
        let screen = noise(300, 200, 5);
        let harness = Harness::new(screen.clone());
        screen
            .crop_imm(100, 80, 100, 40)
            .save(harness.learned_dir().join("banner.png"))
            .unwrap();
        let mut agent = harness.agent();
        agent.apply_command(Command::ToggleAutoTrain).await;
        let before = learned_luma(&agent, "banner");
        harness.brighten_screen(12);

        for _ in 0..3 {
            agent.on_manual_click(40, 30, Instant::now()).await;
        }

        assert_eq!(learned_luma(&agent, "banner"), before);
    }

    #[tokio::test]
    async fn refinement_without_a_region_locates_the_template() {
        let screen = noise(200, 100, 6);
        let harness = Harness::new(screen.clone());
        screen
            .crop_imm(70, 40, 24, 16)
            .save(harness.learned_dir().join("icon.png"))
            .unwrap();
        let mut agent = harness.agent();
        let before = learned_luma(&agent, "icon");
        harness.brighten_screen(12);

        agent.refine(Tier::Learned, "icon", None).await;

        let expected = harness.screen.image.lock().unwrap().crop_imm(70, 40, 24, 16).to_luma8();
        let after = learned_luma(&agent, "icon");
        assert_ne!(after, before);
        assert_eq!(after, expected);
    }

    #[tokio::test]
    async fn off_screen_region_falls_back_to_locating() {
        let screen = noise(200, 100, 6);
        let harness = Harness::new(screen.clone());
        screen
            .crop_imm(70, 40, 24, 16)
            .save(harness.learned_dir().join("icon.png"))
            .unwrap();
        let mut agent = harness.agent();
        harness.brighten_screen(12);

        agent
            .refine(Tier::Learned, "icon", Some(Region::new(190, 90, 24, 16)))
            .await;

        let expected = harness.screen.image.lock().unwrap().crop_imm(70, 40, 24, 16).to_luma8();
        assert_eq!(learned_luma(&agent, "icon"), expected);
    }

    #[tokio::test]
    async fn settings_edits_apply_immediately() {
        let harness = Harness::new(noise(50, 50, 1));
        let mut agent = harness.agent();

        agent
            .apply_command(Command::UpdateSetting {
                key: "scan_interval_ms".to_string(),
                value: "250".to_string(),
            })
            .await;
        agent
            .apply_command(Command::UpdateSetting {
                key: "priority_threshold".to_string(),
                value: "0.5".to_string(),
            })
            .await;

        assert_eq!(agent.scan_interval(), Duration::from_millis(250));
        assert_eq!(agent.matcher.thresholds().priority, 0.90);
    }

    #[tokio::test]
    async fn listener_failure_stops_the_agent() {
        let harness = Harness::new(noise(50, 50, 1));
        let mut agent = harness.agent();

        let flow = agent
            .handle_event(InputEvent::ListenerFailed("hook lost".to_string()))
            .await;

        assert_eq!(flow, Flow::Stop);
        assert!(agent.modes().is_stopped());
    }
}
