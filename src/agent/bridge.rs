//! Seams to the operating system. The agent only talks to the desktop through
//! these traits; the `desktop` feature provides the real implementations.

use std::time::Instant;

use image::DynamicImage;
use tokio::sync::mpsc::UnboundedSender;

use crate::errors::AgentResult;
use crate::learning::RefinementRequest;
use crate::vision::region::Region;

use super::commands::Command;

const ENABLE_LOGS: bool = true;

use crate::log_info;

pub trait ScreenSource: Send + Sync {
    fn screen_size(&self) -> AgentResult<(u32, u32)>;

    /// The whole capture surface, or just `region` of it.
    fn capture(&self, region: Option<Region>) -> AgentResult<DynamicImage>;
}

pub trait ClickInjector: Send + Sync {
    fn inject_click(&self, x: i32, y: i32) -> AgentResult<()>;
}

pub trait ForegroundApp: Send + Sync {
    /// Executable name of the focused application, if it can be determined.
    fn foreground_app_name(&self) -> Option<String>;
}

/// Shows a refinement request to the operator. Must not block; the answer
/// comes back later as a [`Command`].
pub trait OperatorPrompt: Send + Sync {
    fn request_refinement(&self, request: &RefinementRequest);
}

pub trait ListenerHandle: Send {
    fn stop(&mut self);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputEvent {
    /// `at` is when the listener saw the click, not when it is handled.
    Click {
        x: i32,
        y: i32,
        pressed: bool,
        at: Instant,
    },
    Command(Command),
    /// The listener died and will deliver nothing more.
    ListenerFailed(String),
}

pub trait InputSource {
    fn subscribe(&mut self, events: UnboundedSender<InputEvent>) -> AgentResult<Box<dyn ListenerHandle>>;
}

/// Prompts through the log; the operator answers with the confirm and
/// reject hotkeys.
pub struct LogPrompt;

impl OperatorPrompt for LogPrompt {
    fn request_refinement(&self, request: &RefinementRequest) {
        let near = &request.near_miss;
        log_info!(
            "Near miss on {} template {} (score {:.2}). Press F6 to refine it from this click or F7 to skip.",
            near.tier,
            near.template_id,
            near.score
        );
    }
}

/// For platforms where the focused application cannot be determined.
pub struct NoForegroundApp;

impl ForegroundApp for NoForegroundApp {
    fn foreground_app_name(&self) -> Option<String> {
        None
    }
}
