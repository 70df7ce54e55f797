use std::sync::{Mutex, PoisonError};

use image::DynamicImage;
use sysinfo::{Pid, ProcessesToUpdate, System};
use xcap::{Monitor, Window};

use crate::agent::bridge::{ForegroundApp, ScreenSource};
use crate::errors::{AgentError, AgentResult};
use crate::vision::region::Region;

fn primary_monitor() -> AgentResult<Monitor> {
    let monitors = Monitor::all()
        .map_err(|err| AgentError::CaptureFailure(format!("failed to enumerate monitors: {err}")))?;

    monitors
        .iter()
        .find(|monitor| monitor.is_primary().unwrap_or(false))
        .or_else(|| monitors.first())
        .cloned()
        .ok_or_else(|| AgentError::CaptureFailure("no monitors found".to_string()))
}

/// Captures the primary monitor. Multi-monitor layouts are not handled.
pub struct XcapScreen {
    size: Mutex<(u32, u32)>,
}

impl XcapScreen {
    pub fn new() -> AgentResult<Self> {
        let monitor = primary_monitor()?;
        let width = monitor
            .width()
            .map_err(|err| AgentError::CaptureFailure(err.to_string()))?;
        let height = monitor
            .height()
            .map_err(|err| AgentError::CaptureFailure(err.to_string()))?;

        Ok(Self {
            size: Mutex::new((width, height)),
        })
    }
}

impl ScreenSource for XcapScreen {
    fn screen_size(&self) -> AgentResult<(u32, u32)> {
        Ok(*self.size.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn capture(&self, region: Option<Region>) -> AgentResult<DynamicImage> {
        let raw = primary_monitor()?.capture_image().map_err(|err| {
            AgentError::CaptureFailure(format!(
                "{err}. On macOS, grant Screen Recording permission to the terminal"
            ))
        })?;

        let screenshot = DynamicImage::ImageRgba8(raw);
        let size = (screenshot.width(), screenshot.height());
        if size == (0, 0) {
            return Err(AgentError::CaptureFailure("captured an empty screenshot".to_string()));
        }
        *self.size.lock().unwrap_or_else(PoisonError::into_inner) = size;

        match region {
            None => Ok(screenshot),
            Some(region) => {
                let clipped = region
                    .clip_to(size)
                    .ok_or_else(|| AgentError::CaptureFailure(format!("{region:?} is off screen")))?;
                Ok(screenshot.crop_imm(clipped.x, clipped.y, clipped.width, clipped.height))
            }
        }
    }
}

/// Resolves the focused window to its executable name through its pid.
pub struct XcapForeground {
    system: Mutex<System>,
}

impl XcapForeground {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for XcapForeground {
    fn default() -> Self {
        Self::new()
    }
}

impl ForegroundApp for XcapForeground {
    fn foreground_app_name(&self) -> Option<String> {
        let windows = Window::all().ok()?;
        let focused = windows
            .iter()
            .find(|window| window.is_focused().unwrap_or(false))?;
        let pid = Pid::from_u32(focused.pid().ok()?);

        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]));
        system
            .process(pid)
            .map(|process| process.name().to_string_lossy().to_lowercase())
    }
}
