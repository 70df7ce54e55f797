use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Mode {
    ClickOnly,
    LearningOnly,
    Both,
    Stopped,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Mode::ClickOnly => "CLICK_ONLY",
            Mode::LearningOnly => "LEARNING_ONLY",
            Mode::Both => "BOTH",
            Mode::Stopped => "STOPPED",
        })
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CLICK_ONLY" => Ok(Mode::ClickOnly),
            "LEARNING_ONLY" => Ok(Mode::LearningOnly),
            "BOTH" => Ok(Mode::Both),
            "STOPPED" => Ok(Mode::Stopped),
            other => Err(format!("unknown mode '{other}'")),
        }
    }
}

/// Independently switchable behaviours. The named modes are presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    pub auto_click: bool,
    pub learning: bool,
    pub auto_train: bool,
}

impl Capabilities {
    fn for_mode(mode: Mode, auto_train: bool) -> Self {
        let (auto_click, learning) = match mode {
            Mode::ClickOnly => (true, false),
            Mode::LearningOnly => (false, true),
            Mode::Both => (true, true),
            Mode::Stopped => (false, false),
        };
        Self {
            auto_click,
            learning,
            auto_train,
        }
    }
}

/// What a mode command actually changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Changed,
    Unchanged,
    /// The controller is stopped and ignores further changes.
    Ignored,
}

pub struct ModeController {
    capabilities: Capabilities,
    quiet: bool,
    stopped: bool,
}

impl Default for ModeController {
    fn default() -> Self {
        Self::new()
    }
}

impl ModeController {
    pub fn new() -> Self {
        Self {
            capabilities: Capabilities::for_mode(Mode::ClickOnly, false),
            quiet: false,
            stopped: false,
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    /// The named mode matching the current capabilities, if any.
    pub fn mode(&self) -> Option<Mode> {
        if self.stopped {
            return Some(Mode::Stopped);
        }
        match (self.capabilities.auto_click, self.capabilities.learning) {
            (true, false) => Some(Mode::ClickOnly),
            (false, true) => Some(Mode::LearningOnly),
            (true, true) => Some(Mode::Both),
            (false, false) => None,
        }
    }

    pub fn set_mode(&mut self, mode: Mode) -> Transition {
        if self.stopped {
            return Transition::Ignored;
        }
        if mode == Mode::Stopped {
            return self.stop();
        }
        let next = Capabilities::for_mode(mode, self.capabilities.auto_train);
        self.apply(next)
    }

    pub fn toggle_learning(&mut self) -> Transition {
        if self.stopped {
            return Transition::Ignored;
        }
        let mut next = self.capabilities;
        next.learning = !next.learning;
        self.apply(next)
    }

    pub fn toggle_auto_train(&mut self) -> Transition {
        if self.stopped {
            return Transition::Ignored;
        }
        let mut next = self.capabilities;
        next.auto_train = !next.auto_train;
        self.apply(next)
    }

    pub fn toggle_quiet(&mut self) -> bool {
        self.quiet = !self.quiet;
        self.quiet
    }

    /// Terminal; every later mode change is ignored.
    pub fn stop(&mut self) -> Transition {
        if self.stopped {
            return Transition::Unchanged;
        }
        self.stopped = true;
        self.capabilities = Capabilities::for_mode(Mode::Stopped, false);
        Transition::Changed
    }

    fn apply(&mut self, next: Capabilities) -> Transition {
        if next == self.capabilities {
            return Transition::Unchanged;
        }
        self.capabilities = next;
        Transition::Changed
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn is_quiet(&self) -> bool {
        self.quiet
    }

    pub fn can_click(&self) -> bool {
        !self.stopped && self.capabilities.auto_click
    }

    pub fn can_learn(&self) -> bool {
        !self.stopped && self.capabilities.learning
    }

    pub fn can_auto_train(&self) -> bool {
        !self.stopped && self.capabilities.auto_train
    }

    pub fn describe(&self) -> String {
        let mode = self
            .mode()
            .map(|mode| mode.to_string())
            .unwrap_or_else(|| "IDLE".to_string());
        let on_off = |flag: bool| if flag { "on" } else { "off" };
        format!(
            "{mode} (auto-click {}, learning {}, auto-train {}, quiet {})",
            on_off(self.capabilities.auto_click),
            on_off(self.capabilities.learning),
            on_off(self.capabilities.auto_train),
            on_off(self.quiet),
        )
    }
}
