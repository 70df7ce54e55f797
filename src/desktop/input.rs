use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use enigo::{Button, Coordinate, Direction, Enigo, Mouse, Settings};
use rdev::{EventType, Key};
use tokio::sync::mpsc::UnboundedSender;

use crate::agent::bridge::{ClickInjector, InputEvent, InputSource, ListenerHandle};
use crate::agent::commands::Command;
use crate::agent::mode::Mode;
use crate::errors::{AgentError, AgentResult};

const ENABLE_LOGS: bool = true;

use crate::log_info;

/// Moves the pointer and clicks through enigo. A fresh connection is opened
/// per click so the injector can be called from any blocking worker.
pub struct EnigoInjector;

impl ClickInjector for EnigoInjector {
    fn inject_click(&self, x: i32, y: i32) -> AgentResult<()> {
        let mut enigo = Enigo::new(&Settings::default())
            .map_err(|err| AgentError::InjectionFailure(err.to_string()))?;
        enigo
            .move_mouse(x, y, Coordinate::Abs)
            .map_err(|err| AgentError::InjectionFailure(err.to_string()))?;
        enigo
            .button(Button::Left, Direction::Click)
            .map_err(|err| AgentError::InjectionFailure(err.to_string()))
    }
}

/// Maps a function key plus the held modifiers to a command.
///
/// F6/F7 answer a refinement prompt, F8 toggles quiet, F9/F10/F11 pick
/// LEARNING_ONLY/CLICK_ONLY/BOTH and F12 stops. Ctrl+F9 runs cleanup,
/// Ctrl+F10 scans once, Shift+F9 toggles learning and Shift+F12 toggles
/// auto-train.
pub fn hotkey_command(key: Key, ctrl: bool, shift: bool) -> Option<Command> {
    let command = match key {
        Key::F6 => Command::ConfirmRefinement,
        Key::F7 => Command::RejectRefinement,
        Key::F8 => Command::ToggleQuiet,
        Key::F9 if ctrl => Command::Cleanup,
        Key::F9 if shift => Command::ToggleLearning,
        Key::F9 => Command::SetMode(Mode::LearningOnly),
        Key::F10 if ctrl => Command::ScanOnce,
        Key::F10 => Command::SetMode(Mode::ClickOnly),
        Key::F11 => Command::SetMode(Mode::Both),
        Key::F12 if shift => Command::ToggleAutoTrain,
        Key::F12 => Command::ForceStop,
        _ => return None,
    };
    Some(command)
}

/// Global mouse and keyboard hook on a dedicated thread.
#[derive(Default)]
pub struct RdevInput;

struct RdevHandle {
    stop_indicator: Arc<AtomicBool>,
}

impl ListenerHandle for RdevHandle {
    fn stop(&mut self) {
        // rdev cannot unhook; the callback goes inert instead
        self.stop_indicator.store(true, Ordering::SeqCst);
    }
}

impl InputSource for RdevInput {
    fn subscribe(&mut self, events: UnboundedSender<InputEvent>) -> AgentResult<Box<dyn ListenerHandle>> {
        let stop_indicator = Arc::new(AtomicBool::new(false));
        let stop_indicator_clone = Arc::clone(&stop_indicator);

        thread::Builder::new()
            .name("clickwise-input".to_string())
            .spawn(move || {
                let failure_tx = events.clone();
                let mut ctrl = false;
                let mut shift = false;
                let mut pointer = (0.0_f64, 0.0_f64);

                if let Err(error) = rdev::listen(move |event: rdev::Event| {
                    if stop_indicator_clone.load(Ordering::SeqCst) {
                        return;
                    }

                    let forwarded = match event.event_type {
                        EventType::MouseMove { x, y } => {
                            pointer = (x, y);
                            None
                        }
                        EventType::ButtonPress(rdev::Button::Left) => Some(InputEvent::Click {
                            x: pointer.0 as i32,
                            y: pointer.1 as i32,
                            pressed: true,
                            at: Instant::now(),
                        }),
                        EventType::ButtonRelease(rdev::Button::Left) => Some(InputEvent::Click {
                            x: pointer.0 as i32,
                            y: pointer.1 as i32,
                            pressed: false,
                            at: Instant::now(),
                        }),
                        EventType::KeyPress(Key::ControlLeft | Key::ControlRight) => {
                            ctrl = true;
                            None
                        }
                        EventType::KeyRelease(Key::ControlLeft | Key::ControlRight) => {
                            ctrl = false;
                            None
                        }
                        EventType::KeyPress(Key::ShiftLeft | Key::ShiftRight) => {
                            shift = true;
                            None
                        }
                        EventType::KeyRelease(Key::ShiftLeft | Key::ShiftRight) => {
                            shift = false;
                            None
                        }
                        EventType::KeyPress(key) => hotkey_command(key, ctrl, shift).map(InputEvent::Command),
                        _ => None,
                    };

                    if let Some(event) = forwarded {
                        // the agent loop is gone once the receiver drops
                        let _ = events.send(event);
                    }
                }) {
                    let _ = failure_tx.send(InputEvent::ListenerFailed(format!("{error:?}")));
                }
            })
            .map_err(|err| AgentError::ListenerFailure(err.to_string()))?;

        log_info!("Input listener started (F8 quiet, F9 learn, F10 click, F11 both, F12 stop)");
        Ok(Box::new(RdevHandle { stop_indicator }))
    }
}
