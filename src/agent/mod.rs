pub mod blacklist;
pub mod bridge;
pub mod commands;
pub mod context;
pub mod controller;
pub mod loop_worker;
pub mod mode;

pub use bridge::{
    ClickInjector, ForegroundApp, InputEvent, InputSource, ListenerHandle, LogPrompt, NoForegroundApp,
    OperatorPrompt, ScreenSource,
};
pub use commands::Command;
pub use context::{Agent, Collaborators, Flow};
pub use controller::AgentController;
pub use loop_worker::{ExitReason, LoopExit};
pub use mode::{Capabilities, Mode, ModeController};
