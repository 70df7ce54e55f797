//! Real desktop backends: xcap for the screen and the focused window, sysinfo
//! for process names, enigo for clicks and rdev for global input.

pub mod input;
pub mod screen;

pub use input::{EnigoInjector, RdevInput};
pub use screen::{XcapForeground, XcapScreen};
