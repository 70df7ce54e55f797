use super::mode::Mode;

/// Operator commands delivered by the input listener. Each one is safe to
/// repeat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    ToggleQuiet,
    SetMode(Mode),
    ToggleLearning,
    ToggleAutoTrain,
    ForceStop,
    /// One scan and click cycle regardless of mode.
    ScanOnce,
    Cleanup,
    ConfirmRefinement,
    RejectRefinement,
    UpdateSetting { key: String, value: String },
}
