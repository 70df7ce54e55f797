pub mod fingerprint;
pub mod matcher;
pub mod region;

pub use fingerprint::{BlockDescriptor, FingerprintEngine, HashFingerprint};
pub use matcher::{Frame, MatchEngine, MatchResult, ScanReport, TemplateScorer, TierMatch};
pub use region::Region;
