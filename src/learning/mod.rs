pub mod observation;
pub mod refinement;

pub use observation::{Observation, ObservationOutcome, ObservationTracker};
pub use refinement::{AutoTrainCandidate, AutoTrainer, NearMiss, RefinementRequest, RefinementTracker};
