pub mod chains;
pub mod samourai;
pub mod wasabi;

mod engine;

pub use engine::{
    Heuristic, HeuristicContext, HeuristicOutcome, RefinementEngine, RefinementParams, RunState,
};
