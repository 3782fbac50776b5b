//! Coordinate-first heuristic solver for very large planar TSP instances.
//! Decomposes the instance, solves leaves in parallel, stitches them and
//! refines the joined tour until the time budget is spent.

mod algo;
mod budget;
mod error;
mod geo;
mod io;
pub mod logging;
mod node;
mod oracle;
mod router;
mod tour;

pub(crate) use geo::geometry;
pub(crate) use io::options;

pub use algo::{
    kernel::lin_kernighan::LkVariant,
    leaf::LeafReport,
    polish::PolishReport,
    solver::{PhaseDiagnostics, SolveReport, solve},
    stitching::StitchMetrics,
    vcycle::VCycleReport,
};
pub use error::{Error, Result};
pub use io::input::{read_points, write_tour};
pub use io::options::{AlphaMode, DecomposeMode, FingerprintMode, SolverOptions, StitchMode};
pub use node::Point;
pub use oracle::DistanceOracle;
pub use router::{RoutingThresholds, SolverConfig, StrategyRouter, fingerprint::InstanceFingerprint};
pub use tour::is_permutation;
