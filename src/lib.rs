//! Crate containing the core of a minimum-lap-time simulator: curvilinear
//! track preprocessing, differentiable vehicle dynamics models, steady-state
//! and gg-diagram computation, and an interior-point optimal-control solver
//! that finds the time-optimal way around a track.
//!
//! The expensive operations ([`track::preprocessor`] and [`laptime`]) are
//! synchronous and block to completion; named inputs and outputs flow through
//! an explicit [`registry::Registry`] context owned by the caller.

#[macro_use]
pub mod macros;

pub mod error;
pub mod imports;
pub mod laptime;
pub mod nlp;
pub mod prelude;
pub mod registry;
pub mod steady_state;
pub mod track;
pub mod traits;
pub mod utils;
pub mod vehicle;
