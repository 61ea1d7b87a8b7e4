//! Convenient public imports for downstream users.

pub use crate::error::Error;
pub use crate::laptime::{
    ControlMode, IntegralConstraint, LaptimeOptions, LaptimeSolution, OptimalLaptime,
};
pub use crate::registry::Registry;
pub use crate::steady_state::{GgDiagram, SteadyState, SteadyStatePoint};
pub use crate::track::preprocessor::{TrackPreprocessor, TrackPreprocessorOptions};
pub use crate::track::{Track, TrackSurface};
pub use crate::traits::{Init, SerdeAPI};
pub use crate::vehicle::{
    f1_3dof::F1Car, kart_6dof::KartCar, ParameterSet, StateLayout, Vehicle, VehicleModel,
};
