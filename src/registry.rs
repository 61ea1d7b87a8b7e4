//! The owned context holding named artifacts (vehicles, tracks, scalars,
//! vectors) and the per-vehicle-kind warm-start slots. Every public
//! operation on the registry logs one tagged line on failure and re-raises.

use crate::error::log_at_boundary;
use crate::imports::*;
use crate::laptime::{LaptimeOptions, LaptimeSolution, OptimalLaptime};
use crate::steady_state::{GgDiagram, SteadyState};
use crate::track::{Track, TrackSurface};
use crate::vehicle::{PropertyContext, Vehicle, VehicleModel};

#[derive(Default)]
pub struct Registry {
    vehicles: HashMap<String, Vehicle>,
    tracks: HashMap<String, Arc<TrackSurface>>,
    scalars: HashMap<String, f64>,
    vectors: HashMap<String, Vec<f64>>,
    /// Last saved solution per vehicle kind, reusable as a warm start
    warm_starts: HashMap<String, LaptimeSolution>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_name_is_free(&self, name: &str) -> anyhow::Result<()> {
        ensure!(
            !self.vehicles.contains_key(name)
                && !self.tracks.contains_key(name)
                && !self.scalars.contains_key(name)
                && !self.vectors.contains_key(name),
            Error::InputValidation(format!("name {name:?} already exists"))
        );
        Ok(())
    }

    pub fn insert_vehicle<S: Into<String>>(
        &mut self,
        name: S,
        vehicle: Vehicle,
    ) -> anyhow::Result<()> {
        let name = name.into();
        let result = (|| {
            self.ensure_name_is_free(&name)?;
            self.vehicles.insert(name.clone(), vehicle);
            Ok(())
        })();
        log_at_boundary("insert_vehicle", result)
    }

    pub fn insert_track<S: Into<String>>(&mut self, name: S, track: Track) -> anyhow::Result<()> {
        let name = name.into();
        let result = (|| {
            self.ensure_name_is_free(&name)?;
            let surface = TrackSurface::new(track)?;
            self.tracks.insert(name.clone(), Arc::new(surface));
            Ok(())
        })();
        log_at_boundary("insert_track", result)
    }

    pub fn create_scalar<S: Into<String>>(&mut self, name: S, value: f64) -> anyhow::Result<()> {
        let name = name.into();
        let result = (|| {
            self.ensure_name_is_free(&name)?;
            self.scalars.insert(name, value);
            Ok(())
        })();
        log_at_boundary("create_scalar", result)
    }

    pub fn create_vector<S: Into<String>>(
        &mut self,
        name: S,
        values: Vec<f64>,
    ) -> anyhow::Result<()> {
        let name = name.into();
        let result = (|| {
            self.ensure_name_is_free(&name)?;
            self.vectors.insert(name, values);
            Ok(())
        })();
        log_at_boundary("create_vector", result)
    }

    pub fn vehicle(&self, name: &str) -> anyhow::Result<&Vehicle> {
        self.vehicles
            .get(name)
            .ok_or_else(|| anyhow!(Error::LookupMiss(format!("no vehicle named {name:?}"))))
    }

    pub fn vehicle_mut(&mut self, name: &str) -> anyhow::Result<&mut Vehicle> {
        self.vehicles
            .get_mut(name)
            .ok_or_else(|| anyhow!(Error::LookupMiss(format!("no vehicle named {name:?}"))))
    }

    pub fn track(&self, name: &str) -> anyhow::Result<&Arc<TrackSurface>> {
        self.tracks
            .get(name)
            .ok_or_else(|| anyhow!(Error::LookupMiss(format!("no track named {name:?}"))))
    }

    pub fn scalar(&self, name: &str) -> anyhow::Result<f64> {
        self.scalars
            .get(name)
            .copied()
            .ok_or_else(|| anyhow!(Error::LookupMiss(format!("no scalar named {name:?}"))))
    }

    pub fn vector(&self, name: &str) -> anyhow::Result<&Vec<f64>> {
        self.vectors
            .get(name)
            .ok_or_else(|| anyhow!(Error::LookupMiss(format!("no vector named {name:?}"))))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .vehicles
            .keys()
            .chain(self.tracks.keys())
            .chain(self.scalars.keys())
            .chain(self.vectors.keys())
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Duplicates a named artifact under a new name.
    pub fn copy_variable(&mut self, old_name: &str, new_name: &str) -> anyhow::Result<()> {
        let result = (|| {
            self.ensure_name_is_free(new_name)?;
            if let Some(vehicle) = self.vehicles.get(old_name) {
                let copy = vehicle.clone();
                self.vehicles.insert(new_name.into(), copy);
            } else if let Some(track) = self.tracks.get(old_name) {
                let copy = Arc::clone(track);
                self.tracks.insert(new_name.into(), copy);
            } else if let Some(value) = self.scalars.get(old_name) {
                let copy = *value;
                self.scalars.insert(new_name.into(), copy);
            } else if let Some(values) = self.vectors.get(old_name) {
                let copy = values.clone();
                self.vectors.insert(new_name.into(), copy);
            } else {
                bail!(Error::LookupMiss(format!(
                    "no variable named {old_name:?}"
                )));
            }
            Ok(())
        })();
        log_at_boundary("copy_variable", result)
    }

    /// Renames a named artifact.
    pub fn move_variable(&mut self, old_name: &str, new_name: &str) -> anyhow::Result<()> {
        let result = (|| {
            self.ensure_name_is_free(new_name)?;
            if let Some(vehicle) = self.vehicles.remove(old_name) {
                self.vehicles.insert(new_name.into(), vehicle);
            } else if let Some(track) = self.tracks.remove(old_name) {
                self.tracks.insert(new_name.into(), track);
            } else if let Some(value) = self.scalars.remove(old_name) {
                self.scalars.insert(new_name.into(), value);
            } else if let Some(values) = self.vectors.remove(old_name) {
                self.vectors.insert(new_name.into(), values);
            } else {
                bail!(Error::LookupMiss(format!(
                    "no variable named {old_name:?}"
                )));
            }
            Ok(())
        })();
        log_at_boundary("move_variable", result)
    }

    /// Deletes a named artifact of any kind.
    pub fn delete_variable(&mut self, name: &str) -> anyhow::Result<()> {
        let result = (|| {
            let found = self.vehicles.remove(name).is_some()
                || self.tracks.remove(name).is_some()
                || self.scalars.remove(name).is_some()
                || self.vectors.remove(name).is_some();
            ensure!(
                found,
                Error::LookupMiss(format!("no variable named {name:?}"))
            );
            Ok(())
        })();
        log_at_boundary("delete_variable", result)
    }

    /// Deletes every scalar and vector whose name starts with `prefix`.
    pub fn delete_variables_by_prefix(&mut self, prefix: &str) {
        self.scalars.retain(|name, _| !name.starts_with(prefix));
        self.vectors.retain(|name, _| !name.starts_with(prefix));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.vehicles.contains_key(name)
            || self.tracks.contains_key(name)
            || self.scalars.contains_key(name)
            || self.vectors.contains_key(name)
    }

    /// Binds a vehicle to a track; valid to repeat with a different track.
    pub fn vehicle_change_track(
        &mut self,
        vehicle_name: &str,
        track_name: &str,
    ) -> anyhow::Result<()> {
        let result = (|| {
            let track = Arc::clone(self.track(track_name)?);
            self.vehicle_mut(vehicle_name)?.change_track(track);
            Ok(())
        })();
        log_at_boundary("vehicle_change_track", result)
    }

    /// Full optimal-laptime run: seed (steady state or warm start), solve,
    /// save the warm start when requested, and place the outputs into the
    /// scalar/vector tables under the configured prefix.
    pub fn optimal_laptime(
        &mut self,
        vehicle_name: &str,
        track_name: &str,
        n_points: usize,
        options: &LaptimeOptions,
    ) -> anyhow::Result<LaptimeSolution> {
        let result = (|| {
            self.vehicle_change_track(vehicle_name, track_name)?;
            let car = self.vehicle(vehicle_name)?.clone();
            let solver = OptimalLaptime::new(&car, options.clone());
            let solution = if options.warm_start {
                let previous = self.warm_starts.get(car.kind()).ok_or_else(|| {
                    anyhow!(Error::InputValidation(format!(
                        "no warm start saved for vehicle kind {:?}",
                        car.kind()
                    )))
                })?;
                solver.compute_warm(previous)?
            } else {
                solver.compute_uniform(n_points)?
            };
            if options.save_warm_start {
                self.warm_starts
                    .insert(car.kind().to_string(), solution.clone());
            }
            if !options.output_variables_prefix.is_empty() {
                self.write_outputs(&car, &solution, &options.output_variables_prefix)?;
            }
            Ok(solution)
        })();
        log_at_boundary("optimal_laptime", result)
    }

    /// Sweeps the gg diagram and stores `ay`, `ax_max`, `ax_min` vectors.
    pub fn gg_diagram(
        &mut self,
        vehicle_name: &str,
        v: f64,
        n_points: usize,
        prefix: &str,
    ) -> anyhow::Result<GgDiagram> {
        let result = (|| {
            let car = self.vehicle(vehicle_name)?;
            let gg = SteadyState::new(car).gg_diagram(v, n_points)?;
            self.vectors.insert(format!("{prefix}ay"), gg.ay.to_vec());
            self.vectors
                .insert(format!("{prefix}ax_max"), gg.ax_max.to_vec());
            self.vectors
                .insert(format!("{prefix}ax_min"), gg.ax_min.to_vec());
            Ok(gg)
        })();
        log_at_boundary("gg_diagram", result)
    }

    /// Places per-node output vectors for every property the model kind
    /// supports, the laptime scalar, and any parameter sensitivities.
    fn write_outputs(
        &mut self,
        car: &Vehicle,
        solution: &LaptimeSolution,
        prefix: &str,
    ) -> anyhow::Result<()> {
        let names = {
            let mut names = car.property_names();
            names.sort();
            names
        };
        let n_points = solution.s.len();
        let p = car.declared().values();
        let mut columns: HashMap<String, Vec<f64>> = names
            .iter()
            .map(|n| (n.clone(), Vec::with_capacity(n_points)))
            .collect();
        for i in 0..n_points {
            let outputs = car.evaluate(
                &solution.q[i],
                &solution.qa[i],
                &solution.u[i],
                solution.s[i],
                &p,
            )?;
            let context = PropertyContext {
                q: &solution.q[i],
                qa: &solution.qa[i],
                u: &solution.u[i],
                s: solution.s[i],
                outputs: &outputs,
                layout: car.layout(),
                cd: car.drag_coefficient(),
            };
            for name in &names {
                let value = car.property_from_context(&context, name)?;
                columns.get_mut(name).unwrap().push(value);
            }
        }
        for (name, values) in columns {
            self.vectors.insert(format!("{prefix}{name}"), values);
        }
        self.scalars
            .insert(format!("{prefix}laptime"), solution.laptime);

        if let Some(sens) = &solution.sensitivities {
            let state_names = car.state_names();
            for (k, alias) in sens.parameter_aliases.iter().enumerate() {
                for (j, state) in state_names.iter().enumerate() {
                    let column: Vec<f64> =
                        (0..n_points).map(|i| sens.dq_dp[k][i][j]).collect();
                    self.vectors
                        .insert(format!("{prefix}derivatives/{state}/{alias}"), column);
                }
                self.scalars.insert(
                    format!("{prefix}derivatives/laptime/{alias}"),
                    sens.dlaptime_dp[k],
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::track::tests::ring_track;
    use crate::vehicle::ParameterSet;

    fn registry_with_ring() -> Registry {
        let mut registry = Registry::new();
        registry
            .insert_track("ring", ring_track(120.0, 5.0, 96))
            .unwrap();
        registry
            .insert_vehicle(
                "car",
                Vehicle::from_kind("f1-3dof", &ParameterSet::default()).unwrap(),
            )
            .unwrap();
        registry
    }

    #[test]
    fn test_duplicate_names_rejected_across_tables() {
        let mut registry = registry_with_ring();
        let err = registry.create_scalar("ring", 1.0).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::InputValidation(_))
        ));
    }

    #[test]
    fn test_copy_then_move_then_delete_empties_the_name() {
        let mut registry = Registry::new();
        registry.create_scalar("a", 2.5).unwrap();
        registry.copy_variable("a", "b").unwrap();
        assert_eq!(registry.scalar("b").unwrap(), 2.5);
        registry.move_variable("b", "c").unwrap();
        assert!(!registry.contains("b"));
        registry.delete_variable("c").unwrap();
        registry.delete_variable("a").unwrap();
        assert!(!registry.contains("a"));
        assert!(!registry.contains("c"));
        let err = registry.scalar("a").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::LookupMiss(_))
        ));
    }

    #[test]
    fn test_delete_by_prefix() {
        let mut registry = Registry::new();
        registry.create_scalar("run/laptime", 80.0).unwrap();
        registry.create_vector("run/u", vec![1.0, 2.0]).unwrap();
        registry.create_scalar("keep/laptime", 81.0).unwrap();
        registry.delete_variables_by_prefix("run/");
        assert!(!registry.contains("run/laptime"));
        assert!(!registry.contains("run/u"));
        assert!(registry.contains("keep/laptime"));
    }

    #[test]
    fn test_missing_lookup_is_logged_miss() {
        let registry = Registry::new();
        let err = registry.vehicle("ghost").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::LookupMiss(_))
        ));
    }

    #[test]
    fn test_optimal_laptime_writes_outputs_and_warm_start() {
        let mut registry = registry_with_ring();
        let options = LaptimeOptions {
            steady_state_speed: 30.0,
            save_warm_start: true,
            ..Default::default()
        };
        let solution = registry
            .optimal_laptime("car", "ring", 10, &options)
            .unwrap();
        assert!(solution.laptime > 0.0);
        assert!(registry.scalar("run/laptime").unwrap() > 0.0);
        let u = registry.vector("run/u").unwrap();
        assert_eq!(u.len(), solution.s.len());
        assert!(registry.vector("run/front_axle.left_tire.lambda").is_ok());

        // warm start reuses the saved run
        let warm_options = LaptimeOptions {
            steady_state_speed: 30.0,
            warm_start: true,
            output_variables_prefix: "warm/".into(),
            ..Default::default()
        };
        let warm = registry
            .optimal_laptime("car", "ring", 10, &warm_options)
            .unwrap();
        assert!(almost_eq(warm.laptime, solution.laptime, Some(1e-8)));
        assert!(warm.iterations < solution.iterations);
    }

    #[test]
    fn test_warm_start_without_saved_run_fails() {
        let mut registry = registry_with_ring();
        let options = LaptimeOptions {
            warm_start: true,
            ..Default::default()
        };
        let err = registry
            .optimal_laptime("car", "ring", 10, &options)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::InputValidation(_))
        ));
    }
}
