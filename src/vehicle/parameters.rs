//! Vehicle parameters: the path-addressed input map and the declared
//! parameters exposed to the sensitivity facility.

use crate::imports::*;

/// Path-addressed scalar parameters parsed from a vehicle description (e.g.
/// `"chassis/mass"`). This is the form in which external vehicle files reach
/// the core.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct ParameterSet {
    pub entries: HashMap<String, f64>,
}

impl ParameterSet {
    pub fn get(&self, path: &str) -> anyhow::Result<f64> {
        self.entries
            .get(path)
            .copied()
            .ok_or_else(|| anyhow!(Error::LookupMiss(format!("parameter {path:?} not found"))))
    }

    pub fn get_or(&self, path: &str, default: f64) -> f64 {
        self.entries.get(path).copied().unwrap_or(default)
    }

    pub fn insert<S: Into<String>>(&mut self, path: S, value: f64) {
        self.entries.insert(path.into(), value);
    }
}

impl Init for ParameterSet {}
impl SerdeAPI for ParameterSet {}

/// One declared parameter: a constant (single value, no mesh) or a
/// piecewise-constant-over-arclength vector selected by breakpoints.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct DeclaredParameter {
    pub path: String,
    /// One alias per value
    pub aliases: Vec<String>,
    pub values: Vec<f64>,
    /// `(s, index into values)` breakpoints, sorted by `s`; empty for
    /// constants
    pub mesh: Vec<(f64, usize)>,
}

impl DeclaredParameter {
    /// Index into `values` active at arclength `s`: the last breakpoint at
    /// or before `s` selects it.
    pub fn active_index(&self, s: f64) -> usize {
        if self.mesh.is_empty() {
            return 0;
        }
        let mut active = self.mesh[0].1;
        for (s_bp, idx) in &self.mesh {
            if *s_bp <= s {
                active = *idx;
            } else {
                break;
            }
        }
        active
    }
}

/// The set of declared parameters of one vehicle. Their values concatenate
/// into the flat gradient-input vector consumed by the NLP layer.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct DeclaredParameters {
    pub entries: Vec<DeclaredParameter>,
}

impl DeclaredParameters {
    /// Registers a constant parameter addressed by `path` under `alias`.
    pub fn declare_constant(&mut self, path: &str, alias: &str, value: f64) -> anyhow::Result<()> {
        ensure!(
            !self.entries.iter().any(|e| e.path == path),
            Error::InputValidation(format!("parameter {path:?} is already declared"))
        );
        self.entries.push(DeclaredParameter {
            path: path.into(),
            aliases: vec![alias.into()],
            values: vec![value],
            mesh: vec![],
        });
        Ok(())
    }

    /// Registers a piecewise parameter. `aliases` carries one alias per
    /// value, joined with `';'`.
    pub fn declare_variable(
        &mut self,
        path: &str,
        aliases: &str,
        values: Vec<f64>,
        mesh: Vec<(f64, usize)>,
    ) -> anyhow::Result<()> {
        ensure!(
            !self.entries.iter().any(|e| e.path == path),
            Error::InputValidation(format!("parameter {path:?} is already declared"))
        );
        let aliases: Vec<String> = aliases.split(';').map(|a| a.trim().to_string()).collect();
        ensure!(
            aliases.len() == values.len(),
            Error::InputValidation(format!(
                "{} aliases provided for {} values of {path:?}",
                aliases.len(),
                values.len()
            ))
        );
        ensure!(
            !mesh.is_empty(),
            Error::InputValidation(format!("piecewise parameter {path:?} requires breakpoints"))
        );
        ensure!(
            mesh.windows(2).all(|w| w[0].0 < w[1].0),
            Error::InputValidation(format!("breakpoints of {path:?} must increase strictly"))
        );
        ensure!(
            mesh.iter().all(|(_, idx)| *idx < values.len()),
            Error::InputValidation(format!("breakpoint index out of range for {path:?}"))
        );
        self.entries.push(DeclaredParameter {
            path: path.into(),
            aliases,
            values,
            mesh,
        });
        Ok(())
    }

    /// Total number of values, i.e. the gradient dimension.
    pub fn n_values(&self) -> usize {
        self.entries.iter().map(|e| e.values.len()).sum()
    }

    /// Flat nominal value vector.
    pub fn values(&self) -> Vec<f64> {
        self.entries
            .iter()
            .flat_map(|e| e.values.iter().copied())
            .collect()
    }

    /// Flat alias list, aligned with [`DeclaredParameters::values`].
    pub fn alias_names(&self) -> Vec<String> {
        self.entries
            .iter()
            .flat_map(|e| e.aliases.iter().cloned())
            .collect()
    }

    /// Value of the declared parameter at `path` active at arclength `s`,
    /// drawn from the flat vector `p` (AD or plain). `None` when `path` was
    /// never declared.
    pub fn lookup<T: DualNum<f64> + Copy>(&self, path: &str, s: f64, p: &[T]) -> Option<T> {
        let mut offset = 0;
        for entry in &self.entries {
            if entry.path == path {
                return Some(p[offset + entry.active_index(s)]);
            }
            offset += entry.values.len();
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parameter_set_lookup_miss() {
        let params = ParameterSet::default();
        let err = params.get("chassis/mass").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::LookupMiss(_))
        ));
    }

    #[test]
    fn test_declared_constant_lookup() {
        let mut declared = DeclaredParameters::default();
        declared
            .declare_constant("chassis/mass", "m", 660.0)
            .unwrap();
        let p = declared.values();
        assert_eq!(p, vec![660.0]);
        assert_eq!(declared.lookup("chassis/mass", 12.0, &p), Some(660.0));
        assert_eq!(declared.lookup("chassis/inertia", 12.0, &p), None);
    }

    #[test]
    fn test_declared_duplicate_rejected() {
        let mut declared = DeclaredParameters::default();
        declared.declare_constant("chassis/mass", "m", 660.0).unwrap();
        assert!(declared
            .declare_constant("chassis/mass", "m2", 661.0)
            .is_err());
    }

    #[test]
    fn test_piecewise_selects_by_breakpoint() {
        let mut declared = DeclaredParameters::default();
        declared
            .declare_variable(
                "engine/maximum-power",
                "p1;p2",
                vec![500e3, 550e3],
                vec![(0.0, 0), (700.0, 1)],
            )
            .unwrap();
        let p = declared.values();
        assert_eq!(
            declared.lookup("engine/maximum-power", 100.0, &p),
            Some(500e3)
        );
        assert_eq!(
            declared.lookup("engine/maximum-power", 900.0, &p),
            Some(550e3)
        );
        assert_eq!(declared.alias_names(), vec!["p1", "p2"]);
    }

    #[test]
    fn test_piecewise_alias_count_must_match() {
        let mut declared = DeclaredParameters::default();
        assert!(declared
            .declare_variable("engine/maximum-power", "p1", vec![1.0, 2.0], vec![(0.0, 0)])
            .is_err());
    }
}
