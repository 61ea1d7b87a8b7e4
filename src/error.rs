//! Typed error kinds raised by the core.
//!
//! Every public operation propagates failures through [`anyhow`] with one of
//! these kinds at the root, logs a single tagged line at the boundary, and
//! re-raises; nothing is recovered locally.

use thiserror::Error;

/// Failure kinds of the simulation core.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or inconsistent caller input: unknown vehicle type,
    /// unsupported mode, duplicate name, missing mandatory option.
    #[error("input validation: {0}")]
    InputValidation(String),

    /// A referenced name is absent from the registry, or a property or
    /// parameter path does not exist.
    #[error("lookup miss: {0}")]
    LookupMiss(String),

    /// An iterative solver did not converge or a residual stayed above
    /// tolerance.
    #[error("numeric failure: {0}")]
    NumericFailure(String),

    /// A property was requested on a model that does not support it.
    #[error("model mismatch: {0}")]
    ModelMismatch(String),

    /// Internal invariant violation.
    #[error("internal: {0}")]
    Internal(String),
}

/// Logs one diagnostic line tagged with the operation name and re-raises.
pub fn log_at_boundary<T>(operation: &str, result: anyhow::Result<T>) -> anyhow::Result<T> {
    if let Err(err) = &result {
        log::error!("[{operation}] {err:#}");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_is_downcastable() {
        let err: anyhow::Error = Error::LookupMiss("no track named 'suzuka'".into()).into();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::LookupMiss(_))
        ));
    }
}
