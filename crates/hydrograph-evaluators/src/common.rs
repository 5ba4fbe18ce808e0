//! Helpers shared by the evaluators.

use hydrograph_core::keys::{get_domain, read_key};
use hydrograph_core::{ConfigError, Key, KeyTag, ParameterList, StateError};

/// The key an evaluator provides.
///
/// The store sets `"evaluator name"` to the field key when it builds an
/// evaluator from the field-evaluator list; that name wins. Otherwise
/// `"<basename> key"` is read, defaulting to `default` on `domain`.
pub(crate) fn output_key(
    plist: &ParameterList,
    domain: &str,
    basename: &str,
    default: &str,
) -> Result<Key, ConfigError> {
    if plist.is_parameter("evaluator name") {
        plist.get_str("evaluator name").map(Key::from)
    } else {
        read_key(plist, domain, basename, default)
    }
}

/// Domain for default dependency keys: `"domain name"` if given, else the
/// prefix of `"evaluator name"`.
pub(crate) fn domain_from(plist: &ParameterList) -> Result<String, ConfigError> {
    if plist.is_parameter("domain name") {
        return plist.get_str("domain name").map(str::to_string);
    }
    let name = plist.get_string_or("evaluator name", "")?;
    Ok(get_domain(&name).to_string())
}

pub(crate) fn eval_failed(evaluator: &str, reason: impl Into<String>) -> StateError {
    StateError::EvaluationFailed {
        evaluator: evaluator.to_string(),
        reason: reason.into(),
    }
}

pub(crate) fn unsupported(evaluator: &str, of: &KeyTag, wrt: &KeyTag) -> StateError {
    StateError::UnsupportedDerivative {
        evaluator: evaluator.to_string(),
        of: of.clone(),
        wrt: wrt.clone(),
    }
}
