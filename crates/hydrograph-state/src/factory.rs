//! Construct evaluators by configured type name.

use hydrograph_core::{ConfigError, ParameterList, Tag};
use indexmap::IndexMap;

use crate::evaluator::Evaluator;
use crate::primary::{ConstantEvaluator, PrimaryVariable};

/// Option naming the evaluator type in a field's parameter list.
pub const TYPE_KEY: &str = "field evaluator type";

/// Constructor registered for one evaluator type.
pub type EvaluatorCtor = fn(&ParameterList, &Tag) -> Result<Box<dyn Evaluator>, ConfigError>;

/// Maps `"field evaluator type"` strings to constructors.
///
/// Starts with `"primary variable"` and `"constant"` registered. Plug-in
/// crates add their own types with [`register`](EvaluatorFactory::register).
#[derive(Clone)]
pub struct EvaluatorFactory {
    ctors: IndexMap<String, EvaluatorCtor>,
}

impl Default for EvaluatorFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl EvaluatorFactory {
    /// A factory knowing only the built-in types.
    pub fn new() -> Self {
        let mut f = Self {
            ctors: IndexMap::new(),
        };
        f.register("primary variable", PrimaryVariable::from_plist);
        f.register("constant", ConstantEvaluator::from_plist);
        f
    }

    /// Register (or replace) a constructor.
    pub fn register(&mut self, type_name: impl Into<String>, ctor: EvaluatorCtor) -> &mut Self {
        self.ctors.insert(type_name.into(), ctor);
        self
    }

    /// Whether a type name is known.
    pub fn contains(&self, type_name: &str) -> bool {
        self.ctors.contains_key(type_name)
    }

    /// Registered type names, in registration order.
    pub fn type_names(&self) -> impl Iterator<Item = &str> {
        self.ctors.keys().map(|k| k.as_str())
    }

    /// Build the evaluator described by `plist` at `tag`.
    pub fn create(&self, plist: &ParameterList, tag: &Tag) -> Result<Box<dyn Evaluator>, ConfigError> {
        let type_name = plist.get_str(TYPE_KEY)?;
        let ctor = self
            .ctors
            .get(type_name)
            .ok_or_else(|| ConfigError::UnknownType {
                type_name: type_name.to_string(),
            })?;
        ctor(plist, tag)
    }
}

impl std::fmt::Debug for EvaluatorFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.ctors.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_type_is_config_error() {
        let mut p = ParameterList::new("x");
        p.set(TYPE_KEY, "quantum foam");
        p.set("evaluator name", "x");
        match EvaluatorFactory::new().create(&p, &Tag::NEXT) {
            Err(ConfigError::UnknownType { type_name }) => assert_eq!(type_name, "quantum foam"),
            Err(other) => panic!("expected UnknownType, got {other:?}"),
            Ok(_) => panic!("expected UnknownType, got an evaluator"),
        }
    }

    #[test]
    fn missing_type_key_is_reported() {
        let p = ParameterList::new("x");
        assert!(matches!(
            EvaluatorFactory::new().create(&p, &Tag::NEXT),
            Err(ConfigError::MissingParameter { .. })
        ));
    }

    #[test]
    fn builtins_registered() {
        let f = EvaluatorFactory::new();
        let names: Vec<_> = f.type_names().collect();
        assert_eq!(names, ["primary variable", "constant"]);
    }
}
