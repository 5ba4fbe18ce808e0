//! Key naming conventions.
//!
//! Keys on a non-default mesh carry a domain prefix: `"surface-pressure"`
//! lives on the `surface` domain, plain `"pressure"` on the default domain.

use crate::error::ConfigError;
use crate::id::Key;
use crate::params::ParameterList;

/// Name of the default (subsurface) domain.
pub const DEFAULT_DOMAIN: &str = "domain";

/// Domain prefix of a key, or `""` for the default domain.
pub fn get_domain(key: &str) -> &str {
    match key.find('-') {
        Some(pos) => &key[..pos],
        None => "",
    }
}

/// Mesh name a key lives on: its prefix, or [`DEFAULT_DOMAIN`].
pub fn mesh_of(key: &str) -> &str {
    match get_domain(key) {
        "" => DEFAULT_DOMAIN,
        d => d,
    }
}

/// Compose a key from a domain and a variable name.
pub fn get_key(domain: &str, var: &str) -> Key {
    if domain.is_empty() || domain == DEFAULT_DOMAIN {
        Key::new(var)
    } else {
        Key::new(format!("{domain}-{var}"))
    }
}

/// Read `"<basename> key"` from `plist`, defaulting to `get_key(domain, default)`.
pub fn read_key(
    plist: &ParameterList,
    domain: &str,
    basename: &str,
    default: &str,
) -> Result<Key, ConfigError> {
    let option = format!("{basename} key");
    let fallback = get_key(domain, default);
    plist.get_string_or(&option, fallback.as_str()).map(Key::from)
}

/// Name of the derivative record `d<of>/d<wrt>`.
pub fn derivative_key(of: &Key, wrt: &Key) -> Key {
    Key::new(format!("d{of}_d{wrt}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_prefix() {
        assert_eq!(get_domain("surface-pressure"), "surface");
        assert_eq!(get_domain("pressure"), "");
        assert_eq!(mesh_of("pressure"), "domain");
        assert_eq!(mesh_of("surface-pressure"), "surface");
    }

    #[test]
    fn default_domain_is_unprefixed() {
        assert_eq!(get_key("", "temperature"), "temperature");
        assert_eq!(get_key("domain", "temperature"), "temperature");
        assert_eq!(get_key("surface", "temperature"), "surface-temperature");
    }

    #[test]
    fn read_key_prefers_option() {
        let mut p = ParameterList::new("eos");
        assert_eq!(read_key(&p, "surface", "pressure", "effective_pressure").unwrap(),
                   "surface-effective_pressure");
        p.set("pressure key", "p");
        assert_eq!(read_key(&p, "surface", "pressure", "effective_pressure").unwrap(), "p");
    }

    #[test]
    fn derivative_naming() {
        let k = derivative_key(&Key::from("energy"), &Key::from("temperature"));
        assert_eq!(k, "denergy_dtemperature");
    }
}
