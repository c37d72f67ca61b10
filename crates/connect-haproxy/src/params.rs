//! User-tunable `global`/`defaults` parameter overlays.
//!
//! Knobs are two maps of `key -> [values]`, merged right-biased over the
//! built-in defaults. `BTreeMap` keeps rendering deterministic without a
//! sort pass.

use std::collections::BTreeMap;

use connect_core::{Error, Result};

/// Which native configuration section a parameter lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamScope {
    /// The `global` section.
    Global,
    /// The `defaults` section.
    Defaults,
}

/// Parameter overlays for the `global` and `defaults` sections.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HaproxyParams {
    /// `global` section entries.
    pub globals: BTreeMap<String, Vec<String>>,
    /// `defaults` section entries.
    pub defaults: BTreeMap<String, Vec<String>>,
}

impl HaproxyParams {
    /// Built-in sidecar tuning, sized for a per-service proxy rather than
    /// an edge load balancer.
    pub fn builtin() -> Self {
        let mut globals = BTreeMap::new();
        globals.insert("stats".to_string(), vec!["timeout 2m".to_string()]);
        globals.insert("nbthread".to_string(), vec!["1".to_string()]);
        globals.insert("ulimit-n".to_string(), vec!["4096".to_string()]);
        globals.insert("maxconn".to_string(), vec!["1024".to_string()]);
        globals.insert("tune.bufsize".to_string(), vec!["16384".to_string()]);
        globals.insert("tune.maxrewrite".to_string(), vec!["1024".to_string()]);
        globals.insert("tune.ssl.cachesize".to_string(), vec!["500".to_string()]);
        globals.insert(
            "tune.ssl.default-dh-param".to_string(),
            vec!["2048".to_string()],
        );

        let mut defaults = BTreeMap::new();
        defaults.insert("http-reuse".to_string(), vec!["always".to_string()]);

        Self { globals, defaults }
    }

    /// Merge `other` over `self`; keys in `other` replace whole entries.
    pub fn merged_with(&self, other: &Self) -> Self {
        let mut result = self.clone();
        for (k, v) in &other.globals {
            result.globals.insert(k.clone(), v.clone());
        }
        for (k, v) in &other.defaults {
            result.defaults.insert(k.clone(), v.clone());
        }
        result
    }

    /// Insert one parsed flag value.
    pub fn insert(&mut self, scope: ParamScope, key: String, value: String) {
        let map = match scope {
            ParamScope::Global => &mut self.globals,
            ParamScope::Defaults => &mut self.defaults,
        };
        map.entry(key).or_default().push(value);
    }

    /// Build overlays from repeated `scope.key=value` flag values.
    ///
    /// The key may itself contain dots or spaces; only the first `.` and
    /// the first `=` are structural.
    pub fn from_flags<I, S>(flags: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut params = Self::default();
        for flag in flags {
            let flag = flag.as_ref();
            let (scope_str, rest) = flag.split_once('.').ok_or_else(|| {
                Error::Configuration(format!(
                    "bad proxy parameter {flag:?}: expected global.key=value or defaults.key=value"
                ))
            })?;
            let scope = match scope_str {
                "global" => ParamScope::Global,
                "defaults" => ParamScope::Defaults,
                other => {
                    return Err(Error::Configuration(format!(
                        "bad proxy parameter scope {other:?} in {flag:?}"
                    )))
                }
            };
            let (key, value) = rest.split_once('=').ok_or_else(|| {
                Error::Configuration(format!("bad proxy parameter {flag:?}: missing '='"))
            })?;
            if key.is_empty() {
                return Err(Error::Configuration(format!(
                    "bad proxy parameter {flag:?}: empty key"
                )));
            }
            params.insert(scope, key.to_string(), value.to_string());
        }
        Ok(params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_flags_parses_scopes_dots_and_spaces() {
        let params = HaproxyParams::from_flags([
            "defaults.test.with.dots=3",
            "defaults.another=abdc",
            "defaults.multiple key1=value1",
            "defaults.multiple key2=value2",
            "global.with.spaces=hey I have spaces",
        ])
        .expect("parse");

        assert_eq!(params.defaults["test.with.dots"], vec!["3"]);
        assert_eq!(
            params.defaults["multiple key1"],
            vec!["value1".to_string()]
        );
        assert_eq!(params.defaults["multiple key2"], vec!["value2"]);
        assert_eq!(params.globals["with.spaces"], vec!["hey I have spaces"]);
    }

    #[test]
    fn from_flags_rejects_bad_shapes() {
        assert!(HaproxyParams::from_flags(["no-scope=1"]).is_err());
        assert!(HaproxyParams::from_flags(["frontend.key=1"]).is_err());
        assert!(HaproxyParams::from_flags(["global.missing-eq"]).is_err());
        assert!(HaproxyParams::from_flags(["global.=empty"]).is_err());
    }

    #[test]
    fn merge_is_right_biased_per_key() {
        let base = HaproxyParams::builtin();
        let user = HaproxyParams::from_flags(["global.maxconn=4096"]).expect("parse");
        let merged = base.merged_with(&user);

        assert_eq!(merged.globals["maxconn"], vec!["4096"]);
        // Untouched keys survive.
        assert_eq!(merged.globals["nbthread"], vec!["1"]);
        assert_eq!(merged.defaults["http-reuse"], vec!["always"]);
    }

    #[test]
    fn repeated_key_accumulates_values() {
        let params = HaproxyParams::from_flags(["global.log=stdout", "global.log=stderr"])
            .expect("parse");
        assert_eq!(params.globals["log"], vec!["stdout", "stderr"]);
    }
}
