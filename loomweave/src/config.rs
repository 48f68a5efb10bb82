//! Instrumentation options and the surgical profile.
//!
//! [`InstrumentOptions`] holds the per-category toggles and the two CFG
//! preparation switches. [`InstrumentProfile`] is the allow/deny list parsed
//! from a TOML file, keyed by function name and instrumentation point, plus
//! the set of callees whose calls are redirected through interposition
//! thunks.
//!
//! ```toml
//! mode = "allow"
//!
//! [[rule]]
//! function = "compute_kernel"
//! points = ["entry", "exit", "before-call"]
//!
//! [interpose]
//! functions = ["malloc", "free"]
//! ```
use std::collections::{BTreeSet, HashMap, HashSet};

use serde::Deserialize;

use crate::error::{WeaveError, WeaveResult};

/// Per-category enable switches and CFG preparation options.
#[derive(Debug, Clone)]
pub struct InstrumentOptions {
    pub function_entry_exit: bool,
    pub basic_blocks: bool,
    pub loops: bool,
    pub memory_accesses: bool,
    pub atomics: bool,
    pub mem_intrinsics: bool,
    pub calls: bool,
    pub fork_join: bool,
    pub local_allocs: bool,
    pub alloc_fns: bool,
    /// Redirect configured callees through interposition thunks.
    pub interpose: bool,
    /// Assume ordinary calls may raise: promote them to explicit-exception
    /// -edge form so unwind paths have insertion points.
    pub calls_may_throw: bool,
    /// Split blocks after calls so every after-call position is unique.
    pub calls_terminate_blocks: bool,
}

impl Default for InstrumentOptions {
    fn default() -> Self {
        InstrumentOptions {
            function_entry_exit: true,
            basic_blocks: true,
            loops: true,
            memory_accesses: true,
            atomics: true,
            mem_intrinsics: true,
            calls: true,
            fork_join: true,
            local_allocs: true,
            alloc_fns: true,
            interpose: true,
            calls_may_throw: true,
            calls_terminate_blocks: true,
        }
    }
}

/// Instrumentation points selectable per function name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstrPoint {
    Entry,
    Exit,
    BeforeCall,
    AfterCall,
    Fork,
    Join,
}

/// How the rule list is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterMode {
    /// Only listed (function, point) pairs are instrumented.
    Allow,
    /// Listed (function, point) pairs are excluded; everything else is
    /// instrumented. An empty deny list instruments everything.
    #[default]
    Deny,
}

#[derive(Debug, Deserialize)]
struct RawRule {
    function: String,
    points: Vec<InstrPoint>,
}

#[derive(Debug, Default, Deserialize)]
struct RawInterpose {
    #[serde(default)]
    functions: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawProfile {
    #[serde(default)]
    mode: FilterMode,
    #[serde(default, rename = "rule")]
    rules: Vec<RawRule>,
    #[serde(default)]
    interpose: RawInterpose,
}

/// The parsed allow/deny profile.
#[derive(Debug, Clone, Default)]
pub struct InstrumentProfile {
    mode: FilterMode,
    rules: HashMap<String, BTreeSet<InstrPoint>>,
    interpose: HashSet<String>,
}

impl InstrumentProfile {
    /// The default profile instruments every function at every point and
    /// interposes nothing.
    pub fn permissive() -> InstrumentProfile {
        InstrumentProfile::default()
    }

    pub fn from_toml_str(text: &str, origin: &str) -> WeaveResult<InstrumentProfile> {
        let raw: RawProfile = toml::from_str(text).map_err(|source| WeaveError::Profile {
            source,
            file: origin.to_string(),
        })?;
        let mut rules: HashMap<String, BTreeSet<InstrPoint>> = HashMap::new();
        for rule in raw.rules {
            rules.entry(rule.function).or_default().extend(rule.points);
        }
        Ok(InstrumentProfile {
            mode: raw.mode,
            rules,
            interpose: raw.interpose.functions.into_iter().collect(),
        })
    }

    pub fn from_file(path: &std::path::Path) -> WeaveResult<InstrumentProfile> {
        let text = std::fs::read_to_string(path).map_err(|source| WeaveError::ProfileIo {
            source,
            file: path.display().to_string(),
        })?;
        InstrumentProfile::from_toml_str(&text, &path.display().to_string())
    }

    /// Whether `function` should be instrumented at `point`.
    pub fn instrument_point(&self, function: &str, point: InstrPoint) -> bool {
        let listed = self
            .rules
            .get(function)
            .is_some_and(|points| points.contains(&point));
        match self.mode {
            FilterMode::Allow => listed,
            FilterMode::Deny => !listed,
        }
    }

    /// Whether calls to `function` are redirected through an interposition
    /// thunk.
    pub fn interpose(&self, function: &str) -> bool {
        self.interpose.contains(function)
    }

    pub fn interposes_anything(&self) -> bool {
        !self.interpose.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_profile_is_permissive() {
        let p = InstrumentProfile::permissive();
        assert!(p.instrument_point("anything", InstrPoint::Entry));
        assert!(p.instrument_point("anything", InstrPoint::Join));
        assert!(!p.interpose("malloc"));
    }

    #[test]
    fn allow_mode_requires_listing() {
        let p = InstrumentProfile::from_toml_str(
            r#"
            mode = "allow"

            [[rule]]
            function = "hot"
            points = ["entry", "before-call"]
            "#,
            "test",
        )
        .expect("profile parses");
        assert!(p.instrument_point("hot", InstrPoint::Entry));
        assert!(!p.instrument_point("hot", InstrPoint::Exit));
        assert!(!p.instrument_point("cold", InstrPoint::Entry));
    }

    #[test]
    fn deny_mode_excludes_listed_points() {
        let p = InstrumentProfile::from_toml_str(
            r#"
            mode = "deny"

            [[rule]]
            function = "noisy"
            points = ["after-call"]

            [interpose]
            functions = ["malloc"]
            "#,
            "test",
        )
        .expect("profile parses");
        assert!(p.instrument_point("noisy", InstrPoint::BeforeCall));
        assert!(!p.instrument_point("noisy", InstrPoint::AfterCall));
        assert!(p.instrument_point("other", InstrPoint::AfterCall));
        assert!(p.interpose("malloc"));
        assert!(p.interposes_anything());
    }

    #[test]
    fn malformed_profile_is_fatal() {
        let err = InstrumentProfile::from_toml_str("mode = 17", "broken.toml");
        assert!(matches!(err, Err(WeaveError::Profile { .. })));
    }
}
