//! Declared file scope for a task.
//!
//! A scope is a set of glob patterns naming the paths a task is permitted
//! to modify. The empty scope permits nothing: a task that declares no
//! writable paths may not touch any file.

use foreman_proto::{Error, Result};
use glob::{MatchOptions, Pattern};

/// Match options for scope globs: `*` stays within one path segment so
/// `src/*.py` does not reach into subdirectories; `**` crosses them.
const SCOPE_MATCH: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Result of checking a set of paths against a scope.
#[derive(Debug, Clone)]
pub struct ScopeCheck {
    /// Paths that fall outside the scope, in input order.
    pub violations: Vec<String>,
}

impl ScopeCheck {
    /// Whether every path was in scope.
    pub fn is_ok(&self) -> bool {
        self.violations.is_empty()
    }
}

/// A compiled set of allowed-path globs.
#[derive(Debug, Clone)]
pub struct FileScope {
    patterns: Vec<Pattern>,
}

impl FileScope {
    /// Compiles the glob set. Invalid patterns are a plan error.
    pub fn parse(globs: &[String]) -> Result<Self> {
        let mut patterns = Vec::with_capacity(globs.len());
        for raw in globs {
            let pattern = Pattern::new(raw)
                .map_err(|e| Error::PlanInvalid(format!("invalid file_scope glob '{raw}': {e}")))?;
            patterns.push(pattern);
        }
        Ok(Self { patterns })
    }

    /// Whether a single path matches any allowed glob. Always false for the
    /// empty scope.
    pub fn allows(&self, path: &str) -> bool {
        self.patterns
            .iter()
            .any(|p| p.matches_with(path, SCOPE_MATCH))
    }

    /// Checks every path; out-of-scope paths are collected, never dropped.
    pub fn check(&self, paths: &[String]) -> ScopeCheck {
        let violations = paths
            .iter()
            .filter(|p| !self.allows(p))
            .cloned()
            .collect();
        ScopeCheck { violations }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope(globs: &[&str]) -> FileScope {
        let globs: Vec<String> = globs.iter().map(|g| (*g).to_string()).collect();
        FileScope::parse(&globs).unwrap()
    }

    #[test]
    fn matching_paths_pass() {
        let scope = scope(&["src/*.py"]);
        assert!(scope.allows("src/a.py"));
        assert!(!scope.allows("src/sub/a.py"));
        assert!(!scope.allows("docs/a.py"));
    }

    #[test]
    fn recursive_glob_crosses_directories() {
        let scope = scope(&["src/**/*.rs"]);
        assert!(scope.allows("src/core/graph.rs"));
        assert!(scope.allows("src/main.rs"));
        assert!(!scope.allows("tests/graph.rs"));
    }

    #[test]
    fn empty_scope_permits_nothing() {
        let scope = scope(&[]);
        assert!(!scope.allows("src/a.py"));
        let check = scope.check(&["anything".to_string()]);
        assert!(!check.is_ok());
        assert_eq!(check.violations, vec!["anything".to_string()]);
    }

    #[test]
    fn check_reports_each_violation() {
        let scope = scope(&["src/*.py"]);
        let check = scope.check(&[
            "src/a.py".to_string(),
            "docs/readme.md".to_string(),
            "setup.cfg".to_string(),
        ]);
        assert!(!check.is_ok());
        assert_eq!(
            check.violations,
            vec!["docs/readme.md".to_string(), "setup.cfg".to_string()]
        );
    }

    #[test]
    fn src_patch_passes_src_scope_fails_docs_scope() {
        // patch touching src/a.py passes ["src/*.py"] and fails ["docs/*"]
        let paths = vec!["src/a.py".to_string()];

        let allowed = scope(&["src/*.py"]).check(&paths);
        assert!(allowed.is_ok());

        let rejected = scope(&["docs/*"]).check(&paths);
        assert!(!rejected.is_ok());
        assert_eq!(rejected.violations, vec!["src/a.py".to_string()]);
    }

    #[test]
    fn invalid_glob_is_plan_error() {
        let result = FileScope::parse(&["src/[".to_string()]);
        assert!(matches!(result, Err(Error::PlanInvalid(_))));
    }
}
