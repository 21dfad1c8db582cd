//! Enabled-step selection.

use tracing::warn;

use crate::domain::Step;

/// Parsed enabled-steps list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepSelector {
    /// Enabled names in configured order, without duplicates
    names: Vec<String>,
}

impl Default for StepSelector {
    fn default() -> Self {
        Self::all()
    }
}

impl StepSelector {
    /// Every step enabled
    pub fn all() -> Self {
        Self {
            names: Step::ALL.iter().map(|s| s.as_str().to_string()).collect(),
        }
    }

    /// Parse a comma-separated list; `all` or an empty list enables everything
    pub fn parse(list: &str) -> Self {
        let trimmed = list.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("all") {
            return Self::all();
        }

        let mut names: Vec<String> = Vec::new();
        for name in trimmed.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            if names.iter().any(|n| n == name) {
                continue;
            }
            if name.parse::<Step>().is_err() && !Step::ALL.iter().any(|s| s.tool_alias() == name) {
                warn!(step = name, "Ignoring unknown step name in enabled steps");
                continue;
            }
            names.push(name.to_string());
        }

        Self { names }
    }

    /// Exact, delimiter-bounded membership test
    pub fn is_enabled(&self, step_name: &str) -> bool {
        self.names.iter().any(|n| n == step_name)
    }

    /// Whether a step is enabled by its name or its tool alias
    pub fn allows(&self, step: Step) -> bool {
        self.is_enabled(step.as_str()) || self.is_enabled(step.tool_alias())
    }

    /// Whether every step in `gates` is enabled
    pub fn allows_all(&self, gates: &[Step]) -> bool {
        gates.iter().all(|step| self.allows(*step))
    }

    /// Enabled names in configured order
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Canonical comma-separated form
    pub fn to_list(&self) -> String {
        self.names.join(",")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delimiter_bounded_membership() {
        let selector = StepSelector::parse("trim,assemble");

        assert!(selector.is_enabled("trim"));
        assert!(selector.is_enabled("assemble"));
        assert!(!selector.is_enabled("trimX"));
        assert!(!selector.is_enabled("qc"));
        assert!(!selector.is_enabled("tri"));
        assert!(!selector.is_enabled("trim,assemble"));
    }

    #[test]
    fn test_whitespace_and_duplicates() {
        let selector = StepSelector::parse(" qc , trim,,qc ");
        assert_eq!(selector.names(), &["qc".to_string(), "trim".to_string()]);
        assert_eq!(selector.to_list(), "qc,trim");
    }

    #[test]
    fn test_all_and_empty_enable_everything() {
        for list in ["", "all", "ALL", "  "] {
            let selector = StepSelector::parse(list);
            for step in Step::ALL {
                assert!(selector.allows(step), "{} should be enabled for '{}'", step, list);
            }
        }
    }

    #[test]
    fn test_unknown_names_are_never_enabled() {
        let selector = StepSelector::parse("bogus,qc");
        assert!(!selector.is_enabled("bogus"));
        assert_eq!(selector.names(), &["qc".to_string()]);
        assert!(selector.allows(Step::Qc));
        assert!(!selector.allows(Step::Trim));
    }

    #[test]
    fn test_tool_aliases_gate_steps() {
        let selector = StepSelector::parse("fastqc,megahit");
        assert!(selector.allows(Step::Qc));
        assert!(selector.allows(Step::Assemble));
        assert!(!selector.allows(Step::Trim));
        assert!(!selector.is_enabled("qc"));
    }

    #[test]
    fn test_allows_all_gates() {
        let selector = StepSelector::parse("qc");
        assert!(selector.allows_all(&[Step::Qc]));
        assert!(!selector.allows_all(&[Step::Qc, Step::Trim]));
    }
}
