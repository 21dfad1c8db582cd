//! Step Selector Integration Tests
//!
//! Membership rules for the enabled-steps list and how they gate stages.

use metapipe::core::stages::build_stages;
use metapipe::core::StepSelector;
use metapipe::{PipelineConfig, Step};

#[test]
fn test_membership_is_delimiter_bounded() {
    let selector = StepSelector::parse("trim,assemble");

    assert!(selector.is_enabled("trim"));
    assert!(selector.is_enabled("assemble"));
    assert!(!selector.is_enabled("trimX"));
    assert!(!selector.is_enabled("qc"));
    assert!(!selector.is_enabled("tri"));
    assert!(!selector.is_enabled("trim,assemble"));
}

#[test]
fn test_whitespace_and_empty_entries() {
    let selector = StepSelector::parse(" qc , ,trim,");
    assert_eq!(selector.names(), &["qc".to_string(), "trim".to_string()]);
}

#[test]
fn test_all_and_empty_enable_everything() {
    for list in ["all", "ALL", "", "  "] {
        let selector = StepSelector::parse(list);
        for step in Step::ALL {
            assert!(selector.allows(step), "{} should enable {}", list, step);
        }
    }
}

#[test]
fn test_unknown_names_are_ignored() {
    let selector = StepSelector::parse("qc,bogus");
    assert!(selector.is_enabled("qc"));
    assert!(!selector.is_enabled("bogus"));
    assert_eq!(selector.to_list(), "qc");
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
fn test_trimmed_qc_needs_both_steps() {
    let config = PipelineConfig::new("/w");
    let stages = build_stages(&config);
    let trimmed_qc = stages.iter().find(|s| s.id == "qc-trimmed").unwrap();

    assert!(!StepSelector::parse("qc").allows_all(&trimmed_qc.gates));
    assert!(!StepSelector::parse("trim").allows_all(&trimmed_qc.gates));
    assert!(StepSelector::parse("qc,trim").allows_all(&trimmed_qc.gates));
}
