//! Name-based object selection.
//!
//! Rules are evaluated in order and the first matching rule decides. An object
//! that matches no rule is kept only when the list has no `include` rule, so an
//! empty list keeps everything and a list of excludes behaves as a deny-list.

use crate::model::ObjectDescriptor;
use regex::Regex;
use shipper_core::config::{FileSelectorConfig, SelectorRule};
use shipper_core::{Error, Result};

#[derive(Debug, Clone)]
struct CompiledRule {
    pattern: Regex,
    rule: SelectorRule,
}

#[derive(Debug, Clone, Default)]
pub struct ObjectSelector {
    rules: Vec<CompiledRule>,
    has_include: bool,
}

impl ObjectSelector {
    pub fn new(selectors: &[FileSelectorConfig]) -> Result<Self> {
        let rules = selectors
            .iter()
            .map(|s| {
                Regex::new(&s.regex)
                    .map(|pattern| CompiledRule {
                        pattern,
                        rule: s.rule,
                    })
                    .map_err(|e| Error::Config(format!("invalid file selector {:?}: {}", s.regex, e)))
            })
            .collect::<Result<Vec<_>>>()?;

        let has_include = rules.iter().any(|r| r.rule == SelectorRule::Include);

        Ok(Self { rules, has_include })
    }

    pub fn matches(&self, name: &str) -> bool {
        match self.rules.iter().find(|r| r.pattern.is_match(name)) {
            Some(rule) => rule.rule == SelectorRule::Include,
            None => !self.has_include,
        }
    }

    /// Stable filter: survivors keep their listing order.
    pub fn select(&self, objects: Vec<ObjectDescriptor>) -> Vec<ObjectDescriptor> {
        objects
            .into_iter()
            .filter(|o| self.matches(&o.name))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn object(name: &str) -> ObjectDescriptor {
        ObjectDescriptor {
            name: name.to_string(),
            size: 1,
            generation: "1".to_string(),
            content_type: None,
            last_modified: None,
        }
    }

    fn rule(regex: &str, rule: SelectorRule) -> FileSelectorConfig {
        FileSelectorConfig {
            regex: regex.to_string(),
            rule,
        }
    }

    fn names(objects: &[ObjectDescriptor]) -> Vec<&str> {
        objects.iter().map(|o| o.name.as_str()).collect()
    }

    #[test]
    fn exclude_preserves_listing_order() {
        let selector = ObjectSelector::new(&[rule("^b$", SelectorRule::Exclude)]).unwrap();
        let selected = selector.select(vec![object("a"), object("b"), object("c"), object("d")]);
        assert_eq!(names(&selected), vec!["a", "c", "d"]);
    }

    #[test]
    fn empty_selector_keeps_everything() {
        let selector = ObjectSelector::new(&[]).unwrap();
        assert!(selector.matches("anything"));
    }

    #[test]
    fn include_rules_turn_into_allow_list() {
        let selector = ObjectSelector::new(&[rule(r"\.json$", SelectorRule::Include)]).unwrap();
        assert!(selector.matches("logs/a.json"));
        assert!(!selector.matches("logs/a.csv"));
    }

    #[test]
    fn first_matching_rule_wins() {
        let selector = ObjectSelector::new(&[
            rule("^tmp/", SelectorRule::Exclude),
            rule(r"\.log$", SelectorRule::Include),
        ])
        .unwrap();
        assert!(!selector.matches("tmp/a.log"));
        assert!(selector.matches("prod/a.log"));
        assert!(!selector.matches("prod/a.txt"));
    }

    #[test]
    fn invalid_regex_is_a_config_error() {
        let err = ObjectSelector::new(&[rule("(", SelectorRule::Include)]).unwrap_err();
        assert!(err.is_fatal());
    }

    proptest! {
        #[test]
        fn selection_is_an_order_preserving_subsequence(
            raw in proptest::collection::vec("[a-d]{1,3}", 0..20),
        ) {
            let selector = ObjectSelector::new(&[rule("b", SelectorRule::Exclude)]).unwrap();
            let objects: Vec<_> = raw.iter().map(|n| object(n)).collect();
            let selected = selector.select(objects);

            let expected: Vec<&str> = raw.iter().map(String::as_str).filter(|n| !n.contains('b')).collect();
            prop_assert_eq!(names(&selected), expected);
        }
    }
}
