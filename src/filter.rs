use std::collections::BTreeMap;
use std::fmt;

use crate::types::PullRequestSummary;

// ---------------------------------------------------------------------------
// Facets and choices
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Facet {
    Author,
    Label,
    Assignee,
    ReviewStatus,
}

impl fmt::Display for Facet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Author => "author",
            Self::Label => "label",
            Self::Assignee => "assignee",
            Self::ReviewStatus => "review",
        })
    }
}

/// Review-status options. Review data is not part of the PR listing, so
/// these are offered but never narrow the displayed set.
pub const REVIEW_STATUS_OPTIONS: &[&str] = &[
    "No reviews",
    "Required",
    "Approved",
    "Changes requested",
    "Reviewed by you",
    "Not reviewed by you",
    "Awaiting review from you",
];

/// One selectable value of a facet, rendered `"label (count)"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterChoice {
    pub label: String,
    pub count: usize,
}

impl fmt::Display for FilterChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.label, self.count)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FacetChoices {
    pub author: Vec<FilterChoice>,
    pub label: Vec<FilterChoice>,
    pub assignee: Vec<FilterChoice>,
}

/// Strip a trailing `" (N)"` count from a rendered choice.
pub fn base_filter_value(choice: &str) -> &str {
    let trimmed = choice.trim_end();
    if let Some(open) = trimmed.rfind(" (")
        && let Some(digits) = trimmed[open + 2..].strip_suffix(')')
        && !digits.is_empty()
        && digits.bytes().all(|b| b.is_ascii_digit())
    {
        return &trimmed[..open];
    }
    trimmed
}

/// Count every author, label and assignee across `prs`.
///
/// Always called with the full working set, never the displayed subset, so
/// counts describe the whole listing. Blank names are skipped.
pub fn derive_choices(prs: &[PullRequestSummary]) -> FacetChoices {
    let mut authors: BTreeMap<&str, usize> = BTreeMap::new();
    let mut labels: BTreeMap<&str, usize> = BTreeMap::new();
    let mut assignees: BTreeMap<&str, usize> = BTreeMap::new();

    for pr in prs {
        bump(&mut authors, &pr.author);
        for label in &pr.labels {
            bump(&mut labels, label);
        }
        for assignee in &pr.assignees {
            bump(&mut assignees, assignee);
        }
    }

    FacetChoices {
        author: into_choices(authors),
        label: into_choices(labels),
        assignee: into_choices(assignees),
    }
}

fn bump<'a>(counts: &mut BTreeMap<&'a str, usize>, name: &'a str) {
    if !name.trim().is_empty() {
        *counts.entry(name).or_default() += 1;
    }
}

fn into_choices(counts: BTreeMap<&str, usize>) -> Vec<FilterChoice> {
    let mut choices: Vec<FilterChoice> = counts
        .into_iter()
        .map(|(label, count)| FilterChoice {
            label: label.to_owned(),
            count,
        })
        .collect();
    choices.sort_by(|a, b| {
        a.label
            .to_lowercase()
            .cmp(&b.label.to_lowercase())
            .then_with(|| a.label.cmp(&b.label))
    });
    choices
}

// ---------------------------------------------------------------------------
// Selections
// ---------------------------------------------------------------------------

/// Active facet selections. `None` means no constraint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selections {
    pub author: Option<String>,
    pub label: Option<String>,
    pub assignee: Option<String>,
    pub review_status: Option<String>,
}

impl Selections {
    /// Set or clear a facet. Accepts a bare value or a rendered choice.
    pub fn set(&mut self, facet: Facet, choice: Option<&str>) {
        let value = choice
            .map(base_filter_value)
            .filter(|v| !v.is_empty())
            .map(str::to_owned);
        match facet {
            Facet::Author => self.author = value,
            Facet::Label => self.label = value,
            Facet::Assignee => self.assignee = value,
            Facet::ReviewStatus => self.review_status = value,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.author.is_none()
            && self.label.is_none()
            && self.assignee.is_none()
            && self.review_status.is_none()
    }

    fn matches(&self, pr: &PullRequestSummary) -> bool {
        let author = self.author.as_ref().is_none_or(|a| pr.author == *a);
        let label = self.label.as_ref().is_none_or(|l| pr.labels.contains(l));
        let assignee = self.assignee.as_ref();
        author && label && assignee.is_none_or(|a| pr.assignees.contains(a))
    }
}

/// The displayed subset: every active facet must match, newest first.
///
/// Unreadable timestamps carry the epoch sentinel and therefore sort last.
/// Equal timestamps order by descending PR number.
pub fn apply(prs: &[PullRequestSummary], selections: &Selections) -> Vec<PullRequestSummary> {
    if let Some(review) = &selections.review_status {
        tracing::info!("filter: review status {review:?} selected but not applied");
    }
    let mut shown: Vec<PullRequestSummary> = prs
        .iter()
        .filter(|pr| selections.matches(pr))
        .cloned()
        .collect();
    shown.sort_by(|a, b| {
        b.updated_at
            .cmp(&a.updated_at)
            .then_with(|| b.number.cmp(&a.number))
    });
    shown
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::github::stub::summary;
    use crate::types::UPDATED_AT_SENTINEL;

    fn pr(
        number: u64,
        author: &str,
        labels: &[&str],
        assignees: &[&str],
        day: u32,
    ) -> PullRequestSummary {
        PullRequestSummary {
            labels: labels.iter().map(|s| (*s).to_owned()).collect(),
            assignees: assignees.iter().map(|s| (*s).to_owned()).collect(),
            updated_at: Utc.with_ymd_and_hms(2024, 5, day, 12, 0, 0).unwrap(),
            ..summary(number, author)
        }
    }

    fn corpus() -> Vec<PullRequestSummary> {
        vec![
            pr(1, "alice", &["bug"], &["carol"], 1),
            pr(2, "bob", &["bug", "ui"], &[], 2),
            pr(3, "alice", &["ui"], &["dave"], 3),
            pr(4, "Zed", &[], &["carol"], 4),
            pr(5, "alice", &["bug"], &["carol"], 5),
            pr(6, "", &["docs"], &[], 6),
        ]
    }

    #[test]
    fn strips_trailing_count() {
        assert_eq!(base_filter_value("alice (3)"), "alice");
        assert_eq!(base_filter_value("needs review (v2)"), "needs review (v2)");
        assert_eq!(base_filter_value("plain"), "plain");
        assert_eq!(base_filter_value("odd ()"), "odd ()");
    }

    #[test]
    fn choices_count_full_set_case_insensitively() {
        let choices = derive_choices(&corpus());
        let authors: Vec<String> = choices.author.iter().map(ToString::to_string).collect();
        assert_eq!(authors, vec!["alice (3)", "bob (1)", "Zed (1)"]);
        let labels: Vec<String> = choices.label.iter().map(ToString::to_string).collect();
        assert_eq!(labels, vec!["bug (3)", "docs (1)", "ui (2)"]);
        let assignees: Vec<String> = choices.assignee.iter().map(ToString::to_string).collect();
        assert_eq!(assignees, vec!["carol (3)", "dave (1)"]);
    }

    #[test]
    fn rendered_choice_selects_its_prs() {
        let prs = corpus();
        let mut sel = Selections::default();
        sel.set(Facet::Author, Some("alice (3)"));
        let shown: Vec<u64> = apply(&prs, &sel).iter().map(|p| p.number).collect();
        assert_eq!(shown, vec![5, 3, 1]);
    }

    #[test]
    fn facets_combine_with_and() {
        let prs = corpus();
        let mut sel = Selections::default();
        sel.set(Facet::Author, Some("alice"));
        sel.set(Facet::Label, Some("bug (3)"));
        sel.set(Facet::Assignee, Some("carol"));
        let shown: Vec<u64> = apply(&prs, &sel).iter().map(|p| p.number).collect();
        assert_eq!(shown, vec![5, 1]);

        sel.set(Facet::Assignee, Some("dave"));
        assert!(apply(&prs, &sel).is_empty());
    }

    #[test]
    fn clearing_selections_restores_sorted_full_set() {
        let prs = corpus();
        let mut sel = Selections::default();
        sel.set(Facet::Label, Some("ui"));
        sel.set(Facet::Label, None);
        assert!(sel.is_empty());
        let shown: Vec<u64> = apply(&prs, &sel).iter().map(|p| p.number).collect();
        assert_eq!(shown, vec![6, 5, 4, 3, 2, 1]);
    }

    #[test]
    fn review_status_never_filters() {
        let prs = corpus();
        let mut sel = Selections::default();
        sel.set(Facet::ReviewStatus, Some(REVIEW_STATUS_OPTIONS[2]));
        assert_eq!(apply(&prs, &sel).len(), prs.len());
    }

    #[test]
    fn unreadable_timestamp_sorts_oldest() {
        let mut prs = corpus();
        prs[5].updated_at = UPDATED_AT_SENTINEL;
        let shown: Vec<u64> = apply(&prs, &Selections::default())
            .iter()
            .map(|p| p.number)
            .collect();
        assert_eq!(shown.last(), Some(&6));
    }
}
