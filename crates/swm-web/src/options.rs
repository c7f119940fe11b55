//! Cascading option lists and the selection-reset rule for agency → cluster → site.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use swm_core::{DimensionRow, Selector, ALL};

use crate::query::Dimension;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OptionItem {
    pub value: String,
    pub label: String,
}

impl Dimension {
    fn all_label(self) -> &'static str {
        match self {
            Self::Agency => "All Agencies",
            Self::Cluster => "All Clusters",
            Self::Site => "All Sites",
        }
    }
}

/// Capitalize the first letter of every alphabetic run, lowercase the rest.
pub fn display_label(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut prev_alpha = false;
    for ch in value.chars() {
        if prev_alpha {
            out.extend(ch.to_lowercase());
        } else {
            out.extend(ch.to_uppercase());
        }
        prev_alpha = ch.is_alphabetic();
    }
    out
}

/// Distinct non-empty values of `target` among rows where `parent` matches,
/// sorted ascending, after the synthetic "all" entry.
pub fn options_for<R: DimensionRow>(
    rows: &[R],
    target: Dimension,
    parent: Option<(Dimension, &Selector)>,
) -> Vec<OptionItem> {
    let values = rows
        .iter()
        .filter(|row| parent.map_or(true, |(dim, selected)| selected.matches(dim.value_of(*row))))
        .map(|row| target.value_of(row).trim())
        .filter(|v| !v.is_empty())
        .collect::<BTreeSet<_>>();

    let mut options = Vec::with_capacity(values.len() + 1);
    options.push(OptionItem {
        value: ALL.to_string(),
        label: target.all_label().to_string(),
    });
    options.extend(values.into_iter().map(|v| OptionItem {
        value: v.to_string(),
        label: display_label(v),
    }));
    options
}

pub fn agency_options<R: DimensionRow>(rows: &[R]) -> Vec<OptionItem> {
    options_for(rows, Dimension::Agency, None)
}

pub fn cluster_options<R: DimensionRow>(rows: &[R], agency: &Selector) -> Vec<OptionItem> {
    options_for(rows, Dimension::Cluster, Some((Dimension::Agency, agency)))
}

pub fn site_options<R: DimensionRow>(rows: &[R], cluster: &Selector) -> Vec<OptionItem> {
    options_for(rows, Dimension::Site, Some((Dimension::Cluster, cluster)))
}

/// The three linked dropdown values.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FilterSelection {
    #[serde(default)]
    pub agency: Selector,
    #[serde(default)]
    pub cluster: Selector,
    #[serde(default)]
    pub site: Selector,
}

impl FilterSelection {
    /// Reset every selection below `changed` to "all".
    pub fn reset_below(mut self, changed: Dimension) -> Self {
        match changed {
            Dimension::Agency => {
                self.cluster = Selector::All;
                self.site = Selector::All;
            }
            Dimension::Cluster => self.site = Selector::All,
            Dimension::Site => {}
        }
        self
    }

    pub fn select_agency(&mut self, agency: Selector) {
        if self.agency != agency {
            self.agency = agency;
            *self = std::mem::take(self).reset_below(Dimension::Agency);
        }
    }

    pub fn select_cluster(&mut self, cluster: Selector) {
        if self.cluster != cluster {
            self.cluster = cluster;
            *self = std::mem::take(self).reset_below(Dimension::Cluster);
        }
    }

    pub fn select_site(&mut self, site: Selector) {
        self.site = site;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SelectionOptions {
    pub selection: FilterSelection,
    pub agencies: Vec<OptionItem>,
    pub clusters: Vec<OptionItem>,
    pub sites: Vec<OptionItem>,
}

pub fn resolve_selection<R: DimensionRow>(rows: &[R], selection: FilterSelection) -> SelectionOptions {
    SelectionOptions {
        agencies: agency_options(rows),
        clusters: cluster_options(rows, &selection.agency),
        sites: site_options(rows, &selection.cluster),
        selection,
    }
}
