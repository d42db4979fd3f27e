//! Partitioning of raw rows into ordered groups, first by declared type and then, optionally,
//! by tag values.

use std::collections::BTreeMap;

use indexmap::IndexMap;
use tracing::debug;
use tsq_types::{Order, TagMap};

use crate::group::{BoxedRow, GroupByResult, SortingGroup};

/// Groups rows by the values of a fixed list of tags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagGroupBy {
    tag_names: Vec<String>,
}

impl TagGroupBy {
    pub fn new<I, S>(tag_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tag_names: tag_names.into_iter().map(Into::into).collect(),
        }
    }

    pub fn tag_names(&self) -> &[String] {
        &self.tag_names
    }

    /// The configured tags present in `tags`, in configured order.
    pub fn matching_tags(&self, tags: &TagMap) -> IndexMap<String, String> {
        self.tag_names
            .iter()
            .filter_map(|name| {
                tags.get(name.as_str())
                    .map(|value| (name.clone(), value.to_string()))
            })
            .collect()
    }

    fn group_by_result(&self, tags: &TagMap) -> GroupByResult {
        GroupByResult::Tag {
            tag_names: self.tag_names.clone(),
            tag_values: self.matching_tags(tags),
        }
    }
}

/// Key of the tag group a row belongs to: every configured tag name followed by the row's value
/// for it, concatenated without separators. A missing tag contributes an empty value.
///
/// Distinct value combinations can produce the same key when a value ends with the next tag
/// name: grouping on `x`, `y` maps both `x=ay, y=b` and `x=a, y=yb` to `xayyb`.
pub fn tag_group_key(tag_group_by: &TagGroupBy, tags: &TagMap) -> String {
    let mut key = String::new();
    for name in tag_group_by.tag_names() {
        key.push_str(name);
        if let Some(value) = tags.get(name.as_str()) {
            key.push_str(value);
        }
    }
    key
}

/// Partition `rows` into groups.
///
/// Rows are split by declared type, types in lexicographic order. With a `tag_group_by` each
/// type partition is split further by [`tag_group_key`], keys in lexicographic order. The
/// output never depends on the order rows arrive in, apart from the tie-break between samples
/// with equal timestamps.
///
/// Without any rows a single empty group is returned.
pub fn group_by_type_and_tag(
    metric_name: &str,
    rows: Vec<BoxedRow>,
    tag_group_by: Option<&TagGroupBy>,
    order: Order,
) -> Vec<SortingGroup> {
    if rows.is_empty() {
        return vec![SortingGroup::new(metric_name, order)];
    }

    let mut by_type: BTreeMap<&'static str, Vec<BoxedRow>> = BTreeMap::new();
    for row in rows {
        by_type.entry(row.data_type().as_str()).or_default().push(row);
    }

    let mut groups = Vec::new();
    for (data_type, rows) in by_type {
        let type_result = GroupByResult::Type {
            data_type: data_type.to_string(),
        };

        match tag_group_by {
            Some(tag_group_by) => {
                let mut by_key: BTreeMap<String, Vec<BoxedRow>> = BTreeMap::new();
                for row in rows {
                    by_key
                        .entry(tag_group_key(tag_group_by, row.tags()))
                        .or_default()
                        .push(row);
                }
                for rows in by_key.into_values() {
                    let mut group = SortingGroup::new(metric_name, order);
                    if let Some(first) = rows.first() {
                        group.add_group_by_result(tag_group_by.group_by_result(first.tags()));
                    }
                    group.add_group_by_result(type_result.clone());
                    for row in rows {
                        group.add_row(row);
                    }
                    groups.push(group);
                }
            }
            None => {
                let mut group = SortingGroup::new(metric_name, order);
                group.add_group_by_result(type_result);
                for row in rows {
                    group.add_row(row);
                }
                groups.push(group);
            }
        }
    }

    debug!(metric = metric_name, groups = groups.len(), "grouped rows");
    groups
}
