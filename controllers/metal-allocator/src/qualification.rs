//! Server qualification
//!
//! Decides which servers belong to a ServerClass. Pure: no I/O, deterministic output
//! order (by server name) so every replica walks candidates in the same order.
//!
//! A server qualifies when all of the following hold:
//! - it is accepted and not cordoned
//! - the class selector (if any) matches its labels
//! - for each non-empty qualifier list, at least one entry matches
//!
//! CPU and system information entries match field-wise with empty fields as
//! wildcards. A label-selector qualifier entry matches when any one of its key/value
//! pairs is present on the server.

use crate::error::ControllerError;
use crds::{CPUInformation, LabelSelector, Qualifiers, Server, ServerClassSpec, SystemInformation};
use std::collections::BTreeMap;

/// Field-wise comparison where an empty criterion field matches anything.
pub trait PartialMatch {
    /// Whether `actual` satisfies `self` as a criterion
    fn partial_match(&self, actual: &Self) -> bool;
}

fn field_matches(want: &str, got: &str) -> bool {
    want.is_empty() || want == got
}

impl PartialMatch for CPUInformation {
    fn partial_match(&self, actual: &Self) -> bool {
        field_matches(&self.manufacturer, &actual.manufacturer)
            && field_matches(&self.version, &actual.version)
    }
}

impl PartialMatch for SystemInformation {
    fn partial_match(&self, actual: &Self) -> bool {
        field_matches(&self.manufacturer, &actual.manufacturer)
            && field_matches(&self.product_name, &actual.product_name)
            && field_matches(&self.version, &actual.version)
            && field_matches(&self.serial_number, &actual.serial_number)
            && field_matches(&self.sku_number, &actual.sku_number)
            && field_matches(&self.family, &actual.family)
    }
}

/// OR over `criteria`; an empty list passes, a missing value fails a non-empty list.
fn any_partial_match<T: PartialMatch>(criteria: &[T], actual: Option<&T>) -> bool {
    if criteria.is_empty() {
        return true;
    }
    actual.is_some_and(|actual| criteria.iter().any(|c| c.partial_match(actual)))
}

fn any_label_pair_matches(
    selectors: &[BTreeMap<String, String>],
    labels: &BTreeMap<String, String>,
) -> bool {
    if selectors.is_empty() {
        return true;
    }
    selectors
        .iter()
        .flat_map(|selector| selector.iter())
        .any(|(key, value)| labels.get(key) == Some(value))
}

/// Reject unknown operators and operator/value combinations that cannot be evaluated.
pub fn validate_selector(selector: &LabelSelector) -> Result<(), ControllerError> {
    for requirement in &selector.match_expressions {
        let valid = match requirement.operator.as_str() {
            "In" | "NotIn" => !requirement.values.is_empty(),
            "Exists" | "DoesNotExist" => requirement.values.is_empty(),
            _ => {
                return Err(ControllerError::InvalidSelector(format!(
                    "unknown operator {:?} for key {:?}",
                    requirement.operator, requirement.key
                )));
            }
        };
        if !valid || requirement.key.is_empty() {
            return Err(ControllerError::InvalidSelector(format!(
                "invalid requirement {} {} {:?}",
                requirement.key, requirement.operator, requirement.values
            )));
        }
    }
    Ok(())
}

/// Evaluate a label selector against a label set.
///
/// The whole selector is validated before evaluation, so a malformed selector is an
/// error even when an earlier requirement already fails.
pub fn selector_matches(
    selector: &LabelSelector,
    labels: &BTreeMap<String, String>,
) -> Result<bool, ControllerError> {
    validate_selector(selector)?;

    let labels_match = selector
        .match_labels
        .iter()
        .all(|(key, value)| labels.get(key) == Some(value));

    let expressions_match = selector.match_expressions.iter().all(|requirement| {
        let value = labels.get(&requirement.key);
        match requirement.operator.as_str() {
            "In" => value.is_some_and(|v| requirement.values.contains(v)),
            "NotIn" => value.is_none_or(|v| !requirement.values.contains(v)),
            "Exists" => value.is_some(),
            // DoesNotExist, the only operator left after validation
            _ => value.is_none(),
        }
    });

    Ok(labels_match && expressions_match)
}

fn passes_qualifiers(qualifiers: &Qualifiers, server: &Server, labels: &BTreeMap<String, String>) -> bool {
    any_partial_match(&qualifiers.cpu, server.spec.cpu.as_ref())
        && any_partial_match(&qualifiers.system_information, server.spec.system_information.as_ref())
        && any_label_pair_matches(&qualifiers.label_selectors, labels)
}

/// Whether a single server qualifies for a class.
pub fn qualifies(class: &ServerClassSpec, server: &Server) -> Result<bool, ControllerError> {
    if !server.spec.accepted || server.spec.cordoned {
        return Ok(false);
    }

    let empty = BTreeMap::new();
    let labels = server.metadata.labels.as_ref().unwrap_or(&empty);

    if let Some(selector) = &class.selector {
        if !selector_matches(selector, labels)? {
            return Ok(false);
        }
    }

    Ok(passes_qualifiers(&class.qualifiers, server, labels))
}

/// Filter `servers` down to those qualifying for `class`, ordered by name.
///
/// A malformed class selector is reported even when no server gets far enough to be
/// matched against it.
pub fn filter_accepted_servers(
    class: &ServerClassSpec,
    servers: impl IntoIterator<Item = Server>,
) -> Result<Vec<Server>, ControllerError> {
    if let Some(selector) = &class.selector {
        validate_selector(selector)?;
    }

    let mut qualified = Vec::new();
    for server in servers {
        if qualifies(class, &server)? {
            qualified.push(server);
        }
    }
    qualified.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
    Ok(qualified)
}
