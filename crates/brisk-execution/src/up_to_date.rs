use std::collections::BTreeSet;
use std::ops::ControlFlow;

use brisk_fingerprint::{compare, FingerprintComparison, IncompatibleFingerprints};

use crate::history::{ExecutionRecord, PersistedFingerprint};
use crate::input::CurrentInputs;

/// Change messages reported per property before the rest are summarized.
pub const MAX_CHANGE_MESSAGES: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyOutcome {
    UpToDate,
    /// Compared against the previous fingerprint; may be changed only in order.
    Changed(FingerprintComparison),
    Added,
    Removed,
    /// The current fingerprint could not be computed.
    Failed(String),
    /// The previous execution could not fingerprint this property.
    PreviouslyFailed,
    StrategyChanged(IncompatibleFingerprints),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyVerdict {
    pub property: String,
    pub outcome: PropertyOutcome,
}

/// Whether a unit of work can be skipped, and if not, why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpToDateVerdict {
    has_history: bool,
    previous_successful: bool,
    properties: Vec<PropertyVerdict>,
    reasons: Vec<String>,
}

impl UpToDateVerdict {
    pub fn is_up_to_date(&self) -> bool {
        self.reasons.is_empty()
    }

    /// Human-readable reasons for being out of date, in property order.
    pub fn reasons(&self) -> &[String] {
        &self.reasons
    }

    pub fn properties(&self) -> &[PropertyVerdict] {
        &self.properties
    }

    pub fn outcome(&self, property: &str) -> Option<&PropertyOutcome> {
        self.properties
            .iter()
            .find(|verdict| verdict.property == property)
            .map(|verdict| &verdict.outcome)
    }

    /// The changes of `property` since the previous execution.
    pub fn changes(&self, property: &str) -> Option<&FingerprintComparison> {
        match self.outcome(property)? {
            PropertyOutcome::Changed(comparison) => Some(comparison),
            _ => None,
        }
    }

    /// Whether every property was compared against a previous fingerprint, so that the
    /// changes alone describe what to reprocess.
    pub fn is_incremental(&self) -> bool {
        self.has_history
            && self.previous_successful
            && self.properties.iter().all(|verdict| {
                matches!(
                    verdict.outcome,
                    PropertyOutcome::UpToDate | PropertyOutcome::Changed(_)
                )
            })
    }
}

/// Compares the current inputs of a unit of work with its previous execution.
pub fn check(previous: Option<&ExecutionRecord>, current: &CurrentInputs) -> UpToDateVerdict {
    let mut reasons = Vec::new();
    match previous {
        None => reasons.push("No history is available.".to_string()),
        Some(record) if !record.successful => {
            reasons.push("The previous execution failed.".to_string())
        }
        Some(_) => {}
    }

    let mut names: BTreeSet<&str> = current.names().collect();
    if let Some(record) = previous {
        names.extend(record.inputs.keys().map(String::as_str));
    }

    let mut properties = Vec::with_capacity(names.len());
    for name in names {
        let recorded = previous.and_then(|record| record.inputs.get(name));
        let outcome = property_outcome(recorded, current, name);
        if previous.is_some() {
            describe(name, &outcome, &mut reasons);
        } else if let PropertyOutcome::Failed(reason) = &outcome {
            // Reported even without history: the failure is the caller's to surface.
            reasons.push(format!(
                "Input property '{name}' could not be fingerprinted: {reason}"
            ));
        }
        properties.push(PropertyVerdict {
            property: name.to_string(),
            outcome,
        });
    }

    if !reasons.is_empty() {
        tracing::debug!(
            target = "brisk.execution",
            reasons = reasons.len(),
            first = %reasons[0],
            "unit of work is out of date"
        );
    }
    UpToDateVerdict {
        has_history: previous.is_some(),
        previous_successful: previous.is_some_and(|record| record.successful),
        properties,
        reasons,
    }
}

fn property_outcome(
    recorded: Option<&PersistedFingerprint>,
    current: &CurrentInputs,
    name: &str,
) -> PropertyOutcome {
    let current = match current.get(name) {
        None => return PropertyOutcome::Removed,
        Some(Err(err)) => return PropertyOutcome::Failed(err.to_string()),
        Some(Ok(fingerprint)) => fingerprint,
    };
    match recorded {
        None => PropertyOutcome::Added,
        Some(PersistedFingerprint::Failed { .. }) => PropertyOutcome::PreviouslyFailed,
        Some(PersistedFingerprint::Fingerprint(previous)) => match compare(previous, current) {
            Ok(comparison) if comparison.is_up_to_date() => PropertyOutcome::UpToDate,
            Ok(comparison) => PropertyOutcome::Changed(comparison),
            Err(incompatible) => PropertyOutcome::StrategyChanged(incompatible),
        },
    }
}

fn describe(name: &str, outcome: &PropertyOutcome, reasons: &mut Vec<String>) {
    match outcome {
        PropertyOutcome::UpToDate => {}
        PropertyOutcome::Added => reasons.push(format!("Input property '{name}' has been added.")),
        PropertyOutcome::Removed => {
            reasons.push(format!("Input property '{name}' has been removed."))
        }
        PropertyOutcome::Failed(reason) => reasons.push(format!(
            "Input property '{name}' could not be fingerprinted: {reason}"
        )),
        PropertyOutcome::PreviouslyFailed => reasons.push(format!(
            "Input property '{name}' could not be fingerprinted by the previous execution."
        )),
        PropertyOutcome::StrategyChanged(_) => reasons.push(format!(
            "Input property '{name}' is fingerprinted with a different strategy."
        )),
        PropertyOutcome::Changed(comparison) if !comparison.has_changes() => {
            reasons.push(format!("Input property '{name}' has been reordered."))
        }
        PropertyOutcome::Changed(comparison) => {
            let mut reported = 0;
            let _ = comparison.visit(|change| {
                if reported == MAX_CHANGE_MESSAGES {
                    return ControlFlow::Break(());
                }
                reasons.push(format!(
                    "Input property '{name}' file {} has been {}.",
                    change.absolute_path().display(),
                    change.kind.as_str()
                ));
                reported += 1;
                ControlFlow::Continue(())
            });
            let remaining = comparison.change_count() - reported;
            if remaining > 0 {
                reasons.push(format!(
                    "Input property '{name}' has {remaining} more changes."
                ));
            }
        }
    }
}
