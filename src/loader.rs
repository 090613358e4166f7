//! Job loading: turns a persisted job row into a runnable [`Job`].

use std::collections::BTreeMap;
use std::sync::Arc;

use regex::Regex;

use crate::config::{DistributionSettings, ErrorBudget, JobOptions, WarningPolicy};
use crate::distribution::PushType;
use crate::error::{PublishError, Result};
use crate::repository::Repository;
use crate::scheduler::{FilterSet, Job, Subset, SubsetSpecification};
use crate::store::Store;

/// Target environment used when a distribution job names none.
pub const DEFAULT_PUSH_TARGET: &str = "Live";

pub struct JobLoader {
    store: Store,
    repository: Arc<dyn Repository>,
}

impl JobLoader {
    pub fn new(store: Store, repository: Arc<dyn Repository>) -> Self {
        Self { store, repository }
    }

    /// Load job `job_id` with its subset definition, typed options and the
    /// documents requested when it was queued.
    pub async fn load(&self, job_id: i64) -> Result<Job> {
        let mut record = self.store.job(job_id).await?;
        let system = self
            .repository
            .publishing_system(&record.system)
            .await?
            .ok_or_else(|| PublishError::SystemNotFound(record.system.clone()))?;
        let subset = system
            .subset(&record.subset)
            .ok_or_else(|| PublishError::SubsetNotFound {
                system: record.system.clone(),
                subset: record.subset.clone(),
            })?;

        let parameters = merge_parameters(subset, &record.parameters);
        let options = parse_options(&parameters, subset.threshold)?;
        let specifications = resolve_specifications(&subset.specifications, &parameters)?;
        record.parameters = parameters;

        let requested = self.store.requested_documents(job_id).await?;

        tracing::info!(
            job_id,
            system = %record.system,
            subset = %record.subset,
            specifications = specifications.len(),
            requested = requested.len(),
            distribution = options.distribution.is_some(),
            "Job loaded"
        );

        Ok(Job {
            record,
            options,
            specifications,
            requested,
        })
    }
}

/// Subset defaults overlaid with the job's own parameters.
pub fn merge_parameters(
    subset: &Subset,
    job_parameters: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut merged = subset.defaults.clone();
    merged.extend(job_parameters.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "yes" | "y" | "true" | "1" => Ok(true),
        "no" | "n" | "false" | "0" | "" => Ok(false),
        _ => Err(PublishError::invalid_parameter(
            name,
            format!("expected Yes or No, got {:?}", value),
        )),
    }
}

fn parse_int(name: &str, value: &str) -> Result<i64> {
    value.trim().parse::<i64>().map_err(|_| {
        PublishError::invalid_parameter(name, format!("expected an integer, got {:?}", value))
    })
}

/// Build typed options from name/value parameters. `default_threshold` is
/// the subset's error threshold, used when the job sets no AbortOnError.
pub fn parse_options(
    parameters: &BTreeMap<String, String>,
    default_threshold: Option<i64>,
) -> Result<JobOptions> {
    let flag = |name: &str| -> Result<bool> {
        parameters
            .get(name)
            .map(|v| parse_bool(name, v))
            .transpose()
            .map(|v| v.unwrap_or(false))
    };

    let abort_on_error = match parameters.get("AbortOnError") {
        Some(value) => ErrorBudget::from_setting(parse_int("AbortOnError", value)?),
        None => default_threshold
            .map(ErrorBudget::from_setting)
            .unwrap_or_default(),
    };

    let publish_if_warnings = match parameters.get("PublishIfWarnings") {
        Some(value) if !parse_bool("PublishIfWarnings", value)? => WarningPolicy::Reject,
        _ => WarningPolicy::Publish,
    };

    let per_doctype = Regex::new(r"^Max(\w+)Errors$").expect("static regex");
    let mut per_doctype_max_errors = BTreeMap::new();
    for (name, value) in parameters {
        if let Some(caps) = per_doctype.captures(name) {
            let max = parse_int(name, value)?;
            if max >= 0 {
                per_doctype_max_errors.insert(caps[1].to_string(), max as u32);
            }
        }
    }

    let distribution = match parameters.get("PubType") {
        Some(push_type) if !push_type.trim().is_empty() => Some(DistributionSettings {
            push_type: push_type
                .parse::<PushType>()
                .map_err(|reason| PublishError::invalid_parameter("PubType", reason))?,
            target: parameters
                .get("PubTarget")
                .filter(|t| !t.trim().is_empty())
                .cloned()
                .unwrap_or_else(|| DEFAULT_PUSH_TARGET.to_string()),
            description: parameters
                .get("PushJobDescription")
                .filter(|d| !d.trim().is_empty())
                .cloned(),
        }),
        _ => None,
    };

    Ok(JobOptions {
        validate: flag("Validate")?,
        push_all_docs: flag("PushAllDocs")?,
        report_only: flag("ReportOnly")?,
        abort_on_error,
        publish_if_warnings,
        per_doctype_max_errors,
        interactive: flag("InteractiveMode")?,
        ignore_last_job_mismatch: flag("IgnoreLastJobIdMismatch")?,
        distribution,
    })
}

/// Replace `${Name}` filter parameter values with job parameter `Name`.
pub fn resolve_specifications(
    specifications: &[SubsetSpecification],
    parameters: &BTreeMap<String, String>,
) -> Result<Vec<SubsetSpecification>> {
    let reference = Regex::new(r"^\$\{(\w+)\}$").expect("static regex");
    specifications
        .iter()
        .map(|spec| {
            let filter_sets = spec
                .filter_sets
                .iter()
                .map(|set| {
                    let mut resolved = BTreeMap::new();
                    for (name, value) in &set.parameters {
                        let value = match reference.captures(value) {
                            Some(caps) => parameters.get(&caps[1]).cloned().ok_or_else(|| {
                                PublishError::invalid_parameter(
                                    name,
                                    format!("job parameter {} is not set", &caps[1]),
                                )
                            })?,
                            None => value.clone(),
                        };
                        resolved.insert(name.clone(), value);
                    }
                    Ok(FilterSet {
                        filters: set.filters.clone(),
                        parameters: resolved,
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(SubsetSpecification {
                filter_sets,
                ..spec.clone()
            })
        })
        .collect()
}
