//! Admission-contract checks
//!
//! Pure functions mirroring what the admission webhook enforces. Reconcilers
//! call them as a second line of defense when a forbidden change slips
//! through.

use thiserror::Error;

use crate::conditions::{is_condition_true, CONDITION_READY};
use crate::crd::{EntrySelector, InstanceProperties, PlanReference, ServiceInstance, ServiceInstanceSpec};

/// Plural resource names the migration blocker rejects writes to.
pub const BLOCKED_RESOURCES: [&str; 8] = [
    "clusterservicebrokers",
    "servicebrokers",
    "clusterserviceclasses",
    "serviceclasses",
    "clusterserviceplans",
    "serviceplans",
    "serviceinstances",
    "servicebindings",
];

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("exactly one of the cluster or namespaced class and plan references must be set")]
    AmbiguousScope,

    #[error("a class and a plan must both be specified")]
    MissingReference,

    #[error("class and plan must be identified the same way (external name, external id or name)")]
    MixedIdentification,

    #[error("the service class cannot be changed (was {old}, now {new})")]
    ClassChanged { old: String, new: String },

    #[error("externalID cannot be changed once set")]
    ExternalIdChanged,

    #[error("updateRequests cannot decrease ({old} to {new})")]
    UpdateRequestsDecreased { old: i64, new: i64 },

    #[error("plan cannot be changed: class {class} is not plan updatable")]
    PlanNotUpdatable { class: String },

    #[error("instance {0} does not exist")]
    InstanceMissing(String),

    #[error("instance {0} is not ready")]
    InstanceNotReady(String),
}

fn same_method(a: &EntrySelector, b: &EntrySelector) -> bool {
    std::mem::discriminant(a) == std::mem::discriminant(b)
}

/// A plan reference uses one scope and names class and plan the same way.
pub fn validate_plan_reference(reference: &PlanReference) -> Result<(), ValidationError> {
    match (reference.is_cluster_scoped(), reference.is_namespaced()) {
        (true, true) => return Err(ValidationError::AmbiguousScope),
        (false, false) => return Err(ValidationError::MissingReference),
        _ => {}
    }
    match (reference.class_selector(), reference.plan_selector()) {
        (Some(class), Some(plan)) if same_method(&class, &plan) => Ok(()),
        (Some(_), Some(_)) => Err(ValidationError::MixedIdentification),
        _ => Err(ValidationError::MissingReference),
    }
}

/// Spec changes allowed on an existing instance.
pub fn validate_instance_update(old: &ServiceInstanceSpec, new: &ServiceInstanceSpec) -> Result<(), ValidationError> {
    validate_plan_reference(&new.plan_reference)?;
    let old_ref = &old.plan_reference;
    let new_ref = &new.plan_reference;
    if old_ref.is_cluster_scoped() != new_ref.is_cluster_scoped() || old_ref.class_selector() != new_ref.class_selector() {
        return Err(ValidationError::ClassChanged {
            old: old_ref.class_display_name(),
            new: new_ref.class_display_name(),
        });
    }
    if !old.external_id.is_empty() && old.external_id != new.external_id {
        return Err(ValidationError::ExternalIdChanged);
    }
    if new.update_requests < old.update_requests {
        return Err(ValidationError::UpdateRequestsDecreased {
            old: old.update_requests,
            new: new.update_requests,
        });
    }
    Ok(())
}

/// What the broker currently has, compared with what the spec now asks for.
/// Used by the instance reconciler before issuing an update.
pub fn validate_against_provisioned(
    applied: &InstanceProperties,
    external_id: &str,
    class_external_id: &str,
    class_name: &str,
    plan_external_id: &str,
    plan_updatable: bool,
) -> Result<(), ValidationError> {
    if !applied.external_id.is_empty() && applied.external_id != external_id {
        return Err(ValidationError::ExternalIdChanged);
    }
    if applied.class_external_id != class_external_id {
        return Err(ValidationError::ClassChanged {
            old: applied.class_external_name.clone(),
            new: class_name.to_string(),
        });
    }
    if applied.plan_external_id != plan_external_id && !plan_updatable {
        return Err(ValidationError::PlanNotUpdatable {
            class: class_name.to_string(),
        });
    }
    Ok(())
}

/// A binding may only be created against a Ready instance.
pub fn validate_binding_create(instance_name: &str, instance: Option<&ServiceInstance>) -> Result<(), ValidationError> {
    let instance = instance.ok_or_else(|| ValidationError::InstanceMissing(instance_name.to_string()))?;
    let ready = instance
        .status
        .as_ref()
        .is_some_and(|s| is_condition_true(&s.conditions, CONDITION_READY));
    if ready && instance.metadata.deletion_timestamp.is_none() {
        Ok(())
    } else {
        Err(ValidationError::InstanceNotReady(instance_name.to_string()))
    }
}

/// Whether the migration blocker covers a resource.
pub fn is_blocked_resource(group: &str, resource: &str) -> bool {
    group == crate::crd::GROUP && BLOCKED_RESOURCES.contains(&resource)
}
