//! Kubernetes-standard status condition helpers
//!
//! Provides constants and builder functions for managing status conditions
//! across all catalog records following the Kubernetes API conventions.

use chrono::Utc;

use crate::crd::Condition;

// Condition status values
pub const CONDITION_TRUE: &str = "True";
pub const CONDITION_FALSE: &str = "False";

// Condition types shared by brokers, instances and bindings
pub const CONDITION_READY: &str = "Ready";
pub const CONDITION_FAILED: &str = "Failed";
pub const CONDITION_ORPHAN_MITIGATION: &str = "OrphanMitigation";

// Class and plan condition type
pub const CONDITION_REMOVED_FROM_BROKER_CATALOG: &str = "RemovedFromBrokerCatalog";

// Finalizer placed on brokers, instances and bindings
pub const CATALOG_FINALIZER: &str = "kubernetes-incubator/service-catalog";

// Broker reasons
pub const REASON_FETCHED_CATALOG: &str = "FetchedCatalog";
pub const REASON_FETCH_FAILED: &str = "FetchFailed";
pub const REASON_ERROR_FETCHING_CATALOG: &str = "ErrorFetchingCatalog";
pub const REASON_ERROR_SYNCING_CATALOG: &str = "ErrorSyncingCatalog";
pub const REASON_ERROR_GETTING_AUTH_CREDENTIALS: &str = "ErrorGettingAuthCredentials";
pub const REASON_ERROR_DELETING_CATALOG: &str = "ErrorDeletingCatalog";
pub const REASON_BROKER_UNREACHABLE: &str = "BrokerUnreachable";
pub const REASON_AUTH: &str = "Auth";
pub const REASON_REMOVED_FROM_CATALOG: &str = "ServiceRemovedFromCatalog";

// Instance reasons
pub const REASON_PROVISIONING: &str = "Provisioning";
pub const REASON_PROVISION_REQUEST_IN_FLIGHT: &str = "ProvisionRequestInFlight";
pub const REASON_PROVISIONED_SUCCESSFULLY: &str = "ProvisionedSuccessfully";
pub const REASON_PROVISION_CALL_FAILED: &str = "ProvisionCallFailed";
pub const REASON_UPDATING_INSTANCE: &str = "UpdatingInstance";
pub const REASON_INSTANCE_UPDATED_SUCCESSFULLY: &str = "InstanceUpdatedSuccessfully";
pub const REASON_UPDATE_INSTANCE_CALL_FAILED: &str = "UpdateInstanceCallFailed";
pub const REASON_DEPROVISIONING: &str = "Deprovisioning";
pub const REASON_DEPROVISIONED_SUCCESSFULLY: &str = "DeprovisionedSuccessfully";
pub const REASON_DEPROVISION_CALL_FAILED: &str = "DeprovisionCallFailed";
pub const REASON_REFERENCES_NONEXISTENT_SERVICE_CLASS: &str = "ReferencesNonexistentServiceClass";
pub const REASON_REFERENCES_NONEXISTENT_SERVICE_PLAN: &str = "ReferencesNonexistentServicePlan";
pub const REASON_REFERENCES_NONEXISTENT_BROKER: &str = "ReferencesNonexistentBroker";
pub const REASON_REFERENCES_DELETED_SERVICE_PLAN: &str = "ReferencesDeletedServicePlan";
pub const REASON_ERROR_WITH_PARAMETERS: &str = "ErrorWithParameters";
pub const REASON_INVALID_SPEC_CHANGE: &str = "InvalidSpecChange";
pub const REASON_STARTING_ORPHAN_MITIGATION: &str = "StartingInstanceOrphanMitigation";
pub const REASON_ORPHAN_MITIGATION_SUCCESSFUL: &str = "OrphanMitigationSuccessful";
pub const REASON_ORPHAN_MITIGATION_FAILED: &str = "OrphanMitigationFailed";
pub const REASON_SERVICE_BINDINGS_DELETION: &str = "ServiceBindingsDeletion";
pub const REASON_RECONCILIATION_RETRY_TIMEOUT: &str = "ReconciliationRetryTimeout";

// Binding reasons
pub const REASON_BINDING: &str = "Binding";
pub const REASON_INJECTED_BIND_RESULT: &str = "InjectedBindResult";
pub const REASON_BIND_CALL_FAILED: &str = "BindCallFailed";
pub const REASON_INSTANCE_NOT_READY: &str = "InstanceNotReady";
pub const REASON_REFERENCES_NONEXISTENT_INSTANCE: &str = "ReferencesNonexistentInstance";
pub const REASON_NONBINDABLE_SERVICE_CLASS: &str = "ErrorNonbindableServiceClass";
pub const REASON_SECRET_CONFLICT: &str = "SecretConflict";
pub const REASON_ERROR_INJECTING_BIND_RESULT: &str = "ErrorInjectingBindResult";
pub const REASON_UNBINDING: &str = "Unbinding";
pub const REASON_UNBOUND_SUCCESSFULLY: &str = "UnboundSuccessfully";
pub const REASON_UNBIND_CALL_FAILED: &str = "UnbindCallFailed";
pub const REASON_BINDING_NEEDS_ORPHAN_MITIGATION: &str = "ServiceBindingNeedsOrphanMitigation";

/// Build a condition with the current timestamp.
pub fn build_condition(condition_type: &str, status: &str, reason: &str, message: &str) -> Condition {
    Condition {
        r#type: condition_type.to_string(),
        status: status.to_string(),
        last_transition_time: Some(Utc::now().to_rfc3339()),
        reason: Some(reason.to_string()),
        message: Some(message.to_string()),
    }
}

/// Set or update a condition in a list, preserving lastTransitionTime when status hasn't changed.
pub fn set_condition(conditions: &mut Vec<Condition>, new: Condition) {
    if let Some(existing) = conditions.iter_mut().find(|c| c.r#type == new.r#type) {
        if existing.status != new.status {
            *existing = new;
        } else {
            existing.reason = new.reason;
            existing.message = new.message;
        }
    } else {
        conditions.push(new);
    }
}

pub fn remove_condition(conditions: &mut Vec<Condition>, condition_type: &str) {
    conditions.retain(|c| c.r#type != condition_type);
}

pub fn find_condition<'a>(conditions: &'a [Condition], condition_type: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.r#type == condition_type)
}

pub fn is_condition_true(conditions: &[Condition], condition_type: &str) -> bool {
    find_condition(conditions, condition_type).is_some_and(|c| c.status == CONDITION_TRUE)
}

/// Reason of the given condition, if present.
pub fn condition_reason<'a>(conditions: &'a [Condition], condition_type: &str) -> Option<&'a str> {
    find_condition(conditions, condition_type).and_then(|c| c.reason.as_deref())
}

/// Printer-column summary: `Failed` wins over `Ready`; otherwise the Ready reason.
pub fn last_condition_state(conditions: &[Condition]) -> String {
    if is_condition_true(conditions, CONDITION_FAILED) {
        return condition_reason(conditions, CONDITION_FAILED)
            .unwrap_or(CONDITION_FAILED)
            .to_string();
    }
    match find_condition(conditions, CONDITION_READY) {
        Some(c) if c.status == CONDITION_TRUE => CONDITION_READY.to_string(),
        Some(c) => c.reason.clone().unwrap_or_default(),
        None => String::new(),
    }
}
