//! Custom Resource Definitions for the service catalog

pub mod binding;
pub mod broker;
pub mod class;
pub mod common;
pub mod instance;
pub mod plan;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::CustomResourceExt;

pub use binding::{
    AddKeyTransform, AddKeysFromTransform, BindingProperties, RemoveKeyTransform,
    RenameKeyTransform, SecretTransform, ServiceBinding, ServiceBindingSpec, ServiceBindingStatus,
    UnbindStatus,
};
pub use broker::{
    AuthMethod, AuthSecretConfig, BrokerAuthInfo, BrokerResource, BrokerStatus,
    ClusterServiceBroker, ClusterServiceBrokerSpec, CommonBrokerSpec, RelistBehavior,
    ServiceBroker, ServiceBrokerSpec,
};
pub use class::{
    CatalogEntryStatus, ClassResource, ClusterServiceClass, ClusterServiceClassSpec,
    CommonServiceClassSpec, ServiceClass, ServiceClassSpec, LABEL_BROKER_NAME,
};
pub use common::{
    ClusterObjectReference, Condition, LastOperation, LocalObjectReference, OperationKind,
    OperationState, Parameters, ParametersFromSource, SecretKeyReference, SecretReference, GROUP,
    VERSION,
};
pub use instance::{
    DeprovisionStatus, EntrySelector, InstanceProperties, PlanReference, ProvisionStatus,
    ServiceInstance, ServiceInstanceSpec, ServiceInstanceStatus,
};
pub use plan::{
    ClusterServicePlan, ClusterServicePlanSpec, CommonServicePlanSpec, PlanResource, ServicePlan,
    ServicePlanSpec, LABEL_CLASS_NAME,
};

/// Every CRD owned by the catalog, in dependency order.
pub fn all_crds() -> Vec<CustomResourceDefinition> {
    vec![
        ClusterServiceBroker::crd(),
        ServiceBroker::crd(),
        ClusterServiceClass::crd(),
        ServiceClass::crd(),
        ClusterServicePlan::crd(),
        ServicePlan::crd(),
        ServiceInstance::crd(),
        ServiceBinding::crd(),
    ]
}
