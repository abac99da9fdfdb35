//! Service Catalog Controller
//!
//! Reconciles Open Service Broker API brokers, their catalogs, service
//! instances and bindings, and carries the offline tooling that moves the
//! catalog between record stores.
//!
//! ## Records
//!
//! - `ClusterServiceBroker` / `ServiceBroker`: a broker endpoint whose catalog
//!   is materialized as classes and plans
//! - `ClusterServiceClass` / `ServiceClass`, `ClusterServicePlan` / `ServicePlan`
//! - `ServiceInstance`: a provisioned instance of a plan
//! - `ServiceBinding`: credentials for an instance, delivered as a Secret
//!
//! ## Example
//!
//! ```yaml
//! apiVersion: servicecatalog.k8s.io/v1beta1
//! kind: ServiceInstance
//! metadata:
//!   name: db
//!   namespace: default
//! spec:
//!   clusterServiceClassExternalName: postgres
//!   clusterServicePlanExternalName: small
//! ```

pub mod conditions;
pub mod config;
pub mod controllers;
pub mod crd;
pub mod error;
pub mod migration;
pub mod osb;
pub mod retry;
pub mod store;
pub mod validation;

pub use config::{ControllerArgs, ControllerConfig};
pub use controllers::{BrokerClientFactory, BrokerEndpoint, Context, Manager, OsbClientFactory};
pub use crd::{
    ClusterServiceBroker, ClusterServiceClass, ClusterServicePlan, ServiceBinding, ServiceBroker,
    ServiceClass, ServiceInstance, ServicePlan,
};
pub use error::{ControllerError, Result};
pub use migration::{Cleaner, Migration, MigrationAction, MigrationOptions};
pub use store::{KubeStore, MemoryStore, Store};
