//! Broker error taxonomy
//!
//! Every failure at the broker boundary is one of these kinds. Reconcilers
//! decide between retry, terminal failure and orphan mitigation from the kind
//! alone.

use thiserror::Error;

use crate::conditions::{REASON_AUTH, REASON_BROKER_UNREACHABLE};

/// Error returned by a call to a service broker
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrokerError {
    /// Network failure before the request reached the broker, a timeout or
    /// 5xx on a read or destructive call, or a 5xx on any call whose
    /// allocation state does not matter.
    #[error("broker unreachable: {message}")]
    Unreachable { message: String },

    /// 401 or 403
    #[error("broker rejected credentials (HTTP {status})")]
    Auth { status: u16 },

    /// 409
    #[error("broker reported a conflict: {message}")]
    Conflict { message: String },

    /// 404 on a destructive call, or 410
    #[error("resource gone at broker")]
    Gone,

    /// 422 with error `AsyncRequired`
    #[error("broker requires asynchronous operation")]
    AsyncRequired,

    /// 422 with error `ConcurrencyError`; another operation is running
    #[error("broker reported a concurrent operation in progress")]
    Concurrency,

    /// 2xx whose body could not be parsed or lacks a required field
    #[error("invalid broker response (HTTP {status}): {message}")]
    InvalidResponse { status: u16, message: String },

    /// Any other 4xx; carries the broker's error code and description
    #[error("broker reported failure (HTTP {status}): {}", describe(.error, .description))]
    Reported {
        status: u16,
        error: Option<String>,
        description: Option<String>,
    },

    /// Timeout, 408, 5xx or dropped connection after a create-type call was sent
    #[error("broker allocation state unknown: {message}")]
    AmbiguousAllocation { message: String },

    /// The request could not be built (bad URL, non-object parameters)
    #[error("invalid broker request: {0}")]
    InvalidRequest(String),
}

fn describe(error: &Option<String>, description: &Option<String>) -> String {
    match (error, description) {
        (Some(e), Some(d)) => format!("{}: {}", e, d),
        (Some(e), None) => e.clone(),
        (None, Some(d)) => d.clone(),
        (None, None) => "no description".to_string(),
    }
}

/// How a reconciler should react to a broker error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorDisposition {
    /// Retry with backoff; record never marked Failed
    Transient,
    /// Set Failed=True
    Terminal,
    /// The broker may hold an allocation; run orphan mitigation
    OrphanMitigation,
    /// Destructive call on a missing resource; treat as success
    Success,
}

impl BrokerError {
    pub fn unreachable(msg: impl Into<String>) -> Self {
        Self::Unreachable { message: msg.into() }
    }

    pub fn ambiguous(msg: impl Into<String>) -> Self {
        Self::AmbiguousAllocation { message: msg.into() }
    }

    pub fn invalid_response(status: u16, msg: impl Into<String>) -> Self {
        Self::InvalidResponse {
            status,
            message: msg.into(),
        }
    }

    /// Disposition for a provision or bind call.
    pub fn allocation_disposition(&self) -> ErrorDisposition {
        match self {
            Self::Unreachable { .. } | Self::Concurrency => ErrorDisposition::Transient,
            Self::AmbiguousAllocation { .. } | Self::InvalidResponse { .. } => {
                ErrorDisposition::OrphanMitigation
            }
            Self::Auth { .. }
            | Self::Conflict { .. }
            | Self::Gone
            | Self::AsyncRequired
            | Self::Reported { .. }
            | Self::InvalidRequest(_) => ErrorDisposition::Terminal,
        }
    }

    /// Disposition for a deprovision or unbind call.
    pub fn destructive_disposition(&self) -> ErrorDisposition {
        match self {
            Self::Gone => ErrorDisposition::Success,
            Self::Unreachable { .. } | Self::Concurrency | Self::AmbiguousAllocation { .. } => {
                ErrorDisposition::Transient
            }
            _ => ErrorDisposition::Terminal,
        }
    }

    /// Disposition for catalog fetches, polls and updates.
    pub fn read_disposition(&self) -> ErrorDisposition {
        match self {
            Self::Unreachable { .. } | Self::Concurrency | Self::AmbiguousAllocation { .. } => {
                ErrorDisposition::Transient
            }
            _ => ErrorDisposition::Terminal,
        }
    }

    /// Machine-readable reason for conditions.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Unreachable { .. } => REASON_BROKER_UNREACHABLE,
            Self::Auth { .. } => REASON_AUTH,
            Self::Conflict { .. } => "Conflict",
            Self::Gone => "Gone",
            Self::AsyncRequired => "AsyncRequired",
            Self::Concurrency => "ConcurrencyError",
            Self::InvalidResponse { .. } => "BrokerInvalidResponse",
            Self::Reported { .. } => "BrokerReportedFailure",
            Self::AmbiguousAllocation { .. } => "AmbiguousAllocation",
            Self::InvalidRequest(_) => "InvalidRequest",
        }
    }
}
