//! Records of callbacks delivered to the application.

use crate::object::ProxyId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What was delivered on the callback stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeliveredKind {
    /// The creation callback fired for a proxy.
    Created { id: ProxyId, name: String },
    /// The destruction callback fired for a proxy.
    Destroyed { id: ProxyId, name: String },
    /// A timer tick was counted for a proxy.
    Tick {
        id: ProxyId,
        count: u64,
        /// False when no tick handler was registered.
        handled: bool,
    },
    /// A remote attribute update was applied.
    AttributeUpdated { id: ProxyId, attribute: String },
}

impl DeliveredKind {
    /// The proxy this delivery concerns.
    pub fn proxy_id(&self) -> ProxyId {
        match self {
            Self::Created { id, .. }
            | Self::Destroyed { id, .. }
            | Self::Tick { id, .. }
            | Self::AttributeUpdated { id, .. } => *id,
        }
    }
}

/// One entry in the dispatcher's delivery history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveredEvent {
    /// When the delivery happened.
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: DeliveredKind,
}

impl DeliveredEvent {
    pub fn now(kind: DeliveredKind) -> Self {
        Self {
            at: Utc::now(),
            kind,
        }
    }
}
