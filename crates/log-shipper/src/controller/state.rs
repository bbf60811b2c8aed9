// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Tenant lifecycle states and the per-state routing gates.
//!
//! State derivation from an observed cluster object:
//!
//! ```text
//!   deletion timestamp set            -> Deleting
//!   no last operation                 -> Creating
//!   Create   (succeeded)              -> steady
//!   Create   (any other state)        -> Creating
//!   Reconcile                         -> steady
//!   Delete                            -> Deleting
//!   Migrate                           -> Migrating
//!   Restore  (succeeded)              -> steady
//!   Restore  (any other state)        -> Restoring
//!
//!   steady, by hibernation (hibernation enabled, hibernated status):
//!     (true, true)  Hibernated   (true, false)  Hibernating
//!     (false, true) Waking       (false, false) Ready
//! ```
//!
//! `Deleted` is never derived from an object, it is set when the watch
//! reports the object gone.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Creating,
    Ready,
    Hibernating,
    Hibernated,
    Waking,
    Deleting,
    Deleted,
    Restoring,
    Migrating,
}

impl LifecycleState {
    pub const ALL: [LifecycleState; 9] = [
        LifecycleState::Creating,
        LifecycleState::Ready,
        LifecycleState::Hibernating,
        LifecycleState::Hibernated,
        LifecycleState::Waking,
        LifecycleState::Deleting,
        LifecycleState::Deleted,
        LifecycleState::Restoring,
        LifecycleState::Migrating,
    ];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Creating => "creating",
            LifecycleState::Ready => "ready",
            LifecycleState::Hibernating => "hibernating",
            LifecycleState::Hibernated => "hibernated",
            LifecycleState::Waking => "waking",
            LifecycleState::Deleting => "deleting",
            LifecycleState::Deleted => "deleted",
            LifecycleState::Restoring => "restoring",
            LifecycleState::Migrating => "migrating",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationKind {
    Create,
    Reconcile,
    Delete,
    Migrate,
    Restore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationState {
    Processing,
    Succeeded,
    Error,
    Failed,
    Pending,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastOperation {
    #[serde(rename = "type")]
    pub kind: OperationKind,
    pub state: OperationState,
}

/// The parts of an observed cluster object the controller reads.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClusterObject {
    /// Tenant name, also the dynamic host value of its records.
    pub name: String,
    pub deletion_timestamp: Option<String>,
    pub hibernation_enabled: bool,
    pub hibernated: bool,
    pub last_operation: Option<LastOperation>,
}

impl ClusterObject {
    #[must_use]
    pub fn lifecycle_state(&self) -> LifecycleState {
        if self.deletion_timestamp.is_some() {
            return LifecycleState::Deleting;
        }
        let Some(operation) = self.last_operation else {
            return LifecycleState::Creating;
        };
        let succeeded = operation.state == OperationState::Succeeded;
        match operation.kind {
            OperationKind::Create if !succeeded => LifecycleState::Creating,
            OperationKind::Restore if !succeeded => LifecycleState::Restoring,
            OperationKind::Delete => LifecycleState::Deleting,
            OperationKind::Migrate => LifecycleState::Migrating,
            OperationKind::Create | OperationKind::Restore | OperationKind::Reconcile => {
                self.steady_state()
            }
        }
    }

    fn steady_state(&self) -> LifecycleState {
        match (self.hibernation_enabled, self.hibernated) {
            (true, true) => LifecycleState::Hibernated,
            (true, false) => LifecycleState::Hibernating,
            (false, true) => LifecycleState::Waking,
            (false, false) => LifecycleState::Ready,
        }
    }
}

/// One routing direction, one flag per lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateGates {
    pub creating: bool,
    pub ready: bool,
    pub hibernating: bool,
    pub hibernated: bool,
    pub waking: bool,
    pub deleting: bool,
    pub deleted: bool,
    pub restoring: bool,
    pub migrating: bool,
}

impl StateGates {
    #[must_use]
    pub fn all(open: bool) -> Self {
        StateGates {
            creating: open,
            ready: open,
            hibernating: open,
            hibernated: open,
            waking: open,
            deleting: open,
            deleted: open,
            restoring: open,
            migrating: open,
        }
    }

    /// Defaults for the tenant direction: everything but hibernation.
    #[must_use]
    pub fn tenant_defaults() -> Self {
        StateGates {
            hibernating: false,
            hibernated: false,
            ..StateGates::all(true)
        }
    }

    /// Defaults for the default-client direction: states where the tenant's
    /// own backend may not be reachable yet.
    #[must_use]
    pub fn default_client_defaults() -> Self {
        StateGates {
            creating: true,
            restoring: true,
            migrating: true,
            ..StateGates::all(false)
        }
    }

    #[must_use]
    pub fn allows(&self, state: LifecycleState) -> bool {
        *self.flag(state)
    }

    pub fn set(&mut self, state: LifecycleState, open: bool) {
        *self.flag_mut(state) = open;
    }

    fn flag(&self, state: LifecycleState) -> &bool {
        match state {
            LifecycleState::Creating => &self.creating,
            LifecycleState::Ready => &self.ready,
            LifecycleState::Hibernating => &self.hibernating,
            LifecycleState::Hibernated => &self.hibernated,
            LifecycleState::Waking => &self.waking,
            LifecycleState::Deleting => &self.deleting,
            LifecycleState::Deleted => &self.deleted,
            LifecycleState::Restoring => &self.restoring,
            LifecycleState::Migrating => &self.migrating,
        }
    }

    fn flag_mut(&mut self, state: LifecycleState) -> &mut bool {
        match state {
            LifecycleState::Creating => &mut self.creating,
            LifecycleState::Ready => &mut self.ready,
            LifecycleState::Hibernating => &mut self.hibernating,
            LifecycleState::Hibernated => &mut self.hibernated,
            LifecycleState::Waking => &mut self.waking,
            LifecycleState::Deleting => &mut self.deleting,
            LifecycleState::Deleted => &mut self.deleted,
            LifecycleState::Restoring => &mut self.restoring,
            LifecycleState::Migrating => &mut self.migrating,
        }
    }
}

/// Both routing directions. The two sets are independent: nothing requires a
/// state to have at least one open gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutingGates {
    pub tenant: StateGates,
    pub default: StateGates,
}

impl Default for RoutingGates {
    fn default() -> Self {
        RoutingGates {
            tenant: StateGates::tenant_defaults(),
            default: StateGates::default_client_defaults(),
        }
    }
}

impl RoutingGates {
    /// True when logs of a tenant in `state` go anywhere.
    #[must_use]
    pub fn routable(&self, state: LifecycleState) -> bool {
        self.tenant.allows(state) || self.default.allows(state)
    }
}
