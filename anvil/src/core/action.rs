use crate::core::scope::ScopeId;
use crate::core::target::Target;
use crate::core::{Context, Name};
use crate::utils::IResult;
use std::path::Path;
use std::sync::Arc;

pub type MetaOperationId = u8;
pub type OperationId = u8;

pub const DEFAULT_ID: OperationId = 1;
pub const UPDATE_ID: OperationId = 2;
pub const CLEAN_ID: OperationId = 3;

pub const PERFORM_ID: MetaOperationId = 1;
pub const CONFIGURE_ID: MetaOperationId = 2;
pub const DISFIGURE_ID: MetaOperationId = 3;

/// A (meta-operation, operation) pair. `outer` is set when this action is
/// the inner half of a composed pre/post action, so rules can decide to
/// delegate.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Action {
    pub meta: MetaOperationId,
    pub op: OperationId,
    pub outer: Option<OperationId>,
}

impl Action {
    pub fn new(meta: MetaOperationId, op: OperationId) -> Self {
        Self {
            meta,
            op,
            outer: None,
        }
    }

    pub fn with_outer(meta: MetaOperationId, op: OperationId, outer: OperationId) -> Self {
        Self {
            meta,
            op,
            outer: Some(outer),
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.outer {
            Some(o) => write!(
                f,
                "{}({}({}))",
                meta_operation_name(self.meta),
                operation(o).name,
                operation(self.op).name
            ),
            None => write!(
                f,
                "{}({})",
                meta_operation_name(self.meta),
                operation(self.op).name
            ),
        }
    }
}

/// First: prerequisites complete before the target (update-style). Last:
/// the target runs before its prerequisites are torn down (clean-style).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ExecMode {
    First,
    Last,
}

pub struct OperationInfo {
    pub id: OperationId,
    pub name: &'static str,
    pub name_do: &'static str,
    pub name_doing: &'static str,
    pub name_done: &'static str,
    pub mode: ExecMode,
}

pub static DEFAULT_OPERATION: OperationInfo = OperationInfo {
    id: DEFAULT_ID,
    name: "default",
    name_do: "build",
    name_doing: "building",
    name_done: "is up to date",
    mode: ExecMode::First,
};

pub static UPDATE_OPERATION: OperationInfo = OperationInfo {
    id: UPDATE_ID,
    name: "update",
    name_do: "update",
    name_doing: "updating",
    name_done: "is up to date",
    mode: ExecMode::First,
};

pub static CLEAN_OPERATION: OperationInfo = OperationInfo {
    id: CLEAN_ID,
    name: "clean",
    name_do: "clean",
    name_doing: "cleaning",
    name_done: "is clean",
    mode: ExecMode::Last,
};

pub fn operations() -> [&'static OperationInfo; 3] {
    [&DEFAULT_OPERATION, &UPDATE_OPERATION, &CLEAN_OPERATION]
}

pub fn operation(id: OperationId) -> &'static OperationInfo {
    match id {
        DEFAULT_ID => &DEFAULT_OPERATION,
        UPDATE_ID => &UPDATE_OPERATION,
        CLEAN_ID => &CLEAN_OPERATION,
        _ => unreachable!("unknown operation id {}", id),
    }
}

/// A target collected by a meta-operation's match callback. Most
/// meta-operations collect targets; disfigure collects root scopes.
pub enum ActionTarget {
    Target(Arc<Target>),
    Scope(ScopeId),
}

impl ActionTarget {
    pub fn as_target(&self) -> Option<&Arc<Target>> {
        match self {
            ActionTarget::Target(t) => Some(t),
            ActionTarget::Scope(_) => None,
        }
    }
}

/// A meta-operation implementation: how the inner operation is loaded,
/// matched and executed.
pub struct MetaOperationInfo {
    pub id: MetaOperationId,
    pub name: &'static str,
    /// Translates the requested operation id (e.g. `default` to `update`).
    pub operation_pre: Option<fn(OperationId) -> OperationId>,
    pub load: fn(&mut Context, ScopeId, ScopeId, &Path) -> IResult<()>,
    pub match_: fn(&Context, Action, ScopeId, ScopeId, &Name) -> IResult<ActionTarget>,
    pub execute: fn(&Context, Action, &[ActionTarget]) -> IResult<()>,
    pub meta_operation_post: Option<fn(&mut Context) -> IResult<()>>,
}

fn meta_operation_name(id: MetaOperationId) -> &'static str {
    match id {
        PERFORM_ID => "perform",
        CONFIGURE_ID => "configure",
        DISFIGURE_ID => "disfigure",
        _ => "?",
    }
}

pub fn meta_name(id: MetaOperationId) -> &'static str {
    meta_operation_name(id)
}

/// "update target `/tmp/exe{hello}`" style phrases for diagnostics.
pub fn diag_do(a: Action, t: &Target) -> String {
    format!("{} target `{}`", operation(a.op).name_do, t)
}

pub fn diag_doing(a: Action, t: &Target) -> String {
    format!("{} target `{}`", operation(a.op).name_doing, t)
}
