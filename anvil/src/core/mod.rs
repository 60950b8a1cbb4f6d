pub mod action;
pub mod algorithm;
pub mod config;
mod context;
pub mod depdb;
pub mod error;
pub mod name;
pub mod project;
pub mod rule;
pub mod scope;
pub mod target;
pub mod variable;

pub use action::{Action, ActionTarget, MetaOperationInfo, OperationInfo};
pub use context::{Context, Options};
pub use depdb::DepDb;
pub use error::{BuildError, Failed};
pub use name::{to_name, Name};
pub use rule::{Recipe, Rule};
pub use scope::{OperationCallback, Scope, ScopeId, ScopeMap, GLOBAL_SCOPE};
pub use target::{Prerequisite, Target, TargetKey, TargetMap, TargetState, TargetType};
pub use variable::{Value, ValueType, VarMap, VarPool, Variable, Visibility};
