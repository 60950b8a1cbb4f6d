use crate::core::action::{Action, CLEAN_ID};
use crate::core::target::{Target, TargetState};
use crate::core::{algorithm, Context};
use crate::utils::paths::{self, RmdirStatus};
use crate::utils::IResult;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

pub type RecipeFn = dyn Fn(&Context, Action, &Arc<Target>) -> IResult<TargetState> + Send + Sync;

/// The function invoked in the execute phase to transform a target.
#[derive(Clone)]
pub enum Recipe {
    /// Nothing to do; the target ends up unchanged.
    Noop,
    /// Execute prerequisites and fold their states.
    Default,
    /// The group's members carry the state: executing a member triggers
    /// the group's recipe.
    Group,
    Concrete(Arc<RecipeFn>),
}

impl fmt::Debug for Recipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Recipe::Noop => write!(f, "noop"),
            Recipe::Default => write!(f, "default"),
            Recipe::Group => write!(f, "group"),
            Recipe::Concrete(_) => write!(f, "concrete"),
        }
    }
}

/// The match/apply protocol. `match_rule` answers whether this rule can
/// build the target for the action and may stash match data in the
/// target's `extra` slot; `apply` resolves prerequisites and returns the
/// recipe.
pub trait Rule: Send + Sync {
    fn match_rule(&self, cx: &Context, a: Action, t: &Arc<Target>, hint: &str) -> IResult<bool>;

    fn apply(&self, cx: &Context, a: Action, t: &Arc<Target>) -> IResult<Recipe>;
}

/// Named rules for one (operation, target type), kept sorted by name so
/// that a hint prefix selects a contiguous range.
#[derive(Default)]
pub struct RuleNameMap {
    entries: Vec<(String, Arc<dyn Rule>)>,
}

impl RuleNameMap {
    pub fn insert(&mut self, name: &str, rule: Arc<dyn Rule>) {
        let i = self
            .entries
            .binary_search_by(|(n, _)| n.as_str().cmp(name))
            .unwrap_or_else(|i| i);
        self.entries.insert(i, (name.to_string(), rule));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The contiguous range of rules whose name starts with the hint. If
    /// there is exactly one rule registered the hint is ignored.
    pub fn prefix_range<'a>(
        &'a self,
        hint: &'a str,
    ) -> impl Iterator<Item = &'a (String, Arc<dyn Rule>)> + 'a {
        let unique = self.entries.len() == 1;
        self.entries
            .iter()
            .filter(move |(n, _)| unique || hint.is_empty() || n.starts_with(hint))
    }
}

/// Rules registered per (operation, target type name).
#[derive(Default)]
pub struct RuleMap {
    map: HashMap<u8, HashMap<String, RuleNameMap>>,
}

impl RuleMap {
    pub fn insert(&mut self, op: u8, ty: &str, name: &str, rule: Arc<dyn Rule>) {
        self.map
            .entry(op)
            .or_default()
            .entry(ty.to_string())
            .or_default()
            .insert(name, rule);
    }

    pub fn find(&self, op: u8, ty: &str) -> Option<&RuleNameMap> {
        self.map.get(&op).and_then(|m| m.get(ty))
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

// Built-in rules.

/// The fallback rule: matches any path-based target whose file exists.
/// It is the last resort and the only rule permitted to short-circuit the
/// ambiguity scan.
pub struct FileRule;

impl Rule for FileRule {
    fn match_rule(&self, _cx: &Context, a: Action, t: &Arc<Target>, _hint: &str) -> IResult<bool> {
        // For clean there is nothing to verify: not checking whether the
        // file exists is harmless.
        if a.op == CLEAN_ID {
            return Ok(true);
        }

        if !t.is_mtime_based() {
            return Ok(false);
        }

        if let Some(ts) = t.mtime() {
            if ts != paths::timestamp_nonexistent() {
                return Ok(true);
            }
        }

        if !t.is_path_based() {
            return Ok(false);
        }

        let ts = t.load_mtime();
        Ok(ts != paths::timestamp_nonexistent())
    }

    fn apply(&self, cx: &Context, a: Action, t: &Arc<Target>) -> IResult<Recipe> {
        if a.op == CLEAN_ID {
            return Ok(Recipe::Noop);
        }

        // No prerequisites means the file is up to date. Quite a few
        // places that deal with predominantly static content rely on this.
        if t.prerequisites.lock().unwrap().is_empty() {
            return Ok(Recipe::Noop);
        }

        algorithm::match_prerequisites(cx, a, t)?;
        Ok(Recipe::Default)
    }
}

/// Matches `alias{}`/`dir{}` targets: prerequisites carry the state.
pub struct AliasRule;

impl Rule for AliasRule {
    fn match_rule(&self, _cx: &Context, _a: Action, _t: &Arc<Target>, _hint: &str) -> IResult<bool> {
        Ok(true)
    }

    fn apply(&self, cx: &Context, a: Action, t: &Arc<Target>) -> IResult<Recipe> {
        algorithm::match_prerequisites(cx, a, t)?;
        Ok(Recipe::Default)
    }
}

/// Creates the target's directory on update and removes it on clean.
pub struct FsdirRule;

impl Rule for FsdirRule {
    fn match_rule(&self, _cx: &Context, _a: Action, _t: &Arc<Target>, _hint: &str) -> IResult<bool> {
        Ok(true)
    }

    fn apply(&self, cx: &Context, a: Action, t: &Arc<Target>) -> IResult<Recipe> {
        algorithm::match_prerequisites(cx, a, t)?;
        if a.op == CLEAN_ID {
            Ok(Recipe::Concrete(Arc::new(fsdir_clean)))
        } else {
            Ok(Recipe::Concrete(Arc::new(fsdir_update)))
        }
    }
}

fn fsdir_update(cx: &Context, a: Action, t: &Arc<Target>) -> IResult<TargetState> {
    // Parent directories first.
    let mut ts = algorithm::execute_prerequisites(cx, a, t)?;
    let d = t.dir.as_path();
    if !d.exists() {
        paths::create_dir_all(d)?;
        cx.shell().trace(2, format!("mkdir {}", t.dir))?;
        ts = ts.merge(TargetState::Changed);
    }
    Ok(ts)
}

fn fsdir_clean(cx: &Context, a: Action, t: &Arc<Target>) -> IResult<TargetState> {
    // The reverse order of update: first remove this directory, then the
    // parents. A non-empty directory is left alone.
    let mut ts = match paths::rmdir(t.dir.as_path())? {
        RmdirStatus::Success => {
            cx.shell().trace(2, format!("rmdir {}", t.dir))?;
            TargetState::Changed
        }
        _ => TargetState::Unchanged,
    };
    ts = ts.merge(algorithm::reverse_execute_prerequisites(cx, a, t)?);
    Ok(ts)
}

/// For group members: the group's recipe carries the state, so executing
/// a member triggers the group.
pub struct GroupRule;

impl Rule for GroupRule {
    fn match_rule(&self, _cx: &Context, _a: Action, t: &Arc<Target>, _hint: &str) -> IResult<bool> {
        Ok(t.group.lock().unwrap().is_some())
    }

    fn apply(&self, cx: &Context, a: Action, t: &Arc<Target>) -> IResult<Recipe> {
        let g = t.group.lock().unwrap().clone();
        if let Some(g) = g {
            algorithm::match_target(cx, a, &g)?;
        }
        Ok(Recipe::Group)
    }
}

/// Matches anything and does nothing.
pub struct NoopRule;

impl Rule for NoopRule {
    fn match_rule(&self, _cx: &Context, _a: Action, _t: &Arc<Target>, _hint: &str) -> IResult<bool> {
        Ok(true)
    }

    fn apply(&self, _cx: &Context, _a: Action, _t: &Arc<Target>) -> IResult<Recipe> {
        Ok(Recipe::Noop)
    }
}

lazy_static::lazy_static! {
    pub static ref FILE_RULE: Arc<dyn Rule> = Arc::new(FileRule);
    pub static ref ALIAS_RULE: Arc<dyn Rule> = Arc::new(AliasRule);
    pub static ref FSDIR_RULE: Arc<dyn Rule> = Arc::new(FsdirRule);
    pub static ref GROUP_RULE: Arc<dyn Rule> = Arc::new(GroupRule);
    pub static ref NOOP_RULE: Arc<dyn Rule> = Arc::new(NoopRule);
}

#[cfg(test)]
mod test {
    use super::*;

    struct Dummy;
    impl Rule for Dummy {
        fn match_rule(
            &self,
            _cx: &Context,
            _a: Action,
            _t: &Arc<Target>,
            _hint: &str,
        ) -> IResult<bool> {
            Ok(true)
        }
        fn apply(&self, _cx: &Context, _a: Action, _t: &Arc<Target>) -> IResult<Recipe> {
            Ok(Recipe::Noop)
        }
    }

    #[test]
    fn hint_prefix() {
        let mut m = RuleNameMap::default();
        m.insert("cxx.link", Arc::new(Dummy));
        m.insert("bin.ar", Arc::new(Dummy));
        m.insert("cxx.compile", Arc::new(Dummy));

        let named: Vec<&str> = m.prefix_range("cxx").map(|(n, _)| n.as_str()).collect();
        assert_eq!(named, vec!["cxx.compile", "cxx.link"]);

        let all: Vec<&str> = m.prefix_range("").map(|(n, _)| n.as_str()).collect();
        assert_eq!(all, vec!["bin.ar", "cxx.compile", "cxx.link"]);
    }

    #[test]
    fn unique_rule_ignores_hint() {
        let mut m = RuleNameMap::default();
        m.insert("bin.ar", Arc::new(Dummy));
        let named: Vec<&str> = m.prefix_range("cxx").map(|(n, _)| n.as_str()).collect();
        assert_eq!(named, vec!["bin.ar"]);
    }
}
