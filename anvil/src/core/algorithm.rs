use crate::core::action::{self, Action};
use crate::core::rule::{Recipe, Rule, FILE_RULE};
use crate::core::scope::GLOBAL_SCOPE;
use crate::core::target::{Prerequisite, Target, TargetState};
use crate::core::{error, BuildError, Context, Failed};
use crate::utils::paths;
use crate::utils::IResult;
use anyhow::Context as _;
use rayon::prelude::*;
use std::cell::RefCell;
use std::sync::Arc;

thread_local! {
    /// Targets currently being matched or executed by this thread. A wait
    /// on a target we ourselves claimed is a dependency cycle, not a
    /// concurrent claim.
    static IN_PROGRESS: RefCell<Vec<usize>> = RefCell::new(Vec::new());
}

fn cycle_check(t: &Arc<Target>) -> IResult<()> {
    let p = Arc::as_ptr(t) as usize;
    let hit = IN_PROGRESS.with(|s| s.borrow().contains(&p));
    if hit {
        anyhow::bail!("dependency cycle detected involving target `{}`", t);
    }
    Ok(())
}

/// Marks a target in progress on this thread for the guard's lifetime.
struct InProgress(usize);

impl InProgress {
    fn new(t: &Arc<Target>) -> Self {
        let p = Arc::as_ptr(t) as usize;
        IN_PROGRESS.with(|s| s.borrow_mut().push(p));
        Self(p)
    }
}

impl Drop for InProgress {
    fn drop(&mut self) {
        IN_PROGRESS.with(|s| {
            let mut v = s.borrow_mut();
            if let Some(i) = v.iter().rposition(|p| *p == self.0) {
                v.remove(i);
            }
        });
    }
}

/// Resolves a prerequisite to its target, using the type's search hook if
/// there is one. Creates an implied target on first reference.
pub fn search(cx: &Context, p: &Prerequisite) -> IResult<Arc<Target>> {
    if let Some(h) = p.ty.search {
        if let Some(t) = h(cx, p)? {
            return Ok(t);
        }
    }
    default_search(cx, p)
}

fn default_search(cx: &Context, p: &Prerequisite) -> IResult<Arc<Target>> {
    let t = match cx
        .targets
        .find(&p.ty, &p.dir, &p.out, &p.name, p.ext.as_deref())
    {
        Some(t) => t,
        None => cx.targets.insert(
            &p.ty,
            p.dir.clone(),
            p.out.clone(),
            p.name.clone(),
            p.ext.clone(),
            true,
        ),
    };

    // For a path-based target without a derived path yet, see whether a
    // corresponding file already exists in the src tree (prerequisite
    // directories are in the out tree).
    if t.is_path_based() && t.path().is_none() {
        let scope = cx.scopes.get(p.scope);
        if let Some(src_dir) = scope.src_dir(&p.dir) {
            if let Some(path) = existing_file(&t, &src_dir) {
                t.set_path(path);
                t.load_mtime();
            }
        }
    }

    Ok(t)
}

fn existing_file(t: &Target, dir: &crate::utils::paths::DirPath) -> Option<std::path::PathBuf> {
    let ext = t.resolve_extension();
    let file = match ext.as_deref() {
        Some("") | None => t.name.clone(),
        Some(e) => format!("{}.{}", t.name, e),
    };
    let path = dir.join_leaf(file);
    if path.is_file() {
        Some(path)
    } else {
        None
    }
}

/// Matches a rule to a target and assigns its recipe. A second call for
/// the same action is a no-op; concurrent callers wait for the claimed
/// match to finish.
pub fn match_target(cx: &Context, a: Action, t: &Arc<Target>) -> IResult<()> {
    {
        let mut d = t.slot.data.lock().unwrap();
        loop {
            if d.state == TargetState::Failed {
                anyhow::bail!(Failed);
            }
            if d.matched {
                return Ok(());
            }
            if !d.busy {
                d.busy = true;
                break;
            }
            drop(d);
            cycle_check(t)?;
            d = t.slot.data.lock().unwrap();
            if d.busy {
                d = t.slot.cond.wait(d).unwrap();
            }
        }
    }

    let _guard = InProgress::new(t);
    let r = match_impl(cx, a, t);

    let mut d = t.slot.data.lock().unwrap();
    d.busy = false;
    d.matched = true;
    if r.is_err() {
        d.state = TargetState::Failed;
    }
    t.slot.cond.notify_all();
    drop(d);

    r
}

/// Walks the target's type chain looking up registered rules in the
/// target's root scope and then the global scope. A positive match keeps
/// scanning the rest of the hint range to detect ambiguity; only the
/// fallback file rule is exempt.
fn match_impl(cx: &Context, a: Action, t: &Arc<Target>) -> IResult<()> {
    let base = cx.scopes.find(&t.dir);
    let mut rule_scopes = Vec::with_capacity(2);
    if let Some(r) = cx.scopes.root_of(base) {
        rule_scopes.push(r);
    }
    if !rule_scopes.contains(&GLOBAL_SCOPE) {
        rule_scopes.push(GLOBAL_SCOPE);
    }

    let hint = cx
        .lookup_target_str(base, "rule_hint", t)?
        .unwrap_or_default();

    for ty in t.ty.name_chain() {
        for rs in rule_scopes.iter() {
            let scope = cx.scopes.get(*rs);
            let rules = match scope.rules.find(a.op, &ty) {
                Some(r) if !r.is_empty() => r,
                _ => continue,
            };

            let mut matched: Option<(String, Arc<dyn Rule>)> = None;
            for (name, rule) in rules.prefix_range(&hint) {
                let m = rule.match_rule(cx, a, t, &hint).with_context(|| {
                    format!("while matching rule {} to {}", name, action::diag_do(a, t))
                })?;
                if !m {
                    continue;
                }

                match &matched {
                    None => matched = Some((name.clone(), rule.clone())),
                    Some((name0, rule0)) => {
                        // The fallback file rule never makes a match
                        // ambiguous; a real rule wins over it.
                        if is_file_rule(rule0) {
                            matched = Some((name.clone(), rule.clone()));
                        } else if !is_file_rule(rule) && !Arc::ptr_eq(rule0, rule) {
                            anyhow::bail!(BuildError::AmbiguousMatch {
                                action: action::diag_do(a, t),
                                rule1: name0.clone(),
                                rule2: name.clone(),
                            });
                        }
                    }
                }
            }

            if let Some((name, rule)) = matched {
                let recipe = rule.apply(cx, a, t).with_context(|| {
                    format!("while applying rule {} to {}", name, action::diag_do(a, t))
                })?;
                t.set_recipe(recipe);
                return Ok(());
            }
        }
    }

    anyhow::bail!(BuildError::NoRule {
        action: action::diag_do(a, t),
    })
}

fn is_file_rule(r: &Arc<dyn Rule>) -> bool {
    Arc::ptr_eq(r, &FILE_RULE)
}

/// Resolves and matches the target's declared prerequisites, appending
/// the resolved targets to the per-action list. The group, if any, is
/// matched first.
pub fn match_prerequisites(cx: &Context, a: Action, t: &Arc<Target>) -> IResult<()> {
    let group = t.group.lock().unwrap().clone();
    if let Some(g) = group {
        match_target(cx, a, &g)?;
    }

    let prereqs = t.prerequisites.lock().unwrap().clone();
    let mut pts = Vec::with_capacity(prereqs.len());
    for p in prereqs.iter() {
        let pt = search(cx, p)?;
        match_target(cx, a, &pt)?;
        pts.push(pt);
    }

    // Between match and execute the list is append-only and never
    // reordered.
    t.slot
        .data
        .lock()
        .unwrap()
        .prerequisite_targets
        .extend(pts);
    Ok(())
}

/// The execute state machine: an unknown or postponed target is claimed
/// and its recipe run to a terminal state. Already-terminal states take the inline fast
/// path; a busy target is waited on.
pub fn execute(cx: &Context, a: Action, t: &Arc<Target>) -> IResult<TargetState> {
    let recipe;
    {
        let mut d = t.slot.data.lock().unwrap();
        loop {
            match d.state {
                TargetState::Unchanged | TargetState::Changed => return Ok(d.state),
                TargetState::Failed => anyhow::bail!(Failed),
                TargetState::Unknown | TargetState::Postponed => {
                    if !d.busy {
                        d.busy = true;
                        recipe = d.recipe.clone();
                        break;
                    }
                    drop(d);
                    cycle_check(t)?;
                    d = t.slot.data.lock().unwrap();
                    if d.busy {
                        d = t.slot.cond.wait(d).unwrap();
                    }
                }
            }
        }
    }

    let _guard = InProgress::new(t);

    // Serial-stop: refuse to start new recipes after the first failure.
    if cx.stop_requested() {
        finish(t, TargetState::Failed);
        anyhow::bail!(Failed);
    }

    let r: IResult<TargetState> = (|| {
        // A dir{} target runs its scope's operation callbacks around the
        // recipe; their states merge into the target's.
        let cbs = dir_callbacks(cx, a, t);
        let mut s = TargetState::Unchanged;
        if let Some((sid, cbs)) = &cbs {
            for cb in cbs {
                if let Some(pre) = &cb.pre {
                    s = s.merge(pre(cx, a, *sid)?);
                }
            }
        }

        let rs = match recipe {
            None | Some(Recipe::Noop) => TargetState::Unchanged,
            Some(Recipe::Default) => execute_prerequisites(cx, a, t)?,
            Some(Recipe::Group) => {
                let g = t.group.lock().unwrap().clone();
                match g {
                    Some(g) => execute(cx, a, &g)?,
                    None => TargetState::Unchanged,
                }
            }
            Some(Recipe::Concrete(f)) => f(cx, a, t)?,
        };
        s = s.merge(rs);

        if let Some((sid, cbs)) = &cbs {
            for cb in cbs {
                if let Some(post) = &cb.post {
                    s = s.merge(post(cx, a, *sid)?);
                }
            }
        }
        Ok(s)
    })();

    match r {
        Ok(s) => {
            debug_assert!(
                matches!(s, TargetState::Unchanged | TargetState::Changed),
                "recipe returned non-terminal state"
            );
            finish(t, s);
            Ok(s)
        }
        Err(e) => {
            // Report once, at the frame that knows the target; dependents
            // only see the failed marker.
            if !error::reported(&e) {
                let mut shell = cx.shell();
                drop(shell.error(format!("{:#}", e)));
                drop(shell.info(format!("while {}", action::diag_doing(a, t))));
            }
            if cx.options.serial_stop {
                cx.request_stop();
            }
            finish(t, TargetState::Failed);
            Err(Failed.into())
        }
    }
}

/// The operation callbacks registered for the scope whose dir{} target
/// this is, if any.
fn dir_callbacks(
    cx: &Context,
    a: Action,
    t: &Arc<Target>,
) -> Option<(crate::core::ScopeId, Vec<crate::core::scope::OperationCallback>)> {
    if !t.ty.is_a("dir") {
        return None;
    }
    let id = cx.scopes.find(&t.dir);
    let sc = cx.scopes.get(id);
    if sc.out_path != t.dir || sc.operation_callbacks.is_empty() {
        return None;
    }
    let cbs: Vec<_> = sc
        .operation_callbacks
        .iter()
        .filter(|(op, _)| *op == a.op)
        .map(|(_, cb)| cb.clone())
        .collect();
    if cbs.is_empty() {
        None
    } else {
        Some((id, cbs))
    }
}

fn finish(t: &Arc<Target>, s: TargetState) {
    let mut d = t.slot.data.lock().unwrap();
    d.state = s;
    d.busy = false;
    t.slot.cond.notify_all();
}

/// Executes the target's prerequisites in declaration order, folding
/// their states. Independent prerequisites run in parallel; spawns are
/// chunked by jobs × queue-depth.
pub fn execute_prerequisites(cx: &Context, a: Action, t: &Arc<Target>) -> IResult<TargetState> {
    let pts = t.slot.data.lock().unwrap().prerequisite_targets.clone();
    execute_all(cx, a, &pts)
}

pub fn execute_all(cx: &Context, a: Action, ts: &[Arc<Target>]) -> IResult<TargetState> {
    let mut state = TargetState::Unchanged;
    let mut failed = false;

    if cx.options.serial_stop {
        for p in ts.iter() {
            state = state.merge(execute(cx, a, p)?);
        }
        return Ok(state);
    }

    let chunk = (cx.options.jobs.max(1) * cx.options.queue_depth.max(1)).max(1);
    for batch in ts.chunks(chunk) {
        let results: Vec<IResult<TargetState>> =
            batch.par_iter().map(|p| execute(cx, a, p)).collect();
        for r in results {
            match r {
                Ok(s) => state = state.merge(s),
                // Already reported; keep executing what we can and
                // propagate the failure along the edge afterwards.
                Err(_) => failed = true,
            }
        }
    }

    if failed {
        anyhow::bail!(Failed);
    }
    Ok(state)
}

/// Tears down prerequisites after the target, in reverse declaration
/// order. Used by clean-style operations.
pub fn reverse_execute_prerequisites(
    cx: &Context,
    a: Action,
    t: &Arc<Target>,
) -> IResult<TargetState> {
    let pts = t.slot.data.lock().unwrap().prerequisite_targets.clone();
    let mut state = TargetState::Unchanged;
    let mut failed = false;
    for p in pts.iter().rev() {
        match execute(cx, a, p) {
            Ok(s) => state = state.merge(s),
            Err(e) => {
                if cx.options.serial_stop {
                    return Err(e);
                }
                failed = true;
            }
        }
    }
    if failed {
        anyhow::bail!(Failed);
    }
    Ok(state)
}

/// Executes prerequisites and answers whether an mtime-based target must
/// be regenerated: a prerequisite changed, the target's file does not
/// exist, or a prerequisite's mtime is newer.
pub fn execute_prerequisites_mtime(
    cx: &Context,
    a: Action,
    t: &Arc<Target>,
) -> IResult<(TargetState, bool)> {
    let s = execute_prerequisites(cx, a, t)?;
    let mut update = s == TargetState::Changed;

    if t.is_mtime_based() {
        let tm = t.load_mtime();
        if tm == paths::timestamp_nonexistent() {
            update = true;
        } else {
            let pts = t.slot.data.lock().unwrap().prerequisite_targets.clone();
            for p in pts.iter() {
                if let Some(pm) = p.mtime() {
                    if pm != paths::timestamp_nonexistent() && pm > tm {
                        update = true;
                        break;
                    }
                }
            }
        }
    }

    Ok((s, update))
}
