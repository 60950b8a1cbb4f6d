use crate::buildfile;
use crate::core::action::{
    self, Action, ActionTarget, ExecMode, MetaOperationInfo, DEFAULT_ID, PERFORM_ID, UPDATE_ID,
};
use crate::core::scope::ScopeId;
use crate::core::target::{Prerequisite, Target, TargetState, DIR_TYPE, FILE_TYPE};
use crate::core::{algorithm, error, BuildError, Context, Failed, Name};
use crate::utils::paths::DirPath;
use crate::utils::IResult;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const BOOTSTRAP_FILE: &str = "build/bootstrap.build";
pub const SRC_ROOT_FILE: &str = "build/bootstrap/src-root.build";
pub const CONFIG_FILE: &str = "build/config.build";

/// A src_root is marked by its bootstrap file.
pub fn is_src_root(d: &DirPath) -> bool {
    d.join_leaf(BOOTSTRAP_FILE).is_file()
}

/// An out_root of an out-of-tree build is marked by the generated
/// src-root file.
pub fn is_out_root(d: &DirPath) -> bool {
    d.join_leaf(SRC_ROOT_FILE).is_file()
}

pub fn find_src_root(d: &DirPath) -> Option<DirPath> {
    let mut cur = Some(d.clone());
    while let Some(c) = cur {
        if is_src_root(&c) {
            return Some(c);
        }
        cur = c.parent();
    }
    None
}

/// Scans upward for an out_root. The flag reports that the root was found
/// via the src marker, i.e., this is an in-tree build.
pub fn find_out_root(d: &DirPath) -> Option<(DirPath, bool)> {
    let mut cur = Some(d.clone());
    while let Some(c) = cur {
        if is_out_root(&c) {
            return Some((c, false));
        }
        if is_src_root(&c) {
            return Some((c, true));
        }
        cur = c.parent();
    }
    None
}

/// Creates (or reuses) a root scope and seeds its meta/operation tables.
pub fn create_root(cx: &mut Context, out_root: &DirPath) -> ScopeId {
    let id = cx.scopes.insert(out_root, true);
    let s = cx.scopes.get_mut(id);
    if s.meta_operations.is_empty() {
        s.meta_operations = vec![
            &PERFORM,
            &crate::core::config::CONFIGURE,
            &crate::core::config::DISFIGURE,
        ];
        s.operations = action::operations().to_vec();
    }
    id
}

/// Sources `src-root.build` from the out tree, if present. This may set
/// `src_root`.
pub fn bootstrap_out(cx: &mut Context, root: ScopeId) -> IResult<()> {
    let f = cx.scopes.get(root).out_path.join_leaf(SRC_ROOT_FILE);
    if f.is_file() {
        buildfile::source_once(cx, root, root, &f)?;
    }
    Ok(())
}

/// Sources `bootstrap.build` (project name, subprojects, amalgamation)
/// and the configured values from `config.build`. Returns whether the
/// bootstrap file existed.
pub fn bootstrap_src(cx: &mut Context, root: ScopeId) -> IResult<bool> {
    let src_root = match cx.scopes.get(root).src_path.clone() {
        Some(s) => s,
        None => return Ok(false),
    };

    let mut bootstrapped = false;
    let f = src_root.join_leaf(BOOTSTRAP_FILE);
    if f.is_file() {
        buildfile::source_once(cx, root, root, &f)?;
        bootstrapped = true;
    }

    let cf = cx.scopes.get(root).out_path.join_leaf(CONFIG_FILE);
    if cf.is_file() {
        buildfile::source_once(cx, root, root, &cf)?;
    }

    verify_subprojects(cx, root)?;
    create_bootstrap_outer(cx, root)?;

    Ok(bootstrapped)
}

fn verify_subprojects(cx: &Context, root: ScopeId) -> IResult<()> {
    if let Some(v) = cx.lookup(root, "subprojects", None)? {
        for n in v.to_names() {
            if !n.directory() {
                anyhow::bail!("expected directory in subprojects variable instead of `{}`", n);
            }
        }
    }
    Ok(())
}

/// If this project is part of an amalgamation, create and bootstrap the
/// outer root and link it as the strong amalgamation.
fn create_bootstrap_outer(cx: &mut Context, root: ScopeId) -> IResult<()> {
    let amalg = match cx.lookup(root, "amalgamation", None)? {
        Some(v) => match v.as_dir().cloned() {
            Some(d) => d,
            None => return Ok(()),
        },
        None => return Ok(()),
    };

    let out_root = cx.scopes.get(root).out_path.clone();
    let outer_out = out_root.join(amalg.as_path());
    if outer_out == out_root || cx.scopes.get(root).strong.is_some() {
        return Ok(());
    }

    if !is_out_root(&outer_out) && !is_src_root(&outer_out) {
        return Ok(());
    }

    let outer = create_root(cx, &outer_out);
    bootstrap_out(cx, outer)?;
    if cx.scopes.get(outer).src_path.is_none() {
        let src = cx
            .lookup_dir(outer, "src_root")?
            .or_else(|| is_src_root(&outer_out).then(|| outer_out.clone()));
        cx.scopes.get_mut(outer).src_path = src;
    }
    bootstrap_src(cx, outer)?;
    cx.scopes.get_mut(root).strong = Some(outer);
    Ok(())
}

/// Everything the driver needs to know about one buildspec target after
/// project setup.
pub struct TargetSetup {
    pub root: ScopeId,
    pub base: ScopeId,
    pub out_base: DirPath,
    pub src_base: DirPath,
    pub buildfile: PathBuf,
    /// Set when roots had to be guessed; used for better diagnostics.
    pub guessing: bool,
    pub bootstrapped: bool,
}

/// Derives out_base from the target name: an explicit directory wins,
/// otherwise a directory prefix of the value.
fn target_out_base(work: &DirPath, n: &Name) -> DirPath {
    let mut out = n.dir.clone();
    if out.is_empty() {
        let v = &n.value;
        if v.is_empty() || v == "." || v == ".." || n.ty == "dir" {
            out = DirPath::new(v.as_str());
        }
    }
    if !out.is_absolute() {
        out = work.join(out.as_path());
    }
    out
}

/// Computes out/src roots and bases for a buildspec target, creates and
/// bootstraps the root scope, and reconciles `src_root` between the
/// explicit, bootstrap-produced, and inferred values.
pub fn setup_target(
    cx: &mut Context,
    tname: &Name,
    explicit_src: Option<DirPath>,
) -> IResult<TargetSetup> {
    let work = cx.work.clone();
    let out_base = target_out_base(&work, tname);

    let mut guessing = false;
    let mut src_root: Option<DirPath> = None;
    let mut src_base = explicit_src;
    let out_root;

    if let Some(sb) = src_base.as_mut() {
        if !sb.is_absolute() {
            *sb = work.join(sb.as_path());
        }
        match find_src_root(sb) {
            Some(sr) => {
                // Calculate out_root from the src_base suffix.
                let leaf = sb.leaf(&sr)?;
                out_root = strip_suffix(&out_base, &leaf)?;
                src_root = Some(sr);
            }
            None => {
                // A simple project: src_root is src_base.
                src_root = Some(sb.clone());
                out_root = out_base.clone();
            }
        }
    } else {
        match find_out_root(&out_base) {
            Some((or, src)) => {
                if src {
                    src_root = Some(or.clone());
                }
                out_root = or;
            }
            None => {
                // Either a fresh out-of-tree build started from the src
                // tree, or an in-tree simple project.
                match find_src_root(&work) {
                    Some(sr) => {
                        let sb = work.clone();
                        if sr != sb {
                            let leaf = sb.leaf(&sr)?;
                            out_root = strip_suffix(&out_base, &leaf).map_err(|_| {
                                anyhow::anyhow!(
                                    "out_base directory suffix does not match src_base `{}`; \
                                     consider explicitly specifying src_base for `{}`",
                                    sb,
                                    tname
                                )
                            })?;
                        } else {
                            out_root = out_base.clone();
                        }
                        src_root = Some(sr);
                        src_base = Some(sb);
                    }
                    None => {
                        src_root = Some(out_base.clone());
                        src_base = Some(out_base.clone());
                        out_root = out_base.clone();
                    }
                }
                guessing = true;
            }
        }
    }

    let root = create_root(cx, &out_root);
    bootstrap_out(cx, root)?;

    // Reconcile src_root.
    let bootstrapped_src = cx.lookup_dir(root, "src_root")?;
    let src_root = match (bootstrapped_src, src_root) {
        (Some(b), Some(s)) => {
            if b != s {
                anyhow::bail!(BuildError::SrcRootMismatch {
                    bootstrapped: b.to_string(),
                    what: "specified",
                    other: s.to_string(),
                });
            }
            b
        }
        (Some(b), None) => b,
        (None, Some(s)) => {
            set_src_root_var(cx, root, &s)?;
            s
        }
        (None, None) => {
            if is_src_root(&out_root) {
                set_src_root_var(cx, root, &out_root)?;
                out_root.clone()
            } else {
                guessing = true;
                let sb = work.clone();
                let leaf = out_base.leaf(&out_root)?;
                let sr = strip_suffix(&sb, &leaf)?;
                set_src_root_var(cx, root, &sr)?;
                src_base = Some(sb);
                sr
            }
        }
    };

    cx.scopes.get_mut(root).src_path = Some(src_root.clone());

    let src_base = match src_base {
        Some(s) => s,
        None => src_root.join(out_base.leaf(&out_root)?),
    };

    let bootstrapped = bootstrap_src(cx, root)?;

    // out_root must be the innermost root for this target.
    if let Some(v) = cx.lookup(root, "subprojects", None)? {
        for n in v.to_names() {
            if n.directory() {
                let sub = out_root.join(n.dir.as_path());
                if out_base.sub(&sub) {
                    anyhow::bail!(
                        "`{}` is in a subproject of `{}`; \
                         explicitly specify src_base for this target",
                        tname,
                        out_root
                    );
                }
            }
        }
    }

    // The base scope.
    let base = cx.scopes.insert(&out_base, false);
    if cx.scopes.get(base).src_path.is_none() {
        cx.scopes.get_mut(base).src_path = Some(src_base.clone());
    }

    let buildfile = match &cx.options.buildfile {
        Some(p) => {
            if p.is_absolute() {
                p.clone()
            } else {
                work.join_leaf(p)
            }
        }
        None => src_base.join_leaf("buildfile"),
    };

    Ok(TargetSetup {
        root,
        base,
        out_base,
        src_base,
        buildfile,
        guessing,
        bootstrapped,
    })
}

fn set_src_root_var(cx: &mut Context, root: ScopeId, src: &DirPath) -> IResult<()> {
    let var = cx.var_pool.insert(
        "src_root",
        Some(crate::core::variable::ValueType::Dir),
        crate::core::variable::Visibility::Normal,
        false,
    )?;
    cx.scopes
        .assign(root, &var, Some(crate::core::variable::Value::Dir(src.clone())));
    Ok(())
}

/// Removes a relative suffix from a directory: the inverse of join.
fn strip_suffix(d: &DirPath, suffix: &Path) -> IResult<DirPath> {
    let n = suffix.components().count();
    let mut cur = d.clone();
    let mut tail = Vec::new();
    for _ in 0..n {
        let leaf = cur
            .leaf(&cur.parent().unwrap_or_else(DirPath::empty))
            .unwrap_or_default();
        tail.push(leaf);
        cur = cur
            .parent()
            .ok_or_else(|| BuildError::InvalidPath {
                path: d.to_string(),
            })?;
    }
    tail.reverse();
    let got: PathBuf = tail.iter().collect();
    if got != suffix {
        anyhow::bail!(BuildError::InvalidPath {
            path: d.to_string(),
        });
    }
    Ok(cur)
}

/// Turns a buildfile name into a prerequisite: resolve the target type,
/// anchor a relative directory at the scope's out directory.
pub fn name_to_prerequisite(cx: &Context, base: ScopeId, n: &Name) -> IResult<Prerequisite> {
    let out_base = cx.scopes.get(base).out_path.clone();

    let ty = if !n.ty.is_empty() {
        cx.find_target_type(base, &n.ty)
            .ok_or_else(|| anyhow::anyhow!("unknown target type `{}`", n.ty))?
    } else if n.directory() || n.empty() {
        // `./` and friends identify the directory itself.
        DIR_TYPE.clone()
    } else {
        FILE_TYPE.clone()
    };

    let dir = if n.dir.is_empty() {
        out_base
    } else if n.dir.is_absolute() {
        n.dir.clone()
    } else {
        out_base.try_join(n.dir.as_path())?
    };

    Ok(Prerequisite {
        proj: n.proj.clone(),
        ty,
        dir,
        out: DirPath::empty(),
        name: n.value.clone(),
        ext: None,
        scope: base,
    })
}

// The perform meta-operation.

/// The normal load callback: sources the buildfile and aliases `dir{./}`
/// to the default target, so invoking the build with no target name
/// works.
pub fn load_buildfile(
    cx: &mut Context,
    root: ScopeId,
    base: ScopeId,
    buildfile: &Path,
) -> IResult<()> {
    if buildfile.is_file() {
        buildfile::source_once(cx, root, base, buildfile)?;
    }

    let out_base = cx.scopes.get(base).out_path.clone();
    let dir_t = cx.targets.insert(
        &DIR_TYPE,
        out_base,
        DirPath::empty(),
        String::new(),
        None,
        true,
    );

    if let Some(first) = cx.scopes.get(base).default_target.clone() {
        let mut prereqs = dir_t.prerequisites.lock().unwrap();
        if prereqs.is_empty() {
            prereqs.push(name_to_prerequisite(cx, base, &first)?);
        }
    }

    Ok(())
}

/// The normal match callback: resolve the target key to a target and run
/// the match phase on it.
pub fn perform_match(
    cx: &Context,
    a: Action,
    _root: ScopeId,
    base: ScopeId,
    tname: &Name,
) -> IResult<ActionTarget> {
    let p = name_to_prerequisite(cx, base, tname)?;
    let t = cx
        .targets
        .insert(&p.ty, p.dir, p.out, p.name, p.ext, false);

    match algorithm::match_target(cx, a, &t) {
        Ok(()) => Ok(ActionTarget::Target(t)),
        Err(e) => {
            if !error::reported(&e) {
                cx.report(&e);
            }
            Err(Failed.into())
        }
    }
}

/// The normal execute callback: drive the scheduler over the batch and
/// report per-target outcomes.
pub fn perform_execute(cx: &Context, a: Action, ts: &[ActionTarget]) -> IResult<()> {
    if cx.options.match_only {
        return Ok(());
    }

    let targets: Vec<Arc<Target>> = ts.iter().filter_map(|t| t.as_target().cloned()).collect();

    let ordered: Vec<Arc<Target>> = if action::operation(a.op).mode == ExecMode::Last {
        targets.iter().rev().cloned().collect()
    } else {
        targets.clone()
    };

    let run = cx.install(|| algorithm::execute_all(cx, a, &ordered));

    let mut failed = run.is_err();
    for t in targets.iter() {
        let s = t.state();
        if cx.options.structured_result {
            let mut shell = cx.shell();
            drop(writeln!(
                shell.out(),
                "{} {} {} {}",
                s.name(),
                action::meta_name(a.meta),
                action::operation(a.op).name,
                t
            ));
        } else if s == TargetState::Unchanged {
            let mut shell = cx.shell();
            drop(shell.info(format!(
                "target `{}` {}",
                t,
                action::operation(a.op).name_done
            )));
        }
        if s == TargetState::Failed {
            failed = true;
        }
    }

    if failed {
        anyhow::bail!(Failed);
    }
    Ok(())
}

pub static PERFORM: MetaOperationInfo = MetaOperationInfo {
    id: PERFORM_ID,
    name: "perform",
    operation_pre: Some(perform_operation_pre),
    load: load_buildfile,
    match_: perform_match,
    execute: perform_execute,
    meta_operation_post: None,
};

fn perform_operation_pre(o: u8) -> u8 {
    if o == DEFAULT_ID {
        UPDATE_ID
    } else {
        o
    }
}
