use crate::core::action::{
    Action, ActionTarget, MetaOperationInfo, CONFIGURE_ID, DEFAULT_ID, DISFIGURE_ID,
};
use crate::core::project::{
    self, bootstrap_out, bootstrap_src, create_root, CONFIG_FILE, SRC_ROOT_FILE,
};
use crate::core::scope::ScopeId;
use crate::core::{BuildError, Context, Failed, Name};
use crate::utils::paths::{self, DirPath, RmdirStatus};
use crate::utils::IResult;
use std::path::Path;

// configure

fn save_src_root(out_root: &DirPath, src_root: &DirPath) -> IResult<()> {
    let f = out_root.join_leaf(SRC_ROOT_FILE);
    let content = format!(
        "# Created automatically by the configure meta-operation.\n\
         #\n\
         src_root = {}\n",
        src_root
    );
    paths::write(f, content)
}

/// Saves all variables in the `config.*` namespace visible on the
/// project's root scope: values set by buildfiles plus command-line
/// overrides, which are materialized here so the next run sees them
/// without the override.
fn save_config(cx: &Context, root: ScopeId) -> IResult<()> {
    let scope = cx.scopes.get(root);
    let f = scope.out_path.join_leaf(CONFIG_FILE);

    let mut names: Vec<String> = scope
        .vars
        .find_namespace("config")
        .into_iter()
        .map(|(n, _)| n.to_string())
        .collect();
    for n in cx.var_pool.override_names() {
        if n.starts_with("config.") && !names.contains(&n) {
            names.push(n);
        }
    }
    names.sort();

    let mut content = String::from(
        "# Created automatically by the configure meta-operation, but\n\
         # feel free to edit.\n\
         #\n",
    );
    for name in names {
        let var = match cx.var_pool.find(&name) {
            Some(v) => v,
            None => continue,
        };
        match cx.scopes.find_value(&cx.var_pool, root, &var, None)? {
            Some(Some(v)) => content.push_str(&format!("{} = {}\n", name, v)),
            Some(None) => content.push_str(&format!("{} = [null]\n", name)),
            None => {}
        }
    }

    paths::write(f, content)
}

fn configure_project(cx: &Context, a: Action, root: ScopeId) -> IResult<()> {
    let scope = cx.scopes.get(root);
    let out_root = scope.out_path.clone();
    let src_root = scope.src_path.clone().unwrap_or_else(|| out_root.clone());

    if out_root != src_root {
        paths::create_dir_all(out_root.as_path())?;
        paths::create_dir_all(out_root.join_leaf("build"))?;
        paths::create_dir_all(out_root.join_leaf("build/bootstrap"))?;
    } else {
        paths::create_dir_all(out_root.join_leaf("build"))?;
    }

    // An operation-specific configure would go here; `default` means
    // configure everything.
    if a.op == DEFAULT_ID {
        cx.shell()
            .status("Configuring", format!("{}", out_root))?;

        if out_root != src_root {
            save_src_root(&out_root, &src_root)?;
        }
        save_config(cx, root)?;
    }

    // Configure subprojects that have been loaded.
    if let Some(v) = cx.lookup(root, "subprojects", None)? {
        for n in v.to_names() {
            if !n.directory() {
                continue;
            }
            let out_nroot = out_root.join(n.dir.as_path());
            let nroot = cx.scopes.find(&out_nroot);
            if cx.scopes.get(nroot).out_path != out_nroot {
                continue; // This subproject was not loaded.
            }
            configure_project(cx, a, nroot)?;
        }
    }

    Ok(())
}

fn configure_execute(cx: &Context, a: Action, ts: &[ActionTarget]) -> IResult<()> {
    for at in ts {
        let root = match at {
            ActionTarget::Target(t) => {
                let base = cx.scopes.find(&t.dir);
                match cx.scopes.root_of(base) {
                    Some(r) => r,
                    None => {
                        let e = anyhow::Error::new(BuildError::OutOfProject {
                            target: t.to_string(),
                        });
                        cx.report(&e);
                        anyhow::bail!(Failed);
                    }
                }
            }
            ActionTarget::Scope(s) => *s,
        };
        configure_project(cx, a, root)?;
    }
    Ok(())
}

fn keep_operation(o: u8) -> u8 {
    // Don't translate default to update: unspecified means configure
    // (or disfigure) everything.
    o
}

pub static CONFIGURE: MetaOperationInfo = MetaOperationInfo {
    id: CONFIGURE_ID,
    name: "configure",
    operation_pre: Some(keep_operation),
    load: project::load_buildfile,
    match_: project::perform_match,
    execute: configure_execute,
    meta_operation_post: None,
};

// disfigure

/// Disfigure does not load buildfiles; it only bootstraps known
/// subprojects so they can be disfigured too.
fn disfigure_load(
    cx: &mut Context,
    root: ScopeId,
    _base: ScopeId,
    _buildfile: &Path,
) -> IResult<()> {
    bootstrap_subprojects(cx, root)
}

fn bootstrap_subprojects(cx: &mut Context, root: ScopeId) -> IResult<()> {
    let out_root = cx.scopes.get(root).out_path.clone();
    let src_root = match cx.scopes.get(root).src_path.clone() {
        Some(s) => s,
        None => return Ok(()),
    };

    let subs = match cx.lookup(root, "subprojects", None)? {
        Some(v) => v.to_names(),
        None => return Ok(()),
    };

    for n in subs {
        if !n.directory() {
            continue;
        }
        let out_nroot = out_root.join(n.dir.as_path());
        let src_nroot = src_root.join(n.dir.as_path());

        let nroot = create_root(cx, &out_nroot);
        bootstrap_out(cx, nroot)?;

        // Check whether the bootstrap process changed src_root.
        if let Some(p) = cx.lookup_dir(nroot, "src_root")? {
            if p != src_nroot {
                anyhow::bail!(BuildError::SrcRootMismatch {
                    bootstrapped: p.to_string(),
                    what: "subproject",
                    other: src_nroot.to_string(),
                });
            }
        }
        cx.scopes.get_mut(nroot).src_path = Some(src_nroot);

        bootstrap_src(cx, nroot)?;
        bootstrap_subprojects(cx, nroot)?;
    }

    Ok(())
}

fn disfigure_match(
    _cx: &Context,
    _a: Action,
    root: ScopeId,
    _base: ScopeId,
    _tname: &Name,
) -> IResult<ActionTarget> {
    Ok(ActionTarget::Scope(root))
}

fn disfigure_project(cx: &Context, a: Action, root: ScopeId) -> IResult<bool> {
    let mut removed = false;

    let scope = cx.scopes.get(root);
    let out_root = scope.out_path.clone();
    let src_root = scope.src_path.clone().unwrap_or_else(|| out_root.clone());

    // Subprojects first; we do it for all known ones since buildfiles are
    // not loaded during disfigure.
    if let Some(v) = cx.lookup(root, "subprojects", None)? {
        for n in v.to_names() {
            if !n.directory() {
                continue;
            }
            let out_nroot = out_root.join(n.dir.as_path());
            let nroot = cx.scopes.find(&out_nroot);
            if cx.scopes.get(nroot).out_path != out_nroot {
                continue;
            }
            removed = disfigure_project(cx, a, nroot)? || removed;
        }
    }

    if a.op == DEFAULT_ID {
        removed = paths::rmfile(out_root.join_leaf(CONFIG_FILE))? || removed;

        if out_root != src_root {
            removed = paths::rmfile(out_root.join_leaf(SRC_ROOT_FILE))? || removed;

            for d in ["build/bootstrap", "build"] {
                if let RmdirStatus::Success = paths::rmdir(out_root.join_leaf(d))? {
                    removed = true;
                }
            }

            match paths::rmdir(out_root.as_path())? {
                RmdirStatus::Success => removed = true,
                RmdirStatus::NotEmpty => {
                    cx.shell().warn(format!(
                        "directory `{}` is not empty, not removing",
                        out_root
                    ))?;
                }
                RmdirStatus::NotExist => {}
            }
        } else {
            // In-tree: leave build/ if it has other content.
            if let RmdirStatus::Success = paths::rmdir(out_root.join_leaf("build"))? {
                removed = true;
            }
        }
    }

    Ok(removed)
}

fn disfigure_execute(cx: &Context, a: Action, ts: &[ActionTarget]) -> IResult<()> {
    for at in ts {
        if let ActionTarget::Scope(root) = at {
            if !disfigure_project(cx, a, *root)? {
                let out = cx.scopes.get(*root).out_path.clone();
                cx.shell()
                    .info(format!("`{}` is already disfigured", out))?;
            }
        }
    }
    Ok(())
}

/// Anything loaded under the previous configuration is now invalid.
fn disfigure_post(cx: &mut Context) -> IResult<()> {
    cx.reset()
}

pub static DISFIGURE: MetaOperationInfo = MetaOperationInfo {
    id: DISFIGURE_ID,
    name: "disfigure",
    operation_pre: Some(keep_operation),
    load: disfigure_load,
    match_: disfigure_match,
    execute: disfigure_execute,
    meta_operation_post: Some(disfigure_post),
};
