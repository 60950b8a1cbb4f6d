use crate::core::action::{Action, CLEAN_ID, UPDATE_ID};
use crate::core::rule::{Recipe, Rule};
use crate::core::scope::ScopeId;
use crate::core::target::{Target, TargetState, TargetType, FILE_TYPE, OBJ_TYPE};
use crate::core::{algorithm, BuildError, Context, DepDb};
use crate::utils::paths;
use crate::utils::{hash_u64, to_hex, IResult};
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;

lazy_static::lazy_static! {
    static ref C_TYPE: Arc<TargetType> = fixed_file_type("c", || "c");
    static ref CXX_TYPE: Arc<TargetType> = fixed_file_type("cxx", || "cxx");
    static ref H_TYPE: Arc<TargetType> = fixed_file_type("h", || "h");
    static ref HXX_TYPE: Arc<TargetType> = fixed_file_type("hxx", || "hxx");

    static ref COMPILE_RULE: Arc<dyn Rule> = Arc::new(CompileRule);
    static ref LINK_RULE: Arc<dyn Rule> = Arc::new(LinkRule);
}

fn fixed_file_type(name: &str, ext: fn() -> &'static str) -> Arc<TargetType> {
    let mut t = TargetType::derive(name, &FILE_TYPE);
    Arc::get_mut(&mut t).unwrap().fixed_extension = Some(ext);
    t
}

/// `using cc`: registers the source target types, the compile/link rules
/// and the `config.cc.*` defaults on the project root.
pub fn load(cx: &mut Context, root: ScopeId) -> IResult<()> {
    {
        let s = cx.scopes.get_mut(root);
        for tt in [&*C_TYPE, &*CXX_TYPE, &*H_TYPE, &*HXX_TYPE] {
            s.target_types.insert(tt.name.clone(), tt.clone());
        }
        for op in [UPDATE_ID, CLEAN_ID] {
            s.rules.insert(op, "obj", "cc.compile", COMPILE_RULE.clone());
            s.rules.insert(op, "exe", "cc.link", LINK_RULE.clone());
        }
    }

    for (name, ty) in [
        ("config.cc.path", crate::core::ValueType::String),
        ("config.cc.coptions", crate::core::ValueType::Strings),
        ("config.cc.loptions", crate::core::ValueType::Strings),
    ] {
        cx.var_pool.insert(
            name,
            Some(ty),
            crate::core::Visibility::Normal,
            true,
        )?;
    }
    Ok(())
}

/// Index of the source prerequisite, stashed by match for apply.
struct SourceMatch {
    source: usize,
}

fn find_source(t: &Target) -> Option<usize> {
    t.prerequisites
        .lock()
        .unwrap()
        .iter()
        .position(|p| p.ty.is_a("c") || p.ty.is_a("cxx"))
}

fn compiler(cx: &Context, scope: ScopeId, cxx: bool) -> IResult<String> {
    Ok(match cx.lookup(scope, "config.cc.path", None)? {
        Some(v) => v.to_string(),
        None => {
            if cxx {
                "c++".to_string()
            } else {
                "cc".to_string()
            }
        }
    })
}

fn options(cx: &Context, scope: ScopeId, name: &str) -> IResult<Vec<String>> {
    Ok(match cx.lookup(scope, name, None)? {
        Some(v) => v.to_names().iter().map(|n| n.to_string()).collect(),
        None => Vec::new(),
    })
}

fn host_triplet() -> String {
    format!("{}-{}", std::env::consts::ARCH, std::env::consts::OS)
}

/// Path + mtime of the compiler binary, when it can be stat'ed directly.
fn compiler_checksum(path: &str) -> String {
    let mt = paths::mtime(path);
    to_hex(hash_u64(&(path, mt.unix_seconds(), mt.nanoseconds())))
}

fn depdb_path(t: &Target) -> PathBuf {
    let mut p = t.derive_path().into_os_string();
    p.push(".d");
    PathBuf::from(p)
}

/// Fills the dependency database header shared by compile and link.
/// Returns true if everything matched.
fn depdb_check(
    db: &mut DepDb,
    rule: &str,
    compiler: &str,
    opts: &[String],
    inputs: &[PathBuf],
) -> bool {
    let mut fresh = db.expect(&format!("rule: {} 1", rule));
    fresh &= db.expect(&format!("compiler: {} {}", compiler, compiler_checksum(compiler)));
    fresh &= db.expect(&format!("target: {}", host_triplet()));
    fresh &= db.expect(&format!("options: {}", to_hex(hash_u64(&opts))));
    fresh &= db.expect(&format!(
        "inputs: {}",
        to_hex(hash_u64(&inputs.iter().map(|p| p.display().to_string()).collect::<Vec<_>>()))
    ));
    fresh
}

fn run_tool(cx: &Context, program: &str, args: &[String]) -> IResult<()> {
    cx.shell()
        .trace(2, format!("{} {}", program, args.join(" ")))?;

    let out = Command::new(program)
        .args(args)
        .output()
        .map_err(|e| anyhow::anyhow!("unable to execute `{}`: {}", program, e))?;

    if !out.status.success() {
        let mut shell = cx.shell();
        let stderr = String::from_utf8_lossy(&out.stderr);
        for line in stderr.lines() {
            drop(shell.trace(0, line));
        }
        drop(shell);
        anyhow::bail!(BuildError::ProcessError {
            program: program.to_string(),
            status: out.status.to_string(),
        });
    }
    Ok(())
}

/// Compiles one `c{}`/`cxx{}` source into an `obj{}`.
pub struct CompileRule;

impl Rule for CompileRule {
    fn match_rule(&self, _cx: &Context, _a: Action, t: &Arc<Target>, _hint: &str) -> IResult<bool> {
        match find_source(t) {
            Some(i) => {
                *t.extra.lock().unwrap() = Some(Box::new(SourceMatch { source: i }));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn apply(&self, cx: &Context, a: Action, t: &Arc<Target>) -> IResult<Recipe> {
        algorithm::match_prerequisites(cx, a, t)?;
        t.derive_path();
        if a.op == CLEAN_ID {
            Ok(Recipe::Concrete(Arc::new(compile_clean)))
        } else {
            Ok(Recipe::Concrete(Arc::new(compile_update)))
        }
    }
}

fn source_target(t: &Arc<Target>) -> IResult<Arc<Target>> {
    let i = {
        let extra = t.extra.lock().unwrap();
        extra
            .as_ref()
            .and_then(|b| b.downcast_ref::<SourceMatch>())
            .map(|m| m.source)
            .unwrap_or(0)
    };
    let pts = t.slot.data.lock().unwrap().prerequisite_targets.clone();
    pts.get(i)
        .or_else(|| pts.first())
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("no source prerequisite for `{}`", t))
}

fn compile_update(cx: &Context, a: Action, t: &Arc<Target>) -> IResult<TargetState> {
    let (state, mut update) = algorithm::execute_prerequisites_mtime(cx, a, t)?;

    let src = source_target(t)?;
    let src_path = src.derive_path();
    let obj_path = t.derive_path();
    let scope = cx.scopes.find(&t.dir);

    let cxx = src.ty.is_a("cxx");
    let program = compiler(cx, scope, cxx)?;
    let copts = options(cx, scope, "config.cc.coptions")?;

    let mut db = DepDb::open(depdb_path(t));
    let inputs = vec![src_path.clone()];
    if !depdb_check(&mut db, "cc.compile", &program, &copts, &inputs) {
        update = true;
    }
    if !db.verify_mtime(&obj_path) {
        update = true;
    }

    if !update {
        return Ok(state);
    }

    // The database goes to disk before the compiler runs; an interrupted
    // build leaves the object older than the database.
    db.close()?;

    paths::create_dir_all(t.dir.as_path())?;
    cx.shell().status("Compiling", format!("{}", t))?;

    let mut args = copts;
    args.push("-c".to_string());
    args.push(src_path.display().to_string());
    args.push("-o".to_string());
    args.push(obj_path.display().to_string());
    run_tool(cx, &program, &args)?;

    t.set_mtime(paths::mtime(&obj_path));
    Ok(TargetState::Changed)
}

fn compile_clean(cx: &Context, a: Action, t: &Arc<Target>) -> IResult<TargetState> {
    let obj_path = t.derive_path();
    let mut removed = paths::rmfile(&obj_path)?;
    removed = paths::rmfile(depdb_path(t))? || removed;

    let state = algorithm::reverse_execute_prerequisites(cx, a, t)?;
    Ok(state.merge(if removed {
        TargetState::Changed
    } else {
        TargetState::Unchanged
    }))
}

/// Links an `exe{}` from `obj{}`s, synthesizing one per source
/// prerequisite.
pub struct LinkRule;

impl Rule for LinkRule {
    fn match_rule(&self, _cx: &Context, _a: Action, t: &Arc<Target>, _hint: &str) -> IResult<bool> {
        let has_input = t
            .prerequisites
            .lock()
            .unwrap()
            .iter()
            .any(|p| p.ty.is_a("c") || p.ty.is_a("cxx") || p.ty.is_a("obj"));
        Ok(has_input)
    }

    fn apply(&self, cx: &Context, a: Action, t: &Arc<Target>) -> IResult<Recipe> {
        let prereqs = t.prerequisites.lock().unwrap().clone();

        let mut pts = Vec::with_capacity(prereqs.len());
        for p in prereqs.iter() {
            if p.ty.is_a("c") || p.ty.is_a("cxx") {
                // Synthesize the obj{} for this source.
                let obj = cx.targets.insert(
                    &OBJ_TYPE,
                    p.dir.clone(),
                    p.out.clone(),
                    p.name.clone(),
                    None,
                    true,
                );
                {
                    let mut ops = obj.prerequisites.lock().unwrap();
                    if ops.is_empty() {
                        ops.push(p.clone());
                    }
                }
                algorithm::match_target(cx, a, &obj)?;
                pts.push(obj);
            } else {
                let pt = algorithm::search(cx, p)?;
                algorithm::match_target(cx, a, &pt)?;
                pts.push(pt);
            }
        }

        t.slot
            .data
            .lock()
            .unwrap()
            .prerequisite_targets
            .extend(pts);
        t.derive_path();

        if a.op == CLEAN_ID {
            Ok(Recipe::Concrete(Arc::new(link_clean)))
        } else {
            Ok(Recipe::Concrete(Arc::new(link_update)))
        }
    }
}

fn link_update(cx: &Context, a: Action, t: &Arc<Target>) -> IResult<TargetState> {
    let (state, mut update) = algorithm::execute_prerequisites_mtime(cx, a, t)?;

    let exe_path = t.derive_path();
    let scope = cx.scopes.find(&t.dir);

    let pts = t.slot.data.lock().unwrap().prerequisite_targets.clone();
    let objs: Vec<PathBuf> = pts
        .iter()
        .filter(|p| p.ty.is_a("obj"))
        .map(|p| p.derive_path())
        .collect();
    if objs.is_empty() {
        anyhow::bail!("no object files to link `{}`", t);
    }

    let cxx = pts.iter().any(|p| {
        p.slot
            .data
            .lock()
            .unwrap()
            .prerequisite_targets
            .iter()
            .any(|s| s.ty.is_a("cxx"))
    });
    let program = compiler(cx, scope, cxx)?;
    let lopts = options(cx, scope, "config.cc.loptions")?;

    let mut db = DepDb::open(depdb_path(t));
    if !depdb_check(&mut db, "cc.link", &program, &lopts, &objs) {
        update = true;
    }
    if !db.verify_mtime(&exe_path) {
        update = true;
    }

    if !update {
        return Ok(state);
    }

    db.close()?;

    paths::create_dir_all(t.dir.as_path())?;
    cx.shell().status("Linking", format!("{}", t))?;

    let mut args: Vec<String> = objs.iter().map(|o| o.display().to_string()).collect();
    args.push("-o".to_string());
    args.push(exe_path.display().to_string());
    args.extend(lopts);
    run_tool(cx, &program, &args)?;

    t.set_mtime(paths::mtime(&exe_path));
    Ok(TargetState::Changed)
}

fn link_clean(cx: &Context, a: Action, t: &Arc<Target>) -> IResult<TargetState> {
    let exe_path = t.derive_path();
    let mut removed = paths::rmfile(&exe_path)?;
    removed = paths::rmfile(depdb_path(t))? || removed;

    let state = algorithm::reverse_execute_prerequisites(cx, a, t)?;
    Ok(state.merge(if removed {
        TargetState::Changed
    } else {
        TargetState::Unchanged
    }))
}
