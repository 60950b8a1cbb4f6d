use anvil::core::action::{Action, PERFORM_ID, UPDATE_ID};
use anvil::core::rule::{Recipe, Rule};
use anvil::core::target::FILE_TYPE;
use anvil::core::variable::OverrideKind;
use anvil::core::{algorithm, to_name, Context, Options, Target, TargetState, Value, Visibility};
use anvil::utils::paths::DirPath;
use anvil::utils::{IResult, Shell};
use std::sync::Arc;

fn quiet_context() -> Context {
    Context::with_shell(
        Options {
            jobs: 2,
            ..Options::default()
        },
        Shell::from_write(Vec::new()),
    )
    .unwrap()
}

fn names_value(words: &[&str]) -> Value {
    Value::Names(words.iter().map(|w| to_name(w)).collect())
}

#[test]
fn override_precedence() {
    let mut cx = quiet_context();
    let root = cx.scopes.insert(&DirPath::new("/proj"), true);

    let var = cx
        .var_pool
        .insert("x", None, Visibility::Normal, true)
        .unwrap();
    cx.scopes.assign(root, &var, Some(names_value(&["v"])));

    cx.var_pool.insert_override(
        "x",
        OverrideKind::Prefix,
        Some(names_value(&["p"])),
        Visibility::Normal,
        None,
    );
    let v = cx.lookup(root, "x", None).unwrap().unwrap();
    assert_eq!(v.to_string(), "p v");

    // An assignment override restricted to a different project must not
    // apply.
    cx.var_pool.insert_override(
        "x",
        OverrideKind::Assign,
        Some(names_value(&["o"])),
        Visibility::Project,
        Some(DirPath::new("/other")),
    );
    let v = cx.lookup(root, "x", None).unwrap().unwrap();
    assert_eq!(v.to_string(), "p v");
}

struct YesRule;

impl Rule for YesRule {
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
fn ambiguous_match_names_both_rules() {
    let mut cx = quiet_context();
    let root = cx.scopes.insert(&DirPath::new("/amb"), true);
    {
        let s = cx.scopes.get_mut(root);
        s.rules
            .insert(UPDATE_ID, "file", "test.rule1", Arc::new(YesRule));
        s.rules
            .insert(UPDATE_ID, "file", "test.rule2", Arc::new(YesRule));
    }

    let t = cx.targets.insert(
        &FILE_TYPE,
        DirPath::new("/amb"),
        DirPath::empty(),
        "x".into(),
        None,
        false,
    );

    let a = Action::new(PERFORM_ID, UPDATE_ID);
    let err = algorithm::match_target(&cx, a, &t).unwrap_err();
    let msg = format!("{:#}", err);
    assert!(msg.contains("test.rule1"), "{}", msg);
    assert!(msg.contains("test.rule2"), "{}", msg);
    // No recipe ran; the target is failed for this action.
    assert_eq!(t.state(), TargetState::Failed);
}

struct TouchRule;

impl Rule for TouchRule {
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
        Ok(Recipe::Concrete(Arc::new(|_cx, _a, t: &Arc<Target>| {
            if t.name == "bad" {
                anyhow::bail!("refusing to build `{}`", t.name);
            }
            Ok(TargetState::Changed)
        })))
    }
}

#[test]
fn partial_failure_keeps_independent_chain() {
    let mut cx = quiet_context();
    let root = cx.scopes.insert(&DirPath::new("/pf"), true);
    cx.scopes
        .get_mut(root)
        .rules
        .insert(UPDATE_ID, "file", "test.touch", Arc::new(TouchRule));

    let mk = |cx: &Context, name: &str| {
        cx.targets.insert(
            &FILE_TYPE,
            DirPath::new("/pf"),
            DirPath::empty(),
            name.into(),
            None,
            false,
        )
    };
    let good = mk(&cx, "good");
    let bad = mk(&cx, "bad");

    let a = Action::new(PERFORM_ID, UPDATE_ID);
    algorithm::match_target(&cx, a, &good).unwrap();
    algorithm::match_target(&cx, a, &bad).unwrap();

    let ts = vec![good.clone(), bad.clone()];
    let r = cx.install(|| algorithm::execute_all(&cx, a, &ts));
    assert!(r.is_err());

    // The succeeding chain completed; the failing one is terminal.
    assert_eq!(good.state(), TargetState::Changed);
    assert_eq!(bad.state(), TargetState::Failed);

    // Terminal states are stable: re-execution takes the fast path.
    let again = cx.install(|| algorithm::execute(&cx, a, &good)).unwrap();
    assert_eq!(again, TargetState::Changed);
    assert!(cx
        .install(|| algorithm::execute(&cx, a, &bad))
        .is_err());
}

// A rule that copies its single prerequisite, in the shape of a real
// transformation rule: mtime comparison decides whether to rerun.
struct CopyRule;

impl Rule for CopyRule {
    fn match_rule(
        &self,
        _cx: &Context,
        _a: Action,
        t: &Arc<Target>,
        _hint: &str,
    ) -> IResult<bool> {
        Ok(!t.prerequisites.lock().unwrap().is_empty())
    }

    fn apply(&self, cx: &Context, a: Action, t: &Arc<Target>) -> IResult<Recipe> {
        algorithm::match_prerequisites(cx, a, t)?;
        t.derive_path();
        Ok(Recipe::Concrete(Arc::new(copy_recipe)))
    }
}

fn copy_recipe(cx: &Context, a: Action, t: &Arc<Target>) -> IResult<TargetState> {
    let (_, update) = algorithm::execute_prerequisites_mtime(cx, a, t)?;
    if !update {
        return Ok(TargetState::Unchanged);
    }
    let src = t.slot.data.lock().unwrap().prerequisite_targets[0].clone();
    std::fs::copy(src.derive_path(), t.derive_path())?;
    t.set_mtime(anvil::utils::paths::mtime(t.derive_path()));
    Ok(TargetState::Changed)
}

fn copy_chain_context(dir: &DirPath) -> (Context, Arc<Target>) {
    let mut cx = quiet_context();
    let root = cx.scopes.insert(dir, true);
    cx.scopes.get_mut(root).src_path = Some(dir.clone());
    cx.scopes
        .get_mut(root)
        .rules
        .insert(UPDATE_ID, "file", "test.copy", Arc::new(CopyRule));

    let out = cx.targets.insert(
        &FILE_TYPE,
        dir.clone(),
        DirPath::empty(),
        "out.txt".into(),
        None,
        false,
    );
    out.prerequisites
        .lock()
        .unwrap()
        .push(anvil::core::Prerequisite {
            proj: None,
            ty: FILE_TYPE.clone(),
            dir: dir.clone(),
            out: DirPath::empty(),
            name: "in.txt".into(),
            ext: None,
            scope: root,
        });
    (cx, out)
}

#[test]
fn minimal_copy_chain() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = DirPath::new(tmp.path());
    std::fs::write(tmp.path().join("in.txt"), "payload").unwrap();

    let a = Action::new(PERFORM_ID, UPDATE_ID);

    // First run: the output does not exist, so the chain is `changed`.
    let (cx, out) = copy_chain_context(&dir);
    algorithm::match_target(&cx, a, &out).unwrap();
    let s = cx.install(|| algorithm::execute(&cx, a, &out)).unwrap();
    assert_eq!(s, TargetState::Changed);
    assert_eq!(
        std::fs::read_to_string(tmp.path().join("out.txt")).unwrap(),
        "payload"
    );

    // Second run (fresh engine state): nothing changed.
    let (cx, out) = copy_chain_context(&dir);
    algorithm::match_target(&cx, a, &out).unwrap();
    let s = cx.install(|| algorithm::execute(&cx, a, &out)).unwrap();
    assert_eq!(s, TargetState::Unchanged);

    // Touch the input into the future: the output is stale again.
    let future = filetime::FileTime::from_unix_time(
        filetime::FileTime::now().unix_seconds() + 60,
        0,
    );
    filetime::set_file_mtime(tmp.path().join("in.txt"), future).unwrap();

    let (cx, out) = copy_chain_context(&dir);
    algorithm::match_target(&cx, a, &out).unwrap();
    let s = cx.install(|| algorithm::execute(&cx, a, &out)).unwrap();
    assert_eq!(s, TargetState::Changed);
}

#[test]
fn type_pattern_values() {
    use anvil::core::variable::ValueExtra;

    let mut cx = quiet_context();
    let root = cx.scopes.insert(&DirPath::new("/tp"), true);
    let var = cx
        .var_pool
        .insert("opt", None, Visibility::Normal, true)
        .unwrap();

    // The stem in the scope, and a pattern-appended tail.
    cx.scopes.assign(root, &var, Some(names_value(&["a"])));
    cx.scopes.get_mut(root).target_vars.assign(
        "file",
        "*",
        &var,
        ValueExtra::Append,
        Some(names_value(&["b"])),
    );

    let t = cx.targets.insert(
        &FILE_TYPE,
        DirPath::new("/tp"),
        DirPath::empty(),
        "x".into(),
        None,
        false,
    );

    let v = cx.lookup(root, "opt", Some(&*t)).unwrap().unwrap();
    assert_eq!(v.to_string(), "a b");

    // A target-specific value beats the type/pattern one.
    t.vars.lock().unwrap().assign(&var, Some(names_value(&["t"])));
    let v = cx.lookup(root, "opt", Some(&*t)).unwrap().unwrap();
    assert_eq!(v.to_string(), "t");
}

#[test]
fn buildfile_basics() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = DirPath::new(tmp.path());

    let mut cx = quiet_context();
    let root = cx.scopes.insert(&dir, true);
    cx.scopes.get_mut(root).src_path = Some(dir.clone());

    let src = "\
cfg = debug
if ($cfg == debug)
{
  flags = -g
}
else
{
  flags = -O2
}
for f: a b c
{
  list += $f
}
n = [uint64] 42
file{out}: file{in}
";
    anvil::buildfile::parse_string(&mut cx, root, root, src, "<test>").unwrap();

    let get = |name: &str| cx.lookup(root, name, None).unwrap().unwrap().to_string();
    assert_eq!(get("flags"), "-g");
    assert_eq!(get("list"), "a b c");
    assert_eq!(get("n"), "42");

    // The first explicit target is the scope's default.
    let d = cx.scopes.get(root).default_target.clone().unwrap();
    assert_eq!(d.ty, "file");
    assert_eq!(d.value, "out");

    let t = cx
        .targets
        .find(&FILE_TYPE, &dir, &DirPath::empty(), "out", None)
        .unwrap();
    assert_eq!(t.prerequisites.lock().unwrap().len(), 1);
}

#[test]
fn source_once_dedups() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = DirPath::new(tmp.path());
    let bf = tmp.path().join("buildfile");
    std::fs::write(&bf, "x += 1\n").unwrap();

    let mut cx = quiet_context();
    let root = cx.scopes.insert(&dir, true);
    cx.scopes.get_mut(root).src_path = Some(dir.clone());

    assert!(anvil::buildfile::source_once(&mut cx, root, root, &bf).unwrap());
    assert!(!anvil::buildfile::source_once(&mut cx, root, root, &bf).unwrap());
    let v = cx.lookup(root, "x", None).unwrap().unwrap();
    assert_eq!(v.to_string(), "1");
}

#[test]
fn scope_operation_callbacks() {
    use anvil::core::target::DIR_TYPE;
    use anvil::core::OperationCallback;

    let mut cx = quiet_context();
    let dir = DirPath::new("/cb");
    let root = cx.scopes.insert(&dir, true);
    cx.scopes.get_mut(root).operation_callbacks.push((
        UPDATE_ID,
        OperationCallback {
            pre: Some(Arc::new(|_cx, _a, _s| Ok(TargetState::Changed))),
            post: None,
        },
    ));

    let t = cx.targets.insert(
        &DIR_TYPE,
        dir.clone(),
        DirPath::empty(),
        String::new(),
        None,
        false,
    );

    let a = Action::new(PERFORM_ID, UPDATE_ID);
    algorithm::match_target(&cx, a, &t).unwrap();
    let s = cx.install(|| algorithm::execute(&cx, a, &t)).unwrap();
    // The pre callback's state merges with the (unchanged) recipe state.
    assert_eq!(s, TargetState::Changed);
}

#[test]
fn match_is_idempotent() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = DirPath::new(tmp.path());
    std::fs::write(tmp.path().join("in.txt"), "x").unwrap();

    let (cx, out) = copy_chain_context(&dir);
    let a = Action::new(PERFORM_ID, UPDATE_ID);
    algorithm::match_target(&cx, a, &out).unwrap();
    let n = out.slot.data.lock().unwrap().prerequisite_targets.len();
    // A second match must not re-apply (recipe assigned at most once,
    // prerequisite_targets appended only by apply).
    algorithm::match_target(&cx, a, &out).unwrap();
    assert_eq!(out.slot.data.lock().unwrap().prerequisite_targets.len(), n);
}
