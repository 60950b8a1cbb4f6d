use crate::core::action::{Action, MetaOperationInfo, OperationId, OperationInfo};
use crate::core::rule::RuleMap;
use crate::core::target::{Target, TargetState, TargetType};
use crate::core::Context;
use crate::core::variable::{
    Lookup, OverrideKind, TypePatternVars, Value, ValueExtra, VarMap, VarPool, Variable, Visibility,
};
use crate::core::Name;
use crate::utils::paths::DirPath;
use crate::utils::IResult;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ScopeId(pub usize);

pub type OperationCallbackFn = dyn Fn(&Context, Action, ScopeId) -> IResult<TargetState> + Send + Sync;

/// A pre/post hook around the recipe of the `dir{}` target that
/// corresponds to a scope. Registered during load; the returned state is
/// merged into the target's.
#[derive(Clone, Default)]
pub struct OperationCallback {
    pub pre: Option<Arc<OperationCallbackFn>>,
    pub post: Option<Arc<OperationCallbackFn>>,
}

/// A node in the scope hierarchy. Scopes are keyed on out-tree
/// directories and owned by the scope map; parent/root/strong links are
/// ids rather than references.
pub struct Scope {
    pub out_path: DirPath,
    pub src_path: Option<DirPath>,
    pub parent: Option<ScopeId>,
    pub root: Option<ScopeId>,
    /// Root scope of the strong amalgamation, set on root scopes only.
    pub strong: Option<ScopeId>,
    pub vars: VarMap,
    pub target_vars: TypePatternVars,
    pub rules: RuleMap,
    pub target_types: HashMap<String, Arc<TargetType>>,
    /// Meta/operations supported by this project (root scopes only).
    pub meta_operations: Vec<&'static MetaOperationInfo>,
    pub operations: Vec<&'static OperationInfo>,
    /// Per-operation callbacks around this scope's dir{} recipe.
    pub operation_callbacks: Vec<(OperationId, OperationCallback)>,
    /// Modules loaded into this root (`using cc`).
    pub modules: HashSet<String>,
    /// Buildfiles already sourced in this root.
    pub buildfiles: HashSet<PathBuf>,
    /// The first explicitly declared target of this scope's buildfile.
    pub default_target: Option<Name>,
    /// Per-root value caches (stem concatenations and override results),
    /// consulted during match/execute and therefore behind a mutex.
    caches: Mutex<ScopeCaches>,
}

#[derive(Default)]
struct ScopeCaches {
    /// Key: (variable, target type, target name).
    stem: HashMap<(String, String, String), (u64, Lookup)>,
    /// Key: (variable, scope the original was found in).
    overrides: HashMap<(String, usize), (u64, Lookup)>,
}

impl Scope {
    fn new(out_path: DirPath) -> Self {
        Self {
            out_path,
            src_path: None,
            parent: None,
            root: None,
            strong: None,
            vars: VarMap::default(),
            target_vars: TypePatternVars::default(),
            rules: RuleMap::default(),
            target_types: HashMap::new(),
            meta_operations: Vec::new(),
            operations: Vec::new(),
            operation_callbacks: Vec::new(),
            modules: HashSet::new(),
            buildfiles: HashSet::new(),
            default_target: None,
            caches: Mutex::new(ScopeCaches::default()),
        }
    }

    /// Maps an out-tree directory under this scope to the src tree.
    pub fn src_dir(&self, out: &DirPath) -> Option<DirPath> {
        let src = self.src_path.as_ref()?;
        let leaf = out.leaf(&self.out_path).ok()?;
        Some(src.join(leaf))
    }
}

/// The directory-keyed map of scopes. The first entry is always the
/// global scope with the empty key.
pub struct ScopeMap {
    scopes: Vec<Scope>,
    by_path: BTreeMap<DirPath, ScopeId>,
    /// Bumped on load-phase mutation; value caches check it.
    generation: AtomicU64,
}

pub const GLOBAL_SCOPE: ScopeId = ScopeId(0);

impl ScopeMap {
    pub fn new() -> Self {
        let mut m = Self {
            scopes: Vec::new(),
            by_path: BTreeMap::new(),
            generation: AtomicU64::new(1),
        };
        let global = Scope::new(DirPath::empty());
        m.scopes.push(global);
        m.by_path.insert(DirPath::empty(), GLOBAL_SCOPE);
        m
    }

    pub fn get(&self, id: ScopeId) -> &Scope {
        &self.scopes[id.0]
    }

    pub fn get_mut(&mut self, id: ScopeId) -> &mut Scope {
        self.generation.fetch_add(1, Ordering::Relaxed);
        &mut self.scopes[id.0]
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Relaxed)
    }

    pub fn is_root(&self, id: ScopeId) -> bool {
        self.scopes[id.0].root == Some(id)
    }

    /// The root scope this scope belongs to, if any.
    pub fn root_of(&self, id: ScopeId) -> Option<ScopeId> {
        self.scopes[id.0].root
    }

    /// Inserts a scope for the directory, creating it if absent and
    /// re-threading parent/root links of existing descendants so the tree
    /// is correct regardless of insertion order.
    pub fn insert(&mut self, d: &DirPath, root: bool) -> ScopeId {
        self.generation.fetch_add(1, Ordering::Relaxed);

        if let Some(&id) = self.by_path.get(d) {
            if root && !self.is_root(id) {
                self.scopes[id.0].root = Some(id);
                self.rethread(d, id, true);
            }
            return id;
        }

        let parent = self.find(&parent_dir(d));
        let proot = if root {
            None // Set to self below.
        } else {
            self.scopes[parent.0].root
        };

        let id = ScopeId(self.scopes.len());
        let mut s = Scope::new(d.clone());
        s.parent = Some(parent);
        s.root = if root { Some(id) } else { proot };
        self.scopes.push(s);
        self.by_path.insert(d.clone(), id);

        self.rethread(d, id, root);
        id
    }

    /// Re-points descendants of `d` whose parent (and, when `root`, root)
    /// link goes to an ancestor of `d`.
    fn rethread(&mut self, d: &DirPath, id: ScopeId, root: bool) {
        for i in 0..self.scopes.len() {
            if i == id.0 {
                continue;
            }
            if !self.scopes[i].out_path.sub(d) || self.scopes[i].out_path == *d {
                continue;
            }
            if let Some(p) = self.scopes[i].parent {
                if d.sub(&self.scopes[p.0].out_path) && *d != self.scopes[p.0].out_path {
                    self.scopes[i].parent = Some(id);
                }
            }
            if root {
                let rethread_root = match self.scopes[i].root {
                    None => true,
                    Some(r) => {
                        let rp = &self.scopes[r.0].out_path;
                        d.sub(rp) && *d != *rp
                    }
                };
                if rethread_root {
                    self.scopes[i].root = Some(id);
                }
            }
        }
    }

    /// Finds the most qualified scope that encompasses this directory.
    pub fn find(&self, d: &DirPath) -> ScopeId {
        let mut cur = d.clone();
        loop {
            if let Some(&id) = self.by_path.get(&cur) {
                return id;
            }
            match cur.parent() {
                Some(p) => cur = p,
                None => return GLOBAL_SCOPE,
            }
        }
    }

    /// As `find` but for a leaf path.
    pub fn find_path(&self, p: &std::path::Path) -> ScopeId {
        self.find(&DirPath::new(p))
    }

    pub fn iter_ids(&self) -> impl Iterator<Item = ScopeId> {
        (0..self.scopes.len()).map(ScopeId)
    }

    // Variable lookup.

    /// Full lookup: original (including target and type/pattern-specific
    /// variables) plus overrides.
    pub fn find_value(
        &self,
        pool: &VarPool,
        scope: ScopeId,
        var: &Arc<Variable>,
        target: Option<&Target>,
    ) -> IResult<Lookup> {
        let (orig, found) = self.find_original(pool, scope, var, target)?;
        if !var.overridable || !pool.has_overrides(&var.name) {
            return Ok(orig);
        }
        self.find_override(pool, scope, var, orig, found)
    }

    /// The depth-ordered original lookup of §4.B: target vars, then
    /// type/pattern-specific values walking outward, then group vars, then
    /// the scope chain honoring visibility boundaries. Returns the value
    /// and the scope it was found in (None for target/group hits).
    pub fn find_original(
        &self,
        _pool: &VarPool,
        scope: ScopeId,
        var: &Arc<Variable>,
        target: Option<&Target>,
    ) -> IResult<(Lookup, Option<ScopeId>)> {
        if let Some(t) = target {
            // (a) target vars
            if let Some(v) = t.vars.lock().unwrap().get(&var.name) {
                return Ok((Some(v.clone()), None));
            }

            // (b) type/pattern-specific vars in this and outer scopes
            let chain = t.ty.name_chain();
            let ty_chain: Vec<&str> = chain.iter().map(|s| s.as_str()).collect();
            let mut s = Some(scope);
            while let Some(id) = s {
                let sc = &self.scopes[id.0];
                if !sc.target_vars.is_empty() {
                    if let Some(tpv) =
                        sc.target_vars
                            .find(&ty_chain, &t.name, &var.name, t.ty.pattern)
                    {
                        let v = self.apply_extra(id, var, t, tpv.extra, &tpv.value)?;
                        return Ok((v, Some(id)));
                    }
                }
                s = sc.parent;
            }

            // (c) group vars
            if let Some(g) = t.group.lock().unwrap().as_ref() {
                if let Some(v) = g.vars.lock().unwrap().get(&var.name) {
                    return Ok((Some(v.clone()), None));
                }
            }
        }

        if var.visibility == Visibility::Target {
            return Ok((None, None));
        }

        // Scope chain.
        let mut s = Some(scope);
        while let Some(id) = s {
            let sc = &self.scopes[id.0];
            if let Some(v) = sc.vars.get(&var.name) {
                return Ok((Some(v.clone()), Some(id)));
            }
            if var.visibility == Visibility::Scope {
                break;
            }
            if var.visibility == Visibility::Project && self.is_root(id) {
                break;
            }
            s = sc.parent;
        }

        Ok((None, None))
    }

    /// Resolves a type/pattern-specific value: an assign value is taken
    /// as-is while prepend/append values are concatenated with the stem,
    /// the next value outward in the scope chain. Concatenations are
    /// cached per root with a generation guard.
    fn apply_extra(
        &self,
        found: ScopeId,
        var: &Arc<Variable>,
        target: &Target,
        extra: ValueExtra,
        value: &Option<Value>,
    ) -> IResult<Lookup> {
        if extra == ValueExtra::Assign {
            return Ok(Some(value.clone()));
        }

        let cache_scope = self.scopes[found.0].root.unwrap_or(GLOBAL_SCOPE);
        let key = (
            var.name.clone(),
            target.ty.name.clone(),
            target.name.clone(),
        );
        let gen = self.generation();
        {
            let caches = self.scopes[cache_scope.0].caches.lock().unwrap();
            if let Some((g, v)) = caches.stem.get(&key) {
                if *g == gen {
                    return Ok(v.clone());
                }
            }
        }

        // The stem: continue the search from the scope the value was found
        // in, skipping target and type/pattern-specific values.
        let stem = {
            let mut s = Some(found);
            let mut r: Lookup = None;
            while let Some(id) = s {
                let sc = &self.scopes[id.0];
                if let Some(v) = sc.vars.get(&var.name) {
                    r = Some(v.clone());
                    break;
                }
                if var.visibility == Visibility::Scope {
                    break;
                }
                if var.visibility == Visibility::Project && self.is_root(id) {
                    break;
                }
                s = sc.parent;
            }
            r
        };

        let combined = combine(stem.flatten(), value.clone(), extra, &var.name)?;

        let mut caches = self.scopes[cache_scope.0].caches.lock().unwrap();
        caches.stem.insert(key, (gen, combined.clone()));
        Ok(combined)
    }

    /// Applies the override chain to an original lookup result. Each
    /// override contributes only where its visibility and project permit
    /// at the value's innermost scope.
    fn find_override(
        &self,
        pool: &VarPool,
        scope: ScopeId,
        var: &Arc<Variable>,
        orig: Lookup,
        found: Option<ScopeId>,
    ) -> IResult<Lookup> {
        let inner = found.unwrap_or(scope);
        let root_path = self
            .root_of(inner)
            .map(|r| self.scopes[r.0].out_path.clone());

        let cache_scope = self.root_of(inner).unwrap_or(GLOBAL_SCOPE);
        let key = (var.name.clone(), inner.0);
        let gen = self.generation();
        {
            let caches = self.scopes[cache_scope.0].caches.lock().unwrap();
            if let Some((g, v)) = caches.overrides.get(&key) {
                if *g == gen {
                    return Ok(v.clone());
                }
            }
        }

        let chain = pool.overrides(&var.name);

        // The innermost applicable assignment override replaces the stem;
        // prefixes and suffixes then wrap it in chain order.
        let mut stem = orig.flatten();
        for o in chain.iter() {
            if o.kind == OverrideKind::Assign && o.applies(root_path.as_ref()) {
                stem = o.value.clone();
            }
        }
        for o in chain.iter() {
            if !o.applies(root_path.as_ref()) {
                continue;
            }
            match o.kind {
                OverrideKind::Assign => {}
                OverrideKind::Prefix => {
                    stem =
                        combine(stem, o.value.clone(), ValueExtra::Prepend, &var.name)?.flatten();
                }
                OverrideKind::Suffix => {
                    stem = combine(stem, o.value.clone(), ValueExtra::Append, &var.name)?.flatten();
                }
            }
        }

        let result: Lookup = Some(stem);
        let mut caches = self.scopes[cache_scope.0].caches.lock().unwrap();
        caches.overrides.insert(key, (gen, result.clone()));
        Ok(result)
    }

    // Assignment helpers used during load.

    pub fn assign(&mut self, id: ScopeId, var: &Arc<Variable>, value: Option<Value>) {
        self.get_mut(id).vars.assign(var, value);
    }

    /// Appends to the value visible from this scope: if the variable is
    /// not set here, the outer value (if any) is copied in first.
    pub fn append(
        &mut self,
        pool: &VarPool,
        id: ScopeId,
        var: &Arc<Variable>,
        value: Option<Value>,
    ) -> IResult<()> {
        self.pull_outer(pool, id, var);
        self.get_mut(id).vars.append(var, value)
    }

    pub fn prepend(
        &mut self,
        pool: &VarPool,
        id: ScopeId,
        var: &Arc<Variable>,
        value: Option<Value>,
    ) -> IResult<()> {
        self.pull_outer(pool, id, var);
        self.get_mut(id).vars.prepend(var, value)
    }

    fn pull_outer(&mut self, pool: &VarPool, id: ScopeId, var: &Arc<Variable>) {
        if self.scopes[id.0].vars.contains(&var.name) {
            return;
        }
        if let Ok((Some(v), _)) = self.find_original(pool, id, var, None) {
            self.get_mut(id).vars.assign(var, v);
        }
    }
}

impl Default for ScopeMap {
    fn default() -> Self {
        Self::new()
    }
}

fn parent_dir(d: &DirPath) -> DirPath {
    d.parent().unwrap_or_else(DirPath::empty)
}

fn combine(
    stem: Option<Value>,
    value: Option<Value>,
    extra: ValueExtra,
    var: &str,
) -> IResult<Lookup> {
    let value = match value {
        None => return Ok(Some(stem)), // Null prepended/appended is a no-op.
        Some(v) => v,
    };
    let combined = match stem {
        None => value,
        Some(s) => match extra {
            ValueExtra::Prepend => s.prepend(value, var)?,
            _ => s.append(value, var)?,
        },
    };
    Ok(Some(Some(combined)))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn insert_find() {
        let mut m = ScopeMap::new();
        let a = m.insert(&DirPath::new("/p"), true);
        let b = m.insert(&DirPath::new("/p/sub"), false);
        assert_eq!(m.get(b).parent, Some(a));
        assert_eq!(m.root_of(b), Some(a));

        // Longest-prefix lookup.
        assert_eq!(m.find(&DirPath::new("/p/sub/deep")), b);
        assert_eq!(m.find(&DirPath::new("/p/other")), a);
        assert_eq!(m.find(&DirPath::new("/elsewhere")), GLOBAL_SCOPE);
    }

    #[test]
    fn rethreads_on_out_of_order_insert() {
        let mut m = ScopeMap::new();
        let c = m.insert(&DirPath::new("/p/a/b"), false);
        assert_eq!(m.get(c).parent, Some(GLOBAL_SCOPE));
        assert_eq!(m.root_of(c), None);

        // Inserting an ancestor re-parents the deep scope to it.
        let p = m.insert(&DirPath::new("/p"), true);
        assert_eq!(m.get(c).parent, Some(p));
        assert_eq!(m.root_of(c), Some(p));

        // And a middle scope slots in between.
        let a = m.insert(&DirPath::new("/p/a"), false);
        assert_eq!(m.get(c).parent, Some(a));
        assert_eq!(m.get(a).parent, Some(p));
        assert_eq!(m.root_of(c), Some(p));
    }

    #[test]
    fn root_promotion() {
        let mut m = ScopeMap::new();
        let outer = m.insert(&DirPath::new("/p"), true);
        let inner = m.insert(&DirPath::new("/p/sub"), false);
        assert_eq!(m.root_of(inner), Some(outer));

        // Promote the subdirectory to a root; the subscope's root pointer
        // re-threads since its previous root is an ancestor.
        let deep = m.insert(&DirPath::new("/p/sub/x"), false);
        let sub = m.insert(&DirPath::new("/p/sub"), true);
        assert_eq!(sub, inner);
        assert!(m.is_root(sub));
        assert_eq!(m.root_of(deep), Some(sub));
    }
}
