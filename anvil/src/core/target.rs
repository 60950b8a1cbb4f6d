use crate::core::rule::Recipe;
use crate::core::scope::ScopeId;
use crate::core::variable::VarMap;
use crate::core::Context;
use crate::utils::paths::{self, DirPath};
use crate::utils::IResult;
use filetime::FileTime;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

pub type FactoryHook =
    fn(Arc<TargetType>, DirPath, DirPath, String, Option<String>) -> Target;
pub type SearchHook = fn(&Context, &Prerequisite) -> IResult<Option<Arc<Target>>>;
pub type PrintHook = fn(&Target) -> String;
/// Amends a type/pattern-specific name pattern before it is matched
/// (e.g. to account for a default extension).
pub type PatternHook = fn(&str) -> String;

/// A target type descriptor. Dynamic dispatch is a table of function
/// pointers; derived types inherit the hooks of their base, with the
/// factory re-routed to the ultimate base to avoid infinite recursion.
pub struct TargetType {
    pub name: String,
    pub base: Option<Arc<TargetType>>,
    pub factory: FactoryHook,
    /// The type's extension is fixed: targets of this type always compare
    /// extensions after resolution.
    pub fixed_extension: Option<fn() -> &'static str>,
    /// Extension used when deriving a file path and none was specified.
    pub default_extension: Option<fn() -> &'static str>,
    pub pattern: Option<PatternHook>,
    pub print: Option<PrintHook>,
    pub search: Option<SearchHook>,
}

impl TargetType {
    pub fn is_a(&self, name: &str) -> bool {
        if self.name == name {
            return true;
        }
        match &self.base {
            Some(b) => b.is_a(name),
            None => false,
        }
    }

    /// This type's name followed by the names of its bases.
    pub fn name_chain(&self) -> Vec<String> {
        let mut r = vec![self.name.clone()];
        let mut b = self.base.clone();
        while let Some(t) = b {
            r.push(t.name.clone());
            b = t.base.clone();
        }
        r
    }

    /// Derives a new type at runtime. All hooks are inherited; the
    /// factory is already the ultimate base's so no re-routing loop can
    /// form.
    pub fn derive(name: &str, base: &Arc<TargetType>) -> Arc<TargetType> {
        Arc::new(TargetType {
            name: name.to_string(),
            base: Some(base.clone()),
            factory: base.factory,
            fixed_extension: base.fixed_extension,
            default_extension: base.default_extension,
            pattern: base.pattern,
            print: base.print,
            search: base.search,
        })
    }
}

impl fmt::Debug for TargetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetType").field("name", &self.name).finish()
    }
}

fn default_factory(
    ty: Arc<TargetType>,
    dir: DirPath,
    out: DirPath,
    name: String,
    ext: Option<String>,
) -> Target {
    Target {
        ty,
        dir,
        out,
        name,
        ext: Mutex::new(ext),
        implied: AtomicBool::new(false),
        group: Mutex::new(None),
        prerequisites: Mutex::new(Vec::new()),
        vars: Mutex::new(VarMap::default()),
        mtime: Mutex::new(None),
        path: Mutex::new(None),
        extra: Mutex::new(None),
        slot: ActSlot::default(),
    }
}

fn dir_print(t: &Target) -> String {
    // dir{} identifies the directory itself: print the leaf inside the
    // braces, e.g. `/tmp/dir{hello/}`.
    let parent = t.dir.parent().unwrap_or_else(DirPath::empty);
    let leaf = t
        .dir
        .leaf(&parent)
        .map(|l| l.display().to_string())
        .unwrap_or_default();
    format!("{}{}{{{}/}}", parent, t.ty.name, leaf)
}

macro_rules! builtin_type {
    ($name:expr, $base:expr) => {
        Arc::new(TargetType {
            name: $name.to_string(),
            base: $base,
            factory: default_factory,
            fixed_extension: None,
            default_extension: None,
            pattern: None,
            print: None,
            search: None,
        })
    };
}

lazy_static::lazy_static! {
    pub static ref TARGET_TYPE: Arc<TargetType> = builtin_type!("target", None);
    pub static ref ALIAS_TYPE: Arc<TargetType> =
        builtin_type!("alias", Some(TARGET_TYPE.clone()));
    pub static ref DIR_TYPE: Arc<TargetType> = Arc::new(TargetType {
        name: "dir".to_string(),
        base: Some(ALIAS_TYPE.clone()),
        factory: default_factory,
        fixed_extension: None,
        default_extension: None,
        pattern: None,
        print: Some(dir_print),
        search: None,
    });
    pub static ref FSDIR_TYPE: Arc<TargetType> = Arc::new(TargetType {
        name: "fsdir".to_string(),
        base: Some(TARGET_TYPE.clone()),
        factory: default_factory,
        fixed_extension: None,
        default_extension: None,
        pattern: None,
        print: Some(dir_print),
        search: None,
    });
    pub static ref MTIME_TYPE: Arc<TargetType> =
        builtin_type!("mtime_target", Some(TARGET_TYPE.clone()));
    pub static ref PATH_TYPE: Arc<TargetType> =
        builtin_type!("path_target", Some(MTIME_TYPE.clone()));
    pub static ref FILE_TYPE: Arc<TargetType> =
        builtin_type!("file", Some(PATH_TYPE.clone()));
    pub static ref EXE_TYPE: Arc<TargetType> = Arc::new(TargetType {
        name: "exe".to_string(),
        base: Some(FILE_TYPE.clone()),
        factory: default_factory,
        fixed_extension: Some(|| ""),
        default_extension: None,
        pattern: None,
        print: None,
        search: None,
    });
    pub static ref OBJ_TYPE: Arc<TargetType> = Arc::new(TargetType {
        name: "obj".to_string(),
        base: Some(FILE_TYPE.clone()),
        factory: default_factory,
        fixed_extension: Some(|| "o"),
        default_extension: None,
        pattern: None,
        print: None,
        search: None,
    });
}

/// The built-in types every scope can resolve.
pub fn builtin_types() -> Vec<Arc<TargetType>> {
    vec![
        TARGET_TYPE.clone(),
        ALIAS_TYPE.clone(),
        DIR_TYPE.clone(),
        FSDIR_TYPE.clone(),
        MTIME_TYPE.clone(),
        PATH_TYPE.clone(),
        FILE_TYPE.clone(),
        EXE_TYPE.clone(),
        OBJ_TYPE.clone(),
    ]
}

/// Target state for one action. Transitions are monotone: unknown, then
/// possibly postponed, then one of unchanged/changed/failed; failed is
/// terminal.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum TargetState {
    #[default]
    Unknown,
    Postponed,
    Unchanged,
    Changed,
    Failed,
}

impl TargetState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TargetState::Unchanged | TargetState::Changed | TargetState::Failed
        )
    }

    /// Folds two states: failed dominates, then changed.
    pub fn merge(self, other: TargetState) -> TargetState {
        use TargetState::*;
        match (self, other) {
            (Failed, _) | (_, Failed) => Failed,
            (Changed, _) | (_, Changed) => Changed,
            _ => Unchanged,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            TargetState::Unknown => "unknown",
            TargetState::Postponed => "postponed",
            TargetState::Unchanged => "unchanged",
            TargetState::Changed => "changed",
            TargetState::Failed => "failed",
        }
    }
}

/// Per-action mutable data of a target. The batch serialization of the
/// engine means one slot is enough; it is reset between operation
/// batches.
#[derive(Default)]
pub struct ActData {
    pub matched: bool,
    pub recipe: Option<Recipe>,
    pub prerequisite_targets: Vec<Arc<Target>>,
    pub state: TargetState,
    /// Claimed by a thread that is currently matching or executing.
    pub busy: bool,
}

#[derive(Default)]
pub struct ActSlot {
    pub data: Mutex<ActData>,
    pub cond: Condvar,
}

/// A reference to a dependency. Resolves to a target at match time.
#[derive(Clone, Debug)]
pub struct Prerequisite {
    pub proj: Option<String>,
    pub ty: Arc<TargetType>,
    pub dir: DirPath,
    pub out: DirPath,
    pub name: String,
    pub ext: Option<String>,
    /// Owning scope, used for variable lookup during match.
    pub scope: ScopeId,
}

/// One node in the dependency graph.
pub struct Target {
    pub ty: Arc<TargetType>,
    pub dir: DirPath,
    pub out: DirPath,
    pub name: String,
    pub ext: Mutex<Option<String>>,
    /// Entered the graph as a prerequisite rather than being declared.
    pub implied: AtomicBool,
    pub group: Mutex<Option<Arc<Target>>>,
    pub prerequisites: Mutex<Vec<Prerequisite>>,
    pub vars: Mutex<VarMap>,
    /// None is the "unknown" sentinel; `paths::timestamp_nonexistent()`
    /// means the file does not exist.
    pub mtime: Mutex<Option<FileTime>>,
    pub path: Mutex<Option<PathBuf>>,
    /// Auxiliary slot for rules to stash match data between match and
    /// apply.
    pub extra: Mutex<Option<Box<dyn Any + Send>>>,
    pub slot: ActSlot,
}

impl Target {
    pub fn is_mtime_based(&self) -> bool {
        self.ty.is_a("mtime_target")
    }

    pub fn is_path_based(&self) -> bool {
        self.ty.is_a("path_target")
    }

    pub fn mtime(&self) -> Option<FileTime> {
        *self.mtime.lock().unwrap()
    }

    pub fn set_mtime(&self, t: FileTime) {
        *self.mtime.lock().unwrap() = Some(t);
    }

    pub fn path(&self) -> Option<PathBuf> {
        self.path.lock().unwrap().clone()
    }

    pub fn set_path(&self, p: PathBuf) {
        *self.path.lock().unwrap() = Some(p);
    }

    /// Derives and caches the file path of a path-based target:
    /// `dir/name[.ext]` with the extension resolved in fixed, specified,
    /// default order.
    pub fn derive_path(&self) -> PathBuf {
        if let Some(p) = self.path() {
            return p;
        }
        let ext = self.resolve_extension();
        let file = match ext.as_deref() {
            Some("") | None => self.name.clone(),
            Some(e) => format!("{}.{}", self.name, e),
        };
        let p = self.dir.join_leaf(file);
        self.set_path(p.clone());
        p
    }

    /// Stats the file behind the target and records its mtime.
    pub fn load_mtime(&self) -> FileTime {
        if let Some(t) = self.mtime() {
            return t;
        }
        let t = paths::mtime(self.derive_path());
        self.set_mtime(t);
        t
    }

    pub fn resolve_extension(&self) -> Option<String> {
        if let Some(f) = self.ty.fixed_extension {
            return Some(f().to_string());
        }
        if let Some(e) = self.ext.lock().unwrap().clone() {
            return Some(e);
        }
        self.ty.default_extension.map(|f| f().to_string())
    }

    pub fn state(&self) -> TargetState {
        self.slot.data.lock().unwrap().state
    }

    /// Assigns the recipe for the current action. Assigning twice is a
    /// bug.
    pub fn set_recipe(&self, recipe: Recipe) {
        let mut d = self.slot.data.lock().unwrap();
        assert!(d.recipe.is_none(), "recipe for `{}` assigned twice", self);
        d.recipe = Some(recipe);
    }

    pub fn matched(&self) -> bool {
        self.slot.data.lock().unwrap().matched
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(p) = self.ty.print {
            return write!(f, "{}", p(self));
        }
        write!(f, "{}{}{{{}}}", self.dir, self.ty.name, self.name)
    }
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// The identity of a target in the graph.
#[derive(Clone, Debug)]
pub struct TargetKey {
    pub ty: Arc<TargetType>,
    pub dir: DirPath,
    pub out: DirPath,
    pub name: String,
    pub ext: Option<String>,
}

impl PartialEq for TargetKey {
    fn eq(&self, other: &Self) -> bool {
        if !Arc::ptr_eq(&self.ty, &other.ty)
            || self.dir != other.dir
            || self.out != other.out
            || self.name != other.name
        {
            return false;
        }
        // Fixed extensions are resolved on insertion so a plain comparison
        // is exact; otherwise unspecified equals any specified extension.
        if self.ty.fixed_extension.is_some() {
            self.ext == other.ext
        } else {
            match (&self.ext, &other.ext) {
                (Some(a), Some(b)) => a == b,
                _ => true,
            }
        }
    }
}

impl Eq for TargetKey {}

impl Hash for TargetKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // The extension is excluded because of its "unspecified" equality.
        (Arc::as_ptr(&self.ty) as usize).hash(state);
        self.dir.hash(state);
        self.out.hash(state);
        self.name.hash(state);
    }
}

/// The concurrent unique-insertion map owning all targets. Append-only
/// within one run.
#[derive(Default)]
pub struct TargetMap {
    map: Mutex<HashMap<TargetKey, Arc<Target>>>,
}

impl TargetMap {
    /// Inserts or finds the target for a key, resolving a fixed extension
    /// first. On conflict the existing entry is returned and, if the
    /// caller asked for an explicit entry, `implied` is cleared.
    pub fn insert(
        &self,
        ty: &Arc<TargetType>,
        dir: DirPath,
        out: DirPath,
        name: String,
        ext: Option<String>,
        implied: bool,
    ) -> Arc<Target> {
        let ext = match ty.fixed_extension {
            Some(f) => Some(f().to_string()),
            None => ext,
        };
        let key = TargetKey {
            ty: ty.clone(),
            dir,
            out,
            name,
            ext,
        };
        let mut map = self.map.lock().unwrap();
        if let Some(t) = map.get(&key) {
            if !implied {
                t.implied.store(false, Ordering::Relaxed);
            }
            return t.clone();
        }
        let t = Arc::new((ty.factory)(
            key.ty.clone(),
            key.dir.clone(),
            key.out.clone(),
            key.name.clone(),
            key.ext.clone(),
        ));
        t.implied.store(implied, Ordering::Relaxed);
        map.insert(key, t.clone());
        t
    }

    /// The same resolution as `insert`, without inserting.
    pub fn find(
        &self,
        ty: &Arc<TargetType>,
        dir: &DirPath,
        out: &DirPath,
        name: &str,
        ext: Option<&str>,
    ) -> Option<Arc<Target>> {
        let ext = match ty.fixed_extension {
            Some(f) => Some(f().to_string()),
            None => ext.map(|s| s.to_string()),
        };
        let key = TargetKey {
            ty: ty.clone(),
            dir: dir.clone(),
            out: out.clone(),
            name: name.to_string(),
            ext,
        };
        self.map.lock().unwrap().get(&key).cloned()
    }

    pub fn all(&self) -> Vec<Arc<Target>> {
        self.map.lock().unwrap().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.map.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.lock().unwrap().is_empty()
    }

    /// Clears all per-action slots. Run between operation batches.
    pub fn reset_action(&self) {
        for t in self.map.lock().unwrap().values() {
            let mut d = t.slot.data.lock().unwrap();
            *d = ActData::default();
        }
    }

    /// Full reset between runs.
    pub fn clear(&self) {
        self.map.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn unique_insertion() {
        let map = TargetMap::default();
        let d = DirPath::new("/tmp/p");
        let a = map.insert(
            &FILE_TYPE,
            d.clone(),
            DirPath::empty(),
            "x".into(),
            None,
            true,
        );
        let b = map.insert(
            &FILE_TYPE,
            d.clone(),
            DirPath::empty(),
            "x".into(),
            Some("txt".into()),
            false,
        );
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(map.len(), 1);
        // Explicit insertion cleared the implied flag.
        assert!(!a.implied.load(Ordering::Relaxed));
    }

    #[test]
    fn unique_insertion_concurrent() {
        let map = Arc::new(TargetMap::default());
        let d = DirPath::new("/tmp/p");
        let mut handles = Vec::new();
        for _ in 0..8 {
            let map = map.clone();
            let d = d.clone();
            handles.push(std::thread::spawn(move || {
                map.insert(&FILE_TYPE, d, DirPath::empty(), "x".into(), None, true)
            }));
        }
        let targets: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(map.len(), 1);
        for t in &targets {
            assert!(Arc::ptr_eq(t, &targets[0]));
        }
    }

    #[test]
    fn fixed_extension_equality() {
        let map = TargetMap::default();
        let d = DirPath::new("/tmp/p");
        // obj{} has a fixed extension: an unspecified caller extension
        // resolves to it and compares equal.
        let a = map.insert(&OBJ_TYPE, d.clone(), DirPath::empty(), "x".into(), None, true);
        let b = map.insert(
            &OBJ_TYPE,
            d.clone(),
            DirPath::empty(),
            "x".into(),
            Some("o".into()),
            true,
        );
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn derived_type() {
        let t = TargetType::derive("obja", &OBJ_TYPE);
        assert!(t.is_a("obj"));
        assert!(t.is_a("file"));
        assert_eq!(t.name_chain()[0], "obja");
    }

    #[test]
    fn display() {
        let t = default_factory(
            EXE_TYPE.clone(),
            DirPath::new("/tmp/p"),
            DirPath::empty(),
            "hello".into(),
            None,
        );
        assert_eq!(t.to_string(), "/tmp/p/exe{hello}");

        let d = default_factory(
            DIR_TYPE.clone(),
            DirPath::new("/tmp/hello"),
            DirPath::empty(),
            String::new(),
            None,
        );
        assert_eq!(d.to_string(), "/tmp/dir{hello/}");
    }
}
