use crate::core::{BuildError, Name};
use crate::utils::paths::DirPath;
use crate::utils::IResult;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// Declared type of a variable's value.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ValueType {
    Bool,
    UInt,
    String,
    Path,
    Dir,
    AbsDir,
    Name,
    NamePair,
    Strings,
    Paths,
    Dirs,
    Names,
}

impl ValueType {
    pub fn name(self) -> &'static str {
        match self {
            ValueType::Bool => "bool",
            ValueType::UInt => "uint64",
            ValueType::String => "string",
            ValueType::Path => "path",
            ValueType::Dir => "dir_path",
            ValueType::AbsDir => "abs_dir_path",
            ValueType::Name => "name",
            ValueType::NamePair => "name_pair",
            ValueType::Strings => "strings",
            ValueType::Paths => "paths",
            ValueType::Dirs => "dir_paths",
            ValueType::Names => "names",
        }
    }

    pub fn from_name(s: &str) -> Option<Self> {
        Some(match s {
            "bool" => ValueType::Bool,
            "uint64" => ValueType::UInt,
            "string" => ValueType::String,
            "path" => ValueType::Path,
            "dir_path" => ValueType::Dir,
            "abs_dir_path" => ValueType::AbsDir,
            "name" => ValueType::Name,
            "name_pair" => ValueType::NamePair,
            "strings" => ValueType::Strings,
            "paths" => ValueType::Paths,
            "dir_paths" => ValueType::Dirs,
            "names" => ValueType::Names,
            _ => return None,
        })
    }
}

/// The result of a variable lookup: `None` means undefined, `Some(None)`
/// a defined null value.
pub type Lookup = Option<Option<Value>>;

/// A typed value. The untyped representation is `Names`; everything else
/// is produced from it by `typify`.
#[derive(Clone, PartialEq, Debug)]
pub enum Value {
    Bool(bool),
    UInt(u64),
    String(String),
    Path(PathBuf),
    Dir(DirPath),
    Name(Name),
    NamePair(Box<(Name, Name)>),
    Strings(Vec<String>),
    Paths(Vec<PathBuf>),
    Dirs(Vec<DirPath>),
    Names(Vec<Name>),
}

impl Value {
    pub fn ty(&self) -> ValueType {
        match self {
            Value::Bool(_) => ValueType::Bool,
            Value::UInt(_) => ValueType::UInt,
            Value::String(_) => ValueType::String,
            Value::Path(_) => ValueType::Path,
            Value::Dir(_) => ValueType::Dir,
            Value::Name(_) => ValueType::Name,
            Value::NamePair(_) => ValueType::NamePair,
            Value::Strings(_) => ValueType::Strings,
            Value::Paths(_) => ValueType::Paths,
            Value::Dirs(_) => ValueType::Dirs,
            Value::Names(_) => ValueType::Names,
        }
    }

    /// Converts an untyped name list to a value of the requested type.
    pub fn typify(names: Vec<Name>, ty: Option<ValueType>, var: &str) -> IResult<Value> {
        fn conflict(var: &str, ty: ValueType, got: &str) -> anyhow::Error {
            BuildError::TypeConflict {
                name: var.to_string(),
                existing: ty.name().to_string(),
                requested: got.to_string(),
            }
            .into()
        }

        let ty = match ty {
            None => return Ok(Value::Names(names)),
            Some(t) => t,
        };

        let one = |names: Vec<Name>| -> IResult<Name> {
            if names.len() == 1 {
                Ok(names.into_iter().next().unwrap())
            } else {
                Err(conflict(var, ty, "name list"))
            }
        };

        Ok(match ty {
            ValueType::Bool => {
                let n = one(names)?;
                match n.value.as_str() {
                    "true" => Value::Bool(true),
                    "false" => Value::Bool(false),
                    v => return Err(conflict(var, ty, v)),
                }
            }
            ValueType::UInt => {
                let n = one(names)?;
                Value::UInt(
                    n.value
                        .parse::<u64>()
                        .map_err(|_| conflict(var, ty, &n.value))?,
                )
            }
            ValueType::String => Value::String(one(names)?.to_string()),
            ValueType::Path => {
                let n = one(names)?;
                Value::Path(n.dir.as_path().join(&n.value))
            }
            ValueType::Dir | ValueType::AbsDir => {
                let n = one(names)?;
                let d = if n.dir.is_empty() {
                    DirPath::new(&n.value)
                } else {
                    n.dir
                };
                if ty == ValueType::AbsDir && !d.is_absolute() {
                    return Err(conflict(var, ty, "relative directory"));
                }
                Value::Dir(d)
            }
            ValueType::Name => Value::Name(one(names)?),
            ValueType::NamePair => {
                if names.len() == 2 {
                    let mut it = names.into_iter();
                    let a = it.next().unwrap();
                    let b = it.next().unwrap();
                    Value::NamePair(Box::new((a, b)))
                } else {
                    return Err(conflict(var, ty, "name list"));
                }
            }
            ValueType::Strings => Value::Strings(names.iter().map(|n| n.to_string()).collect()),
            ValueType::Paths => Value::Paths(
                names
                    .into_iter()
                    .map(|n| n.dir.as_path().join(&n.value))
                    .collect(),
            ),
            ValueType::Dirs => Value::Dirs(
                names
                    .into_iter()
                    .map(|n| {
                        if n.dir.is_empty() {
                            DirPath::new(&n.value)
                        } else {
                            n.dir
                        }
                    })
                    .collect(),
            ),
            ValueType::Names => Value::Names(names),
        })
    }

    /// The reverse of `typify`, used by expansion.
    pub fn to_names(&self) -> Vec<Name> {
        match self {
            Value::Bool(b) => vec![Name::simple_value(if *b { "true" } else { "false" })],
            Value::UInt(u) => vec![Name::simple_value(u.to_string())],
            Value::String(s) => vec![Name::simple_value(s.clone())],
            Value::Path(p) => vec![Name::simple_value(p.display().to_string())],
            Value::Dir(d) => vec![Name::from_dir(d.clone())],
            Value::Name(n) => vec![n.clone()],
            Value::NamePair(p) => vec![p.0.clone(), p.1.clone()],
            Value::Strings(v) => v.iter().map(Name::simple_value).collect(),
            Value::Paths(v) => v
                .iter()
                .map(|p| Name::simple_value(p.display().to_string()))
                .collect(),
            Value::Dirs(v) => v.iter().map(|d| Name::from_dir(d.clone())).collect(),
            Value::Names(v) => v.clone(),
        }
    }

    /// Appends `other` to `self`. Containers extend, strings concatenate;
    /// anything else is a type conflict.
    pub fn append(self, other: Value, var: &str) -> IResult<Value> {
        match (self, other) {
            (Value::String(mut a), Value::String(b)) => {
                a.push_str(&b);
                Ok(Value::String(a))
            }
            (Value::Strings(mut a), Value::Strings(b)) => {
                a.extend(b);
                Ok(Value::Strings(a))
            }
            (Value::Paths(mut a), Value::Paths(b)) => {
                a.extend(b);
                Ok(Value::Paths(a))
            }
            (Value::Dirs(mut a), Value::Dirs(b)) => {
                a.extend(b);
                Ok(Value::Dirs(a))
            }
            (Value::Names(mut a), Value::Names(b)) => {
                a.extend(b);
                Ok(Value::Names(a))
            }
            (a, b) => Err(BuildError::TypeConflict {
                name: var.to_string(),
                existing: a.ty().name().to_string(),
                requested: b.ty().name().to_string(),
            }
            .into()),
        }
    }

    pub fn prepend(self, other: Value, var: &str) -> IResult<Value> {
        other.append(self, var)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_dir(&self) -> Option<&DirPath> {
        match self {
            Value::Dir(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = self.to_names();
        for (i, n) in names.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{}", n)?;
        }
        Ok(())
    }
}

/// Variable visibility, in order of increasing restriction.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum Visibility {
    /// Visible in all outer scopes.
    Normal,
    /// Not visible outside the project's root scope.
    Project,
    /// Not visible outside the scope it is set on.
    Scope,
    /// Only visible on targets.
    Target,
}

/// An interned variable descriptor. Stored in and owned by the pool.
#[derive(Debug)]
pub struct Variable {
    pub name: String,
    pub ty: Option<ValueType>,
    pub visibility: Visibility,
    pub overridable: bool,
}

/// The synthesized override variables: `x.__override`, `x.__prefix`,
/// `x.__suffix`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum OverrideKind {
    Assign,
    Prefix,
    Suffix,
}

impl OverrideKind {
    pub fn suffix(self) -> &'static str {
        match self {
            OverrideKind::Assign => ".__override",
            OverrideKind::Prefix => ".__prefix",
            OverrideKind::Suffix => ".__suffix",
        }
    }
}

#[derive(Debug)]
pub struct Override {
    /// Synthesized variable name (`x.__prefix` and so on).
    pub name: String,
    pub kind: OverrideKind,
    pub value: Option<Value>,
    pub visibility: Visibility,
    /// Root scope (out path) this override is restricted to. None means it
    /// applies in every project.
    pub project: Option<DirPath>,
}

impl Override {
    /// Whether this override contributes to a value whose original lives
    /// under `root` (the innermost root scope of the lookup).
    pub fn applies(&self, root: Option<&DirPath>) -> bool {
        match (&self.project, self.visibility) {
            (None, _) => true,
            (Some(p), Visibility::Normal) => root.map_or(false, |r| r.sub(p)),
            (Some(p), _) => root.map_or(false, |r| r == p),
        }
    }
}

/// The process-wide append-only set of interned variable descriptors.
#[derive(Default)]
pub struct VarPool {
    vars: Mutex<HashMap<String, Arc<Variable>>>,
    /// Override chains keyed by base variable name, ordered outer to inner
    /// (i.e., in the order they were entered).
    overrides: Mutex<HashMap<String, Vec<Arc<Override>>>>,
}

impl VarPool {
    /// Interns a variable. Idempotent for a compatible type; a conflicting
    /// type fails.
    pub fn insert(
        &self,
        name: &str,
        ty: Option<ValueType>,
        visibility: Visibility,
        overridable: bool,
    ) -> IResult<Arc<Variable>> {
        let mut vars = self.vars.lock().unwrap();
        if let Some(v) = vars.get(name) {
            if ty.is_some() && v.ty != ty {
                anyhow::bail!(BuildError::TypeConflict {
                    name: name.to_string(),
                    existing: v.ty.map(|t| t.name()).unwrap_or("untyped").to_string(),
                    requested: ty.map(|t| t.name()).unwrap_or("untyped").to_string(),
                });
            }
            return Ok(v.clone());
        }
        let v = Arc::new(Variable {
            name: name.to_string(),
            ty,
            visibility,
            overridable,
        });
        vars.insert(name.to_string(), v.clone());
        Ok(v)
    }

    pub fn find(&self, name: &str) -> Option<Arc<Variable>> {
        self.vars.lock().unwrap().get(name).cloned()
    }

    pub fn insert_override(
        &self,
        base: &str,
        kind: OverrideKind,
        value: Option<Value>,
        visibility: Visibility,
        project: Option<DirPath>,
    ) {
        let o = Arc::new(Override {
            name: format!("{}{}", base, kind.suffix()),
            kind,
            value,
            visibility,
            project,
        });
        self.overrides
            .lock()
            .unwrap()
            .entry(base.to_string())
            .or_default()
            .push(o);
    }

    pub fn overrides(&self, base: &str) -> Vec<Arc<Override>> {
        self.overrides
            .lock()
            .unwrap()
            .get(base)
            .cloned()
            .unwrap_or_default()
    }

    /// Base names of all variables with an override chain.
    pub fn override_names(&self) -> Vec<String> {
        self.overrides.lock().unwrap().keys().cloned().collect()
    }

    pub fn has_overrides(&self, base: &str) -> bool {
        self.overrides
            .lock()
            .unwrap()
            .get(base)
            .map_or(false, |v| !v.is_empty())
    }
}

/// A variable map: scope vars, target vars, group vars.
///
/// A present entry with a None value is a null value; a missing entry is
/// undefined. Null appended or prepended is a no-op while null assigned
/// clears the value.
#[derive(Default, Debug)]
pub struct VarMap {
    map: HashMap<String, (Arc<Variable>, Option<Value>)>,
}

impl VarMap {
    pub fn assign(&mut self, var: &Arc<Variable>, value: Option<Value>) {
        self.map.insert(var.name.clone(), (var.clone(), value));
    }

    pub fn append(&mut self, var: &Arc<Variable>, value: Option<Value>) -> IResult<()> {
        let value = match value {
            None => return Ok(()),
            Some(v) => v,
        };
        match self.map.remove(&var.name) {
            Some((v, Some(cur))) => {
                let merged = cur.append(value, &var.name)?;
                self.map.insert(var.name.clone(), (v, Some(merged)));
            }
            _ => self.assign(var, Some(value)),
        }
        Ok(())
    }

    pub fn prepend(&mut self, var: &Arc<Variable>, value: Option<Value>) -> IResult<()> {
        let value = match value {
            None => return Ok(()),
            Some(v) => v,
        };
        match self.map.remove(&var.name) {
            Some((v, Some(cur))) => {
                let merged = cur.prepend(value, &var.name)?;
                self.map.insert(var.name.clone(), (v, Some(merged)));
            }
            _ => self.assign(var, Some(value)),
        }
        Ok(())
    }

    /// None: undefined here. Some(None): defined null.
    pub fn get(&self, name: &str) -> Option<&Option<Value>> {
        self.map.get(name).map(|(_, v)| v)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.map.contains_key(name)
    }

    /// All entries within a dotted namespace, sorted by name.
    pub fn find_namespace<'a>(&'a self, ns: &str) -> Vec<(&'a str, &'a Option<Value>)> {
        let prefix = format!("{}.", ns);
        let mut r: Vec<_> = self
            .map
            .iter()
            .filter(|(k, _)| k.starts_with(&prefix))
            .map(|(k, (_, v))| (k.as_str(), v))
            .collect();
        r.sort_by_key(|(k, _)| *k);
        r
    }
}

/// The `extra` flag of a target type/pattern-specific value.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ValueExtra {
    Assign,
    Prepend,
    Append,
}

#[derive(Clone, Debug)]
pub struct TypePatternValue {
    pub var: Arc<Variable>,
    pub extra: ValueExtra,
    pub value: Option<Value>,
}

pub struct TypePatternEntry {
    /// Target type name this entry applies to.
    pub ty: String,
    /// Name pattern: `*`, `foo*` or `*bar`.
    pub pattern: String,
    pub vars: HashMap<String, TypePatternValue>,
}

/// Target type/pattern-specific variables of one scope.
#[derive(Default)]
pub struct TypePatternVars {
    entries: Vec<TypePatternEntry>,
}

impl TypePatternVars {
    pub fn assign(
        &mut self,
        ty: &str,
        pattern: &str,
        var: &Arc<Variable>,
        extra: ValueExtra,
        value: Option<Value>,
    ) {
        let entry = match self
            .entries
            .iter_mut()
            .find(|e| e.ty == ty && e.pattern == pattern)
        {
            Some(e) => e,
            None => {
                self.entries.push(TypePatternEntry {
                    ty: ty.to_string(),
                    pattern: pattern.to_string(),
                    vars: HashMap::new(),
                });
                self.entries.last_mut().unwrap()
            }
        };
        entry.vars.insert(
            var.name.clone(),
            TypePatternValue {
                var: var.clone(),
                extra,
                value,
            },
        );
    }

    /// Finds the value for `var` matching a target with the given type
    /// chain and name. The most recently defined matching entry wins.
    /// `amend` is the target type's pattern amendment hook, applied to
    /// each candidate pattern before matching.
    pub fn find(
        &self,
        ty_chain: &[&str],
        name: &str,
        var: &str,
        amend: Option<fn(&str) -> String>,
    ) -> Option<&TypePatternValue> {
        for e in self.entries.iter().rev() {
            if !ty_chain.contains(&e.ty.as_str()) {
                continue;
            }
            let matched = match amend {
                Some(f) => pattern_matches(&f(&e.pattern), name),
                None => pattern_matches(&e.pattern, name),
            };
            if !matched {
                continue;
            }
            if let Some(v) = e.vars.get(var) {
                return Some(v);
            }
        }
        None
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// `*` matches anything; a single `*` elsewhere splits the pattern into a
/// required prefix and suffix.
pub fn pattern_matches(pat: &str, name: &str) -> bool {
    match pat.find('*') {
        None => pat == name,
        Some(i) => {
            let (prefix, suffix) = (&pat[..i], &pat[i + 1..]);
            name.len() >= prefix.len() + suffix.len()
                && name.starts_with(prefix)
                && name.ends_with(suffix)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn pool_idempotent() {
        let pool = VarPool::default();
        let a = pool
            .insert("x", Some(ValueType::String), Visibility::Normal, true)
            .unwrap();
        let b = pool
            .insert("x", Some(ValueType::String), Visibility::Normal, true)
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(pool
            .insert("x", Some(ValueType::Bool), Visibility::Normal, true)
            .is_err());
        // Untyped re-insertion of a typed variable is compatible.
        assert!(pool.insert("x", None, Visibility::Normal, true).is_ok());
    }

    #[test]
    fn null_semantics() {
        let pool = VarPool::default();
        let x = pool.insert("x", None, Visibility::Normal, true).unwrap();
        let mut m = VarMap::default();

        m.assign(&x, Some(Value::Names(vec![Name::simple_value("a")])));
        m.append(&x, None).unwrap();
        assert_eq!(
            m.get("x").unwrap().as_ref().unwrap().to_names().len(),
            1,
            "null append must be a no-op"
        );

        m.assign(&x, None);
        assert!(m.get("x").unwrap().is_none(), "null assign clears");
        assert!(m.contains("x"));
    }

    #[test]
    fn append_prepend() {
        let v = Value::Names(vec![Name::simple_value("b")]);
        let v = v
            .append(Value::Names(vec![Name::simple_value("c")]), "x")
            .unwrap();
        let v = v
            .prepend(Value::Names(vec![Name::simple_value("a")]), "x")
            .unwrap();
        assert_eq!(v.to_string(), "a b c");

        let s = Value::String("ab".into());
        assert!(s.append(Value::UInt(1), "x").is_err());
    }

    #[test]
    fn typify() {
        let v = Value::typify(
            vec![Name::simple_value("42")],
            Some(ValueType::UInt),
            "x",
        )
        .unwrap();
        assert_eq!(v, Value::UInt(42));
        assert!(Value::typify(
            vec![Name::simple_value("no")],
            Some(ValueType::Bool),
            "x"
        )
        .is_err());
    }

    #[test]
    fn patterns() {
        assert!(pattern_matches("*", "anything"));
        assert!(pattern_matches("foo*", "foobar"));
        assert!(pattern_matches("*bar", "foobar"));
        assert!(!pattern_matches("foo*", "barfoo"));
        assert!(pattern_matches("exact", "exact"));
    }
}
