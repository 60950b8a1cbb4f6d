use crate::core::action::{CLEAN_ID, DEFAULT_ID, UPDATE_ID};
use crate::core::rule::{ALIAS_RULE, FILE_RULE, FSDIR_RULE};
use crate::core::scope::{ScopeId, ScopeMap, GLOBAL_SCOPE};
use crate::core::target::{builtin_types, Target, TargetMap, TargetType};
use crate::core::variable::{OverrideKind, Value, ValueType, VarPool, Visibility};
use crate::core::Name;
use crate::utils::paths::DirPath;
use crate::utils::{IResult, Shell};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Driver options relevant to the engine.
#[derive(Debug, Clone)]
pub struct Options {
    pub verbosity: u32,
    pub progress: Option<bool>,
    pub jobs: usize,
    /// Cap on the total number of worker threads, including ones blocked
    /// on external processes.
    pub max_jobs: usize,
    /// Per-job bound on outstanding prerequisite spawns.
    pub queue_depth: usize,
    /// Worker stack size in KB.
    pub max_stack: Option<usize>,
    pub serial_stop: bool,
    pub structured_result: bool,
    pub match_only: bool,
    pub no_column: bool,
    pub no_line: bool,
    pub buildfile: Option<PathBuf>,
    pub config_guess: Option<PathBuf>,
    pub config_sub: Option<PathBuf>,
    pub pager: Option<PathBuf>,
    pub pager_options: Vec<String>,
}

impl Default for Options {
    fn default() -> Self {
        let jobs = num_cpus::get().max(1);
        Self {
            verbosity: 1,
            progress: None,
            jobs,
            max_jobs: jobs * max_jobs_factor(),
            queue_depth: 4,
            max_stack: None,
            serial_stop: false,
            structured_result: false,
            match_only: false,
            no_column: false,
            no_line: false,
            buildfile: None,
            config_guess: None,
            config_sub: None,
            pager: None,
            pager_options: Vec::new(),
        }
    }
}

fn max_jobs_factor() -> usize {
    if cfg!(target_pointer_width = "64") {
        32
    } else {
        8
    }
}

/// The engine state for one invocation: scope map, target map, variable
/// pool, worker pool. Everything match/execute touches goes through a
/// context reference so concurrent or embedded use stays possible.
pub struct Context {
    pub options: Options,
    pub scopes: ScopeMap,
    pub targets: TargetMap,
    pub var_pool: VarPool,
    /// Current working directory, absolute and normalized.
    pub work: DirPath,
    pub home: Option<DirPath>,
    shell: Mutex<Shell>,
    pool: rayon::ThreadPool,
    stop: AtomicBool,
}

impl Context {
    pub fn new(options: Options) -> IResult<Self> {
        let mut shell = Shell::new();
        shell.set_verbosity(options.verbosity);
        shell.set_location_format(options.no_line, options.no_column);
        Self::with_shell(options, shell)
    }

    pub fn with_shell(options: Options, shell: Shell) -> IResult<Self> {
        let work = DirPath::new(std::env::current_dir()?);
        let home = crate::utils::home_dir().map(DirPath::new);

        let threads = if options.serial_stop {
            1
        } else {
            options.jobs.min(options.max_jobs).max(1)
        };
        let mut b = rayon::ThreadPoolBuilder::new().num_threads(threads);
        if let Some(kb) = options.max_stack {
            b = b.stack_size(kb * 1024);
        }
        let pool = b.build()?;

        let mut cx = Self {
            options,
            scopes: ScopeMap::new(),
            targets: TargetMap::default(),
            var_pool: VarPool::default(),
            work,
            home,
            shell: Mutex::new(shell),
            pool,
            stop: AtomicBool::new(false),
        };
        cx.bootstrap_global()?;
        Ok(cx)
    }

    /// Seeds the global scope: built-in target types and rules plus the
    /// `build.*` variables.
    fn bootstrap_global(&mut self) -> IResult<()> {
        {
            let g = self.scopes.get_mut(GLOBAL_SCOPE);
            for tt in builtin_types() {
                g.target_types.insert(tt.name.clone(), tt);
            }
            for op in [DEFAULT_ID, UPDATE_ID, CLEAN_ID] {
                g.rules.insert(op, "alias", "build.alias", ALIAS_RULE.clone());
                g.rules.insert(op, "fsdir", "build.fsdir", FSDIR_RULE.clone());
                g.rules
                    .insert(op, "mtime_target", "build.file", FILE_RULE.clone());
            }
        }

        // Well-known variables, typed up front so that values sourced
        // back from persisted state come out with the right type.
        for name in ["src_root", "out_root", "amalgamation"] {
            self.var_pool
                .insert(name, Some(ValueType::Dir), Visibility::Normal, false)?;
        }
        self.var_pool
            .insert("subprojects", Some(ValueType::Names), Visibility::Normal, false)?;

        if let Some(h) = self.home.clone() {
            let var = self.var_pool.insert(
                "build.home",
                Some(ValueType::Dir),
                Visibility::Normal,
                false,
            )?;
            self.scopes.assign(GLOBAL_SCOPE, &var, Some(Value::Dir(h)));
        }

        for (name, path) in [
            ("build.config.guess", self.options.config_guess.clone()),
            ("build.config.sub", self.options.config_sub.clone()),
        ] {
            if let Some(p) = path {
                let var =
                    self.var_pool
                        .insert(name, Some(ValueType::Path), Visibility::Normal, false)?;
                self.scopes
                    .assign(GLOBAL_SCOPE, &var, Some(Value::Path(p)));
            }
        }

        Ok(())
    }

    /// Resets the engine state between runs. The target and scope maps
    /// are rebuilt; command-line overrides in the pool survive.
    pub fn reset(&mut self) -> IResult<()> {
        self.targets.clear();
        self.scopes = ScopeMap::new();
        self.stop.store(false, Ordering::SeqCst);
        self.bootstrap_global()
    }

    pub fn shell(&self) -> MutexGuard<'_, Shell> {
        self.shell.lock().unwrap()
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Runs a closure on the worker pool; rayon spawns inside use it.
    pub fn install<R: Send>(&self, f: impl FnOnce() -> R + Send) -> R {
        self.pool.install(f)
    }

    /// Reports an error once, with its context chain.
    pub fn report(&self, e: &anyhow::Error) {
        let mut shell = self.shell();
        drop(shell.error(format!("{:#}", e)));
    }

    // Variable lookup conveniences.

    pub fn lookup(
        &self,
        scope: ScopeId,
        name: &str,
        target: Option<&Target>,
    ) -> IResult<Option<Value>> {
        match self.var_pool.find(name) {
            None => Ok(None),
            Some(var) => Ok(self
                .scopes
                .find_value(&self.var_pool, scope, &var, target)?
                .flatten()),
        }
    }

    pub fn lookup_str(&self, scope: ScopeId, name: &str) -> IResult<Option<String>> {
        Ok(self.lookup(scope, name, None)?.map(|v| v.to_string()))
    }

    pub fn lookup_dir(&self, scope: ScopeId, name: &str) -> IResult<Option<DirPath>> {
        Ok(self
            .lookup(scope, name, None)?
            .and_then(|v| v.as_dir().cloned()))
    }

    pub fn lookup_target_str(
        &self,
        scope: ScopeId,
        name: &str,
        target: &Target,
    ) -> IResult<Option<String>> {
        Ok(self
            .lookup(scope, name, Some(target))?
            .map(|v| v.to_string()))
    }

    /// Parses a command-line variable override (`x=v`, `x+=v`, `x=+v`)
    /// into the pool. Returns false if the argument is not an override.
    pub fn enter_override(&self, spec: &str) -> IResult<bool> {
        let eq = match spec.find('=') {
            Some(i) if i > 0 => i,
            _ => return Ok(false),
        };

        let (kind, name, val) = if spec[..eq].ends_with('+') {
            (OverrideKind::Suffix, &spec[..eq - 1], &spec[eq + 1..])
        } else if spec[eq + 1..].starts_with('+') {
            (OverrideKind::Prefix, &spec[..eq], &spec[eq + 2..])
        } else {
            (OverrideKind::Assign, &spec[..eq], &spec[eq + 1..])
        };

        if name.is_empty() || name.contains(|c: char| c.is_whitespace()) {
            return Ok(false);
        }

        self.var_pool
            .insert(name, None, Visibility::Normal, true)?;

        let names: Vec<Name> = val
            .split_whitespace()
            .map(crate::core::name::to_name)
            .collect();
        let value = if names.is_empty() {
            None
        } else {
            Some(Value::Names(names))
        };

        self.var_pool
            .insert_override(name, kind, value, Visibility::Normal, None);
        Ok(true)
    }

    /// Finds a target type by name, walking the scope chain to the global
    /// scope.
    pub fn find_target_type(&self, scope: ScopeId, name: &str) -> Option<Arc<TargetType>> {
        let mut s = Some(scope);
        while let Some(id) = s {
            let sc = self.scopes.get(id);
            if let Some(tt) = sc.target_types.get(name) {
                return Some(tt.clone());
            }
            s = sc.parent;
        }
        self.scopes
            .get(GLOBAL_SCOPE)
            .target_types
            .get(name)
            .cloned()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn test_context() -> Context {
        Context::with_shell(
            Options {
                jobs: 2,
                ..Options::default()
            },
            Shell::from_write(Vec::new()),
        )
        .unwrap()
    }

    #[test]
    fn overrides_from_cli() {
        let cx = test_context();
        assert!(cx.enter_override("x=foo").unwrap());
        assert!(cx.enter_override("x+=bar").unwrap());
        assert!(!cx.enter_override("update").unwrap());
        assert!(!cx.enter_override("=broken").unwrap());

        let v = cx.lookup(GLOBAL_SCOPE, "x", None).unwrap().unwrap();
        assert_eq!(v.to_string(), "foo bar");
    }

    #[test]
    fn builtin_types_visible() {
        let cx = test_context();
        assert!(cx.find_target_type(GLOBAL_SCOPE, "file").is_some());
        assert!(cx.find_target_type(GLOBAL_SCOPE, "dir").is_some());
        assert!(cx.find_target_type(GLOBAL_SCOPE, "nope").is_none());
    }
}
