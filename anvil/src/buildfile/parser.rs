use crate::buildfile::lexer::{Lexer, Token, TokenKind};
use crate::core::project::name_to_prerequisite;
use crate::core::scope::ScopeId;
use crate::core::variable::{Value, ValueExtra, ValueType, Visibility};
use crate::core::{to_name, Context, Name};
use crate::utils::paths::DirPath;
use crate::utils::IResult;
use anyhow::Context as _;
use std::path::Path;
use std::process::Command;

/// Sources a buildfile into the given scope.
pub fn source(cx: &mut Context, root: ScopeId, base: ScopeId, path: &Path) -> IResult<()> {
    let src = crate::utils::paths::read_string(path)?;
    parse_string(cx, root, base, &src, &path.display().to_string())
}

/// As `source` but skips buildfiles already sourced in this root.
pub fn source_once(cx: &mut Context, root: ScopeId, base: ScopeId, path: &Path) -> IResult<bool> {
    let canon = crate::utils::paths::normalize(path);
    if !cx.scopes.get_mut(root).buildfiles.insert(canon) {
        return Ok(false);
    }
    source(cx, root, base, path)?;
    Ok(true)
}

pub fn parse_string(
    cx: &mut Context,
    root: ScopeId,
    base: ScopeId,
    src: &str,
    name: &str,
) -> IResult<()> {
    let mut p = Parser {
        cx,
        lex: Lexer::new(src.as_bytes().to_vec(), name),
        root,
        scope: base,
        peeked: None,
    };
    p.parse_clause(false)
}

struct Parser<'a> {
    cx: &'a mut Context,
    lex: Lexer,
    root: ScopeId,
    scope: ScopeId,
    peeked: Option<Token>,
}

#[derive(Clone, Copy, PartialEq)]
enum AssignKind {
    Assign,
    Append,
    Prepend,
}

impl<'a> Parser<'a> {
    fn next(&mut self) -> IResult<Token> {
        match self.peeked.take() {
            Some(t) => Ok(t),
            None => self.lex.next_token(),
        }
    }

    fn peek(&mut self) -> IResult<&Token> {
        if self.peeked.is_none() {
            self.peeked = Some(self.lex.next_token()?);
        }
        Ok(self.peeked.as_ref().unwrap())
    }

    fn err(&self, t: &Token, msg: impl std::fmt::Display) -> anyhow::Error {
        let loc = self
            .cx
            .shell()
            .location(self.lex.name(), t.line, t.column);
        anyhow::anyhow!("{}: error: {}", loc, msg)
    }

    // The main clause loop: one construct per line.
    fn parse_clause(&mut self, in_block: bool) -> IResult<()> {
        loop {
            let t = self.peek()?.clone();
            match &t.kind {
                TokenKind::Eof => {
                    if in_block {
                        anyhow::bail!(self.err(&t, "expected `}` before end of file"));
                    }
                    return Ok(());
                }
                TokenKind::Newline => {
                    self.next()?;
                }
                TokenKind::RBrace if in_block => return Ok(()),
                TokenKind::Word(w) => match w.as_str() {
                    "print" => self.parse_print()?,
                    "include" => self.parse_include(true)?,
                    "source" => self.parse_include(false)?,
                    "assert" => self.parse_assert()?,
                    "if" => self.parse_if()?,
                    "for" => self.parse_for()?,
                    "define" => self.parse_define()?,
                    "using" => self.parse_using()?,
                    "run" => self.parse_run()?,
                    "import" => self.parse_import()?,
                    "export" => self.parse_export()?,
                    "elif" | "else" => {
                        anyhow::bail!(self.err(&t, format!("`{}` without `if`", w)))
                    }
                    _ => self.parse_line()?,
                },
                _ => self.parse_line()?,
            }
        }
    }

    /// Assignment, dependency declaration, or target-specific assignment.
    fn parse_line(&mut self) -> IResult<()> {
        let start = self.peek()?.clone();
        let names = self.parse_names()?;

        let t = self.peek()?.clone();
        match t.kind {
            TokenKind::Assign | TokenKind::Append | TokenKind::Prepend => {
                let kind = self.assign_kind()?;
                let var_name = single_simple(&names)
                    .ok_or_else(|| self.err(&start, "expected variable name"))?;
                let (ty, value) = self.parse_value(&var_name)?;
                self.assign_scope_var(&var_name, ty, kind, value)?;
            }
            TokenKind::Colon => {
                self.next()?;
                self.parse_dependency(names)?;
            }
            TokenKind::Newline | TokenKind::Eof => {
                if !names.is_empty() {
                    anyhow::bail!(self.err(&start, "expected `:` or `=` after names"));
                }
            }
            _ => anyhow::bail!(self.err(&t, "unexpected token")),
        }
        Ok(())
    }

    /// After `targets :`: either prerequisites, a chained declaration, or
    /// a target/type-pattern-specific assignment.
    fn parse_dependency(&mut self, targets: Vec<Name>) -> IResult<()> {
        let start = self.peek()?.clone();
        let rhs = self.parse_names()?;

        let t = self.peek()?.clone();
        match t.kind {
            TokenKind::Assign | TokenKind::Append | TokenKind::Prepend => {
                let kind = self.assign_kind()?;
                let var_name = single_simple(&rhs)
                    .ok_or_else(|| self.err(&start, "expected variable name after `:`"))?;
                let (ty, value) = self.parse_value(&var_name)?;
                self.assign_target_vars(&targets, &var_name, ty, kind, value)?;
            }
            TokenKind::Colon => {
                // A dependency chain: the right-hand side becomes both the
                // prerequisites here and the targets of the next link.
                self.declare(&targets, &rhs)?;
                self.next()?;
                self.parse_dependency(rhs)?;
            }
            _ => {
                self.declare(&targets, &rhs)?;
            }
        }
        Ok(())
    }

    fn assign_kind(&mut self) -> IResult<AssignKind> {
        let t = self.next()?;
        Ok(match t.kind {
            TokenKind::Assign => AssignKind::Assign,
            TokenKind::Append => AssignKind::Append,
            TokenKind::Prepend => AssignKind::Prepend,
            _ => unreachable!(),
        })
    }

    /// Parses `[attrs] names...` to end of line into a value.
    fn parse_value(&mut self, var: &str) -> IResult<(Option<ValueType>, Option<Value>)> {
        let mut ty = None;
        let mut null = false;

        if self.peek()?.kind == TokenKind::LBracket {
            self.next()?;
            loop {
                let t = self.next()?;
                match t.kind {
                    TokenKind::RBracket => break,
                    TokenKind::Word(ref w) => {
                        if w == "null" {
                            null = true;
                        } else if let Some(vt) = ValueType::from_name(&w) {
                            ty = Some(vt);
                        } else {
                            anyhow::bail!(self.err(&t, format!("unknown attribute `{}`", w)));
                        }
                    }
                    _ => anyhow::bail!(self.err(&t, "expected attribute")),
                }
            }
        }

        let names = self.parse_names()?;
        if null {
            return Ok((ty, None));
        }
        let v = Value::typify(names, ty, var)?;
        Ok((ty, Some(v)))
    }

    fn assign_scope_var(
        &mut self,
        name: &str,
        ty: Option<ValueType>,
        kind: AssignKind,
        value: Option<Value>,
    ) -> IResult<()> {
        let var = self
            .cx
            .var_pool
            .insert(name, ty, Visibility::Normal, true)?;
        let value = retypify(&var, value)?;
        match kind {
            AssignKind::Assign => self.cx.scopes.assign(self.scope, &var, value),
            AssignKind::Append => {
                self.cx
                    .scopes
                    .append(&self.cx.var_pool, self.scope, &var, value)?
            }
            AssignKind::Prepend => {
                self.cx
                    .scopes
                    .prepend(&self.cx.var_pool, self.scope, &var, value)?
            }
        }
        Ok(())
    }

    /// `exe{hello}: x = y` (target-specific) and `cxx{*}: x = y`
    /// (type/pattern-specific).
    fn assign_target_vars(
        &mut self,
        targets: &[Name],
        name: &str,
        ty: Option<ValueType>,
        kind: AssignKind,
        value: Option<Value>,
    ) -> IResult<()> {
        let var = self
            .cx
            .var_pool
            .insert(name, ty, Visibility::Normal, true)?;
        let value = retypify(&var, value)?;

        for tn in targets {
            if tn.value.contains('*') {
                if tn.ty.is_empty() {
                    anyhow::bail!(
                        "pattern `{}` requires a target type (e.g. `file{{*}}`)",
                        tn.value
                    );
                }
                let extra = match kind {
                    AssignKind::Assign => ValueExtra::Assign,
                    AssignKind::Append => ValueExtra::Append,
                    AssignKind::Prepend => ValueExtra::Prepend,
                };
                self.cx.scopes.get_mut(self.scope).target_vars.assign(
                    &tn.ty,
                    &tn.value,
                    &var,
                    extra,
                    value.clone(),
                );
            } else {
                let p = name_to_prerequisite(self.cx, self.scope, tn)?;
                let t = self
                    .cx
                    .targets
                    .insert(&p.ty, p.dir, p.out, p.name, p.ext, false);
                let mut vars = t.vars.lock().unwrap();
                match kind {
                    AssignKind::Assign => vars.assign(&var, value.clone()),
                    AssignKind::Append => vars.append(&var, value.clone())?,
                    AssignKind::Prepend => vars.prepend(&var, value.clone())?,
                }
            }
        }
        Ok(())
    }

    /// Declares targets with prerequisites, recording the scope's default
    /// target.
    fn declare(&mut self, targets: &[Name], prereqs: &[Name]) -> IResult<()> {
        for tn in targets {
            let p = name_to_prerequisite(self.cx, self.scope, tn)?;
            let t = self
                .cx
                .targets
                .insert(&p.ty, p.dir, p.out, p.name, p.ext, false);

            if self.cx.scopes.get(self.scope).default_target.is_none() {
                self.cx.scopes.get_mut(self.scope).default_target = Some(tn.clone());
            }

            let mut ps = t.prerequisites.lock().unwrap();
            for pn in prereqs {
                ps.push(name_to_prerequisite(self.cx, self.scope, pn)?);
            }
        }
        Ok(())
    }

    /// Parses a whitespace-separated name list, stopping at structural
    /// tokens. Handles `type{...}` groups, `@` pairs, and `$var`
    /// expansion.
    fn parse_names(&mut self) -> IResult<Vec<Name>> {
        let mut names: Vec<Name> = Vec::new();
        loop {
            let t = self.peek()?.clone();
            match &t.kind {
                TokenKind::Word(w) => {
                    let w = w.clone();
                    self.next()?;
                    // `type{...}`: an unseparated brace after a word.
                    let brace = {
                        let n = self.peek()?;
                        n.kind == TokenKind::LBrace && !n.sep
                    };
                    if brace {
                        self.next()?;
                        let inner = self.parse_names()?;
                        let close = self.next()?;
                        if close.kind != TokenKind::RBrace {
                            anyhow::bail!(self.err(&close, "expected `}`"));
                        }
                        for mut n in inner {
                            if !n.ty.is_empty() {
                                anyhow::bail!(self.err(&t, "nested target type"));
                            }
                            n.ty = w.clone();
                            names.push(n);
                        }
                    } else {
                        names.extend(self.expand_word(&w)?);
                    }
                }
                TokenKind::Pair => {
                    self.next()?;
                    match names.last_mut() {
                        Some(n) => n.pair = b'@',
                        None => anyhow::bail!(self.err(&t, "`@` without left-hand side")),
                    }
                }
                _ => return Ok(names),
            }
        }
    }

    /// `$var` / `$(var)` expansion. A word that is exactly one reference
    /// splices the value's names; an embedded reference concatenates the
    /// value's string form.
    fn expand_word(&mut self, w: &str) -> IResult<Vec<Name>> {
        if !w.contains('$') {
            return Ok(vec![to_name(w)]);
        }

        if let Some(name) = full_reference(w) {
            let v = self.cx.lookup(self.scope, name, None)?;
            return Ok(match v {
                Some(v) => v.to_names(),
                None => Vec::new(),
            });
        }

        let mut out = String::new();
        let mut rest = w;
        while let Some(i) = rest.find('$') {
            out.push_str(&rest[..i]);
            rest = &rest[i + 1..];
            let (name, tail) = if let Some(stripped) = rest.strip_prefix('(') {
                match stripped.find(')') {
                    Some(j) => (&stripped[..j], &stripped[j + 1..]),
                    None => anyhow::bail!("unterminated `$(` in `{}`", w),
                }
            } else {
                let j = rest
                    .find(|c: char| !(c.is_alphanumeric() || c == '_' || c == '.'))
                    .unwrap_or(rest.len());
                (&rest[..j], &rest[j..])
            };
            if name.is_empty() {
                anyhow::bail!("empty variable reference in `{}`", w);
            }
            if let Some(v) = self.cx.lookup(self.scope, name, None)? {
                out.push_str(&v.to_string());
            }
            rest = tail;
        }
        out.push_str(rest);
        Ok(vec![to_name(&out)])
    }

    // Directives.

    fn parse_print(&mut self) -> IResult<()> {
        self.next()?;
        let names = self.parse_names()?;
        let line = names
            .iter()
            .map(|n| n.to_string())
            .collect::<Vec<_>>()
            .join(" ");
        let mut shell = self.cx.shell();
        writeln!(shell.out(), "{}", line)?;
        Ok(())
    }

    fn parse_include(&mut self, once: bool) -> IResult<()> {
        let kw = self.next()?;
        let names = self.parse_names()?;
        for n in names {
            let rel = if n.directory() {
                n.dir.join_leaf("buildfile")
            } else {
                n.dir.join_leaf(&n.value)
            };

            let src_base = self
                .cx
                .scopes
                .get(self.scope)
                .src_path
                .clone()
                .unwrap_or_else(|| self.cx.scopes.get(self.scope).out_path.clone());
            let path = if rel.is_absolute() {
                rel
            } else {
                src_base.join_leaf(rel)
            };

            if !path.is_file() {
                anyhow::bail!(self.err(&kw, format!("`{}` does not exist", path.display())));
            }

            let scope = if once {
                self.enter_dir_scope(&DirPath::new(path.parent().unwrap_or(Path::new(""))))
            } else {
                self.scope
            };

            if once {
                crate::buildfile::source_once(self.cx, self.root, scope, &path)?;
            } else {
                crate::buildfile::source(self.cx, self.root, scope, &path)?;
            }
        }
        Ok(())
    }

    /// Maps an src-tree directory to its out-tree scope, creating it if
    /// needed.
    fn enter_dir_scope(&mut self, src_dir: &DirPath) -> ScopeId {
        let root = self.cx.scopes.get(self.root);
        let out_root = root.out_path.clone();
        let src_root = root.src_path.clone();

        if let Some(sr) = src_root {
            if let Ok(leaf) = src_dir.leaf(&sr) {
                let out = out_root.join(leaf);
                let id = self.cx.scopes.insert(&out, false);
                if self.cx.scopes.get(id).src_path.is_none() {
                    self.cx.scopes.get_mut(id).src_path = Some(src_dir.clone());
                }
                return id;
            }
        }
        self.scope
    }

    fn parse_assert(&mut self) -> IResult<()> {
        let kw = self.next()?;
        let (cond, text) = self.parse_condition()?;
        if !cond {
            anyhow::bail!(self.err(&kw, format!("assertion failed: {}", text)));
        }
        Ok(())
    }

    fn parse_if(&mut self) -> IResult<()> {
        self.next()?;
        let (mut taken, _) = self.parse_condition()?;
        let mut done = taken;

        self.parse_or_skip_block(taken)?;

        loop {
            // Look ahead for elif/else chains.
            let save = self.lex.mark();
            let saved_peek = self.peeked.clone();
            let mut t = self.next()?;
            while t.kind == TokenKind::Newline {
                t = self.next()?;
            }
            match &t.kind {
                TokenKind::Word(w) if w == "elif" => {
                    let (c, _) = self.parse_condition()?;
                    taken = c && !done;
                    done = done || taken;
                    self.parse_or_skip_block(taken)?;
                }
                TokenKind::Word(w) if w == "else" => {
                    self.skip_to_newline()?;
                    self.parse_or_skip_block(!done)?;
                    return Ok(());
                }
                _ => {
                    self.lex.reset(save);
                    self.peeked = saved_peek;
                    return Ok(());
                }
            }
        }
    }

    /// Evaluates a condition to end of line: `w`, `! w`, `a == b`,
    /// `a != b`, optionally parenthesized.
    fn parse_condition(&mut self) -> IResult<(bool, String)> {
        let mut toks = Vec::new();
        loop {
            let t = self.peek()?.clone();
            match t.kind {
                TokenKind::Newline | TokenKind::Eof => break,
                _ => {
                    self.next()?;
                    toks.push(t);
                }
            }
        }

        // Strip parens.
        let stripped: Vec<&Token> = toks
            .iter()
            .filter(|t| !matches!(t.kind, TokenKind::LParen | TokenKind::RParen))
            .collect();

        let mut words: Vec<String> = Vec::new();
        let mut ops: Vec<&TokenKind> = Vec::new();
        for t in &stripped {
            match &t.kind {
                TokenKind::Word(w) => {
                    for n in self.expand_word(w)? {
                        words.push(n.to_string());
                    }
                    if let TokenKind::Word(w) = &t.kind {
                        if w == "!" {
                            // Keep as operator, not operand.
                            words.pop();
                            ops.push(&t.kind);
                        }
                    }
                }
                k => ops.push(k),
            }
        }

        let text: String = words.join(" ");

        // a == b: two Assign tokens between the operands.
        let eq_count = ops
            .iter()
            .filter(|k| matches!(k, TokenKind::Assign))
            .count();
        let negated = ops
            .iter()
            .any(|k| matches!(k, TokenKind::Word(w) if w == "!"));

        let result = if eq_count >= 2 {
            words.len() == 2 && words[0] == words[1]
        } else if negated && eq_count == 1 {
            // a != b
            !(words.len() == 2 && words[0] == words[1])
        } else {
            let truthy = !words.is_empty() && words.iter().any(|w| w != "false" && !w.is_empty());
            if negated {
                !truthy
            } else {
                truthy
            }
        };

        Ok((result, text))
    }

    fn skip_to_newline(&mut self) -> IResult<()> {
        loop {
            let t = self.peek()?.clone();
            match t.kind {
                TokenKind::Newline | TokenKind::Eof => return Ok(()),
                _ => {
                    self.next()?;
                }
            }
        }
    }

    /// Expects a `{ ... }` block and either parses or skips it.
    fn parse_or_skip_block(&mut self, take: bool) -> IResult<()> {
        loop {
            let t = self.next()?;
            match t.kind {
                TokenKind::Newline => continue,
                TokenKind::LBrace => break,
                _ => anyhow::bail!(self.err(&t, "expected `{` to open block")),
            }
        }

        if take {
            self.parse_clause(true)?;
            let t = self.next()?;
            if t.kind != TokenKind::RBrace {
                anyhow::bail!(self.err(&t, "expected `}`"));
            }
        } else {
            let mut depth = 1usize;
            loop {
                let t = self.next()?;
                match t.kind {
                    TokenKind::LBrace => depth += 1,
                    TokenKind::RBrace => {
                        depth -= 1;
                        if depth == 0 {
                            break;
                        }
                    }
                    TokenKind::Eof => {
                        anyhow::bail!(self.err(&t, "expected `}` before end of file"))
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }

    /// `for x: a b c { ... }`. The block is re-scanned per iteration.
    fn parse_for(&mut self) -> IResult<()> {
        self.next()?;
        let vt = self.next()?;
        let var_name = match &vt.kind {
            TokenKind::Word(w) => w.clone(),
            _ => anyhow::bail!(self.err(&vt, "expected variable name after `for`")),
        };
        let t = self.next()?;
        if t.kind != TokenKind::Colon {
            anyhow::bail!(self.err(&t, "expected `:` after `for` variable"));
        }
        let items = self.parse_names()?;

        // Position on the block.
        loop {
            let t = self.next()?;
            match t.kind {
                TokenKind::Newline => continue,
                TokenKind::LBrace => break,
                _ => anyhow::bail!(self.err(&t, "expected `{` to open `for` block")),
            }
        }
        let body = self.lex.mark();
        let body_peek = self.peeked.clone();

        let var = self
            .cx
            .var_pool
            .insert(&var_name, None, Visibility::Normal, false)?;

        if items.is_empty() {
            // Still need to skip the block.
            let mut depth = 1usize;
            loop {
                let t = self.next()?;
                match t.kind {
                    TokenKind::LBrace => depth += 1,
                    TokenKind::RBrace => {
                        depth -= 1;
                        if depth == 0 {
                            return Ok(());
                        }
                    }
                    TokenKind::Eof => {
                        anyhow::bail!(self.err(&t, "expected `}` before end of file"))
                    }
                    _ => {}
                }
            }
        }

        for item in items {
            self.lex.reset(body);
            self.peeked = body_peek.clone();
            self.cx
                .scopes
                .assign(self.scope, &var, Some(Value::Names(vec![item])));
            self.parse_clause(true)?;
            let t = self.next()?;
            if t.kind != TokenKind::RBrace {
                anyhow::bail!(self.err(&t, "expected `}`"));
            }
        }
        Ok(())
    }

    /// `define obj2: obj` derives a target type.
    fn parse_define(&mut self) -> IResult<()> {
        self.next()?;
        let nt = self.next()?;
        let new_name = match &nt.kind {
            TokenKind::Word(w) => w.clone(),
            _ => anyhow::bail!(self.err(&nt, "expected new target type name")),
        };
        let t = self.next()?;
        if t.kind != TokenKind::Colon {
            anyhow::bail!(self.err(&t, "expected `:` in `define`"));
        }
        let bt = self.next()?;
        let base_name = match &bt.kind {
            TokenKind::Word(w) => w.clone(),
            _ => anyhow::bail!(self.err(&bt, "expected base target type name")),
        };

        let base = self
            .cx
            .find_target_type(self.scope, &base_name)
            .ok_or_else(|| self.err(&bt, format!("unknown target type `{}`", base_name)))?;
        let derived = crate::core::target::TargetType::derive(&new_name, &base);
        self.cx
            .scopes
            .get_mut(self.root)
            .target_types
            .insert(new_name, derived);
        Ok(())
    }

    /// `using cc` loads a module into the project root.
    fn parse_using(&mut self) -> IResult<()> {
        let kw = self.next()?;
        let names = self.parse_names()?;
        for n in names {
            crate::rules::load_module(self.cx, self.root, &n.value)
                .map_err(|e| self.err(&kw, e))?;
        }
        Ok(())
    }

    /// `run prog args...`. The program's stdout is parsed as buildfile
    /// text in the current scope.
    fn parse_run(&mut self) -> IResult<()> {
        let kw = self.next()?;
        let names = self.parse_names()?;
        if names.is_empty() {
            anyhow::bail!(self.err(&kw, "expected program name after `run`"));
        }
        let prog = names[0].to_string();
        let args: Vec<String> = names[1..].iter().map(|n| n.to_string()).collect();

        let out = Command::new(&prog)
            .args(&args)
            .output()
            .with_context(|| format!("failed to execute `{}`", prog))?;
        if !out.status.success() {
            anyhow::bail!(crate::core::BuildError::ProcessError {
                program: prog,
                status: out.status.to_string(),
            });
        }
        let text = String::from_utf8_lossy(&out.stdout).to_string();
        let name = format!("<run {}>", prog);
        crate::buildfile::parse_string(self.cx, self.root, self.scope, &text, &name)
    }

    /// `import x = proj%name` resolves a target in another project via
    /// subprojects of the amalgamation or `config.import.<proj>`.
    fn parse_import(&mut self) -> IResult<()> {
        let kw = self.next()?;
        let vt = self.next()?;
        let var_name = match &vt.kind {
            TokenKind::Word(w) => w.clone(),
            _ => anyhow::bail!(self.err(&vt, "expected variable name after `import`")),
        };
        let t = self.next()?;
        if t.kind != TokenKind::Assign {
            anyhow::bail!(self.err(&t, "expected `=` in `import`"));
        }
        let names = self.parse_names()?;

        let mut resolved = Vec::with_capacity(names.len());
        for mut n in names {
            if let Some(proj) = n.proj.take() {
                let dir = self
                    .resolve_import(&proj)?
                    .ok_or_else(|| {
                        self.err(
                            &kw,
                            format!(
                                "unable to import `{}%{}`: no subproject and no \
                                 config.import.{} value",
                                proj, n.value, proj
                            ),
                        )
                    })?;
                n.dir = dir.join(n.dir.as_path());
            }
            resolved.push(n);
        }

        let var = self
            .cx
            .var_pool
            .insert(&var_name, None, Visibility::Normal, true)?;
        self.cx
            .scopes
            .assign(self.scope, &var, Some(Value::Names(resolved)));
        Ok(())
    }

    fn resolve_import(&mut self, proj: &str) -> IResult<Option<DirPath>> {
        // config.import.<proj> wins.
        if let Some(d) = self
            .cx
            .lookup_dir(self.scope, &format!("config.import.{}", proj))?
        {
            return Ok(Some(d));
        }

        // Then subprojects of this root and of the strong amalgamation.
        let mut roots = vec![self.root];
        if let Some(s) = self.cx.scopes.get(self.root).strong {
            roots.push(s);
        }
        for r in roots {
            if let Some(v) = self.cx.lookup(r, "subprojects", None)? {
                let out_root = self.cx.scopes.get(r).out_path.clone();
                for n in v.to_names() {
                    if n.directory()
                        && n.dir
                            .as_path()
                            .file_name()
                            .map_or(false, |f| f == std::ffi::OsStr::new(proj))
                    {
                        return Ok(Some(out_root.join(n.dir.as_path())));
                    }
                }
            }
        }
        Ok(None)
    }

    /// `export <names>` records what this project exports on its root.
    fn parse_export(&mut self) -> IResult<()> {
        self.next()?;
        let names = self.parse_names()?;
        let var = self
            .cx
            .var_pool
            .insert("export", None, Visibility::Project, false)?;
        self.cx
            .scopes
            .append(&self.cx.var_pool, self.root, &var, Some(Value::Names(names)))?;
        Ok(())
    }
}

/// An untyped value assigned to a typed variable takes the variable's
/// declared type.
fn retypify(
    var: &std::sync::Arc<crate::core::Variable>,
    value: Option<Value>,
) -> IResult<Option<Value>> {
    match (var.ty, value) {
        (Some(t), Some(Value::Names(ns))) => Ok(Some(Value::typify(ns, Some(t), &var.name)?)),
        (_, v) => Ok(v),
    }
}

fn single_simple(names: &[Name]) -> Option<String> {
    if names.len() == 1 && names[0].simple() && !names[0].value.is_empty() {
        Some(names[0].value.clone())
    } else {
        None
    }
}

fn full_reference(w: &str) -> Option<&str> {
    let rest = w.strip_prefix('$')?;
    if let Some(inner) = rest.strip_prefix('(') {
        let name = inner.strip_suffix(')')?;
        if !name.is_empty() && !name.contains(['(', ')', '$']) {
            return Some(name);
        }
        return None;
    }
    if !rest.is_empty()
        && rest
            .chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '.')
    {
        return Some(rest);
    }
    None
}
