use crate::buildfile::lexer::{Lexer, TokenKind};
use crate::core::{to_name, Name};
use crate::utils::paths::DirPath;
use crate::utils::IResult;

/// One target of an operation batch, optionally bound to an src_base via
/// `src@target`.
#[derive(Debug, Clone)]
pub struct TargetSpec {
    pub name: Name,
    pub src_base: Option<DirPath>,
}

/// `op(target...)`. The name may be empty (default operation) and may
/// turn out to be a meta-operation name; the driver lifts it after
/// bootstrap, once the root scope's tables are known.
#[derive(Debug, Default, Clone)]
pub struct OpSpec {
    pub name: String,
    pub targets: Vec<TargetSpec>,
}

/// `meta-op(op(...)...)`.
#[derive(Debug, Default, Clone)]
pub struct MetaOpSpec {
    pub name: String,
    pub ops: Vec<OpSpec>,
}

pub type Buildspec = Vec<MetaOpSpec>;

/// Parses the free-form command line arguments into a buildspec:
/// `meta-op(op(targets...)...)...`, with bare targets filling unnamed
/// batches.
pub fn parse_buildspec(args: &[String]) -> IResult<Buildspec> {
    let joined = args.join(" ");
    let mut lex = Lexer::new(joined.into_bytes(), "<buildspec>");

    let mut spec: Buildspec = Vec::new();
    let mut cur_meta = MetaOpSpec::default();
    let mut cur_op = OpSpec::default();

    loop {
        let t = lex.next_token()?;
        match t.kind {
            TokenKind::Eof => break,
            TokenKind::Newline => continue,
            TokenKind::Word(w) => {
                let save = lex.mark();
                let la = lex.next_token()?;
                if la.kind == TokenKind::LParen && !la.sep {
                    match parse_group(&mut lex, &w)? {
                        Group::Op(op) => {
                            push_op(&mut cur_meta, &mut cur_op, op);
                        }
                        Group::Meta(m) => {
                            close_meta(&mut spec, &mut cur_meta, &mut cur_op);
                            spec.push(m);
                        }
                    }
                } else {
                    lex.reset(save);
                    cur_op.targets.push(parse_target(&w, &mut lex)?);
                }
            }
            _ => anyhow::bail!("invalid buildspec near `{:?}`", t.kind),
        }
    }

    close_meta(&mut spec, &mut cur_meta, &mut cur_op);

    if spec.is_empty() {
        spec.push(MetaOpSpec::default());
    }
    for m in spec.iter_mut() {
        if m.ops.is_empty() {
            m.ops.push(OpSpec::default());
        }
        for o in m.ops.iter_mut() {
            if o.targets.is_empty() {
                // Default target: dir{./}.
                o.targets.push(TargetSpec {
                    name: Name {
                        ty: "dir".to_string(),
                        ..Default::default()
                    },
                    src_base: None,
                });
            }
        }
    }

    Ok(spec)
}

enum Group {
    Op(OpSpec),
    Meta(MetaOpSpec),
}

/// Parses `name( ... )` after the opening paren. An inner group promotes
/// this one to a meta-operation.
fn parse_group(lex: &mut Lexer, name: &str) -> IResult<Group> {
    let mut op = OpSpec {
        name: name.to_string(),
        ..Default::default()
    };
    let mut meta: Option<MetaOpSpec> = None;

    loop {
        let t = lex.next_token()?;
        match t.kind {
            TokenKind::RParen => break,
            TokenKind::Eof => anyhow::bail!("unbalanced `(` in buildspec"),
            TokenKind::Newline => continue,
            TokenKind::Word(w) => {
                let save = lex.mark();
                let la = lex.next_token()?;
                if la.kind == TokenKind::LParen && !la.sep {
                    let inner = match parse_group(lex, &w)? {
                        Group::Op(o) => o,
                        Group::Meta(_) => anyhow::bail!("nested meta-operation in buildspec"),
                    };
                    let m = meta.get_or_insert_with(|| MetaOpSpec {
                        name: name.to_string(),
                        ..Default::default()
                    });
                    m.ops.push(inner);
                } else {
                    lex.reset(save);
                    op.targets.push(parse_target(&w, lex)?);
                }
            }
            _ => anyhow::bail!("invalid buildspec near `{:?}`", t.kind),
        }
    }

    match meta {
        Some(mut m) => {
            if !op.targets.is_empty() {
                anyhow::bail!(
                    "meta-operation `{}` mixes operations and bare targets",
                    name
                );
            }
            if m.ops.is_empty() {
                m.ops.push(OpSpec::default());
            }
            Ok(Group::Meta(m))
        }
        None => Ok(Group::Op(op)),
    }
}

/// A target word, possibly `src@target`.
fn parse_target(w: &str, lex: &mut Lexer) -> IResult<TargetSpec> {
    let n = parse_name(w, lex)?;

    let save = lex.mark();
    let t = lex.next_token()?;
    if t.kind == TokenKind::Pair {
        let tt = lex.next_token()?;
        match tt.kind {
            TokenKind::Word(rhs) => {
                // The left-hand side is the src_base directory.
                let src = if n.dir.is_empty() {
                    DirPath::new(&n.value)
                } else {
                    n.dir.clone()
                };
                let name = parse_name(&rhs, lex)?;
                return Ok(TargetSpec {
                    name,
                    src_base: Some(src),
                });
            }
            _ => anyhow::bail!("expected target after `@` in buildspec"),
        }
    }
    lex.reset(save);
    Ok(TargetSpec {
        name: n,
        src_base: None,
    })
}

/// Handles `type{...}` adjacency for buildspec target words.
fn parse_name(w: &str, lex: &mut Lexer) -> IResult<Name> {
    let save = lex.mark();
    let t = lex.next_token()?;
    if t.kind == TokenKind::LBrace && !t.sep {
        let inner = lex.next_token()?;
        let v = match inner.kind {
            TokenKind::Word(v) => v,
            TokenKind::RBrace => {
                return Ok(Name {
                    ty: w.to_string(),
                    ..Default::default()
                })
            }
            _ => anyhow::bail!("invalid target name in buildspec"),
        };
        let close = lex.next_token()?;
        if close.kind != TokenKind::RBrace {
            anyhow::bail!("expected `}}` in buildspec target");
        }
        let mut n = to_name(&v);
        n.ty = w.to_string();
        Ok(n)
    } else {
        lex.reset(save);
        Ok(to_name(w))
    }
}

fn push_op(meta: &mut MetaOpSpec, cur: &mut OpSpec, op: OpSpec) {
    if !cur.targets.is_empty() || !cur.name.is_empty() {
        meta.ops.push(std::mem::take(cur));
    }
    meta.ops.push(op);
}

fn close_meta(spec: &mut Buildspec, meta: &mut MetaOpSpec, cur: &mut OpSpec) {
    if !cur.targets.is_empty() || !cur.name.is_empty() {
        meta.ops.push(std::mem::take(cur));
    }
    if !meta.ops.is_empty() || !meta.name.is_empty() {
        spec.push(std::mem::take(meta));
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn specs(s: &str) -> Buildspec {
        parse_buildspec(&[s.to_string()]).unwrap()
    }

    #[test]
    fn empty_is_default() {
        let b = specs("");
        assert_eq!(b.len(), 1);
        assert_eq!(b[0].name, "");
        assert_eq!(b[0].ops.len(), 1);
        assert_eq!(b[0].ops[0].name, "");
        // Implicit dir{./}.
        assert_eq!(b[0].ops[0].targets[0].name.ty, "dir");
    }

    #[test]
    fn nested() {
        let b = specs("perform(update(./ hello/))");
        assert_eq!(b.len(), 1);
        assert_eq!(b[0].name, "perform");
        assert_eq!(b[0].ops.len(), 1);
        assert_eq!(b[0].ops[0].name, "update");
        assert_eq!(b[0].ops[0].targets.len(), 2);
    }

    #[test]
    fn single_level_group() {
        let b = specs("update(exe{hello})");
        assert_eq!(b.len(), 1);
        assert_eq!(b[0].name, "");
        assert_eq!(b[0].ops[0].name, "update");
        assert_eq!(b[0].ops[0].targets[0].name.ty, "exe");
        assert_eq!(b[0].ops[0].targets[0].name.value, "hello");
    }

    #[test]
    fn bare_targets() {
        let b = specs("hello/ world/");
        assert_eq!(b[0].ops[0].targets.len(), 2);
        assert!(b[0].ops[0].targets[0].name.directory());
    }

    #[test]
    fn src_base_pair() {
        let b = specs("configure(src/@out/)");
        let ts = &b[0].ops[0].targets[0];
        assert_eq!(ts.src_base.as_ref().unwrap().to_string(), "src/");
        assert!(ts.name.directory());
        assert_eq!(ts.name.dir.to_string(), "out/");
    }

    #[test]
    fn two_batches() {
        let b = specs("clean(./) update(./)");
        assert_eq!(b.len(), 1);
        assert_eq!(b[0].ops.len(), 2);
        assert_eq!(b[0].ops[0].name, "clean");
        assert_eq!(b[0].ops[1].name, "update");
    }
}
