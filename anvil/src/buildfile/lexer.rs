use crate::utils::IResult;
use memchr::memchr;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TokenKind {
    Word(String),
    Colon,
    Assign,
    Append,
    Prepend,
    LBrace,
    RBrace,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Pair,
    Newline,
    Eof,
}

#[derive(Clone, Debug)]
pub struct Token {
    pub kind: TokenKind,
    /// Whitespace separated this token from the previous one. Used to
    /// tell `exe{...}` from `exe {...}`.
    pub sep: bool,
    pub line: u64,
    pub column: u64,
}

/// A saved lexer position, for re-scanning blocks (`for` bodies).
#[derive(Clone, Copy, Debug)]
pub struct Mark {
    pos: usize,
    line: u64,
    column: u64,
}

/// Line-oriented tokenizer for buildfiles and buildspecs.
pub struct Lexer {
    src: Vec<u8>,
    name: String,
    pos: usize,
    line: u64,
    column: u64,
}

impl Lexer {
    pub fn new(src: impl Into<Vec<u8>>, name: impl Into<String>) -> Self {
        Self {
            src: src.into(),
            name: name.into(),
            pos: 0,
            line: 1,
            column: 1,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mark(&self) -> Mark {
        Mark {
            pos: self.pos,
            line: self.line,
            column: self.column,
        }
    }

    pub fn reset(&mut self, m: Mark) {
        self.pos = m.pos;
        self.line = m.line;
        self.column = m.column;
    }

    fn bump(&mut self) -> Option<u8> {
        let c = *self.src.get(self.pos)?;
        self.pos += 1;
        if c == b'\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn peek2(&self) -> Option<u8> {
        self.src.get(self.pos + 1).copied()
    }

    pub fn next_token(&mut self) -> IResult<Token> {
        let mut sep = false;

        loop {
            match self.peek() {
                Some(b' ') | Some(b'\t') => {
                    sep = true;
                    self.bump();
                }
                Some(b'\\') if self.peek2() == Some(b'\n') => {
                    // Line continuation.
                    sep = true;
                    self.bump();
                    self.bump();
                }
                Some(b'#') => {
                    // Comment to end of line.
                    match memchr(b'\n', &self.src[self.pos..]) {
                        Some(i) => {
                            for _ in 0..i {
                                self.bump();
                            }
                        }
                        None => {
                            self.pos = self.src.len();
                        }
                    }
                }
                _ => break,
            }
        }

        let (line, column) = (self.line, self.column);
        let tok = |kind| Token {
            kind,
            sep,
            line,
            column,
        };

        let c = match self.peek() {
            None => return Ok(tok(TokenKind::Eof)),
            Some(c) => c,
        };

        match c {
            b'\n' => {
                self.bump();
                Ok(tok(TokenKind::Newline))
            }
            b':' => {
                self.bump();
                Ok(tok(TokenKind::Colon))
            }
            b'{' => {
                self.bump();
                Ok(tok(TokenKind::LBrace))
            }
            b'}' => {
                self.bump();
                Ok(tok(TokenKind::RBrace))
            }
            b'(' => {
                self.bump();
                Ok(tok(TokenKind::LParen))
            }
            b')' => {
                self.bump();
                Ok(tok(TokenKind::RParen))
            }
            b'[' => {
                self.bump();
                Ok(tok(TokenKind::LBracket))
            }
            b']' => {
                self.bump();
                Ok(tok(TokenKind::RBracket))
            }
            b'@' => {
                self.bump();
                Ok(tok(TokenKind::Pair))
            }
            b'=' => {
                self.bump();
                if self.peek() == Some(b'+') {
                    self.bump();
                    Ok(tok(TokenKind::Prepend))
                } else {
                    Ok(tok(TokenKind::Assign))
                }
            }
            b'+' if self.peek2() == Some(b'=') => {
                self.bump();
                self.bump();
                Ok(tok(TokenKind::Append))
            }
            _ => self.word(tok),
        }
    }

    fn word(&mut self, tok: impl FnOnce(TokenKind) -> Token) -> IResult<Token> {
        let mut w = Vec::new();
        loop {
            let c = match self.peek() {
                None => break,
                Some(c) => c,
            };
            match c {
                b' ' | b'\t' | b'\n' | b'#' | b':' | b'{' | b'}' | b'(' | b')' | b'[' | b']'
                | b'@' | b'=' => break,
                b'+' if self.peek2() == Some(b'=') => break,
                b'"' | b'\'' => {
                    let quote = c;
                    self.bump();
                    loop {
                        match self.bump() {
                            None => anyhow::bail!(
                                "{}:{}: unterminated quote",
                                self.name,
                                self.line
                            ),
                            Some(c) if c == quote => break,
                            Some(b'\\') if quote == b'"' => {
                                if let Some(e) = self.bump() {
                                    w.push(e);
                                }
                            }
                            Some(c) => w.push(c),
                        }
                    }
                }
                _ => {
                    w.push(c);
                    self.bump();
                }
            }
        }
        let s = String::from_utf8(w)
            .map_err(|_| anyhow::anyhow!("{}: invalid UTF-8 in buildfile", self.name))?;
        Ok(tok(TokenKind::Word(s)))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn lex(src: &str) -> Vec<TokenKind> {
        let mut l = Lexer::new(src, "<test>");
        let mut r = Vec::new();
        loop {
            let t = l.next_token().unwrap();
            let end = t.kind == TokenKind::Eof;
            r.push(t.kind);
            if end {
                break;
            }
        }
        r
    }

    fn word(s: &str) -> TokenKind {
        TokenKind::Word(s.to_string())
    }

    #[test]
    fn assignment_forms() {
        assert_eq!(
            lex("x = a b"),
            vec![
                word("x"),
                TokenKind::Assign,
                word("a"),
                word("b"),
                TokenKind::Eof
            ]
        );
        assert_eq!(
            lex("x += a"),
            vec![word("x"), TokenKind::Append, word("a"), TokenKind::Eof]
        );
        assert_eq!(
            lex("x =+ a"),
            vec![word("x"), TokenKind::Prepend, word("a"), TokenKind::Eof]
        );
    }

    #[test]
    fn target_declaration() {
        assert_eq!(
            lex("exe{hello}: cxx{hello}"),
            vec![
                word("exe"),
                TokenKind::LBrace,
                word("hello"),
                TokenKind::RBrace,
                TokenKind::Colon,
                word("cxx"),
                TokenKind::LBrace,
                word("hello"),
                TokenKind::RBrace,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn separation() {
        let mut l = Lexer::new("exe{x} exe {y}", "<test>");
        let mut toks = Vec::new();
        loop {
            let t = l.next_token().unwrap();
            if t.kind == TokenKind::Eof {
                break;
            }
            toks.push(t);
        }
        // `exe{x}`: no separation before the brace; `exe {y}`: separated.
        assert!(!toks[1].sep);
        assert!(toks[5].sep);
    }

    #[test]
    fn comments_and_quotes() {
        assert_eq!(
            lex("x = 'a b' # trailing\ny"),
            vec![
                word("x"),
                TokenKind::Assign,
                word("a b"),
                TokenKind::Newline,
                word("y"),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn pair_marker() {
        assert_eq!(
            lex("src/@out/"),
            vec![word("src/"), TokenKind::Pair, word("out/"), TokenKind::Eof]
        );
    }
}
