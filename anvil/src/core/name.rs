use crate::utils::paths::DirPath;
use std::fmt;

/// A name is what the engine operates on by default. Depending on the
/// context it is interpreted as a target or prerequisite name. A name
/// without a type and directory can represent any text; a name with a
/// directory and an empty value represents a directory.
///
/// A name may be qualified with a project. If `pair` is non-zero then this
/// name and the next one in a flat list form an `a@b` pair.
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct Name {
    pub proj: Option<String>,
    pub dir: DirPath,
    pub ty: String,
    pub value: String,
    pub pair: u8,
}

impl Name {
    pub fn simple_value(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            ..Default::default()
        }
    }

    pub fn from_dir(dir: DirPath) -> Self {
        Self {
            dir,
            ..Default::default()
        }
    }

    pub fn typed(ty: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            ty: ty.into(),
            value: value.into(),
            ..Default::default()
        }
    }

    pub fn qualified(&self) -> bool {
        self.proj.is_some()
    }

    pub fn is_typed(&self) -> bool {
        !self.ty.is_empty()
    }

    /// Empty directory and value. Note that an empty name is simple but
    /// not a directory.
    pub fn empty(&self) -> bool {
        self.dir.is_empty() && self.value.is_empty()
    }

    pub fn simple(&self) -> bool {
        !self.qualified() && !self.is_typed() && self.dir.is_empty()
    }

    pub fn directory(&self) -> bool {
        !self.qualified() && !self.is_typed() && !self.dir.is_empty() && self.value.is_empty()
    }
}

/// Store a string in a name in a reversible way. A trailing directory
/// separator marks a directory, `type{value}` marks a typed name and
/// `proj%value` a project-qualified one.
pub fn to_name(s: &str) -> Name {
    let mut n = Name::default();
    let mut rest = s;

    if let Some(i) = rest.find('%') {
        n.proj = Some(rest[..i].to_string());
        rest = &rest[i + 1..];
    }

    if let Some(i) = rest.find('{') {
        if rest.ends_with('}') {
            n.ty = rest[..i].to_string();
            rest = &rest[i + 1..rest.len() - 1];
        }
    }

    // Split a directory prefix off the value; a trailing separator means
    // the whole thing is a directory.
    if rest.ends_with('/') {
        n.dir = DirPath::new(rest);
    } else if let Some(i) = rest.rfind('/') {
        n.dir = DirPath::new(&rest[..i]);
        n.value = rest[i + 1..].to_string();
    } else {
        n.value = rest.to_string();
    }

    n
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(p) = &self.proj {
            write!(f, "{}%", p)?;
        }
        if self.is_typed() {
            write!(f, "{}{{", self.ty)?;
        }
        if !self.dir.is_empty() {
            write!(f, "{}", self.dir)?;
        }
        write!(f, "{}", self.value)?;
        if self.is_typed() {
            write!(f, "}}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn round_trip(s: &str) {
        assert_eq!(to_name(s).to_string(), s);
    }

    #[test]
    fn stringify() {
        round_trip("hello");
        round_trip("dir/");
        round_trip("exe{hello}");
        round_trip("exe{dir/hello}");
        round_trip("proj%exe{hello}");
        round_trip("proj%hello");
    }

    #[test]
    fn classify() {
        assert!(to_name("hello").simple());
        assert!(to_name("dir/").directory());
        assert!(!to_name("exe{hello}").simple());
        assert!(to_name("").simple());
        assert!(!to_name("").directory());
        let n = to_name("exe{sub/hello}");
        assert_eq!(n.ty, "exe");
        assert_eq!(n.dir.to_string(), "sub/");
        assert_eq!(n.value, "hello");
    }
}
