use crate::utils::IResult;
use anyhow::Context as _;
use filetime::FileTime;
use std::fmt;
use std::fs;
use std::path::{Component, Path, PathBuf};

/// Equivalent to [`std::fs::create_dir_all`] with better error messages.
pub fn create_dir_all(p: impl AsRef<Path>) -> IResult<()> {
    let path = p.as_ref();
    fs::create_dir_all(path)
        .with_context(|| format!("failed to create directory `{}`", path.display()))
}

/// Equivalent to [`std::fs::read_to_string`] with better error messages.
pub fn read_string(p: impl AsRef<Path>) -> IResult<String> {
    let path = p.as_ref();
    fs::read_to_string(path).with_context(|| format!("failed to read file `{}`", path.display()))
}

/// Equivalent to [`std::fs::write`] with better error messages.
pub fn write<P: AsRef<Path>, C: AsRef<[u8]>>(path: P, contents: C) -> IResult<()> {
    let path = path.as_ref();
    fs::write(path, contents.as_ref())
        .with_context(|| format!("failed to write `{}`", path.display()))
}

/// Removes a file if it exists. Returns true if something was removed.
pub fn rmfile(p: impl AsRef<Path>) -> IResult<bool> {
    let path = p.as_ref();
    if path.is_file() {
        fs::remove_file(path)
            .with_context(|| format!("failed to remove file `{}`", path.display()))?;
        Ok(true)
    } else {
        Ok(false)
    }
}

pub enum RmdirStatus {
    Success,
    NotExist,
    NotEmpty,
}

/// Removes a directory if it exists and is empty.
pub fn rmdir(p: impl AsRef<Path>) -> IResult<RmdirStatus> {
    let path = p.as_ref();
    if !path.is_dir() {
        return Ok(RmdirStatus::NotExist);
    }
    match fs::remove_dir(path) {
        Ok(()) => Ok(RmdirStatus::Success),
        Err(e) => {
            // Not-empty is reported differently across platforms; check the
            // directory contents instead of the error code.
            if fs::read_dir(path).map(|mut i| i.next().is_some()).unwrap_or(false) {
                Ok(RmdirStatus::NotEmpty)
            } else {
                Err(e).with_context(|| format!("failed to remove directory `{}`", path.display()))
            }
        }
    }
}

/// The "this file does not exist" timestamp sentinel. The "unknown"
/// sentinel is represented as the absence of a value.
pub fn timestamp_nonexistent() -> FileTime {
    FileTime::zero()
}

/// Returns the last modification time of a file, or the nonexistent
/// sentinel if there is no such file.
pub fn mtime(p: impl AsRef<Path>) -> FileTime {
    match fs::metadata(p.as_ref()) {
        Ok(meta) => FileTime::from_last_modification_time(&meta),
        Err(_) => timestamp_nonexistent(),
    }
}

/// Path normalization - like `canonicalize` but without using std::fs
pub fn normalize(p: impl AsRef<Path>) -> PathBuf {
    let path = p.as_ref();
    let mut out = PathBuf::new();
    for component in path.components() {
        let comp = component.as_os_str();
        if comp == "." {
            continue;
        } else if comp == ".." {
            out.pop();
        } else {
            out.push(comp)
        }
    }
    out
}

/// An always-normalized path with directory semantics. Stringifies with a
/// trailing separator, which is also how [`crate::core::Name`] marks
/// directory names.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct DirPath(PathBuf);

impl DirPath {
    pub fn new(p: impl Into<PathBuf>) -> Self {
        Self(normalize(p.into()))
    }

    /// The empty directory path. Used as the key of the global scope.
    pub fn empty() -> Self {
        Self(PathBuf::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.as_os_str().is_empty()
    }

    pub fn is_absolute(&self) -> bool {
        self.0.is_absolute()
    }

    pub fn as_path(&self) -> &Path {
        &self.0
    }

    pub fn into_path_buf(self) -> PathBuf {
        self.0
    }

    /// Appends a (relative) directory component.
    pub fn join(&self, p: impl AsRef<Path>) -> DirPath {
        DirPath::new(self.0.join(p.as_ref()))
    }

    /// As `join` but fails with an invalid-path error if the component is
    /// itself rooted.
    pub fn try_join(&self, p: impl AsRef<Path>) -> IResult<DirPath> {
        let p = p.as_ref();
        if p.components().next().map_or(false, |c| matches!(c, Component::RootDir | Component::Prefix(_))) {
            anyhow::bail!(crate::core::BuildError::InvalidPath {
                path: p.display().to_string(),
            });
        }
        Ok(self.join(p))
    }

    /// Appends a leaf (file) component.
    pub fn join_leaf(&self, p: impl AsRef<Path>) -> PathBuf {
        normalize(self.0.join(p.as_ref()))
    }

    pub fn parent(&self) -> Option<DirPath> {
        self.0.parent().map(|p| DirPath(p.to_path_buf()))
    }

    /// True if this directory is `other` or lies below it. The empty path
    /// contains everything.
    pub fn sub(&self, other: &DirPath) -> bool {
        other.is_empty() || self.0.starts_with(&other.0)
    }

    /// The path of this directory relative to an ancestor.
    pub fn leaf(&self, ancestor: &DirPath) -> IResult<PathBuf> {
        self.0
            .strip_prefix(&ancestor.0)
            .map(|p| p.to_path_buf())
            .map_err(|_| {
                anyhow::anyhow!(
                    "path `{}` is not a subdirectory of `{}`",
                    self,
                    ancestor
                )
            })
    }
}

impl fmt::Display for DirPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return Ok(());
        }
        let s = self.0.display().to_string();
        if s.ends_with(std::path::MAIN_SEPARATOR) {
            write!(f, "{}", s)
        } else {
            write!(f, "{}{}", s, std::path::MAIN_SEPARATOR)
        }
    }
}

impl fmt::Debug for DirPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn normalize_() {
        assert_eq!(PathBuf::from("a/b/c"), normalize("a/b/c"));
        assert_eq!(PathBuf::from("a/b/c/e"), normalize("a/b/c/./e"));
        assert_eq!(PathBuf::from("a/b/e"), normalize("a/b/c/../e"));
    }

    #[test]
    fn dir_path() {
        let d = DirPath::new("/tmp/x/./y/..");
        assert_eq!(d.as_path(), Path::new("/tmp/x"));
        assert_eq!(d.to_string(), "/tmp/x/");
        assert!(d.sub(&DirPath::new("/tmp")));
        assert!(!DirPath::new("/tmp").sub(&d));
        assert!(d.sub(&DirPath::empty()));
        assert_eq!(d.leaf(&DirPath::new("/tmp")).unwrap(), PathBuf::from("x"));
        assert!(d.try_join("/abs").is_err());
    }
}
