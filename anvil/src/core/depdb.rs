use crate::utils::paths;
use crate::utils::IResult;
use filetime::FileTime;
use std::fs;
use std::path::{Path, PathBuf};

const MAGIC: &str = "anvil.depdb 1";

/// A per-target dependency database, stored next to the target as a `.d`
/// sidecar.
///
/// The protocol: open the database, then `expect` the lines that describe
/// the build (rule id and version, compiler checksum, target triplet,
/// options hash, input set). The first mismatching line switches the
/// database to writing: everything from that point on is recorded fresh
/// and the caller knows the target is out of date. After a successful
/// build, `close` persists the new contents.
pub struct DepDb {
    path: PathBuf,
    lines: Vec<String>,
    pos: usize,
    writing: bool,
    /// Database file mtime at open (nonexistent sentinel if absent).
    pub mtime: FileTime,
}

impl DepDb {
    pub fn open(path: impl Into<PathBuf>) -> DepDb {
        let path = path.into();
        let mtime = paths::mtime(&path);

        let mut lines = Vec::new();
        let mut writing = true;
        if let Ok(content) = fs::read_to_string(&path) {
            let mut it = content.lines();
            if it.next() == Some(MAGIC) {
                lines = it.map(|l| l.to_string()).collect();
                writing = false;
            }
        }

        DepDb {
            path,
            lines,
            pos: 0,
            writing,
            mtime,
        }
    }

    /// Still reading: all lines so far matched.
    pub fn reading(&self) -> bool {
        !self.writing
    }

    /// Reads the next line, or None once the database is exhausted or
    /// writing.
    pub fn read(&mut self) -> Option<String> {
        if self.writing || self.pos >= self.lines.len() {
            return None;
        }
        let l = self.lines[self.pos].clone();
        self.pos += 1;
        Some(l)
    }

    /// Compares the next line against the expected one. A mismatch (or an
    /// exhausted database) truncates and switches to writing, recording
    /// the expected line as the new content.
    pub fn expect(&mut self, line: &str) -> bool {
        if !self.writing && self.pos < self.lines.len() && self.lines[self.pos] == line {
            self.pos += 1;
            return true;
        }
        self.write(line);
        false
    }

    pub fn write(&mut self, line: &str) {
        if !self.writing {
            self.writing = true;
            self.lines.truncate(self.pos);
        }
        self.lines.push(line.to_string());
        self.pos += 1;
    }

    /// True when every expected line matched and nothing was left over.
    pub fn fresh(&self) -> bool {
        !self.writing && self.pos == self.lines.len()
    }

    /// The database is written before the recipe runs; the target after.
    /// A target older than its database means the build was interrupted
    /// between the two and cannot be trusted.
    pub fn verify_mtime(&self, target: &Path) -> bool {
        let tm = paths::mtime(target);
        if tm == paths::timestamp_nonexistent() {
            return false;
        }
        self.mtime == paths::timestamp_nonexistent() || self.mtime <= tm
    }

    /// Persists the contents if anything changed.
    pub fn close(&mut self) -> IResult<()> {
        if !self.writing {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            paths::create_dir_all(parent)?;
        }
        let mut content = String::with_capacity(64);
        content.push_str(MAGIC);
        content.push('\n');
        for l in self.lines.iter() {
            content.push_str(l);
            content.push('\n');
        }
        paths::write(&self.path, content)?;
        self.writing = false;
        Ok(())
    }

    pub fn remove(&self) -> IResult<bool> {
        paths::rmfile(&self.path)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.d");

        let mut db = DepDb::open(&path);
        assert!(!db.expect("rule: cc.compile 1"));
        assert!(!db.expect("checksum: abc"));
        db.close().unwrap();

        let mut db = DepDb::open(&path);
        assert!(db.expect("rule: cc.compile 1"));
        assert!(db.expect("checksum: abc"));
        assert!(db.fresh());

        // Any mismatching line forces a rebuild and rewrites the tail.
        let mut db = DepDb::open(&path);
        assert!(db.expect("rule: cc.compile 1"));
        assert!(!db.expect("checksum: xyz"));
        db.close().unwrap();

        let mut db = DepDb::open(&path);
        assert!(db.expect("rule: cc.compile 1"));
        assert!(db.expect("checksum: xyz"));
    }

    #[test]
    fn interrupted_build() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.d");
        let target = dir.path().join("x");

        std::fs::write(&target, "out").unwrap();
        let mut db = DepDb::open(&path);
        db.write("rule: test 1");
        db.close().unwrap();

        // The database is newer than the target: interrupted.
        let db = DepDb::open(&path);
        filetime::set_file_mtime(
            &target,
            FileTime::from_unix_time(db.mtime.unix_seconds() - 10, 0),
        )
        .unwrap();
        let db = DepDb::open(&path);
        assert!(!db.verify_mtime(&target));

        // Target newer than the database: fine.
        filetime::set_file_mtime(
            &target,
            FileTime::from_unix_time(db.mtime.unix_seconds() + 10, 0),
        )
        .unwrap();
        assert!(db.verify_mtime(&target));

        assert!(!db.verify_mtime(dir.path().join("missing").as_path()));
    }
}
