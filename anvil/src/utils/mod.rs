pub use anyhow::Error;
pub type IResult<T> = anyhow::Result<T>;

mod hasher;
pub use hasher::StableHasher;

pub mod paths;

mod shell;
pub use shell::Shell;

/// Returns the user's home directory, if known.
pub fn home_dir() -> Option<std::path::PathBuf> {
    home::home_dir()
}

pub fn hash_u64<H: std::hash::Hash>(value: &H) -> u64 {
    let mut h = StableHasher::new();
    value.hash(&mut h);
    std::hash::Hasher::finish(&h)
}

pub fn to_hex(num: u64) -> String {
    const TABLE: &[u8] = b"0123456789abcdef";
    let mut b = Vec::new();
    for byte in num.to_le_bytes() {
        b.push(TABLE[(byte >> 4) as usize]);
        b.push(TABLE[(byte & 0xf) as usize]);
    }
    // SAFETY: Hex strings are always valid UTF-8
    unsafe { String::from_utf8_unchecked(b) }
}
