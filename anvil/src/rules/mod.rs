pub mod cc;

use crate::core::scope::ScopeId;
use crate::core::Context;
use crate::utils::IResult;

/// Loads a buildfile module (`using <name>`) into a project root. Loading
/// the same module twice is a no-op.
pub fn load_module(cx: &mut Context, root: ScopeId, name: &str) -> IResult<()> {
    let key = match name {
        "c" | "cxx" => "cc",
        n => n,
    };
    if !cx.scopes.get_mut(root).modules.insert(key.to_string()) {
        return Ok(());
    }
    match key {
        "cc" => cc::load(cx, root),
        // Configured values are handled by the core itself.
        "config" => Ok(()),
        _ => anyhow::bail!("unknown module `{}`", name),
    }
}
