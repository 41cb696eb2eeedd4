//! Finalizer token helpers.
//!
//! A record carrying a finalizer is not erased by the store when deletion is
//! requested; it only gains a deletion marker. The reconciler runs cleanup
//! and then drops its own token, after which the store completes removal.

/// Token the reconciler places on every Environment it manages.
pub const FINALIZER: &str = "finalizer.anareta.dev";

pub fn has(tokens: &[String], name: &str) -> bool {
    tokens.iter().any(|t| t == name)
}

/// Returns `tokens` without any occurrence of `name`, keeping order.
pub fn without(tokens: &[String], name: &str) -> Vec<String> {
    tokens.iter().filter(|t| *t != name).cloned().collect()
}

/// Returns `tokens` with `name` appended unless already present.
pub fn with(tokens: &[String], name: &str) -> Vec<String> {
    let mut out = tokens.to_vec();
    if !has(tokens, name) {
        out.push(name.to_string());
    }
    out
}
