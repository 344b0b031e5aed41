//! Boundary validation for identifiers and recipe names.
//!
//! Every `task_id`, agent name, and hostname crosses a trust boundary twice:
//! once when it arrives from the task service and once inside the supervisor
//! process. Both sides call into this module before the value reaches the
//! filesystem or a subprocess argument vector.

use crate::error::CoreError;
use std::path::{Component, Path, PathBuf};

pub const MAX_IDENT_LEN: usize = 64;
pub const MAX_HOST_LEN: usize = 255;

/// `^[A-Za-z0-9_-]{1,64}$`
pub fn is_valid_ident(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= MAX_IDENT_LEN
        && s.bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

pub fn validate_ident(kind: &'static str, value: &str) -> Result<(), CoreError> {
    if is_valid_ident(value) {
        Ok(())
    } else {
        Err(CoreError::InvalidIdent {
            kind,
            value: value.to_string(),
        })
    }
}

/// Hostnames additionally allow dots.
pub fn validate_host(value: &str) -> Result<(), CoreError> {
    let ok = !value.is_empty()
        && value.len() <= MAX_HOST_LEN
        && value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-' || b == b'.');
    if ok {
        Ok(())
    } else {
        Err(CoreError::InvalidIdent {
            kind: "host",
            value: value.to_string(),
        })
    }
}

/// A recipe name is a relative `.yaml`/`.yml` path with no parent traversal
/// and no characters that could be meaningful to a shell.
pub fn validate_recipe_name(name: &str) -> Result<(), CoreError> {
    let invalid = || CoreError::InvalidIdent {
        kind: "recipe",
        value: name.to_string(),
    };

    if name.is_empty() || name.len() > 4096 {
        return Err(invalid());
    }
    if !name
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.' | b'/'))
    {
        return Err(invalid());
    }
    if !(name.ends_with(".yaml") || name.ends_with(".yml")) {
        return Err(invalid());
    }

    let path = Path::new(name);
    if path.is_absolute() {
        return Err(invalid());
    }
    for component in path.components() {
        match component {
            Component::Normal(_) => {}
            _ => return Err(invalid()),
        }
    }
    Ok(())
}

/// Resolve a validated recipe name under `recipes_dir` and require the
/// resolved path to remain strictly inside it. The recipe file must exist.
pub fn resolve_recipe(recipes_dir: &Path, name: &str) -> Result<PathBuf, CoreError> {
    validate_recipe_name(name)?;
    let base = recipes_dir.canonicalize()?;
    let resolved = base.join(name).canonicalize()?;
    if !resolved.starts_with(&base) {
        return Err(CoreError::PathEscape {
            base,
            path: resolved,
        });
    }
    Ok(resolved)
}
