//! Key codec: maps the plain, versioned and user-versioned key spaces onto
//! one flat physical namespace.
//!
//! Layouts (`␟` is [`SEPARATOR`], U+001F):
//!
//! | Shape | Physical key |
//! |-------|--------------|
//! | plain | `key` |
//! | versioned | `key␟version` |
//! | user-versioned | `user␟version␟key` |
//!
//! No component may contain the separator, so a plain key holds none, a
//! versioned key exactly one and a user-versioned key exactly two. Imports go
//! through [`decode_exported`], which only accepts the plain and versioned
//! shapes under an application prefix.

use crate::storage::{StorageError, StorageResult};

/// Reserved separator between key components.
pub const SEPARATOR: char = '\u{1f}';

/// Separator of the layout written by earlier deployments.
pub const LEGACY_SEPARATOR: char = '_';

fn check_component(name: &str, value: &str) -> StorageResult<()> {
    if value.is_empty() {
        return Err(StorageError::Validation(format!("{} must not be empty", name)));
    }
    if value.contains(SEPARATOR) {
        return Err(StorageError::Validation(format!(
            "{} must not contain the reserved separator U+001F",
            name
        )));
    }
    Ok(())
}

pub fn encode_plain(key: &str) -> StorageResult<String> {
    check_component("key", key)?;
    if key == "." || key == ".." {
        return Err(StorageError::Validation(format!("key {:?} is reserved", key)));
    }
    Ok(key.to_string())
}

pub fn encode_versioned(key: &str, version: &str) -> StorageResult<String> {
    check_component("key", key)?;
    check_component("version", version)?;
    Ok(format!("{key}{SEPARATOR}{version}"))
}

pub fn encode_user_versioned(user_id: &str, version: &str, key: &str) -> StorageResult<String> {
    check_component("user id", user_id)?;
    check_component("version", version)?;
    check_component("key", key)?;
    Ok(format!("{user_id}{SEPARATOR}{version}{SEPARATOR}{key}"))
}

/// Strips the `␟version` suffix. Returns `physical` unchanged when the
/// suffix is absent.
pub fn decode_versioned<'a>(physical: &'a str, version: &str) -> &'a str {
    physical
        .strip_suffix(version)
        .and_then(|rest| rest.strip_suffix(SEPARATOR))
        .filter(|key| !key.is_empty())
        .unwrap_or(physical)
}

/// Strips the `user␟version␟` prefix. Returns `physical` unchanged when the
/// prefix is absent.
pub fn decode_user_versioned<'a>(physical: &'a str, user_id: &str, version: &str) -> &'a str {
    physical
        .strip_prefix(user_id)
        .and_then(|rest| rest.strip_prefix(SEPARATOR))
        .and_then(|rest| rest.strip_prefix(version))
        .and_then(|rest| rest.strip_prefix(SEPARATOR))
        .filter(|key| !key.is_empty())
        .unwrap_or(physical)
}

/// Splits a physical key on its first separator into `(version, key)`.
pub fn split_version_key(physical: &str) -> Option<(&str, &str)> {
    physical.split_once(SEPARATOR)
}

/// Splits an exported physical key into `(key, version)`.
///
/// Accepts only what an application export produces: a plain key, or a
/// versioned `key␟version`, in both cases starting with `app_prefix`.
pub fn decode_exported<'a>(
    app_prefix: &str,
    physical: &'a str,
) -> StorageResult<(&'a str, Option<&'a str>)> {
    if !physical.starts_with(app_prefix) {
        return Err(StorageError::Validation(format!(
            "imported key {:?} is outside {:?}",
            physical, app_prefix
        )));
    }
    match physical.split_once(SEPARATOR) {
        None => Ok((physical, None)),
        Some((key, version)) => {
            check_component("version", version)?;
            Ok((key, Some(version)))
        }
    }
}

/// Scopes a physical key to a deployment namespace.
pub fn namespaced(namespace: &str, physical: &str) -> String {
    format!("{namespace}{SEPARATOR}{physical}")
}

/// Removes the namespace added by [`namespaced`], or returns the input
/// unchanged.
pub fn strip_namespace<'a>(namespace: &str, physical: &'a str) -> &'a str {
    physical
        .strip_prefix(namespace)
        .and_then(|rest| rest.strip_prefix(SEPARATOR))
        .unwrap_or(physical)
}

/// Legacy version-before-key layout, `namespace_version_key`. Read-only.
pub fn legacy_versioned(namespace: &str, version: &str, key: &str) -> String {
    format!("{namespace}{LEGACY_SEPARATOR}{version}{LEGACY_SEPARATOR}{key}")
}

/// Inverse of [`legacy_versioned`], returning the input unchanged when the
/// legacy prefix is absent.
pub fn decode_legacy_versioned<'a>(physical: &'a str, namespace: &str, version: &str) -> &'a str {
    physical
        .strip_prefix(namespace)
        .and_then(|rest| rest.strip_prefix(LEGACY_SEPARATOR))
        .and_then(|rest| rest.strip_prefix(version))
        .and_then(|rest| rest.strip_prefix(LEGACY_SEPARATOR))
        .unwrap_or(physical)
}
