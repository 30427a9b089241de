//! Argument checks applied before anything reaches an external tool.
//!
//! VBoxManage and virt-sysprep both sub-parse some of their arguments
//! (comma-separated NAT rules, `user:file:path` selectors), so values that
//! would change the meaning of those records are rejected here.

use crate::error::{Error, Result};

fn invalid(field: &'static str, value: &str, reason: &'static str) -> Error {
    Error::InvalidArgument {
        field,
        value: value.to_owned(),
        reason,
    }
}

fn check_common(field: &'static str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(invalid(field, value, "must not be empty"));
    }
    if value.chars().any(char::is_control) {
        return Err(invalid(field, value, "must not contain control characters"));
    }
    Ok(())
}

/// A VM name, UUID, or image path/URL.
pub fn vm_ref(field: &'static str, value: &str) -> Result<()> {
    check_common(field, value)
}

/// A value embedded in a comma-separated VBoxManage record.
pub fn record_field(field: &'static str, value: &str) -> Result<()> {
    check_common(field, value)?;
    if value.contains(',') {
        return Err(invalid(field, value, "must not contain ','"));
    }
    Ok(())
}

/// A guest user name for `--ssh-inject`.
pub fn guest_user(value: &str) -> Result<()> {
    check_common("guest user", value)?;
    if value.contains(':') {
        return Err(invalid("guest user", value, "must not contain ':'"));
    }
    if value.chars().any(char::is_whitespace) {
        return Err(invalid("guest user", value, "must not contain whitespace"));
    }
    Ok(())
}

/// A path handed to the guest customization tool, which does not cope with
/// whitespace in paths.
pub fn tool_path(field: &'static str, value: &str) -> Result<()> {
    check_common(field, value)?;
    if value.chars().any(char::is_whitespace) {
        return Err(invalid(field, value, "must not contain whitespace"));
    }
    Ok(())
}
