//! Parsing of VBoxManage's machine-readable output.
//!
//! `showvminfo --machinereadable` prints one `key=value` record per line.
//! Values, and some keys, are wrapped in a single layer of double quotes;
//! a few values (NAT rules) are themselves comma-separated records. Lines
//! without `=` are continuations of multi-line values and carry nothing we
//! track. Unknown keys are skipped so new VirtualBox releases keep working.
//!
//! `guestproperty enumerate` prints `<name> = '<value>' @ <timestamp>`.

use camino::Utf8PathBuf;
use chrono::{DateTime, FixedOffset};
use tracing::debug;

use crate::error::{Error, Result};
use crate::types::{NicType, VmDescriptor, VmState};

/// Strip one leading and one trailing `"`, and nothing else.
pub fn unquote(value: &str) -> &str {
    let value = value.strip_prefix('"').unwrap_or(value);
    value.strip_suffix('"').unwrap_or(value)
}

fn is_forwarding_key(key: &str) -> bool {
    key.strip_prefix("Forwarding(")
        .and_then(|rest| rest.strip_suffix(')'))
        .is_some_and(|idx| !idx.is_empty() && idx.bytes().all(|b| b.is_ascii_digit()))
}

/// Extract the host port from a NAT rule record
/// `name,proto,hostip,hostport,guestip,guestport`, if the record belongs to
/// `rule_name`.
fn forwarded_port(record: &str, rule_name: &str) -> Result<Option<u16>> {
    let fields: Vec<&str> = record.split(',').collect();
    if fields.first() != Some(&rule_name) {
        return Ok(None);
    }
    let malformed = |detail: String| Error::MalformedOutput {
        what: "showvminfo forwarding rule",
        detail,
    };
    if fields.len() < 3 {
        return Err(malformed(format!("too few fields in '{record}'")));
    }
    let port = fields[fields.len() - 3];
    port.parse::<u16>()
        .map(Some)
        .map_err(|_| malformed(format!("invalid host port '{port}' in '{record}'")))
}

/// Options controlling which keys are picked out of a dump.
#[derive(Debug, Clone, Copy)]
pub struct DumpKeys<'a> {
    /// Unquoted controller slot key of the primary disk.
    pub disk_slot: &'a str,
    /// Name of the forwarding rule whose host port becomes `ssh_port`.
    pub rule_name: &'a str,
}

/// Build a descriptor from a `showvminfo --machinereadable` dump.
///
/// Missing keys leave the corresponding fields empty.
pub fn parse_vm_info(dump: &str, keys: DumpKeys<'_>) -> Result<VmDescriptor> {
    let mut vm = VmDescriptor::default();
    for line in dump.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = unquote(key);
        let value = unquote(value.trim_end_matches('\r'));
        match key {
            "name" => vm.name = value.to_owned(),
            "UUID" => vm.id = value.to_owned(),
            "VMState" => vm.state = Some(VmState::from(value)),
            "memory" => vm.memory_mb = value.parse().ok(),
            "cpus" => vm.cpus = value.parse().ok(),
            "nic1" => vm.nic1 = value.parse::<NicType>().ok(),
            k if k == keys.disk_slot => {
                vm.disk_path = (value != "none" && !value.is_empty())
                    .then(|| Utf8PathBuf::from(value));
            }
            k if is_forwarding_key(k) => {
                if let Some(port) = forwarded_port(value, keys.rule_name)? {
                    vm.ssh_port = Some(port);
                }
            }
            _ => {}
        }
    }
    Ok(vm)
}

/// One entry of the guest property store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestProperty {
    /// Property path, e.g. `/VirtualBox/GuestInfo/Net/0/V4/IP`.
    pub name: String,
    /// Property value.
    pub value: String,
    /// When the guest last set it, if the timestamp could be parsed.
    pub timestamp: Option<DateTime<FixedOffset>>,
}

/// Parse a line of the form `<name> = '<value>' @ <timestamp>`.
///
/// Anything after the timestamp (VirtualBox 7 may append flags) is ignored.
pub fn parse_guest_property(line: &str) -> Result<GuestProperty> {
    let malformed = |detail: &str| Error::MalformedOutput {
        what: "guestproperty",
        detail: format!("{detail} in '{line}'"),
    };
    let (name, rest) = line
        .split_once(" = ")
        .ok_or_else(|| malformed("missing ' = '"))?;
    let rest = rest
        .strip_prefix('\'')
        .ok_or_else(|| malformed("value is not quoted"))?;
    let (value, tail) = rest
        .rsplit_once("' @ ")
        .ok_or_else(|| malformed("missing timestamp"))?;
    let stamp = tail.split_whitespace().next().unwrap_or_default();
    let timestamp = match DateTime::parse_from_rfc3339(stamp) {
        Ok(t) => Some(t),
        Err(e) => {
            debug!("Ignoring unparseable guest property timestamp '{stamp}': {e}");
            None
        }
    };
    Ok(GuestProperty {
        name: name.trim().to_owned(),
        value: value.to_owned(),
        timestamp,
    })
}

/// Find `name` in `guestproperty enumerate` output.
///
/// Empty output means the guest has not published the property yet.
pub fn find_guest_property(output: &str, name: &str) -> Result<Option<GuestProperty>> {
    for line in output.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let prop = parse_guest_property(line)?;
        if prop.name == name {
            return Ok(Some(prop));
        }
    }
    Ok(None)
}
