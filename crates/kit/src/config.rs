//! Controller configuration.

use std::ffi::OsString;
use std::ops::RangeInclusive;
use std::time::Duration;

use camino::Utf8PathBuf;

/// Default VBoxManage binary, looked up in `$PATH`.
pub const DEFAULT_VBOXMANAGE: &str = "VBoxManage";
/// Default guest customization tool.
pub const DEFAULT_CUSTOMIZE_TOOL: &str = "virt-sysprep";
/// Default name of the reserved SSH forwarding rule.
pub const DEFAULT_RULE_NAME: &str = "vboxkit_ssh_port_rule";
/// Default controller slot holding the primary disk of imported appliances.
pub const DEFAULT_DISK_SLOT: &str = "SATA Controller-0-0";
/// Lowest host port handed out for forwarding.
pub const DEFAULT_PORT_MIN: u16 = 7000;
/// Highest host port handed out for forwarding.
pub const DEFAULT_PORT_MAX: u16 = 8000;
/// Guest SSH port.
pub const DEFAULT_GUEST_SSH_PORT: u16 = 22;
/// Appliance imports can be slow; anything past this is considered hung.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(600);

/// Settings for a [`crate::VirtualBox`] controller.
#[derive(Debug, Clone)]
pub struct VBoxConfig {
    /// VBoxManage binary.
    pub vboxmanage: OsString,
    /// Tool invoked as `<tool> -a <image> --ssh-inject <user>:file:<key>`.
    pub customize_tool: OsString,
    /// Host ports eligible for forwarding, inclusive.
    pub port_range: RangeInclusive<u16>,
    /// Guest port targeted by the SSH forwarding rule.
    pub guest_ssh_port: u16,
    /// Name of the one forwarding rule this controller manages per VM.
    pub rule_name: String,
    /// `showvminfo` key (without quotes) whose value is the primary disk.
    pub disk_slot: String,
    /// Where scratch copies of disk images are made.
    pub scratch_dir: Utf8PathBuf,
    /// Kill external commands that run longer than this.
    pub command_timeout: Option<Duration>,
    /// Let the guest reach host loopback services through NAT after import.
    pub nat_localhost_reachable: bool,
}

impl Default for VBoxConfig {
    fn default() -> Self {
        let scratch_dir = Utf8PathBuf::from_path_buf(std::env::temp_dir())
            .unwrap_or_else(|_| Utf8PathBuf::from("/tmp"));
        Self {
            vboxmanage: DEFAULT_VBOXMANAGE.into(),
            customize_tool: DEFAULT_CUSTOMIZE_TOOL.into(),
            port_range: DEFAULT_PORT_MIN..=DEFAULT_PORT_MAX,
            guest_ssh_port: DEFAULT_GUEST_SSH_PORT,
            rule_name: DEFAULT_RULE_NAME.to_owned(),
            disk_slot: DEFAULT_DISK_SLOT.to_owned(),
            scratch_dir,
            command_timeout: Some(DEFAULT_COMMAND_TIMEOUT),
            nat_localhost_reachable: true,
        }
    }
}

impl VBoxConfig {
    /// Use a different VBoxManage binary.
    pub fn with_vboxmanage(mut self, program: impl Into<OsString>) -> Self {
        self.vboxmanage = program.into();
        self
    }

    /// Use a different guest customization tool.
    pub fn with_customize_tool(mut self, program: impl Into<OsString>) -> Self {
        self.customize_tool = program.into();
        self
    }

    /// Restrict forwarded host ports to `range`.
    pub fn with_port_range(mut self, range: RangeInclusive<u16>) -> Self {
        self.port_range = range;
        self
    }

    /// Make scratch copies in `dir`.
    pub fn with_scratch_dir(mut self, dir: impl Into<Utf8PathBuf>) -> Self {
        self.scratch_dir = dir.into();
        self
    }

    /// Change or disable the external command timeout.
    pub fn with_command_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Change the name of the managed forwarding rule.
    pub fn with_rule_name(mut self, name: impl Into<String>) -> Self {
        self.rule_name = name.into();
        self
    }

    /// Change the controller slot the disk image is read from.
    pub fn with_disk_slot(mut self, slot: impl Into<String>) -> Self {
        self.disk_slot = slot.into();
        self
    }
}
