//! Value types shared between the controller, the parser and the CLI.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use camino::Utf8PathBuf;
use serde::{Serialize, Serializer};

/// Run state reported by `VMState` in the machine-readable dump.
///
/// Only [`VmState::Running`] matters operationally; the other values are kept
/// so callers can display what VirtualBox reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmState {
    /// `poweroff`
    PoweredOff,
    /// `running`
    Running,
    /// `paused`
    Paused,
    /// `saved`
    Saved,
    /// `aborted`
    Aborted,
    /// `starting`
    Starting,
    /// `stopping`
    Stopping,
    /// Any state this crate does not distinguish.
    Other(String),
}

impl VmState {
    /// The string VirtualBox uses for this state.
    pub fn as_str(&self) -> &str {
        match self {
            VmState::PoweredOff => "poweroff",
            VmState::Running => "running",
            VmState::Paused => "paused",
            VmState::Saved => "saved",
            VmState::Aborted => "aborted",
            VmState::Starting => "starting",
            VmState::Stopping => "stopping",
            VmState::Other(s) => s,
        }
    }
}

impl From<&str> for VmState {
    fn from(s: &str) -> Self {
        match s {
            "poweroff" => VmState::PoweredOff,
            "running" => VmState::Running,
            "paused" => VmState::Paused,
            "saved" => VmState::Saved,
            "aborted" => VmState::Aborted,
            "starting" => VmState::Starting,
            "stopping" => VmState::Stopping,
            other => VmState::Other(other.to_owned()),
        }
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for VmState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Snapshot of a VM as reported by VBoxManage at one point in time.
///
/// Never cached: every inspection builds a fresh one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VmDescriptor {
    /// UUID assigned by VirtualBox; stable for the life of the VM.
    pub id: String,
    /// Display name; may change, so it is not used as a key.
    pub name: String,
    /// Run state, if the dump carried one.
    pub state: Option<VmState>,
    /// Primary disk image.
    pub disk_path: Option<Utf8PathBuf>,
    /// Guest IPv4 address, only while running and once the guest reports it.
    pub ipv4: Option<Ipv4Addr>,
    /// Host port of the reserved SSH forwarding rule.
    pub ssh_port: Option<u16>,
    /// Configured memory in MiB.
    pub memory_mb: Option<u64>,
    /// Configured CPU count.
    pub cpus: Option<u32>,
    /// Attachment type of network interface 1.
    pub nic1: Option<NicType>,
}

impl VmDescriptor {
    /// Whether VirtualBox reports the VM as running.
    pub fn is_running(&self) -> bool {
        matches!(self.state, Some(VmState::Running))
    }

    /// The most specific handle for passing back to VBoxManage.
    pub fn handle(&self) -> &str {
        if self.id.is_empty() {
            &self.name
        } else {
            &self.id
        }
    }
}

/// Display/session strategy passed to `startvm --type`.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    strum::Display,
    strum::EnumString,
    clap::ValueEnum,
)]
#[strum(serialize_all = "lowercase")]
pub enum BootMode {
    /// Full graphical frontend.
    Gui,
    /// No display at all.
    #[default]
    Headless,
    /// Simple SDL-based window.
    Sdl,
    /// GUI in a separate process from the VM.
    Separate,
}

/// Attachment type for a network interface.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    strum::Display,
    strum::EnumString,
    clap::ValueEnum,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum NicType {
    /// Bridged to a host interface.
    Bridged,
    /// NAT through the VirtualBox engine.
    Nat,
    /// Host-only adapter.
    Hostonly,
    /// Host-only network.
    Hostonlynet,
    /// Generic driver.
    Generic,
    /// NAT network shared between VMs.
    Natnetwork,
}

impl NicType {
    /// The `modifyvm` flag naming what this interface attaches to, if the
    /// type has one.
    pub(crate) fn attachment_flag(self) -> Option<&'static str> {
        match self {
            NicType::Bridged => Some("--bridgeadapter1"),
            NicType::Hostonly => Some("--hostonlyadapter1"),
            NicType::Hostonlynet => Some("--host-only-net1"),
            NicType::Generic => Some("--nicgenericdrv1"),
            NicType::Natnetwork => Some("--nat-network1"),
            NicType::Nat => None,
        }
    }
}

/// Requested configuration for network interface 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NicSpec {
    /// Attachment type.
    pub kind: NicType,
    /// Host interface, adapter, network or driver name, depending on `kind`.
    pub attachment: Option<String>,
}

impl NicSpec {
    /// A NIC spec with no attachment name.
    pub fn new(kind: NicType) -> Self {
        Self {
            kind,
            attachment: None,
        }
    }

    /// Set the attachment name (e.g. the host interface for bridged mode).
    pub fn with_attachment(mut self, attachment: impl Into<String>) -> Self {
        self.attachment = Some(attachment.into());
        self
    }
}

/// A NAT port forwarding rule on interface 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortForwardRule {
    /// Rule name; re-adding a rule with the same name replaces it.
    pub name: String,
    /// Host loopback port.
    pub host_port: u16,
    /// Guest port.
    pub guest_port: u16,
}

impl PortForwardRule {
    /// Value for `modifyvm --natpf1`.
    pub(crate) fn to_natpf(&self) -> String {
        format!(
            "{},tcp,127.0.0.1,{},,{}",
            self.name, self.host_port, self.guest_port
        )
    }
}

/// Parameters for importing a new VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateRequest {
    /// Path or URL of the appliance to import.
    pub image: String,
    /// Name for the new VM.
    pub name: String,
    /// Memory in MiB.
    pub memory_mb: u64,
    /// Number of virtual CPUs.
    pub cpus: u32,
}

impl FromStr for VmState {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(VmState::from(s))
    }
}
