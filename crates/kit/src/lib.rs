//! vboxkit library - drive VirtualBox VMs through VBoxManage
//!
//! [`VirtualBox`] is the entry point. It runs VBoxManage (and, for SSH key
//! injection, a guest customization tool) through a [`Runner`], parses the
//! machine-readable output, and hands back a fresh [`VmDescriptor`] after
//! every operation.

pub mod config;
pub mod error;
pub mod hostexec;
pub mod machinereadable;
pub mod portfwd;
pub mod provision;
pub mod sshcred;
pub mod types;
pub mod validate;
pub mod vm;

pub use config::VBoxConfig;
pub use error::{Diagnostic, Diagnostics, Error, InjectStage, Result};
pub use hostexec::{CommandOutput, ProcessRunner, Runner};
pub use provision::{ProvisionRequest, SshAccess};
pub use types::{BootMode, CreateRequest, NicSpec, NicType, PortForwardRule, VmDescriptor, VmState};
pub use vm::VirtualBox;
