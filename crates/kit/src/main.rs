//! vboxkit - manage VirtualBox VM lifecycles from the command line

use clap::{Parser, Subcommand};
use color_eyre::{Report, Result};
use tracing::instrument;
use vboxkit::VirtualBox;

mod commands;
mod utils;

#[derive(Parser)]
#[clap(version, about)]
struct Cli {
    #[clap(flatten)]
    global: commands::GlobalOpts,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Import an appliance as a new VM
    Create(commands::CreateOpts),
    /// Start a VM
    Start(commands::StartOpts),
    /// Power off a VM (not a graceful shutdown)
    Stop(commands::VmOpts),
    /// Unregister a VM and delete all of its files
    Destroy(commands::DestroyOpts),
    /// Show the current state of a VM
    Info(commands::VmOpts),
    /// Print the guest IPv4 address of a running VM
    Ip(commands::IpOpts),
    /// Reconfigure network interface 1
    SetNic(commands::SetNicOpts),
    /// Forward a free host port to a guest port
    ForwardPort(commands::ForwardPortOpts),
    /// Authorize an SSH public key inside a powered-off VM's disk
    InjectKey(commands::InjectKeyOpts),
    /// Create a VM, set up SSH access and start it
    ///
    /// If any step fails the new VM is unregistered and its disks deleted.
    /// A name that is already registered is refused up front.
    Provision(commands::ProvisionOpts),
}

fn install_tracing() {
    use tracing_error::ErrorLayer;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let fmt_layer = fmt::layer().with_target(false).with_writer(std::io::stderr);
    let filter_layer = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .with(ErrorLayer::default())
        .init();
}

#[instrument]
fn main() -> Result<(), Report> {
    install_tracing();
    color_eyre::install()?;

    let cli = Cli::parse();
    let vbox = VirtualBox::new(cli.global.to_config());

    match cli.command {
        Commands::Create(opts) => opts.run(&vbox)?,
        Commands::Start(opts) => opts.run(&vbox)?,
        Commands::Stop(opts) => opts.stop(&vbox)?,
        Commands::Destroy(opts) => opts.run(&vbox)?,
        Commands::Info(opts) => opts.info(&vbox)?,
        Commands::Ip(opts) => opts.run(&vbox)?,
        Commands::SetNic(opts) => opts.run(&vbox)?,
        Commands::ForwardPort(opts) => opts.run(&vbox)?,
        Commands::InjectKey(opts) => opts.run(&vbox)?,
        Commands::Provision(opts) => opts.run(&vbox)?,
    }
    Ok(())
}
