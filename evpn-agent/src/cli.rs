//! Command-line flags layered on top of the INI config file.

use std::path::PathBuf;

use clap::Parser;

/// Per-hypervisor control-plane agent realising EVPN/VXLAN overlay networks.
#[derive(Clone, Debug, Parser)]
#[command(version)]
pub struct Cli {
    /// Path to the agent's INI configuration file.
    #[arg(short = 'c', long, default_value = "/etc/evpn-agent/evpn-agent.ini")]
    pub config_file: PathBuf,

    /// Path to a JSON inventory snapshot, used in place of a live database
    /// adapter (none ships with this crate).
    #[arg(long, default_value = "/etc/evpn-agent/inventory.json")]
    pub inventory_file: PathBuf,

    /// Path to the routing daemon's base configuration file.
    #[arg(long, default_value = "/etc/frr/frr.conf")]
    pub frr_config_file: PathBuf,

    /// Run a single reconciliation iteration and exit.
    #[arg(short = '1', long)]
    pub oneshot: bool,

    /// Force DEBUG-level logging, overriding the config file.
    #[arg(short, long)]
    pub debug: bool,

    /// Force INFO-level logging, overriding the config file (ignored if `--debug` is also set).
    #[arg(short, long)]
    pub verbose: bool,
}

pub fn parse() -> Cli {
    Cli::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_with_no_arguments() {
        let cli = Cli::try_parse_from(["evpn-agentd"]).unwrap();
        assert!(!cli.oneshot);
        assert!(!cli.debug);
        assert_eq!(cli.config_file, PathBuf::from("/etc/evpn-agent/evpn-agent.ini"));
    }

    #[test]
    fn short_flags_set_their_fields() {
        let cli = Cli::try_parse_from(["evpn-agentd", "-1", "-d"]).unwrap();
        assert!(cli.oneshot);
        assert!(cli.debug);
    }
}
