use std::process::ExitCode;
use std::rc::Rc;
use std::thread;
use std::time::Duration;

use evpn_agent_lib::Driver;
use evpn_agent_lib::config::AgentConfig;
use evpn_agent_lib::runner::{CommandRunner, SystemRunner};

mod cli;
mod json_inventory;
mod logging;

fn main() -> ExitCode {
    let args = cli::parse();

    let mut config = match AgentConfig::load(&args.config_file.to_string_lossy()) {
        Ok(c) => c,
        Err(error) => {
            eprintln!("failed to load config from {}: {error}", args.config_file.display());
            return ExitCode::from(exitcode::CONFIG as u8);
        }
    };
    config.apply_cli_overrides(args.debug, args.verbose, args.oneshot);

    logging::init(&config.loglevel);

    let inventory = match json_inventory::load(&args.inventory_file) {
        Ok(inv) => inv,
        Err(error) => {
            tracing::error!(%error, path = %args.inventory_file.display(), "failed to load inventory snapshot");
            return ExitCode::from(exitcode::CONFIG as u8);
        }
    };

    let runner: Rc<dyn CommandRunner> = Rc::new(SystemRunner);
    let oneshot = config.oneshot;
    let interval = Duration::from_secs(config.interval);

    let mut driver = match Driver::new(runner, config, inventory, &args.frr_config_file.to_string_lossy()) {
        Ok(d) => d,
        Err(error) => {
            tracing::error!(%error, "failed to initialise driver");
            return ExitCode::from(exitcode::SOFTWARE as u8);
        }
    };

    loop {
        if let Err(error) = driver.run_iteration() {
            tracing::error!(%error, "reconciliation iteration failed, retrying next tick");
        }

        if oneshot {
            return ExitCode::from(exitcode::OK as u8);
        }

        thread::sleep(interval);
    }
}
