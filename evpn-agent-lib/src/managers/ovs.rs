//! OVS manager. Ensures the downlink veth is attached to the integration
//! bridge. No snapshot/prune lifecycle: this is a single idempotent check
//! run once per iteration, never tagged or garbage-collected.

use thiserror::Error;

use crate::runner::CommandRunner;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Command(#[from] crate::runner::Error),
}

pub struct OvsManager<R> {
    runner: R,
    bridge: String,
    veth: String,
}

impl<R: CommandRunner> OvsManager<R> {
    pub fn new(runner: R, bridge: impl Into<String>, veth: impl Into<String>) -> Self {
        OvsManager {
            runner,
            bridge: bridge.into(),
            veth: veth.into(),
        }
    }

    pub fn ensure_veth(&mut self) -> Result<(), Error> {
        let stdout = self
            .runner
            .run(&["ovs-vsctl", "list-ports", &self.bridge], crate::runner::RunOpts::capture())?
            .unwrap_or_default();

        if stdout.lines().any(|l| l == self.veth) {
            return Ok(());
        }

        tracing::warn!(bridge = %self.bridge, veth = %self.veth, "adding veth to OVS bridge");
        self.runner
            .run(&["ovs-vsctl", "add-port", &self.bridge, &self.veth], crate::runner::RunOpts::checked())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::mocks::RecordingRunner;

    #[test]
    fn ensure_veth_skips_when_port_present() {
        let runner = RecordingRunner::new();
        runner.push_response("tap-other\nveth-to-ovs\n");
        let mut mgr = OvsManager::new(&runner, "br-int", "veth-to-ovs");

        mgr.ensure_veth().unwrap();
        assert!(runner.calls_matching(&["ovs-vsctl", "add-port"]).is_empty());
    }

    #[test]
    fn ensure_veth_adds_port_when_absent() {
        let runner = RecordingRunner::new();
        runner.push_response("tap-other\n");
        let mut mgr = OvsManager::new(&runner, "br-int", "veth-to-ovs");

        mgr.ensure_veth().unwrap();
        let adds = runner.calls_matching(&["ovs-vsctl", "add-port"]);
        assert_eq!(adds.len(), 1);
        assert!(adds[0].args.contains(&"veth-to-ovs".to_string()));
    }
}
