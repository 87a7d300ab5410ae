//! Neighbour manager. Owns permanent ARP/ND entries on IRB devices, tagged
//! with the agent's route-protocol id so unrelated kernel/daemon-learned
//! neighbours are never touched.

use thiserror::Error;

use crate::ordered_set::OrderedSet;
use crate::runner::CommandRunner;
use crate::types::Neighbour;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Command(#[from] crate::runner::Error),
}

pub struct NeighbourManager<R> {
    runner: R,
    protocol: String,
    snapshot: Vec<serde_json::Value>,
    known: OrderedSet<Neighbour>,
}

impl<R: CommandRunner> NeighbourManager<R> {
    pub fn new(runner: R, protocol: impl Into<String>) -> Result<Self, Error> {
        let mut mgr = NeighbourManager {
            runner,
            protocol: protocol.into(),
            snapshot: Vec::new(),
            known: OrderedSet::new(),
        };
        mgr.update()?;
        Ok(mgr)
    }

    pub fn update(&mut self) -> Result<(), Error> {
        let mut all = Vec::new();
        for family in ["-4", "-6"] {
            let entries = self
                .runner
                .run_json(&["ip", family, "-j", "neighbour", "show", "nud", "permanent"])?
                .as_array()
                .cloned()
                .unwrap_or_default();
            all.extend(entries);
        }
        self.snapshot = all;
        Ok(())
    }

    fn is_ours(entry: &serde_json::Value, protocol: &str) -> bool {
        entry.get("protocol").and_then(|v| v.as_str()) == Some(protocol)
    }

    pub fn ensure(&mut self, neigh: Neighbour) -> Result<(), Error> {
        let dst = neigh.dst.to_string();
        let present = self.snapshot.iter().any(|entry| {
            entry.get("dst").and_then(|v| v.as_str()) == Some(dst.as_str())
                && entry.get("dev").and_then(|v| v.as_str()) == Some(neigh.device.as_str())
                && entry.get("lladdr").and_then(|v| v.as_str()) == Some(neigh.lladdr.as_str())
        });

        self.known.insert(neigh.clone());

        if present {
            return Ok(());
        }

        tracing::warn!(dst = %dst, device = %neigh.device, lladdr = %neigh.lladdr, "adding permanent neighbour");
        self.runner.run(
            &[
                "ip",
                "neighbour",
                "replace",
                &dst,
                "lladdr",
                &neigh.lladdr,
                "dev",
                &neigh.device,
                "nud",
                "permanent",
                "protocol",
                &self.protocol,
            ],
            crate::runner::RunOpts::checked(),
        )?;
        Ok(())
    }

    /// Removes protocol-tagged permanent neighbours not ensured this
    /// iteration. Entries owned by other protocols (static config, other
    /// daemons) are never touched.
    pub fn prune(&mut self) -> Result<(), Error> {
        for entry in self.snapshot.clone() {
            if !Self::is_ours(&entry, &self.protocol) {
                continue;
            }
            let dst = entry.get("dst").and_then(|v| v.as_str()).unwrap_or_default().to_string();
            let dev = entry.get("dev").and_then(|v| v.as_str()).unwrap_or_default().to_string();
            let lladdr = entry.get("lladdr").and_then(|v| v.as_str()).unwrap_or_default().to_string();

            let known = self.known.iter().any(|k| k.dst.to_string() == dst && k.device == dev && k.lladdr == lladdr);
            if known {
                continue;
            }

            tracing::warn!(dst = %dst, device = %dev, "removing orphaned neighbour");
            self.runner.run(&["ip", "neighbour", "del", &dst, "dev", &dev], crate::runner::RunOpts::checked())?;
        }
        Ok(())
    }

    pub fn finalise(&mut self) -> Result<(), Error> {
        self.prune()?;
        self.update()?;
        self.known.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::mocks::RecordingRunner;

    fn new_mgr(runner: &RecordingRunner) -> NeighbourManager<&RecordingRunner> {
        NeighbourManager::new(runner, "186").unwrap()
    }

    #[test]
    fn ensure_skips_matching_entry() {
        let runner = RecordingRunner::new();
        runner.push_response(r#"[{"dst":"10.0.0.5","dev":"irb-100","lladdr":"aa:bb:cc:dd:ee:ff","protocol":"186"}]"#);
        runner.push_response("[]");
        let mut mgr = new_mgr(&runner);

        mgr.ensure(Neighbour {
            dst: "10.0.0.5".parse().unwrap(),
            device: "irb-100".to_string(),
            lladdr: "aa:bb:cc:dd:ee:ff".to_string(),
        })
        .unwrap();
        assert!(runner.calls_matching(&["ip", "neighbour", "replace"]).is_empty());
    }

    #[test]
    fn prune_ignores_entries_owned_by_other_protocols() {
        let runner = RecordingRunner::new();
        runner.push_response(r#"[{"dst":"10.0.0.9","dev":"irb-100","lladdr":"aa:bb:cc:dd:ee:ee","protocol":"static"}]"#);
        runner.push_response("[]");
        let mut mgr = new_mgr(&runner);

        mgr.prune().unwrap();
        assert!(runner.calls_matching(&["ip", "neighbour", "del"]).is_empty());
    }

    #[test]
    fn prune_removes_unknown_owned_entry() {
        let runner = RecordingRunner::new();
        runner.push_response(r#"[{"dst":"10.0.0.9","dev":"irb-100","lladdr":"aa:bb:cc:dd:ee:ee","protocol":"186"}]"#);
        runner.push_response("[]");
        let mut mgr = new_mgr(&runner);

        mgr.prune().unwrap();
        assert_eq!(runner.calls_matching(&["ip", "neighbour", "del"]).len(), 1);
    }
}
