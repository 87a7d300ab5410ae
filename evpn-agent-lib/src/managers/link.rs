//! Link manager. Owns L2/L3 interfaces: bridges, veth pairs, VLAN
//! sub-interfaces, VXLANs, VRFs.

use thiserror::Error;

use crate::ordered_set::OrderedSet;
use crate::runner::CommandRunner;
use crate::types::{Link, LinkKind};
use crate::value::{AttrValue, from_json};

const OWNED_PREFIXES: &[&str] = &["irb-", "l2vni-", "l3vni-", "vrf-"];

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Command(#[from] crate::runner::Error),
}

pub struct LinkManager<R> {
    runner: R,
    snapshot: Vec<serde_json::Value>,
    known: OrderedSet<String>,
}

impl<R: CommandRunner> LinkManager<R> {
    pub fn new(runner: R) -> Result<Self, Error> {
        let mut mgr = LinkManager {
            runner,
            snapshot: Vec::new(),
            known: OrderedSet::new(),
        };
        mgr.update()?;
        Ok(mgr)
    }

    pub fn update(&mut self) -> Result<(), Error> {
        let value = self.runner.run_json(&["ip", "-j", "-d", "link", "show"])?;
        self.snapshot = value.as_array().cloned().unwrap_or_default();
        Ok(())
    }

    pub fn list_names(&self) -> Vec<String> {
        self.snapshot
            .iter()
            .filter_map(|l| l.get("ifname").and_then(|v| v.as_str()).map(str::to_string))
            .collect()
    }

    pub fn get(&self, name: &str) -> Option<&serde_json::Value> {
        self.snapshot.iter().find(|l| l.get("ifname").and_then(|v| v.as_str()) == Some(name))
    }

    /// Ensures `desc` exists and matches its declared attributes. Issues the
    /// minimal set of `ip link add|set` commands needed to converge.
    pub fn ensure(&mut self, desc: &Link) -> Result<(), Error> {
        self.known.insert(desc.name.clone());

        if self.get(&desc.name).is_none() {
            self.create(desc)?;
            // Snapshot-freshness invariant: subsequent sync reads must see the
            // link that was just created.
            self.update()?;
        }

        self.sync_attrs(desc)?;

        let up = self
            .get(&desc.name)
            .and_then(|l| l.get("flags"))
            .and_then(|f| f.as_array())
            .map(|flags| flags.iter().any(|f| f.as_str() == Some("UP")))
            .unwrap_or(false);
        if !up {
            self.run(&["ip", "link", "set", &desc.name, "up"])?;
        }

        Ok(())
    }

    fn create(&mut self, desc: &Link) -> Result<(), Error> {
        let mut args: Vec<String> = vec!["ip".into(), "link".into(), "add".into(), "name".into(), desc.name.clone()];

        if desc.kind != LinkKind::Veth {
            if let Some(peer) = &desc.peer_name {
                args.push("link".into());
                args.push(peer.clone());
            }
        }

        for (k, v) in desc.link_attrs.iter() {
            // addrgenmode cannot be set at creation time; deferred to sync below.
            if k == "inet6_addr_gen_mode" {
                continue;
            }
            args.extend(link_attr_to_cmd(k, v));
        }

        args.push("type".into());
        args.push(desc.kind.as_str().into());

        if desc.kind == LinkKind::Veth {
            if let Some(peer) = &desc.peer_name {
                args.push("peer".into());
                args.push("name".into());
                args.push(peer.clone());
            }
        }

        for (k, v) in desc.type_attrs.iter() {
            args.extend(type_attr_to_cmd(k, v));
        }

        let args_ref: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run(&args_ref)?;
        Ok(())
    }

    fn sync_attrs(&mut self, desc: &Link) -> Result<(), Error> {
        // Re-fetch from the snapshot unconditionally rather than reusing a
        // binding captured before creation, which may now be stale.
        let link = match self.get(&desc.name) {
            Some(l) => l.clone(),
            None => return Ok(()),
        };

        let info_kind = link.pointer("/linkinfo/info_kind").and_then(|v| v.as_str());
        if info_kind != Some(desc.kind.as_str()) {
            tracing::error!(
                name = %desc.name,
                expected = desc.kind.as_str(),
                actual = ?info_kind,
                "link has the wrong kind; not auto-correcting"
            );
        }

        for (k, v) in desc.link_attrs.iter() {
            let current = link.get(k).and_then(from_json);
            if current.as_ref() != Some(v) {
                tracing::warn!(name = %desc.name, attr = %k, ?current, desired = %v, "updating link attribute");
                let mut args: Vec<String> = vec!["ip".into(), "link".into(), "set".into(), desc.name.clone()];
                args.extend(link_attr_to_cmd(k, v));
                let args_ref: Vec<&str> = args.iter().map(String::as_str).collect();
                self.run(&args_ref)?;
            }
        }

        for (k, v) in desc.type_attrs.iter() {
            let current = link.pointer("/linkinfo/info_data").and_then(|d| d.get(k)).and_then(from_json);
            if current.as_ref() != Some(v) {
                tracing::warn!(name = %desc.name, attr = %k, ?current, desired = %v, "updating type attribute");
                let mut args: Vec<String> =
                    vec!["ip".into(), "link".into(), "set".into(), desc.name.clone(), "type".into(), desc.kind.as_str().into()];
                args.extend(type_attr_to_cmd(k, v));
                let args_ref: Vec<&str> = args.iter().map(String::as_str).collect();
                self.run(&args_ref)?;
            }
        }

        for (k, v) in desc.bridge_slave_attrs.iter() {
            let current = link.pointer("/linkinfo/info_slave_data").and_then(|d| d.get(k)).and_then(from_json);
            if current.as_ref() != Some(v) {
                tracing::warn!(name = %desc.name, attr = %k, ?current, desired = %v, "updating bridge slave attribute");
                let mut args: Vec<String> =
                    vec!["ip".into(), "link".into(), "set".into(), desc.name.clone(), "type".into(), "bridge_slave".into()];
                args.extend(bridge_slave_attr_to_cmd(k, v));
                let args_ref: Vec<&str> = args.iter().map(String::as_str).collect();
                self.run(&args_ref)?;
            }
        }

        Ok(())
    }

    /// Deletes every snapshot link with an owned prefix that wasn't ensured
    /// this iteration.
    pub fn prune(&mut self) -> Result<(), Error> {
        for name in self.list_names() {
            if self.known.contains(&name) {
                continue;
            }
            if OWNED_PREFIXES.iter().any(|p| name.starts_with(p)) {
                tracing::warn!(name = %name, "removing orphaned link");
                self.run(&["ip", "link", "del", &name])?;
            }
        }
        Ok(())
    }

    pub fn finalise(&mut self) -> Result<(), Error> {
        self.prune()?;
        self.update()?;
        self.known.clear();
        Ok(())
    }

    fn run(&self, args: &[&str]) -> Result<(), Error> {
        self.runner.run(args, crate::runner::RunOpts::checked())?;
        Ok(())
    }
}

fn link_attr_to_cmd(attr: &str, val: &AttrValue) -> Vec<String> {
    let attr = match attr {
        "inet6_addr_gen_mode" => "addrgenmode",
        "ifalias" => "alias",
        other => other,
    };
    vec![attr.to_string(), val.to_string()]
}

fn type_attr_to_cmd(attr: &str, val: &AttrValue) -> Vec<String> {
    if attr == "learning" {
        return match val.as_bool() {
            Some(false) => vec!["nolearning".to_string()],
            Some(true) => vec!["learning".to_string()],
            None => vec![attr.to_string(), val.to_string()],
        };
    }
    if attr == "port" {
        return vec!["dstport".to_string(), val.to_string()];
    }
    vec![attr.to_string(), val.to_string()]
}

fn bridge_slave_attr_to_cmd(attr: &str, val: &AttrValue) -> Vec<String> {
    if matches!(attr, "learning" | "neigh_suppress") {
        if let Some(b) = val.as_bool() {
            return vec![attr.to_string(), if b { "on" } else { "off" }.to_string()];
        }
    }
    vec![attr.to_string(), val.to_string()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::mocks::RecordingRunner;

    fn empty_link_list() -> &'static str {
        "[]"
    }

    #[test]
    fn creates_bridge_when_absent() {
        let runner = RecordingRunner::new();
        runner.push_response(empty_link_list()); // initial update()
        let mut mgr = LinkManager::new(&runner).unwrap();

        runner.push_response(r#"[{"ifname":"br-evpn","flags":["UP"],"linkinfo":{"info_kind":"bridge","info_data":{}}}]"#);
        runner.push_response(r#"[{"ifname":"br-evpn","flags":["UP"],"linkinfo":{"info_kind":"bridge","info_data":{}}}]"#);

        let desc = Link::new("br-evpn", LinkKind::Bridge)
            .with_link_attr("address", "00:00:5e:00:01:00")
            .with_link_attr("mtu", 9216i64);
        mgr.ensure(&desc).unwrap();

        let adds = runner.calls_matching(&["ip", "link", "add"]);
        assert_eq!(adds.len(), 1);
        assert!(adds[0].args.contains(&"br-evpn".to_string()));
    }

    #[test]
    fn idempotent_when_link_matches_desired_state() {
        let runner = RecordingRunner::new();
        runner.push_response(
            r#"[{"ifname":"br-evpn","flags":["UP"],"address":"00:00:5e:00:01:00","mtu":9216,
                "linkinfo":{"info_kind":"bridge","info_data":{}}}]"#,
        );
        let mut mgr = LinkManager::new(&runner).unwrap();

        let desc = Link::new("br-evpn", LinkKind::Bridge)
            .with_link_attr("address", "00:00:5e:00:01:00")
            .with_link_attr("mtu", 9216i64);
        mgr.ensure(&desc).unwrap();

        assert!(runner.calls_matching(&["ip", "link", "add"]).is_empty());
        assert!(runner.calls_matching(&["ip", "link", "set"]).is_empty());
    }

    #[test]
    fn prune_only_removes_owned_prefixes() {
        let runner = RecordingRunner::new();
        runner.push_response(
            r#"[{"ifname":"irb-100","flags":["UP"],"linkinfo":{"info_kind":"vlan","info_data":{}}},
                {"ifname":"eth0","flags":["UP"],"linkinfo":{"info_kind":"device","info_data":{}}}]"#,
        );
        let mut mgr = LinkManager::new(&runner).unwrap();
        mgr.prune().unwrap();

        let dels = runner.calls_matching(&["ip", "link", "del"]);
        assert_eq!(dels.len(), 1);
        assert!(dels[0].args.contains(&"irb-100".to_string()));
    }

    #[test]
    fn kind_mismatch_is_logged_not_corrected() {
        let runner = RecordingRunner::new();
        runner.push_response(r#"[{"ifname":"vrf-100","flags":["UP"],"linkinfo":{"info_kind":"bridge","info_data":{}}}]"#);
        let mut mgr = LinkManager::new(&runner).unwrap();

        let desc = Link::new("vrf-100", LinkKind::Vrf);
        mgr.ensure(&desc).unwrap();
        // No type-level corrective command should be issued for the mismatch itself.
        assert!(runner.calls_matching(&["ip", "link", "set", "vrf-100", "type"]).is_empty());
    }
}
