//! Bridge manager. Owns bridge VLANs on ports and static sticky FDB entries
//! on the downlink veth.

use thiserror::Error;

use crate::ordered_set::OrderedSet;
use crate::runner::CommandRunner;
use crate::types::{BridgeVlan, Fdb};

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Command(#[from] crate::runner::Error),
}

pub struct BridgeManager<R> {
    runner: R,
    bridge_name: String,
    downlink_veth: String,
    fdb_snapshot: Vec<serde_json::Value>,
    vlan_snapshot: Vec<serde_json::Value>,
    link_snapshot: Vec<serde_json::Value>,
    known_fdbs: OrderedSet<Fdb>,
    known_vlans: OrderedSet<BridgeVlan>,
}

impl<R: CommandRunner> BridgeManager<R> {
    pub fn new(runner: R, bridge_name: impl Into<String>, downlink_veth: impl Into<String>) -> Result<Self, Error> {
        let mut mgr = BridgeManager {
            runner,
            bridge_name: bridge_name.into(),
            downlink_veth: downlink_veth.into(),
            fdb_snapshot: Vec::new(),
            vlan_snapshot: Vec::new(),
            link_snapshot: Vec::new(),
            known_fdbs: OrderedSet::new(),
            known_vlans: OrderedSet::new(),
        };
        mgr.update()?;
        Ok(mgr)
    }

    pub fn update(&mut self) -> Result<(), Error> {
        self.fdb_snapshot = self
            .runner
            .run_json(&["bridge", "-j", "-d", "fdb", "show", "dev", &self.downlink_veth])
            .ok()
            .and_then(|v| v.as_array().cloned())
            .unwrap_or_default();
        self.vlan_snapshot = self
            .runner
            .run_json(&["bridge", "-j", "-d", "vlan", "show"])?
            .as_array()
            .cloned()
            .unwrap_or_default();
        self.link_snapshot = self
            .runner
            .run_json(&["bridge", "-j", "-d", "link", "show"])?
            .as_array()
            .cloned()
            .unwrap_or_default();
        Ok(())
    }

    /// Ensures a static sticky FDB entry for `fdb` on the downlink veth.
    pub fn ensure_fdb(&mut self, fdb: Fdb) -> Result<(), Error> {
        let already_present = self.fdb_snapshot.iter().any(|entry| {
            let mac = entry.get("mac").and_then(|v| v.as_str());
            let vlan = entry.get("vlan").and_then(|v| v.as_u64());
            let flags = entry.get("flags").and_then(|v| v.as_array());
            let sticky_or_extern = flags
                .map(|f| {
                    let strs: Vec<&str> = f.iter().filter_map(|x| x.as_str()).collect();
                    strs == ["sticky"] || strs == ["extern_learn", "sticky"]
                })
                .unwrap_or(false);
            let master = entry.get("master").and_then(|v| v.as_str());
            let state = entry.get("state").and_then(|v| v.as_str());

            mac == Some(fdb.mac.as_str())
                && vlan == Some(fdb.vid as u64)
                && sticky_or_extern
                && master == Some(self.bridge_name.as_str())
                && state == Some("static")
        });

        self.known_fdbs.insert(fdb.clone());

        if already_present {
            return Ok(());
        }

        tracing::warn!(mac = %fdb.mac, vid = fdb.vid, "adding static sticky FDB entry");
        self.runner.run(
            &[
                "bridge",
                "fdb",
                "replace",
                &fdb.mac,
                "dev",
                &self.downlink_veth,
                "master",
                "vlan",
                &fdb.vid.to_string(),
                "static",
                "sticky",
            ],
            crate::runner::RunOpts::checked(),
        )?;
        Ok(())
    }

    /// Ensures `vlan` is present on `vlan.device`.
    pub fn ensure_vlan(&mut self, vlan: BridgeVlan) -> Result<(), Error> {
        let present = self.vlan_snapshot.iter().any(|port| {
            port.get("ifname").and_then(|v| v.as_str()) == Some(vlan.device.as_str())
                && port
                    .get("vlans")
                    .and_then(|v| v.as_array())
                    .map(|vlans| vlans.iter().any(|v| v.get("vlan").and_then(|x| x.as_u64()) == Some(vlan.vid as u64)))
                    .unwrap_or(false)
        });

        let is_self = vlan.device == self.bridge_name;
        self.known_vlans.insert(vlan.clone());

        if present {
            return Ok(());
        }

        tracing::warn!(device = %vlan.device, vid = vlan.vid, tagged = vlan.tagged, "adding bridge VLAN");
        let vid_str = vlan.vid.to_string();
        let mut args: Vec<&str> = vec!["bridge", "vlan", "add", "dev", &vlan.device, "vid", &vid_str];
        if !vlan.tagged {
            args.push("pvid");
            args.push("untagged");
        }
        if is_self {
            args.push("self");
        }
        self.runner.run(&args, crate::runner::RunOpts::checked())?;
        Ok(())
    }

    /// Prune order is load-bearing: FDBs must go before VLANs.
    pub fn prune(&mut self) -> Result<(), Error> {
        for entry in self.fdb_snapshot.clone() {
            if entry.get("state").and_then(|v| v.as_str()) != Some("static") {
                continue;
            }
            let mac = entry.get("mac").and_then(|v| v.as_str()).unwrap_or_default().to_string();
            let vid = entry.get("vlan").and_then(|v| v.as_u64()).unwrap_or_default() as u16;
            if self.known_fdbs.contains(&Fdb { mac: mac.clone(), vid }) {
                continue;
            }
            tracing::warn!(mac = %mac, vid, "removing orphaned FDB entry");
            self.runner.run(
                &["bridge", "fdb", "del", &mac, "dev", &self.downlink_veth, "master", "vlan", &vid.to_string()],
                crate::runner::RunOpts::checked(),
            )?;
        }

        for port in self.vlan_snapshot.clone() {
            let ifname = port.get("ifname").and_then(|v| v.as_str()).unwrap_or_default().to_string();
            let is_evpn_bridge = ifname == self.bridge_name;
            let is_evpn_port = self
                .link_snapshot
                .iter()
                .any(|l| l.get("ifname").and_then(|v| v.as_str()) == Some(ifname.as_str()) && l.get("master").and_then(|v| v.as_str()) == Some(self.bridge_name.as_str()));

            if !is_evpn_bridge && !is_evpn_port {
                tracing::debug!(device = %ifname, "ignoring VLANs, not part of EVPN bridge");
                continue;
            }

            let vlans = port.get("vlans").and_then(|v| v.as_array()).cloned().unwrap_or_default();
            for v in vlans {
                let vid = v.get("vlan").and_then(|v| v.as_u64()).unwrap_or_default() as u16;
                let known = self.known_vlans.iter().any(|kv| kv.device == ifname && kv.vid == vid);
                if known {
                    continue;
                }
                tracing::warn!(device = %ifname, vid, "removing orphaned bridge VLAN");
                let mut args: Vec<&str> = vec!["bridge", "vlan", "del", "dev", &ifname, "vid"];
                let vid_str = vid.to_string();
                args.push(&vid_str);
                if is_evpn_bridge {
                    args.push("self");
                }
                self.runner.run(&args, crate::runner::RunOpts::checked())?;
            }
        }

        Ok(())
    }

    pub fn finalise(&mut self) -> Result<(), Error> {
        self.prune()?;
        self.update()?;
        self.known_fdbs.clear();
        self.known_vlans.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::mocks::RecordingRunner;

    fn new_mgr(runner: &RecordingRunner) -> BridgeManager<&RecordingRunner> {
        BridgeManager::new(runner, "br-evpn", "veth-to-ovs").unwrap()
    }

    #[test]
    fn ensure_fdb_accepts_extern_learn_sticky() {
        let runner = RecordingRunner::new();
        runner.push_response(
            r#"[{"mac":"aa:bb:cc:dd:ee:ff","vlan":100,"flags":["extern_learn","sticky"],"master":"br-evpn","state":"static"}]"#,
        );
        runner.push_response("[]");
        runner.push_response("[]");
        let mut mgr = new_mgr(&runner);

        mgr.ensure_fdb(Fdb { mac: "aa:bb:cc:dd:ee:ff".to_string(), vid: 100 }).unwrap();
        assert!(runner.calls_matching(&["bridge", "fdb", "replace"]).is_empty());
    }

    #[test]
    fn prune_orders_fdb_deletes_before_vlan_deletes() {
        let runner = RecordingRunner::new();
        runner.push_response(r#"[{"mac":"aa:bb:cc:dd:ee:ff","vlan":100,"flags":["sticky"],"master":"br-evpn","state":"static"}]"#);
        runner.push_response(r#"[{"ifname":"br-evpn","vlans":[{"vlan":100}]}]"#);
        runner.push_response(r#"[{"ifname":"br-evpn","master":null}]"#);
        let mut mgr = new_mgr(&runner);

        mgr.prune().unwrap();

        let invocations = runner.invocations();
        let fdb_del_idx = invocations.iter().position(|i| i.args.starts_with(&["bridge".into(), "fdb".into(), "del".into()]));
        let vlan_del_idx = invocations.iter().position(|i| i.args.starts_with(&["bridge".into(), "vlan".into(), "del".into()]));
        assert!(fdb_del_idx.unwrap() < vlan_del_idx.unwrap());
    }

    #[test]
    fn vlan_prune_skips_ports_not_on_evpn_bridge() {
        let runner = RecordingRunner::new();
        runner.push_response("[]");
        runner.push_response(r#"[{"ifname":"irb-200","vlans":[{"vlan":1}]}]"#);
        runner.push_response(r#"[{"ifname":"irb-200","master":"vrf-200"}]"#);
        let mut mgr = new_mgr(&runner);

        mgr.prune().unwrap();
        assert!(runner.calls_matching(&["bridge", "vlan", "del"]).is_empty());
    }
}
