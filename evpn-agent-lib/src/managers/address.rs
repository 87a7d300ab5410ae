//! Address manager. Owns IPv4/IPv6 addresses on IRB interfaces.

use thiserror::Error;

use crate::ordered_set::OrderedSet;
use crate::runner::CommandRunner;
use crate::types::Address;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Command(#[from] crate::runner::Error),
}

pub struct AddressManager<R> {
    runner: R,
    snapshot: Vec<serde_json::Value>,
    known: OrderedSet<Address>,
}

impl<R: CommandRunner> AddressManager<R> {
    pub fn new(runner: R) -> Result<Self, Error> {
        let mut mgr = AddressManager {
            runner,
            snapshot: Vec::new(),
            known: OrderedSet::new(),
        };
        mgr.update()?;
        Ok(mgr)
    }

    pub fn update(&mut self) -> Result<(), Error> {
        self.snapshot = self
            .runner
            .run_json(&["ip", "-j", "-d", "address", "show"])?
            .as_array()
            .cloned()
            .unwrap_or_default();
        Ok(())
    }

    /// Returns the first global-scope IPv4 address on `lo`, used as the VXLAN
    /// underlay source for L2VNI/L3VNI devices.
    pub fn primary_loopback_ipv4(&self) -> Option<std::net::Ipv4Addr> {
        let lo = self.snapshot.iter().find(|d| d.get("ifname").and_then(|v| v.as_str()) == Some("lo"))?;
        let addr_info = lo.get("addr_info").and_then(|v| v.as_array())?;
        for ai in addr_info {
            if ai.get("family").and_then(|v| v.as_str()) == Some("inet") && ai.get("scope").and_then(|v| v.as_str()) == Some("global") {
                if let Some(local) = ai.get("local").and_then(|v| v.as_str()) {
                    if let Ok(addr) = local.parse() {
                        return Some(addr);
                    }
                }
            }
        }
        None
    }

    pub fn ensure(&mut self, addr: Address) -> Result<(), Error> {
        let (local, prefixlen) = match addr.address {
            cidr::IpInet::V4(c) => (c.address().to_string(), c.network_length()),
            cidr::IpInet::V6(c) => (c.address().to_string(), c.network_length()),
        };

        let present = self.snapshot.iter().any(|dev| {
            dev.get("ifname").and_then(|v| v.as_str()) == Some(addr.device.as_str())
                && dev
                    .get("addr_info")
                    .and_then(|v| v.as_array())
                    .map(|ai| {
                        ai.iter().any(|a| {
                            a.get("local").and_then(|v| v.as_str()) == Some(local.as_str())
                                && a.get("prefixlen").and_then(|v| v.as_u64()) == Some(prefixlen as u64)
                        })
                    })
                    .unwrap_or(false)
        });

        self.known.insert(addr.clone());

        if present {
            return Ok(());
        }

        let cidr_str = addr.address.to_string();
        tracing::warn!(device = %addr.device, address = %cidr_str, "adding address");
        let mut args: Vec<&str> = vec!["ip", "address", "add", "dev", &addr.device, &cidr_str];
        if addr.is_ipv6() {
            args.push("nodad");
        }
        self.runner.run(&args, crate::runner::RunOpts::checked())?;
        Ok(())
    }

    /// Removes IRB-scoped addresses not ensured this iteration. IPv6
    /// link-locals are never pruned (or managed at all).
    pub fn prune(&mut self) -> Result<(), Error> {
        for dev in self.snapshot.clone() {
            let ifname = dev.get("ifname").and_then(|v| v.as_str()).unwrap_or_default().to_string();
            if !ifname.starts_with("irb-") {
                continue;
            }
            let addr_info = dev.get("addr_info").and_then(|v| v.as_array()).cloned().unwrap_or_default();
            for ai in addr_info {
                if ai.get("family").and_then(|v| v.as_str()) == Some("inet6") && ai.get("scope").and_then(|v| v.as_str()) == Some("link") {
                    continue;
                }
                let local = ai.get("local").and_then(|v| v.as_str()).unwrap_or_default();
                let prefixlen = ai.get("prefixlen").and_then(|v| v.as_u64()).unwrap_or_default();
                let cidr_str = format!("{local}/{prefixlen}");
                let known = self.known.iter().any(|k| k.device == ifname && k.address.to_string() == cidr_str);
                if known {
                    continue;
                }
                tracing::warn!(device = %ifname, address = %cidr_str, "removing orphan address");
                self.runner.run(&["ip", "address", "del", "dev", &ifname, &cidr_str], crate::runner::RunOpts::checked())?;
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::mocks::RecordingRunner;
    use std::str::FromStr;

    #[test]
    fn ensure_skips_when_already_present() {
        let runner = RecordingRunner::new();
        runner.push_response(r#"[{"ifname":"irb-100","addr_info":[{"family":"inet","local":"10.0.0.1","prefixlen":24}]}]"#);
        let mut mgr = AddressManager::new(&runner).unwrap();

        let addr = Address {
            device: "irb-100".to_string(),
            address: cidr::IpInet::from_str("10.0.0.1/24").unwrap(),
        };
        mgr.ensure(addr).unwrap();
        assert!(runner.calls_matching(&["ip", "address", "add"]).is_empty());
    }

    #[test]
    fn ensure_ipv6_adds_nodad() {
        let runner = RecordingRunner::new();
        runner.push_response("[]");
        let mut mgr = AddressManager::new(&runner).unwrap();

        let addr = Address {
            device: "irb-100".to_string(),
            address: cidr::IpInet::from_str("2001:db8::1/64").unwrap(),
        };
        mgr.ensure(addr).unwrap();
        let adds = runner.calls_matching(&["ip", "address", "add"]);
        assert_eq!(adds.len(), 1);
        assert!(adds[0].args.contains(&"nodad".to_string()));
    }

    #[test]
    fn ensure_gateway_host_address_is_added_with_host_bits_intact() {
        let runner = RecordingRunner::new();
        runner.push_response("[]");
        let mut mgr = AddressManager::new(&runner).unwrap();

        // A subnet gateway like 10.0.0.1/24 has nonzero host bits; this must
        // not panic and must emit the host address, not the network address.
        let addr = Address {
            device: "irb-100".to_string(),
            address: cidr::IpInet::from_str("10.0.0.1/24").unwrap(),
        };
        mgr.ensure(addr).unwrap();
        let adds = runner.calls_matching(&["ip", "address", "add"]);
        assert_eq!(adds.len(), 1);
        assert!(adds[0].args.contains(&"10.0.0.1/24".to_string()));
    }

    #[test]
    fn ensure_skips_gateway_host_address_already_present_in_snapshot() {
        let runner = RecordingRunner::new();
        runner.push_response(r#"[{"ifname":"irb-100","addr_info":[{"family":"inet","local":"10.0.0.1","prefixlen":24}]}]"#);
        let mut mgr = AddressManager::new(&runner).unwrap();

        let addr = Address {
            device: "irb-100".to_string(),
            address: cidr::IpInet::from_str("10.0.0.1/24").unwrap(),
        };
        mgr.ensure(addr).unwrap();
        // Without host-bit preservation this would compare the network
        // address (10.0.0.0) against the snapshot's host address and never
        // match, re-adding the gateway every iteration.
        assert!(runner.calls_matching(&["ip", "address", "add"]).is_empty());
    }

    #[test]
    fn prune_never_touches_ipv6_link_local() {
        let runner = RecordingRunner::new();
        runner.push_response(
            r#"[{"ifname":"irb-100","addr_info":[{"family":"inet6","local":"fe80::1","prefixlen":64,"scope":"link"}]}]"#,
        );
        let mut mgr = AddressManager::new(&runner).unwrap();
        mgr.prune().unwrap();
        assert!(runner.calls_matching(&["ip", "address", "del"]).is_empty());
    }

    #[test]
    fn primary_loopback_ipv4_finds_global_scope_address() {
        let runner = RecordingRunner::new();
        runner.push_response(
            r#"[{"ifname":"lo","addr_info":[{"family":"inet","local":"127.0.0.1","scope":"host"},
                {"family":"inet","local":"10.255.0.1","scope":"global"}]}]"#,
        );
        let mgr = AddressManager::new(&runner).unwrap();
        assert_eq!(mgr.primary_loopback_ipv4(), Some("10.255.0.1".parse().unwrap()));
    }
}
