//! Reconciliation driver: the top-level per-iteration loop that sequences
//! every manager against the declarative inventory.

use std::net::IpAddr;
use std::rc::Rc;

use cidr::{IpCidr, IpInet};

use crate::config::AgentConfig;
use crate::inventory::{Inventory, Network, Port};
use crate::managers::address::AddressManager;
use crate::managers::bridge::BridgeManager;
use crate::managers::frr::FrrManager;
use crate::managers::link::LinkManager;
use crate::managers::neighbour::NeighbourManager;
use crate::managers::ovs::OvsManager;
use crate::managers::route::RouteManager;
use crate::runner::CommandRunner;
use crate::types::{BridgeVlan, Fdb, Link, LinkKind, Neighbour, Route};

pub struct Driver<I> {
    config: AgentConfig,
    inventory: I,
    link: LinkManager<Rc<dyn CommandRunner>>,
    bridge: BridgeManager<Rc<dyn CommandRunner>>,
    address: AddressManager<Rc<dyn CommandRunner>>,
    neighbour: NeighbourManager<Rc<dyn CommandRunner>>,
    route: RouteManager<Rc<dyn CommandRunner>>,
    ovs: OvsManager<Rc<dyn CommandRunner>>,
    frr: FrrManager<Rc<dyn CommandRunner>>,
}

impl<I: Inventory> Driver<I> {
    pub fn new(runner: Rc<dyn CommandRunner>, config: AgentConfig, inventory: I, frr_config_path: &str) -> Result<Self, crate::Error> {
        let link = LinkManager::new(runner.clone())?;
        let bridge = BridgeManager::new(runner.clone(), config.bridge_name.clone(), config.bridge_veth.clone())?;
        let address = AddressManager::new(runner.clone())?;
        let neighbour = NeighbourManager::new(runner.clone(), config.rt_proto.clone())?;
        let route = RouteManager::new(runner.clone(), config.rt_proto.clone())?;
        let ovs = OvsManager::new(runner.clone(), config.ovs_name.clone(), config.ovs_veth.clone());
        let frr = FrrManager::new(runner, frr_config_path)?;

        Ok(Driver {
            config,
            inventory,
            link,
            bridge,
            address,
            neighbour,
            route,
            ovs,
            frr,
        })
    }

    /// Runs exactly one reconciliation pass: ensure baseline + per-network
    /// desired state, then finalise every manager in dependency order.
    pub fn run_iteration(&mut self) -> Result<(), crate::Error> {
        self.ensure_baseline()?;

        let ports = self.inventory.get_ports()?;
        for net in self.inventory.get_networks()? {
            self.ensure_network(&net, &ports)?;
        }

        // Finalise order: routing daemon, neighbours, routes, addresses,
        // bridge, links — higher-layer tenants before lower-layer substrates.
        self.frr.finalise()?;
        self.neighbour.finalise()?;
        self.route.finalise()?;
        self.address.finalise()?;
        self.bridge.finalise()?;
        self.link.finalise()?;

        Ok(())
    }

    fn ensure_baseline(&mut self) -> Result<(), crate::Error> {
        let mtu = self.config.bridge_mtu as i64;

        let bridge_link = Link::new(self.config.bridge_name.clone(), LinkKind::Bridge)
            .with_link_attr("address", self.config.bridge_address.clone())
            .with_link_attr("inet6_addr_gen_mode", "none")
            .with_link_attr("mtu", mtu)
            .with_type_attr("vlan_default_pvid", 0i64)
            .with_type_attr("vlan_filtering", 1i64);
        self.link.ensure(&bridge_link)?;

        let bridge_veth = Link::new(self.config.bridge_veth.clone(), LinkKind::Veth)
            .with_peer(self.config.ovs_veth.clone())
            .with_link_attr("master", self.config.bridge_name.clone())
            .with_link_attr("inet6_addr_gen_mode", "none")
            .with_link_attr("mtu", mtu);
        self.link.ensure(&bridge_veth)?;

        let ovs_veth = Link::new(self.config.ovs_veth.clone(), LinkKind::Veth)
            .with_peer(self.config.bridge_veth.clone())
            .with_link_attr("inet6_addr_gen_mode", "none")
            .with_link_attr("mtu", mtu);
        self.link.ensure(&ovs_veth)?;

        self.ovs.ensure_veth()?;
        Ok(())
    }

    fn ensure_network(&mut self, net: &Network, ports: &[Port]) -> Result<(), crate::Error> {
        let vid = net.segmentation_id;
        let mtu = net.mtu as i64;
        let l3vni = net.l3vni;

        // `l3vni = 0` means an isolated per-VLAN VRF (same as no L3VNI at
        // all) for the purposes of VRF sharing and L3VNI-device creation,
        // but is NOT the same as None for enabling L3 gateway features below.
        let vrf_id = match l3vni {
            Some(v) if v != 0 => v,
            _ => vid,
        };
        let rt_table_num = vrf_id as u64 + self.config.rt_table_offset as u64;
        let rt_table = rt_table_num.to_string();

        self.bridge.ensure_vlan(BridgeVlan {
            device: self.config.bridge_veth.clone(),
            vid: vid as u16,
            tagged: true,
        })?;

        let l2vni = net.l2vni.or_else(|| self.config.l2vni_offset.map(|off| vid + off));

        if let Some(l2vni) = l2vni {
            let devname = format!("l2vni-{l2vni}");
            let local = self.address.primary_loopback_ipv4();
            let mut l2vni_link = Link::new(devname.clone(), LinkKind::Vxlan)
                .with_link_attr("master", self.config.bridge_name.clone())
                .with_link_attr("inet6_addr_gen_mode", "none")
                .with_link_attr("mtu", mtu)
                .with_link_attr("ifalias", format!("L2VNI for {}", net.id))
                .with_type_attr("id", l2vni as i64)
                .with_type_attr("learning", false)
                .with_type_attr("port", 4789i64)
                .with_bridge_slave_attr("learning", false)
                .with_bridge_slave_attr("neigh_suppress", true);
            match local {
                Some(ip) => l2vni_link = l2vni_link.with_type_attr("local", ip.to_string()),
                None => tracing::error!(device = %devname, "no loopback IPv4 address found, VXLAN local source will be unset"),
            }
            self.link.ensure(&l2vni_link)?;

            self.bridge.ensure_vlan(BridgeVlan {
                device: devname,
                vid: vid as u16,
                tagged: false,
            })?;
        }

        let vrf = format!("vrf-{vrf_id}");
        let irb_vrf = format!("irb-{vrf_id}");
        let vrf_link = Link::new(vrf.clone(), LinkKind::Vrf)
            .with_link_attr("ifalias", format!("VRF {vrf_id}"))
            .with_link_attr("inet6_addr_gen_mode", "none")
            .with_type_attr("table", rt_table_num as i64);
        self.link.ensure(&vrf_link)?;

        self.frr.ensure_vrf(&vrf, l3vni)?;

        let dev = format!("irb-{vid}");
        let irb_link = Link::new(dev.clone(), LinkKind::Vlan)
            .with_peer(self.config.bridge_name.clone())
            .with_link_attr("mtu", mtu)
            .with_link_attr("ifalias", format!("IRB for VLAN {vid}"))
            .with_link_attr("master", vrf.clone())
            .with_type_attr("id", vid as i64);
        self.link.ensure(&irb_link)?;

        self.bridge.ensure_vlan(BridgeVlan {
            device: self.config.bridge_name.clone(),
            vid: vid as u16,
            tagged: true,
        })?;

        if let Some(vni) = l3vni {
            if vni != 0 {
                let irb_bridge_mtu = self.config.bridge_mtu as i64 - 50;
                let irb_bridge_link = Link::new(irb_vrf.clone(), LinkKind::Bridge)
                    .with_link_attr("ifalias", format!("IRB for VRF {vrf_id}"))
                    .with_link_attr("inet6_addr_gen_mode", "none")
                    .with_link_attr("master", vrf.clone())
                    .with_link_attr("mtu", irb_bridge_mtu);
                self.link.ensure(&irb_bridge_link)?;

                let local = self.address.primary_loopback_ipv4();
                let devname = format!("l3vni-{vni}");
                let mut l3vni_link = Link::new(devname.clone(), LinkKind::Vxlan)
                    .with_link_attr("ifalias", format!("L3VNI for VRF {vrf_id}"))
                    .with_link_attr("inet6_addr_gen_mode", "none")
                    .with_link_attr("master", irb_vrf.clone())
                    .with_link_attr("mtu", irb_bridge_mtu)
                    .with_type_attr("id", vni as i64)
                    .with_type_attr("learning", false)
                    .with_type_attr("port", 4789i64)
                    .with_bridge_slave_attr("learning", false)
                    .with_bridge_slave_attr("neigh_suppress", true);
                match local {
                    Some(ip) => l3vni_link = l3vni_link.with_type_attr("local", ip.to_string()),
                    None => tracing::error!(device = %devname, "no loopback IPv4 address found, VXLAN local source will be unset"),
                }
                self.link.ensure(&l3vni_link)?;
            }
        }

        if l3vni.is_some() {
            if net.advertise_connected {
                self.frr.ensure_advertise_connected(&vrf, vid)?;
            }

            for subnet in self.inventory.get_subnets(&net.id)? {
                let prefix_len = match subnet.cidr {
                    IpCidr::V4(c) => c.network_length(),
                    IpCidr::V6(c) => c.network_length(),
                };
                let gw = ip_inet_for(subnet.gateway_ip, prefix_len);
                self.address.ensure(crate::types::Address { device: dev.clone(), address: gw })?;

                if subnet.enable_dhcp {
                    if let Some(mode) = &subnet.ipv6_ra_mode {
                        self.frr.ensure_ra(&dev, &subnet.cidr.to_string(), mode)?;
                    }
                }

                for subnetroute in self.inventory.get_subnet_routes(&subnet.id)? {
                    if is_sentinel_nexthop(subnetroute.nexthop) {
                        if let Err(e) = self.frr.ensure_bgp_listener(
                            &dev,
                            &vrf,
                            &subnet.cidr.to_string(),
                            &subnetroute.destination.to_string(),
                            &subnetroute.nexthop.to_string(),
                        ) {
                            tracing::error!(error = %e, "skipping malformed BGP-listener subnet route");
                        }
                        continue;
                    }

                    let has_local_port = ports.iter().any(|p| p.segmentation_id == vid && p.ip_address == Some(subnetroute.nexthop));
                    if !has_local_port {
                        continue;
                    }

                    self.route.ensure(Route::new(subnetroute.destination, rt_table.clone()).with_gateway(subnetroute.nexthop).with_device(dev.clone()))?;
                }

                if let Some(scope) = &subnet.address_scope_id {
                    for port in ports.iter().filter(|p| p.subnet_id.as_deref() == Some(subnet.id.as_str()) && p.device_owner == "network:router_gateway") {
                        for tenantnet in self.inventory.get_tenant_networks(&port.device_id, scope)? {
                            if let Some(gw_ip) = port.ip_address {
                                self.route.ensure(Route::new(tenantnet.cidr, rt_table.clone()).with_gateway(gw_ip).with_device(dev.clone()))?;
                            }
                        }
                    }
                }
            }
        }

        for port in ports.iter().filter(|p| p.segmentation_id == vid) {
            self.bridge.ensure_fdb(Fdb {
                mac: port.mac_address.clone(),
                vid: vid as u16,
            })?;

            if let Some(ip) = port.ip_address {
                self.neighbour.ensure(Neighbour {
                    dst: ip,
                    device: dev.clone(),
                    lladdr: port.mac_address.clone(),
                })?;

                // When the IRB isn't bound to a real L3VNI, the Type-2
                // MAC/IP route for this neighbour isn't leaked across VRFs
                // as a host route, only the on-link subnet prefix is. Add
                // an explicit host route so traffic to this port routes
                // directly to the hypervisor that has it active.
                if l3vni == Some(0) {
                    let host = ip_cidr_for(ip, if ip.is_ipv4() { 32 } else { 128 });
                    self.route.ensure(Route::new(host, rt_table.clone()).with_device(dev.clone()))?;
                }
            }
        }

        Ok(())
    }
}

fn ip_cidr_for(addr: IpAddr, prefix_len: u8) -> IpCidr {
    match addr {
        IpAddr::V4(v4) => IpCidr::V4(cidr::Ipv4Cidr::new(v4, prefix_len).expect("valid IPv4 prefix length")),
        IpAddr::V6(v6) => IpCidr::V6(cidr::Ipv6Cidr::new(v6, prefix_len).expect("valid IPv6 prefix length")),
    }
}

/// Builds a host-bit-preserving address+prefix for a gateway IP, e.g.
/// `10.0.0.1/24`. Unlike `ip_cidr_for`, this must accept a nonzero host
/// part, so it uses `IpInet` rather than `IpCidr`.
fn ip_inet_for(addr: IpAddr, prefix_len: u8) -> IpInet {
    match addr {
        IpAddr::V4(v4) => IpInet::V4(cidr::Ipv4Inet::new(v4, prefix_len).expect("valid IPv4 prefix length")),
        IpAddr::V6(v6) => IpInet::V6(cidr::Ipv6Inet::new(v6, prefix_len).expect("valid IPv6 prefix length")),
    }
}

/// A nexthop in `0.179.0.0/16` or `::179:0:0/96` signals a dynamic BGP
/// listener rather than a kernel route.
fn is_sentinel_nexthop(nexthop: IpAddr) -> bool {
    match nexthop {
        IpAddr::V4(v4) => cidr::Ipv4Cidr::new(std::net::Ipv4Addr::new(0, 179, 0, 0), 16).unwrap().contains(&v4),
        IpAddr::V6(v6) => cidr::Ipv6Cidr::new("::179:0:0".parse().unwrap(), 96).unwrap().contains(&v6),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::StaticInventory;
    use crate::runner::mocks::RecordingRunner;
    use std::str::FromStr;

    fn empty_runner_with_baseline_responses(runner: &RecordingRunner) {
        // link/bridge/address/neighbour/route/frr `update()` calls during construction.
        runner.push_response("[]"); // link update
        runner.push_response("[]"); // bridge fdb
        runner.push_response("[]"); // bridge vlan
        runner.push_response("[]"); // bridge link
        runner.push_response("[]"); // address update
        runner.push_response("[]"); // neighbour -4
        runner.push_response("[]"); // neighbour -6
        runner.push_response("[]"); // route -4
        runner.push_response("[]"); // route -6
        runner.push_response("router bgp 65000\nexit\n"); // frr running config
    }

    #[test]
    fn bootstrap_with_empty_inventory_creates_only_the_baseline() {
        let runner = Rc::new(RecordingRunner::new());
        empty_runner_with_baseline_responses(&runner);
        let runner_dyn: Rc<dyn CommandRunner> = runner.clone();

        let config = AgentConfig::default();
        let inventory = StaticInventory::default();
        let mut driver = Driver::new(runner_dyn, config, inventory, "/nonexistent/frr.conf").unwrap();

        // Baseline link creation commands will appear; no per-network work
        // should follow for an empty inventory.
        driver.ensure_baseline().unwrap();
        let adds = runner.calls_matching(&["ip", "link", "add"]);
        assert!(adds.iter().any(|a| a.args.contains(&"br-evpn".to_string())));
    }

    #[test]
    fn vrf_id_falls_back_to_vlan_id_when_l3vni_is_zero_or_none() {
        // Zero and None must both fall back to the VLAN id; only a nonzero
        // VNI is used directly. Easy to get backwards.
        let vid = 100u32;
        let vrf_for_none = match None::<u32> {
            Some(v) if v != 0 => v,
            _ => vid,
        };
        let vrf_for_zero = match Some(0u32) {
            Some(v) if v != 0 => v,
            _ => vid,
        };
        let vrf_for_explicit = match Some(20001u32) {
            Some(v) if v != 0 => v,
            _ => vid,
        };
        assert_eq!(vrf_for_none, 100);
        assert_eq!(vrf_for_zero, 100);
        assert_eq!(vrf_for_explicit, 20001);
    }

    #[test]
    fn sentinel_nexthop_detection() {
        assert!(is_sentinel_nexthop(IpAddr::from_str("0.179.24.32").unwrap()));
        assert!(!is_sentinel_nexthop(IpAddr::from_str("10.0.0.1").unwrap()));
        assert!(is_sentinel_nexthop(IpAddr::from_str("::179:24:32").unwrap()));
    }
}
