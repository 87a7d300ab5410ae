//! Resource descriptors shared across managers.

use cidr::{IpCidr, IpInet};

use crate::value::AttrMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LinkKind {
    Bridge,
    Veth,
    Vlan,
    Vxlan,
    Vrf,
}

impl LinkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkKind::Bridge => "bridge",
            LinkKind::Veth => "veth",
            LinkKind::Vlan => "vlan",
            LinkKind::Vxlan => "vxlan",
            LinkKind::Vrf => "vrf",
        }
    }
}

/// An interface to be created/synced by the link manager.
///
/// `kind` is immutable once created: a pre-existing link of the wrong kind
/// is a [`crate::managers::link::Error::KindMismatch`], logged and left
/// alone rather than auto-corrected.
#[derive(Clone, Debug)]
pub struct Link {
    pub name: String,
    pub kind: LinkKind,
    /// veth peer, or vlan parent device.
    pub peer_name: Option<String>,
    pub link_attrs: AttrMap,
    pub type_attrs: AttrMap,
    pub bridge_slave_attrs: AttrMap,
}

impl Link {
    pub fn new(name: impl Into<String>, kind: LinkKind) -> Self {
        Link {
            name: name.into(),
            kind,
            peer_name: None,
            link_attrs: AttrMap::new(),
            type_attrs: AttrMap::new(),
            bridge_slave_attrs: AttrMap::new(),
        }
    }

    pub fn with_peer(mut self, peer: impl Into<String>) -> Self {
        self.peer_name = Some(peer.into());
        self
    }

    pub fn with_link_attr(mut self, key: impl Into<String>, val: impl Into<crate::value::AttrValue>) -> Self {
        self.link_attrs.insert(key.into(), val.into());
        self
    }

    pub fn with_type_attr(mut self, key: impl Into<String>, val: impl Into<crate::value::AttrValue>) -> Self {
        self.type_attrs.insert(key.into(), val.into());
        self
    }

    pub fn with_bridge_slave_attr(mut self, key: impl Into<String>, val: impl Into<crate::value::AttrValue>) -> Self {
        self.bridge_slave_attrs.insert(key.into(), val.into());
        self
    }
}

/// A bridge VLAN membership on a port (or on the bridge device itself, via `self_`).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct BridgeVlan {
    pub device: String,
    pub vid: u16,
    pub tagged: bool,
}

/// A static sticky FDB entry.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Fdb {
    pub mac: String,
    pub vid: u16,
}

/// An IP address to be present on an IRB device.
///
/// Modeled as `IpInet` (address + prefix length, host bits preserved)
/// rather than `IpCidr` (address + prefix length, host bits forced to
/// zero): a gateway address like `10.0.0.1/24` has a nonzero host part,
/// which `IpCidr::new` would reject.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Address {
    pub device: String,
    pub address: IpInet,
}

impl Address {
    pub fn is_ipv6(&self) -> bool {
        matches!(self.address, IpInet::V6(_))
    }
}

/// A permanent ARP/ND entry tagged with the agent's route-protocol id.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Neighbour {
    pub dst: std::net::IpAddr,
    pub device: String,
    pub lladdr: String,
}

/// A route in an arbitrary table, tagged with the agent's route-protocol id.
///
/// Defaults mirror the kernel's own defaults at route-add time so that a
/// freshly decoded snapshot entry compares equal to a freshly constructed
/// descriptor without any manual normalisation.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Route {
    pub dst: IpCidr,
    pub gateway: Option<std::net::IpAddr>,
    pub device: Option<String>,
    pub kind: String,
    pub metric: u32,
    pub table: String,
}

impl Route {
    pub fn new(dst: IpCidr, table: impl Into<String>) -> Self {
        Route {
            dst,
            gateway: None,
            device: None,
            kind: "unicast".to_string(),
            metric: 1024,
            table: table.into(),
        }
    }

    pub fn with_gateway(mut self, gw: std::net::IpAddr) -> Self {
        self.gateway = Some(gw);
        self
    }

    pub fn with_device(mut self, dev: impl Into<String>) -> Self {
        self.device = Some(dev.into());
        self
    }

    pub fn with_metric(mut self, metric: u32) -> Self {
        self.metric = metric;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_builder_preserves_insertion_order_semantics() {
        let link = Link::new("l2vni-10100", LinkKind::Vxlan)
            .with_link_attr("master", "br-evpn")
            .with_type_attr("id", 10100i64)
            .with_type_attr("learning", false);
        assert_eq!(link.link_attrs.get("master").unwrap().to_string(), "br-evpn");
        assert_eq!(link.type_attrs.get("learning").unwrap().as_bool(), Some(false));
    }
}
