//! Inventory query contract. The SQL layer against the cloud-networking
//! database is an external collaborator; this module only defines the
//! shapes the driver consumes and a [`StaticInventory`] test double.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("inventory query failed: {0}")]
    QueryFailed(String),
}

#[derive(Clone, Debug, PartialEq)]
pub struct Port {
    pub segmentation_id: u32,
    pub mac_address: String,
    pub device_id: String,
    pub device_owner: String,
    pub ip_address: Option<std::net::IpAddr>,
    pub subnet_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Network {
    pub id: String,
    pub l2vni: Option<u32>,
    pub l3vni: Option<u32>,
    pub advertise_connected: bool,
    pub segmentation_id: u32,
    pub mtu: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Subnet {
    pub id: String,
    pub gateway_ip: std::net::IpAddr,
    pub cidr: cidr::IpCidr,
    pub enable_dhcp: bool,
    pub ipv6_ra_mode: Option<String>,
    pub address_scope_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct StaticRoute {
    pub destination: cidr::IpCidr,
    pub nexthop: std::net::IpAddr,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TenantNetwork {
    pub cidr: cidr::IpCidr,
}

/// Read-only view onto the declarative inventory for the current host.
/// Implemented for real deployments by a database-backed adapter that owns
/// connection parameters (`config::AgentConfig`'s `db.*` section) and the
/// host's physical-network filter; out of scope for this crate.
pub trait Inventory {
    fn get_ports(&self) -> Result<Vec<Port>, Error>;
    fn get_networks(&self) -> Result<Vec<Network>, Error>;
    fn get_subnets(&self, network_id: &str) -> Result<Vec<Subnet>, Error>;
    fn get_subnet_routes(&self, subnet_id: &str) -> Result<Vec<StaticRoute>, Error>;
    fn get_tenant_networks(&self, device_id: &str, address_scope_id: &str) -> Result<Vec<TenantNetwork>, Error>;
}

/// Plain in-memory [`Inventory`], for tests and for driving the engine
/// without a real database.
#[derive(Clone, Debug, Default)]
pub struct StaticInventory {
    pub ports: Vec<Port>,
    pub networks: Vec<Network>,
    pub subnets: std::collections::HashMap<String, Vec<Subnet>>,
    pub subnet_routes: std::collections::HashMap<String, Vec<StaticRoute>>,
    pub tenant_networks: std::collections::HashMap<(String, String), Vec<TenantNetwork>>,
}

impl Inventory for StaticInventory {
    fn get_ports(&self) -> Result<Vec<Port>, Error> {
        Ok(self.ports.clone())
    }

    fn get_networks(&self) -> Result<Vec<Network>, Error> {
        Ok(self.networks.clone())
    }

    fn get_subnets(&self, network_id: &str) -> Result<Vec<Subnet>, Error> {
        Ok(self.subnets.get(network_id).cloned().unwrap_or_default())
    }

    fn get_subnet_routes(&self, subnet_id: &str) -> Result<Vec<StaticRoute>, Error> {
        Ok(self.subnet_routes.get(subnet_id).cloned().unwrap_or_default())
    }

    fn get_tenant_networks(&self, device_id: &str, address_scope_id: &str) -> Result<Vec<TenantNetwork>, Error> {
        Ok(self.tenant_networks.get(&(device_id.to_string(), address_scope_id.to_string())).cloned().unwrap_or_default())
    }
}
