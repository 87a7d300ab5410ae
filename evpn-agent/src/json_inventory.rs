//! Loads a [`StaticInventory`] from a JSON snapshot file.
//!
//! The core's inventory contract is deliberately database-agnostic (see
//! `evpn_agent_lib::inventory`); this is the simplest caller-owned adapter
//! that satisfies it without a live OpenStack/Neutron database, useful for
//! running the daemon against a hand-written or externally-dumped snapshot.

use std::collections::HashMap;
use std::net::IpAddr;
use std::str::FromStr;

use evpn_agent_lib::inventory::{Error, Network, Port, StaticInventory, StaticRoute, Subnet, TenantNetwork};
use serde_json::Value;

pub fn load(path: &std::path::Path) -> Result<StaticInventory, Error> {
    let text = std::fs::read_to_string(path).map_err(|e| Error::QueryFailed(format!("reading {}: {e}", path.display())))?;
    let root: Value = serde_json::from_str(&text).map_err(|e| Error::QueryFailed(format!("parsing {}: {e}", path.display())))?;

    let ports = root
        .get("ports")
        .and_then(Value::as_array)
        .map(|a| a.iter().map(parse_port).collect::<Result<Vec<_>, _>>())
        .transpose()?
        .unwrap_or_default();

    let networks = root
        .get("networks")
        .and_then(Value::as_array)
        .map(|a| a.iter().map(parse_network).collect::<Result<Vec<_>, _>>())
        .transpose()?
        .unwrap_or_default();

    let subnets = parse_map(root.get("subnets"), parse_subnet)?;
    let subnet_routes = parse_map(root.get("subnet_routes"), parse_static_route)?;

    let mut tenant_networks = HashMap::new();
    if let Some(obj) = root.get("tenant_networks").and_then(Value::as_object) {
        for (key, value) in obj {
            let (device_id, scope_id) = key
                .split_once('|')
                .ok_or_else(|| Error::QueryFailed(format!("tenant_networks key {key:?} must be \"device_id|scope_id\"")))?;
            let list = value
                .as_array()
                .ok_or_else(|| Error::QueryFailed(format!("tenant_networks[{key:?}] must be an array")))?
                .iter()
                .map(parse_tenant_network)
                .collect::<Result<Vec<_>, _>>()?;
            tenant_networks.insert((device_id.to_string(), scope_id.to_string()), list);
        }
    }

    Ok(StaticInventory {
        ports,
        networks,
        subnets,
        subnet_routes,
        tenant_networks,
    })
}

fn parse_map<T>(value: Option<&Value>, parse_one: impl Fn(&Value) -> Result<T, Error>) -> Result<HashMap<String, Vec<T>>, Error> {
    let mut out = HashMap::new();
    if let Some(obj) = value.and_then(Value::as_object) {
        for (key, value) in obj {
            let list = value
                .as_array()
                .ok_or_else(|| Error::QueryFailed(format!("{key:?} must map to an array")))?
                .iter()
                .map(&parse_one)
                .collect::<Result<Vec<_>, _>>()?;
            out.insert(key.clone(), list);
        }
    }
    Ok(out)
}

fn field<'a>(v: &'a Value, name: &str) -> Result<&'a Value, Error> {
    v.get(name).ok_or_else(|| Error::QueryFailed(format!("missing field {name:?}")))
}

fn str_field(v: &Value, name: &str) -> Result<String, Error> {
    field(v, name)?.as_str().map(str::to_string).ok_or_else(|| Error::QueryFailed(format!("{name:?} must be a string")))
}

fn u32_field(v: &Value, name: &str) -> Result<u32, Error> {
    field(v, name)?.as_u64().map(|n| n as u32).ok_or_else(|| Error::QueryFailed(format!("{name:?} must be an integer")))
}

fn opt_u32_field(v: &Value, name: &str) -> Option<u32> {
    v.get(name).and_then(Value::as_u64).map(|n| n as u32)
}

fn opt_str_field(v: &Value, name: &str) -> Option<String> {
    v.get(name).and_then(Value::as_str).map(str::to_string)
}

fn parse_typed<T: FromStr>(v: &Value, name: &str) -> Result<T, Error> {
    str_field(v, name)?.parse().map_err(|_| Error::QueryFailed(format!("{name:?} is not a valid value")))
}

fn parse_port(v: &Value) -> Result<Port, Error> {
    let ip_address = match v.get("ip_address").and_then(Value::as_str) {
        Some(s) => Some(IpAddr::from_str(s).map_err(|_| Error::QueryFailed(format!("invalid ip_address {s:?}")))?),
        None => None,
    };
    Ok(Port {
        segmentation_id: u32_field(v, "segmentation_id")?,
        mac_address: str_field(v, "mac_address")?,
        device_id: str_field(v, "device_id")?,
        device_owner: str_field(v, "device_owner")?,
        ip_address,
        subnet_id: opt_str_field(v, "subnet_id"),
    })
}

fn parse_network(v: &Value) -> Result<Network, Error> {
    Ok(Network {
        id: str_field(v, "id")?,
        l2vni: opt_u32_field(v, "l2vni"),
        l3vni: opt_u32_field(v, "l3vni"),
        advertise_connected: v.get("advertise_connected").and_then(Value::as_bool).unwrap_or(false),
        segmentation_id: u32_field(v, "segmentation_id")?,
        mtu: u32_field(v, "mtu")?,
    })
}

fn parse_subnet(v: &Value) -> Result<Subnet, Error> {
    Ok(Subnet {
        id: str_field(v, "id")?,
        gateway_ip: parse_typed(v, "gateway_ip")?,
        cidr: parse_typed(v, "cidr")?,
        enable_dhcp: v.get("enable_dhcp").and_then(Value::as_bool).unwrap_or(false),
        ipv6_ra_mode: opt_str_field(v, "ipv6_ra_mode"),
        address_scope_id: opt_str_field(v, "address_scope_id"),
    })
}

fn parse_static_route(v: &Value) -> Result<StaticRoute, Error> {
    Ok(StaticRoute {
        destination: parse_typed(v, "destination")?,
        nexthop: parse_typed(v, "nexthop")?,
    })
}

fn parse_tenant_network(v: &Value) -> Result<TenantNetwork, Error> {
    Ok(TenantNetwork { cidr: parse_typed(v, "cidr")? })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_a_full_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inventory.json");
        std::fs::write(
            &path,
            r#"{
                "ports": [{"segmentation_id": 100, "mac_address": "aa:bb:cc:dd:ee:ff", "device_id": "d1",
                            "device_owner": "compute:nova", "ip_address": "10.0.0.5", "subnet_id": "sub1"}],
                "networks": [{"id": "net1", "l2vni": 10100, "l3vni": null, "advertise_connected": false,
                               "segmentation_id": 100, "mtu": 1450}],
                "subnets": {"net1": [{"id": "sub1", "gateway_ip": "10.0.0.1", "cidr": "10.0.0.0/24",
                                        "enable_dhcp": true, "ipv6_ra_mode": null, "address_scope_id": null}]},
                "subnet_routes": {},
                "tenant_networks": {}
            }"#,
        )
        .unwrap();

        let inv = load(&path).unwrap();
        assert_eq!(inv.ports.len(), 1);
        assert_eq!(inv.networks[0].l2vni, Some(10100));
        assert_eq!(inv.subnets["net1"][0].id, "sub1");
    }

    #[test]
    fn missing_required_field_fails_with_query_failed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inventory.json");
        std::fs::write(&path, r#"{"networks": [{"id": "net1"}]}"#).unwrap();

        let err = load(&path).unwrap_err();
        assert!(matches!(err, Error::QueryFailed(_)));
    }
}
