//! INI-style agent configuration.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: ini::Error,
    },
    #[error("invalid value for {section}.{key}: {value}")]
    InvalidValue { section: String, key: String, value: String },
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub interval: u64,
    pub loglevel: String,
    pub physical_network: String,
    pub rt_proto: String,
    pub rt_table_offset: u32,
    pub l2vni_offset: Option<u32>,
    pub oneshot: bool,
    pub bridge_name: String,
    pub bridge_address: String,
    pub bridge_mtu: u32,
    pub bridge_veth: String,
    pub ovs_name: String,
    pub ovs_veth: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            interval: 1,
            loglevel: "WARNING".to_string(),
            physical_network: "physnet1".to_string(),
            rt_proto: "255".to_string(),
            rt_table_offset: 100_000_000,
            l2vni_offset: None,
            oneshot: false,
            bridge_name: "br-evpn".to_string(),
            bridge_address: "00:00:5e:00:01:00".to_string(),
            bridge_mtu: 9216,
            bridge_veth: "veth-to-ovs".to_string(),
            ovs_name: "br-ex".to_string(),
            ovs_veth: "veth-to-evpn".to_string(),
        }
    }
}

impl AgentConfig {
    /// Loads defaults overlaid with whatever `path` sets. A missing file is
    /// not an error — defaults are a complete, valid configuration on their
    /// own, matching `configparser.read()`'s silent-skip-if-absent behaviour.
    pub fn load(path: &str) -> Result<Self, Error> {
        let mut conf = AgentConfig::default();

        let text = match std::fs::read_to_string(path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(conf),
            Err(source) => {
                return Err(Error::Read {
                    path: path.to_string(),
                    source,
                })
            }
        };

        let ini = ini::Ini::load_from_str(&text).map_err(|source| Error::Parse {
            path: path.to_string(),
            source,
        })?;

        if let Some(section) = ini.section(Some("agent")) {
            if let Some(v) = section.get("interval") {
                conf.interval = parse_value("agent", "interval", v)?;
            }
            if let Some(v) = section.get("loglevel") {
                conf.loglevel = v.to_string();
            }
            if let Some(v) = section.get("physical_network") {
                conf.physical_network = v.to_string();
            }
            if let Some(v) = section.get("rt_proto") {
                conf.rt_proto = v.to_string();
            }
            if let Some(v) = section.get("rt_table_offset") {
                conf.rt_table_offset = parse_value("agent", "rt_table_offset", v)?;
            }
            if let Some(v) = section.get("l2vni_offset") {
                conf.l2vni_offset = Some(parse_value("agent", "l2vni_offset", v)?);
            }
            if section.get("oneshot").is_some() {
                conf.oneshot = true;
            }
        }

        if let Some(section) = ini.section(Some("bridge")) {
            if let Some(v) = section.get("name") {
                conf.bridge_name = v.to_string();
            }
            if let Some(v) = section.get("address") {
                conf.bridge_address = v.to_string();
            }
            if let Some(v) = section.get("mtu") {
                conf.bridge_mtu = parse_value("bridge", "mtu", v)?;
            }
            if let Some(v) = section.get("veth") {
                conf.bridge_veth = v.to_string();
            }
        }

        if let Some(section) = ini.section(Some("ovs")) {
            if let Some(v) = section.get("name") {
                conf.ovs_name = v.to_string();
            }
            if let Some(v) = section.get("veth") {
                conf.ovs_veth = v.to_string();
            }
        }

        Ok(conf)
    }

    /// `--debug` forces DEBUG; else `--verbose` forces INFO; else the
    /// config-file/default level stands. `--oneshot` forces one-shot mode.
    pub fn apply_cli_overrides(&mut self, debug: bool, verbose: bool, oneshot: bool) {
        if debug {
            self.loglevel = "DEBUG".to_string();
        } else if verbose {
            self.loglevel = "INFO".to_string();
        }
        if oneshot {
            self.oneshot = true;
        }
    }
}

fn parse_value<T: std::str::FromStr>(section: &str, key: &str, value: &str) -> Result<T, Error> {
    value.parse().map_err(|_| Error::InvalidValue {
        section: section.to_string(),
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_table() {
        let conf = AgentConfig::default();
        assert_eq!(conf.interval, 1);
        assert_eq!(conf.loglevel, "WARNING");
        assert_eq!(conf.rt_proto, "255");
        assert_eq!(conf.rt_table_offset, 100_000_000);
        assert_eq!(conf.l2vni_offset, None);
        assert!(!conf.oneshot);
        assert_eq!(conf.bridge_mtu, 9216);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let conf = AgentConfig::load("/nonexistent/path/evpn_agent.ini").unwrap();
        assert_eq!(conf.bridge_name, "br-evpn");
    }

    #[test]
    fn file_overrides_layer_on_top_of_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("evpn_agent.ini");
        std::fs::write(&path, "[agent]\ninterval = 5\nl2vni_offset = 20000\n\n[bridge]\nname = br-test\n").unwrap();

        let conf = AgentConfig::load(path.to_str().unwrap()).unwrap();
        assert_eq!(conf.interval, 5);
        assert_eq!(conf.l2vni_offset, Some(20000));
        assert_eq!(conf.bridge_name, "br-test");
        assert_eq!(conf.bridge_veth, "veth-to-ovs");
    }

    #[test]
    fn cli_overrides_prefer_debug_over_verbose() {
        let mut conf = AgentConfig::default();
        conf.apply_cli_overrides(true, true, false);
        assert_eq!(conf.loglevel, "DEBUG");
    }
}
