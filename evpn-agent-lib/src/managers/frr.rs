//! Routing-daemon (FRR) manager.
//!
//! Unlike the other managers, this one doesn't shell out to `ip`/`bridge` per
//! resource. It maintains two in-memory context trees — the daemon's running
//! configuration and a target configuration built up by the `ensure_*`
//! calls this iteration — and reconciles them with a single `vtysh configure`
//! pass at `finalise()`.

use std::collections::BTreeSet;

use cidr::IpCidr;
use regex::Regex;
use thiserror::Error;

use crate::runner::CommandRunner;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Command(#[from] crate::runner::Error),
    #[error("malformed sentinel nexthop: {0}")]
    BadNexthop(String),
    #[error("invalid ge/le for {cidr}: mask length {mask} must satisfy mask <= ge <= le, got ge={ge} le={le}")]
    InvalidGeLe { cidr: String, mask: u8, ge: u8, le: u8 },
    #[error("no running `router bgp <asn>` context found")]
    NoAsn,
}

/// A context-tree line: the nested block path it lives under, plus the leaf
/// command text.
type Line = (Vec<String>, String);

const CONTEXT_OPENERS: &[&str] = &["route-map ", "router bgp", "vrf ", "address-family ", "interface "];

fn is_context_opener(line: &str) -> bool {
    CONTEXT_OPENERS.iter().any(|p| line.starts_with(p))
}

fn is_context_closer(line: &str) -> bool {
    matches!(line, "exit" | "exit-vrf" | "exit-address-family" | "end")
}

/// An ordered context tree: each distinct nesting path maps to an ordered,
/// de-duplicated list of leaf lines it directly contains.
#[derive(Debug, Clone, Default)]
pub struct FrrConfig {
    contexts: Vec<(Vec<String>, Vec<String>)>,
}

impl FrrConfig {
    pub fn new() -> Self {
        Self::default()
    }

    fn context_mut(&mut self, path: &[String]) -> &mut Vec<String> {
        if let Some(idx) = self.contexts.iter().position(|(p, _)| p == path) {
            &mut self.contexts[idx].1
        } else {
            self.contexts.push((path.to_vec(), Vec::new()));
            &mut self.contexts.last_mut().unwrap().1
        }
    }

    /// Parses `text` and merges its context/line pairs into this tree,
    /// appending to (not replacing) whatever is already present under a
    /// shared path. Mirrors the routing daemon's reload tooling accumulating
    /// repeated `load_from_file` calls into one cumulative target.
    pub fn merge_text(&mut self, text: &str) {
        let mut stack: Vec<String> = Vec::new();
        for raw in text.lines() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('!') {
                continue;
            }
            if is_context_closer(line) {
                stack.pop();
                continue;
            }
            if is_context_opener(line) {
                stack.push(line.to_string());
                continue;
            }
            let lines = self.context_mut(&stack);
            if !lines.iter().any(|l| l == line) {
                lines.push(line.to_string());
            }
        }
    }

    fn pairs(&self) -> Vec<Line> {
        self.contexts
            .iter()
            .flat_map(|(path, lines)| lines.iter().map(move |l| (path.clone(), l.clone())))
            .collect()
    }

    fn context_lines(&self, path: &[String]) -> Option<&[String]> {
        self.contexts.iter().find(|(p, _)| p == path).map(|(_, l)| l.as_slice())
    }
}

/// Computes `(adds, deletes)` needed to turn `running` into `target`,
/// context-scoped: a context present in one tree but absent from the other
/// is added/deleted wholesale, a context present in both is diffed
/// line-by-line.
fn diff(target: &FrrConfig, running: &FrrConfig) -> (Vec<Line>, Vec<Line>) {
    let mut adds = Vec::new();
    let mut deletes = Vec::new();

    for (path, lines) in &target.contexts {
        let running_lines = running.context_lines(path).unwrap_or(&[]);
        for line in lines {
            if !running_lines.contains(line) {
                adds.push((path.clone(), line.clone()));
            }
        }
    }

    for (path, lines) in &running.contexts {
        let target_lines = target.context_lines(path).unwrap_or(&[]);
        for line in lines {
            if !target_lines.contains(line) {
                deletes.push((path.clone(), line.clone()));
            }
        }
    }

    (adds, deletes)
}

fn dedup_preserve_order(lines: Vec<Line>) -> Vec<Line> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    for l in lines {
        let key = format!("{:?}", l);
        if seen.insert(key) {
            out.push(l);
        }
    }
    out
}

/// Renders the nested `vtysh -c` argument sequence for one context/line pair.
fn render_vtysh_args(path: &[String], line: &str, delete: bool) -> Vec<String> {
    let mut args: Vec<String> = vec!["configure".to_string()];
    args.extend(path.iter().cloned());
    if delete {
        args.push(format!("no {line}"));
    } else {
        args.push(line.to_string());
    }
    args
}

pub struct FrrManager<R> {
    runner: R,
    running: FrrConfig,
    target: FrrConfig,
    config_path: String,
}

impl<R: CommandRunner> FrrManager<R> {
    pub fn new(runner: R, config_path: impl Into<String>) -> Result<Self, Error> {
        let mut mgr = FrrManager {
            runner,
            running: FrrConfig::new(),
            target: FrrConfig::new(),
            config_path: config_path.into(),
        };
        mgr.update()?;
        Ok(mgr)
    }

    pub fn update(&mut self) -> Result<(), Error> {
        let running_text = self
            .runner
            .run(&["vtysh", "-c", "show running-config"], crate::runner::RunOpts::capture())?
            .unwrap_or_default();
        let mut running = FrrConfig::new();
        running.merge_text(&running_text);
        self.running = running;

        let target_text = std::fs::read_to_string(&self.config_path).unwrap_or_default();
        let mut target = FrrConfig::new();
        target.merge_text(&target_text);
        self.target = target;
        Ok(())
    }

    fn add_config(&mut self, text: &str) {
        self.target.merge_text(text);
    }

    pub fn get_asn(&self) -> Result<u32, Error> {
        let re = Regex::new(r"^router bgp (\d+)$").unwrap();
        for (path, _) in &self.running.contexts {
            if let Some(first) = path.first() {
                if let Some(caps) = re.captures(first) {
                    return caps[1].parse().map_err(|_| Error::NoAsn);
                }
            }
        }
        Err(Error::NoAsn)
    }

    /// Ensures a VRF's BGP instance, route-target import/export suppression
    /// route-map, and (when `l3vni` is given) its VNI mapping. `l3vni == 0`
    /// (distinct from `None`) additionally leaks routes to/from the default
    /// VRF, working around FRR's Type-2 MAC/IP route handling on a VNI-less
    /// VRF.
    pub fn ensure_vrf(&mut self, vrf: &str, l3vni: Option<u32>) -> Result<(), Error> {
        let asn = self.get_asn()?;

        let mut frrconf = format!(
            "route-map {vrf}-redistribute-connected deny 65535\n\
             exit\n\
             router bgp {asn} vrf {vrf}\n\
             no bgp default ipv4-unicast\n\
             bgp disable-ebgp-connected-route-check\n\
             bgp bestpath as-path multipath-relax\n\
             address-family ipv4 unicast\n\
             redistribute kernel\n\
             redistribute connected route-map {vrf}-redistribute-connected\n\
             exit-address-family\n\
             address-family ipv6 unicast\n\
             redistribute kernel\n\
             redistribute connected route-map {vrf}-redistribute-connected\n\
             exit-address-family\n\
             address-family l2vpn evpn\n\
             advertise ipv4 unicast\n\
             advertise ipv6 unicast\n\
             exit-address-family\n\
             exit\n"
        );

        // A VNI of exactly 0 gets no `vni` mapping (there's no such thing as
        // VNI 0), only the isolated-VRF underlay-leak import block below.
        if let Some(vni) = l3vni {
            if vni != 0 {
                frrconf.push_str(&format!("vrf {vrf}\nvni {vni}\nexit-vrf\n"));
            }
        }

        if l3vni == Some(0) {
            frrconf.push_str(&format!(
                "router bgp {asn}\n\
                 address-family ipv4 unicast\n\
                 import vrf {vrf}\n\
                 exit-address-family\n\
                 address-family ipv6 unicast\n\
                 import vrf {vrf}\n\
                 exit-address-family\n\
                 exit\n\
                 router bgp {asn} vrf {vrf}\n\
                 address-family ipv4 unicast\n\
                 import vrf default\n\
                 exit-address-family\n\
                 address-family ipv6 unicast\n\
                 import vrf default\n\
                 exit-address-family\n\
                 exit\n"
            ));
        }

        self.add_config(&frrconf);
        Ok(())
    }

    pub fn ensure_advertise_connected(&mut self, vrf: &str, vlanid: u32) -> Result<(), Error> {
        let frrconf = format!("route-map {vrf}-redistribute-connected permit {vlanid}\nmatch interface irb-{vlanid}\nexit\n");
        self.add_config(&frrconf);
        Ok(())
    }

    /// Configures IPv6 router advertisements per Neutron's `ipv6_ra_mode`
    /// semantics: SLAAC (A,M,O = 1,0,0) is FRR's default and needs no flags.
    pub fn ensure_ra(&mut self, dev: &str, prefix: &str, mode: &str) -> Result<(), Error> {
        let mut frrconf = format!("interface {dev}\n");
        match mode {
            "dhcpv6-stateful" => {
                frrconf.push_str("ipv6 nd managed-config-flag\n");
                frrconf.push_str(&format!("ipv6 nd prefix {prefix} no-autoconfig\n"));
            }
            "dhcpv6-stateless" => {
                frrconf.push_str("ipv6 nd other-config-flag\n");
            }
            _ => {}
        }
        frrconf.push_str("no ipv6 nd suppress-ra\n");
        frrconf.push_str("exit\n");
        self.add_config(&frrconf);
        Ok(())
    }

    /// Configures a dynamic BGP unnumbered listener for `subnet` using the
    /// sentinel nexthop's embedded `ge`/`le` prefix-list bounds
    /// (`0.179.<ge>.<le>` / `::179:<ge>:<le>`).
    pub fn ensure_bgp_listener(&mut self, dev: &str, vrf: &str, subnet: &str, destination: &str, nexthop: &str) -> Result<(), Error> {
        let asn = self.get_asn()?;
        let cidr: IpCidr = destination.parse().map_err(|_| Error::BadNexthop(destination.to_string()))?;

        let re = Regex::new(r"^(?:::|0\.)179[:.](\d+)[:.](\d+)$").unwrap();
        let caps = re.captures(nexthop).ok_or_else(|| Error::BadNexthop(nexthop.to_string()))?;
        let ge: u8 = caps[1].parse().map_err(|_| Error::BadNexthop(nexthop.to_string()))?;
        let le: u8 = caps[2].parse().map_err(|_| Error::BadNexthop(nexthop.to_string()))?;

        let mask = match cidr {
            IpCidr::V4(c) => c.network_length(),
            IpCidr::V6(c) => c.network_length(),
        };
        if !(mask <= ge && ge <= le) {
            return Err(Error::InvalidGeLe {
                cidr: destination.to_string(),
                mask,
                ge,
                le,
            });
        }

        let (afi, pltype) = match cidr {
            IpCidr::V4(_) => ("ipv4", "ip"),
            IpCidr::V6(_) => ("ipv6", "ipv6"),
        };

        let frrconf = format!(
            "{pltype} prefix-list {dev}-accept-bgp permit {cidr} ge {ge} le {le}\n\
             router bgp {asn} vrf {vrf}\n\
             neighbor {dev} peer-group\n\
             neighbor {dev} remote-as external\n\
             bgp listen range {subnet} peer-group {dev}\n\
             no bgp default ipv4-unicast\n\
             address-family {afi} unicast\n\
             neighbor {dev} activate\n\
             neighbor {dev} prefix-list {dev}-accept-bgp in\n\
             exit-address-family\n\
             exit\n"
        );
        self.add_config(&frrconf);
        Ok(())
    }

    /// Diffs target against running, applies the dedup'd delete-then-add
    /// command sequence over `vtysh`, then refreshes both trees from the
    /// daemon.
    pub fn finalise(&mut self) -> Result<(), Error> {
        let (adds, deletes) = diff(&self.target, &self.running);
        let adds = dedup_preserve_order(adds);
        let deletes = dedup_preserve_order(deletes);

        for (path, line) in &deletes {
            let args = render_vtysh_args(path, line, true);
            tracing::warn!(?args, "configuring routing daemon");
            let args_ref: Vec<&str> = std::iter::once("vtysh").chain(flatten_c_flags(&args)).collect();
            self.runner.run(&args_ref, crate::runner::RunOpts::checked())?;
        }
        for (path, line) in &adds {
            let args = render_vtysh_args(path, line, false);
            tracing::warn!(?args, "configuring routing daemon");
            let args_ref: Vec<&str> = std::iter::once("vtysh").chain(flatten_c_flags(&args)).collect();
            self.runner.run(&args_ref, crate::runner::RunOpts::checked())?;
        }

        self.update()
    }
}

/// Interleaves `-c <line>` for each nested command, matching `vtysh`'s
/// multi-context invocation style.
fn flatten_c_flags(args: &[String]) -> impl Iterator<Item = &str> + '_ {
    args.iter().flat_map(|a| ["-c", a.as_str()])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::mocks::RecordingRunner;

    fn running_with_asn(runner: &RecordingRunner, asn: &str) {
        runner.push_response(format!("router bgp {asn}\n address-family l2vpn evpn\n advertise-all-vni\n exit-address-family\nexit\n"));
    }

    #[test]
    fn merge_text_builds_nested_context_path() {
        let mut cfg = FrrConfig::new();
        cfg.merge_text("router bgp 65000 vrf vrf-200\n address-family ipv4 unicast\n redistribute kernel\n exit-address-family\nexit\n");
        assert_eq!(
            cfg.context_lines(&["router bgp 65000 vrf vrf-200".to_string(), "address-family ipv4 unicast".to_string()]),
            Some(["redistribute kernel".to_string()].as_slice())
        );
    }

    #[test]
    fn get_asn_finds_top_level_bgp_context() {
        let runner = RecordingRunner::new();
        running_with_asn(&runner, "65000");
        runner.push_response(""); // target file read is not via runner; unused
        let mgr = FrrManager::new(&runner, "/nonexistent/frr.conf").unwrap();
        assert_eq!(mgr.get_asn().unwrap(), 65000);
    }

    #[test]
    fn ensure_bgp_listener_rejects_ge_below_mask_length() {
        let runner = RecordingRunner::new();
        running_with_asn(&runner, "65000");
        let mut mgr = FrrManager::new(&runner, "/nonexistent/frr.conf").unwrap();

        let err = mgr.ensure_bgp_listener("irb-100", "vrf-100", "10.0.0.0/24", "10.0.0.0/26", "0.179.10.20").unwrap_err();
        assert!(matches!(err, Error::InvalidGeLe { .. }));
    }

    #[test]
    fn ensure_bgp_listener_accepts_valid_sentinel() {
        let runner = RecordingRunner::new();
        running_with_asn(&runner, "65000");
        let mut mgr = FrrManager::new(&runner, "/nonexistent/frr.conf").unwrap();

        mgr.ensure_bgp_listener("irb-100", "vrf-100", "10.0.0.0/24", "10.0.0.0/24", "0.179.24.32").unwrap();
        assert!(mgr.target.context_lines(&[]).map(|l| l.iter().any(|s| s.contains("prefix-list"))).unwrap_or(false));
    }

    #[test]
    fn diff_scopes_deletes_and_adds_by_context() {
        let mut running = FrrConfig::new();
        running.merge_text("router bgp 65000\n bgp router-id 10.0.0.1\nexit\n");
        let mut target = FrrConfig::new();
        target.merge_text("router bgp 65000\n bgp bestpath as-path multipath-relax\nexit\n");

        let (adds, deletes) = diff(&target, &running);
        assert_eq!(adds, vec![(vec!["router bgp 65000".to_string()], "bgp bestpath as-path multipath-relax".to_string())]);
        assert_eq!(deletes, vec![(vec!["router bgp 65000".to_string()], "bgp router-id 10.0.0.1".to_string())]);
    }

    #[test]
    fn dedup_preserves_first_occurrence_order() {
        let lines = vec![
            (vec!["a".to_string()], "x".to_string()),
            (vec!["b".to_string()], "y".to_string()),
            (vec!["a".to_string()], "x".to_string()),
        ];
        let deduped = dedup_preserve_order(lines);
        assert_eq!(deduped.len(), 2);
    }
}
