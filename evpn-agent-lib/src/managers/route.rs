//! Route manager. Owns kernel routes tagged with the agent's route-protocol
//! id across every table.

use thiserror::Error;

use crate::ordered_set::OrderedSet;
use crate::runner::CommandRunner;
use crate::types::Route;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Command(#[from] crate::runner::Error),
}

pub struct RouteManager<R> {
    runner: R,
    protocol: String,
    snapshot: Vec<Route>,
    known: OrderedSet<Route>,
}

impl<R: CommandRunner> RouteManager<R> {
    pub fn new(runner: R, protocol: impl Into<String>) -> Result<Self, Error> {
        let mut mgr = RouteManager {
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
                .run_json(&["ip", family, "-j", "-d", "route", "show", "proto", &self.protocol, "table", "all"])?
                .as_array()
                .cloned()
                .unwrap_or_default();
            for rt in entries {
                let raw_dst = rt.get("dst").and_then(|v| v.as_str()).unwrap_or_default();
                let dst_str = if raw_dst == "default" {
                    if family == "-4" { "0.0.0.0/0" } else { "::/0" }
                } else {
                    raw_dst
                };
                let Ok(dst) = dst_str.parse() else { continue };
                let gateway = rt.get("gateway").and_then(|v| v.as_str()).and_then(|s| s.parse().ok());
                let device = rt.get("dev").and_then(|v| v.as_str()).map(str::to_string);
                let kind = rt.get("type").and_then(|v| v.as_str()).unwrap_or("unicast").to_string();
                let metric = rt.get("metric").and_then(|v| v.as_u64()).unwrap_or(1024) as u32;
                let table = rt
                    .get("table")
                    .map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))
                    .unwrap_or_else(|| "main".to_string());

                all.push(Route {
                    dst,
                    gateway,
                    device,
                    kind,
                    metric,
                    table,
                });
            }
        }
        self.snapshot = all;
        Ok(())
    }

    pub fn ensure(&mut self, route: Route) -> Result<(), Error> {
        self.known.insert(route.clone());

        if self.snapshot.contains(&route) {
            return Ok(());
        }

        tracing::warn!(dst = %route.dst, table = %route.table, "adding route");
        let dst_str = route.dst.to_string();
        let metric_str = route.metric.to_string();
        let mut args: Vec<&str> = vec!["ip", "route", "add"];
        if !route.kind.is_empty() {
            args.push(&route.kind);
        }
        args.push(&dst_str);
        let gw_str;
        if let Some(gw) = route.gateway {
            gw_str = gw.to_string();
            args.push("via");
            args.push(&gw_str);
        }
        if let Some(dev) = &route.device {
            args.push("dev");
            args.push(dev);
        }
        args.push("metric");
        args.push(&metric_str);
        args.push("table");
        args.push(&route.table);
        args.push("proto");
        args.push(&self.protocol);
        self.runner.run(&args, crate::runner::RunOpts::checked())?;
        Ok(())
    }

    pub fn prune(&mut self) -> Result<(), Error> {
        for route in self.snapshot.clone() {
            if self.known.contains(&route) {
                continue;
            }
            tracing::warn!(dst = %route.dst, table = %route.table, "removing orphan route");
            let dst_str = route.dst.to_string();
            self.runner.run(
                &["ip", "route", "del", &dst_str, "table", &route.table, "proto", &self.protocol],
                crate::runner::RunOpts::checked(),
            )?;
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

    fn new_mgr(runner: &RecordingRunner) -> RouteManager<&RecordingRunner> {
        RouteManager::new(runner, "186").unwrap()
    }

    #[test]
    fn update_normalises_default_route_per_family() {
        let runner = RecordingRunner::new();
        runner.push_response(r#"[{"dst":"default","gateway":"10.0.0.1","dev":"irb-100","type":"unicast","metric":1024,"table":"200"}]"#);
        runner.push_response(r#"[{"dst":"default","gateway":"2001:db8::1","dev":"irb-100","type":"unicast","metric":1024,"table":"200"}]"#);
        let mgr = new_mgr(&runner);

        assert!(mgr.snapshot.iter().any(|r| r.dst == cidr::IpCidr::from_str("0.0.0.0/0").unwrap()));
        assert!(mgr.snapshot.iter().any(|r| r.dst == cidr::IpCidr::from_str("::/0").unwrap()));
    }

    #[test]
    fn ensure_skips_when_route_already_present() {
        let runner = RecordingRunner::new();
        runner.push_response(r#"[{"dst":"10.1.0.0/24","dev":"irb-100","type":"unicast","metric":1024,"table":"200"}]"#);
        runner.push_response("[]");
        let mut mgr = new_mgr(&runner);

        let route = Route::new(cidr::IpCidr::from_str("10.1.0.0/24").unwrap(), "200").with_device("irb-100");
        mgr.ensure(route).unwrap();
        assert!(runner.calls_matching(&["ip", "route", "add"]).is_empty());
    }

    #[test]
    fn prune_tags_deletes_with_protocol_and_table() {
        let runner = RecordingRunner::new();
        runner.push_response(r#"[{"dst":"10.1.0.0/24","dev":"irb-100","type":"unicast","metric":1024,"table":"200"}]"#);
        runner.push_response("[]");
        let mut mgr = new_mgr(&runner);

        mgr.prune().unwrap();
        let dels = runner.calls_matching(&["ip", "route", "del"]);
        assert_eq!(dels.len(), 1);
        assert!(dels[0].args.contains(&"186".to_string()));
        assert!(dels[0].args.contains(&"200".to_string()));
    }
}
