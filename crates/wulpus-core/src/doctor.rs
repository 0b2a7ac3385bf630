//! `doctor` diagnostics used by the CLI.
//!
//! Each check has an identifier, a status ("pass", "warn" or "fail") and a
//! summary. The overall status is the worst status across all checks.

use std::env;
use std::net::ToSocketAddrs;
use std::time::Duration;

use serde::Serialize;

use crate::client::BridgeClient;
use crate::config::{self, Config};

const PING_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct DoctorReport {
    pub version: String,
    pub overall: String,
    pub checks: Vec<DoctorCheck>,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct DoctorCheck {
    pub id: String,
    pub status: String,
    pub summary: String,
}

fn mk(id: &str, status: &str, summary: impl Into<String>) -> DoctorCheck {
    DoctorCheck {
        id: id.to_string(),
        status: status.to_string(),
        summary: summary.into(),
    }
}

fn aggregate_overall(checks: &[DoctorCheck]) -> String {
    // fail > warn > pass
    if checks.iter().any(|c| c.status == "fail") {
        "fail".to_string()
    } else if checks.iter().any(|c| c.status == "warn") {
        "warn".to_string()
    } else {
        "pass".to_string()
    }
}

fn resolve_check(addr: &str) -> Result<usize, String> {
    let addrs: Vec<_> = addr
        .to_socket_addrs()
        .map_err(|e| format!("resolution failed for {}: {}", addr, e))?
        .collect();
    if addrs.is_empty() {
        return Err(format!("no addresses for {}", addr));
    }
    Ok(addrs.len())
}

async fn ping_check(addr: &str) -> DoctorCheck {
    let result = async {
        let mut client = BridgeClient::connect(addr, PING_TIMEOUT).await?;
        let rtt = client.ping().await?;
        client.close().await?;
        Ok::<_, crate::client::ClientError>(rtt)
    };
    match tokio::time::timeout(PING_TIMEOUT * 2, result).await {
        Ok(Ok(rtt)) => mk("bridge.ping", "pass", format!("pong from {} in {:?}", addr, rtt)),
        Ok(Err(e)) => mk("bridge.ping", "fail", format!("{}: {}", addr, e)),
        Err(_) => mk("bridge.ping", "fail", format!("{}: timed out", addr)),
    }
}

pub async fn doctor_check() -> DoctorReport {
    let mut checks: Vec<DoctorCheck> = Vec::new();

    // 1) config load check; a missing file means defaults
    let path = config::config_path();
    let cfg_res = if path.exists() {
        config::load_config().and_then(|(cfg, path)| {
            cfg.validate()
                .map_err(|e| format!("config validation failed: {}", e))?;
            Ok((cfg, path))
        })
    } else {
        Ok((Config::default(), path.clone()))
    };
    match &cfg_res {
        Ok((_cfg, p)) if p.exists() => {
            checks.push(mk("cfg.load", "pass", format!("loaded config: {}", p.display())));
        }
        Ok((_cfg, p)) => {
            checks.push(mk(
                "cfg.load",
                "warn",
                format!("no config at {}, using defaults", p.display()),
            ));
        }
        Err(err) => checks.push(mk("cfg.load", "fail", err)),
    }

    // 2) bridge reachability
    let addr = match &cfg_res {
        Ok((cfg, _)) => cfg.client_addr(),
        Err(_) => {
            checks.push(mk("net.resolve", "warn", "skipped because config load failed"));
            checks.push(mk("bridge.ping", "warn", "skipped because config load failed"));
            return finish(checks);
        }
    };
    match env::var("WULPUS_DOCTOR_NET").as_deref() {
        Ok("pass") => {
            checks.push(mk("net.resolve", "pass", "forced pass via WULPUS_DOCTOR_NET"));
            checks.push(mk("bridge.ping", "pass", "forced pass via WULPUS_DOCTOR_NET"));
        }
        Ok("fail") => {
            checks.push(mk("net.resolve", "fail", "forced fail via WULPUS_DOCTOR_NET"));
            checks.push(mk("bridge.ping", "fail", "forced fail via WULPUS_DOCTOR_NET"));
        }
        Ok("skip") => {
            checks.push(mk("net.resolve", "warn", "skipped via WULPUS_DOCTOR_NET"));
            checks.push(mk("bridge.ping", "warn", "skipped via WULPUS_DOCTOR_NET"));
        }
        _ => match resolve_check(&addr) {
            Ok(count) => {
                checks.push(mk(
                    "net.resolve",
                    "pass",
                    format!("resolved {} to {} addr(s)", addr, count),
                ));
                checks.push(ping_check(&addr).await);
            }
            Err(e) => {
                checks.push(mk("net.resolve", "fail", e));
                checks.push(mk("bridge.ping", "warn", "skipped because net.resolve failed"));
            }
        },
    }

    finish(checks)
}

fn finish(checks: Vec<DoctorCheck>) -> DoctorReport {
    DoctorReport {
        version: env!("CARGO_PKG_VERSION").to_string(),
        overall: aggregate_overall(&checks),
        checks,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overall_prefers_fail_over_warn() {
        let checks = vec![mk("a", "pass", ""), mk("b", "warn", ""), mk("c", "fail", "")];
        assert_eq!(aggregate_overall(&checks), "fail");
        assert_eq!(aggregate_overall(&checks[..2]), "warn");
        assert_eq!(aggregate_overall(&checks[..1]), "pass");
    }

    #[test]
    fn report_serializes_with_stable_keys() {
        let report = finish(vec![mk("cfg.load", "warn", "defaults")]);
        let value = serde_json::to_value(&report).expect("json");
        assert_eq!(value["overall"], "warn");
        assert_eq!(value["checks"][0]["id"], "cfg.load");
        assert!(value["version"].is_string());
    }

    #[test]
    fn resolve_rejects_garbage() {
        assert!(resolve_check("not an address").is_err());
        assert_eq!(resolve_check("127.0.0.1:2121"), Ok(1));
    }
}
