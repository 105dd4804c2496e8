//! Host identity resolution.

use std::collections::BTreeMap;
use std::fs;

use anyhow::{Result, anyhow, bail};
use tracing::debug;

use crate::core::types::HostIdentity;

const PROC_HOSTNAME: &str = "/proc/sys/kernel/hostname";

/// Resolve the host name once at startup.
///
/// Reads `/proc/sys/kernel/hostname`, falling back to `$HOSTNAME`.
pub fn resolve_hostname() -> Result<String> {
    if let Ok(raw) = fs::read_to_string(PROC_HOSTNAME) {
        let name = raw.trim();
        if !name.is_empty() {
            debug!(hostname = name, source = PROC_HOSTNAME, "resolved hostname");
            return Ok(name.to_string());
        }
    }
    match std::env::var("HOSTNAME") {
        Ok(name) if !name.trim().is_empty() => {
            debug!(hostname = %name, source = "HOSTNAME", "resolved hostname");
            Ok(name.trim().to_string())
        }
        _ => Err(anyhow!(
            "unable to determine hostname (pass --hostname explicitly)"
        )),
    }
}

/// Parse a `key:value` tag. The key must be non-empty; the value may contain `:`.
pub fn parse_tag(raw: &str) -> Result<(String, String)> {
    let Some((key, value)) = raw.split_once(':') else {
        bail!("tag {raw:?} must look like key:value");
    };
    if key.trim().is_empty() {
        bail!("tag {raw:?} has an empty key");
    }
    Ok((key.trim().to_string(), value.to_string()))
}

/// Build the host identity from a resolved name and CLI-supplied tags.
///
/// All CLI tags form a single tag source; no source is added when none are given.
pub fn host_identity(hostname: String, tags: &[String]) -> Result<HostIdentity> {
    let mut identity = HostIdentity::new(hostname);
    if !tags.is_empty() {
        let parsed = tags
            .iter()
            .map(String::as_str)
            .map(parse_tag)
            .collect::<Result<BTreeMap<_, _>>>()?;
        identity = identity.with_tags(parsed);
    }
    Ok(identity)
}
