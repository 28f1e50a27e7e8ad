// probe.rs - `cf-agent probe`: connect, identify, ask for VERSION.

use std::sync::Arc;

use cf_actuators::AgentConfig;
use cf_net::{parse_from_config, Connect, ConnectionFlags, Connector, RustlsSecurity};

/// Split `host`, `host:port` or `[v6]:port`; a bare host gets `default_port`.
fn split_target<'a>(target: &'a str, default_port: &'a str) -> anyhow::Result<(&'a str, &'a str)> {
    if let Some(rest) = target.strip_prefix('[') {
        let (host, after) = rest
            .split_once(']')
            .ok_or_else(|| anyhow::anyhow!("unterminated '[' in {}", target))?;
        return match after.strip_prefix(':') {
            Some(port) if !port.is_empty() => Ok((host, port)),
            None if after.is_empty() => Ok((host, default_port)),
            _ => anyhow::bail!("malformed target {}", target),
        };
    }
    match target.matches(':').count() {
        0 => Ok((target, default_port)),
        1 => match target.split_once(':') {
            Some((host, port)) if !host.is_empty() && !port.is_empty() => Ok((host, port)),
            _ => anyhow::bail!("malformed target {}", target),
        },
        // Bare IPv6 address.
        _ => Ok((target, default_port)),
    }
}

pub fn execute(
    config: &AgentConfig,
    target: &str,
    protocol: Option<&str>,
    trust_server: bool,
) -> anyhow::Result<()> {
    let (host, port) = split_target(target, &config.port)?;
    let version = match protocol {
        Some(setting) => {
            let parsed = parse_from_config(Some(setting));
            if parsed.is_undefined() {
                anyhow::bail!("unknown protocol '{}'", setting);
            }
            parsed
        }
        None => config.protocol(),
    };

    let mut security = RustlsSecurity::new();
    if let Some(anchor) = &config.trust_anchor {
        security = security.with_trust_anchors(anchor)?;
    }
    let mut connector = Connector::new(Arc::new(security))
        .with_timeouts(config.connect_timeout(), config.io_timeout());
    if let Some(username) = &config.username {
        connector = connector.with_username(username.clone());
    }

    let flags = ConnectionFlags::new(version).with_trust_server(trust_server);
    tracing::debug!(host, port, protocol = %version, trust_server, "probing server");
    let mut conn = connector.connect(host, port, flags)?;
    let server_version = conn.server_version()?;

    println!("Server:     {}:{}", conn.server(), conn.port());
    if let Some(ip) = conn.remote_ip() {
        println!("Address:    {}", ip);
    }
    println!("Protocol:   {}", conn.protocol());
    println!("Encrypted:  {}", if conn.is_encrypted() { "yes" } else { "no" });
    println!("Peer key:   {}", conn.peer_key_digest().unwrap_or("-"));
    println!("Version:    {}", server_version);
    conn.disconnect();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn targets_split_into_host_and_port() {
        assert_eq!(split_target("hub", "5308").unwrap(), ("hub", "5308"));
        assert_eq!(split_target("hub:1234", "5308").unwrap(), ("hub", "1234"));
        assert_eq!(split_target("[::1]:99", "5308").unwrap(), ("::1", "99"));
        assert_eq!(split_target("[::1]", "5308").unwrap(), ("::1", "5308"));
        assert_eq!(split_target("fe80::1", "5308").unwrap(), ("fe80::1", "5308"));
        assert!(split_target("hub:", "5308").is_err());
        assert!(split_target("[::1", "5308").is_err());
    }
}
