//! List and map flag values
//!
//! Lists are comma separated, with `\,` for a literal comma. Maps are lists
//! of `key:value` pairs.

use anyhow::{bail, Context, Result};
use shardctl_core::TabletRole;
use std::collections::BTreeMap;

/// Split a comma separated list, honoring `\,` escapes. Empty items are dropped.
pub fn parse_list(value: &str) -> Vec<String> {
    let mut items = Vec::new();
    let mut current = String::new();
    let mut chars = value.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\\' if chars.peek() == Some(&',') => {
                current.push(',');
                chars.next();
            }
            ',' => items.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    items.push(current);

    items.retain(|item| !item.is_empty());
    items
}

/// Parse `key:value,key:value`
pub fn parse_map(value: &str) -> Result<BTreeMap<String, String>> {
    let mut map = BTreeMap::new();
    for item in parse_list(value) {
        let Some((key, val)) = item.split_once(':') else {
            bail!("Expected key:value, got '{}'", item);
        };
        if key.is_empty() {
            bail!("Empty key in '{}'", item);
        }
        map.insert(key.to_string(), val.to_string());
    }
    Ok(map)
}

/// Parse a port map such as `vt:15000,mysql:3306`
pub fn parse_ports(value: &str) -> Result<BTreeMap<String, u16>> {
    parse_map(value)?
        .into_iter()
        .map(|(name, port)| -> Result<(String, u16)> {
            let port = port
                .parse()
                .with_context(|| format!("Invalid port for {}: {}", name, port))?;
            Ok((name, port))
        })
        .collect()
}

/// Parse served-from redirects such as `replica:source_keyspace`
pub fn parse_served_from(value: &str) -> Result<BTreeMap<TabletRole, String>> {
    parse_map(value)?
        .into_iter()
        .map(|(role, keyspace)| -> Result<(TabletRole, String)> {
            let role: TabletRole = role.parse()?;
            Ok((role, keyspace))
        })
        .collect()
}

/// Split `keyspace/shard`
pub fn parse_keyspace_shard(value: &str) -> Result<(String, String)> {
    match value.split_once('/') {
        Some((keyspace, shard)) if !keyspace.is_empty() && !shard.is_empty() => {
            Ok((keyspace.to_string(), shard.to_string()))
        }
        _ => bail!("Expected keyspace/shard, got '{}'", value),
    }
}

/// Keyspace id in decimal or `0x` hex
pub fn parse_keyspace_id(value: &str) -> Result<u64> {
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.with_context(|| format!("Invalid keyspace id: {}", value))
}
