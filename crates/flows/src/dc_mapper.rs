// SPDX-License-Identifier: Apache-2.0

//! Static mapping between host addresses and datacenters.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// One address → DC mapping entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DCMapEntry {
    /// Host address.
    pub host_addr: String,
    /// Datacenter the address belongs to.
    pub dc: String,
}

/// Configuration for [`StaticDCMapper`].
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct StaticDCMapperConfig {
    /// All known address → DC entries.
    pub entries: Vec<DCMapEntry>,
}

/// Looks up datacenters by host address and vice versa.
#[derive(Clone, Debug, Default)]
pub struct StaticDCMapper {
    host_addr_to_dc: HashMap<String, String>,
    dc_to_all_hosts: HashMap<String, Vec<String>>,
    all_dcs: Vec<String>,
}

impl StaticDCMapper {
    /// Builds the mapper from its configuration.
    pub fn new(config: &StaticDCMapperConfig) -> Self {
        let mut mapper = StaticDCMapper::default();
        for entry in &config.entries {
            let _ = mapper
                .host_addr_to_dc
                .insert(entry.host_addr.clone(), entry.dc.clone());
            mapper
                .dc_to_all_hosts
                .entry(entry.dc.clone())
                .or_default()
                .push(entry.host_addr.clone());
            if !mapper.all_dcs.contains(&entry.dc) {
                mapper.all_dcs.push(entry.dc.clone());
            }
        }
        mapper
    }

    /// The DC of `host_addr`, if known.
    pub fn host_dc(&self, host_addr: &str) -> Option<&str> {
        self.host_addr_to_dc.get(host_addr).map(String::as_str)
    }

    /// All host addresses of `dc`, if known.
    pub fn hosts_for_dc(&self, dc: &str) -> Option<&[String]> {
        self.dc_to_all_hosts.get(dc).map(Vec::as_slice)
    }

    /// All DCs, in first-seen order.
    pub fn all_dcs(&self) -> &[String] {
        &self.all_dcs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapper() -> StaticDCMapper {
        StaticDCMapper::new(&StaticDCMapperConfig {
            entries: vec![
                DCMapEntry {
                    host_addr: "10.0.0.1".into(),
                    dc: "chicago".into(),
                },
                DCMapEntry {
                    host_addr: "10.0.0.2".into(),
                    dc: "chicago".into(),
                },
                DCMapEntry {
                    host_addr: "10.1.0.1".into(),
                    dc: "detroit".into(),
                },
            ],
        })
    }

    #[test]
    fn lookups_both_ways() {
        let m = mapper();
        assert_eq!(m.host_dc("10.0.0.1"), Some("chicago"));
        assert_eq!(m.host_dc("10.9.9.9"), None);
        assert_eq!(
            m.hosts_for_dc("chicago"),
            Some(&["10.0.0.1".to_string(), "10.0.0.2".to_string()][..])
        );
        assert_eq!(m.hosts_for_dc("tokyo"), None);
        assert_eq!(m.all_dcs(), &["chicago".to_string(), "detroit".to_string()]);
    }
}
