use std::collections::HashMap;
use std::str::FromStr;

use crate::model::{ValidationError, normalize_hostname};

/// The `dns.*` label namespace of a single container, with the configured
/// prefix stripped.
///
/// Lookups follow the precedence chain `<provider_type>.<attr>` then `<attr>`;
/// attribute values are untyped strings and are coerced on access so a bad
/// value surfaces as a structured error instead of tearing down a cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DnsLabels {
    values: HashMap<String, String>,
}

impl DnsLabels {
    /// Extract the DNS namespace from a container's full label map.
    ///
    /// `prefix` is the configured label prefix including the trailing dot,
    /// e.g. `dns.`.
    pub fn from_container_labels(labels: &HashMap<String, String>, prefix: &str) -> Self {
        let values = labels
            .iter()
            .filter_map(|(key, value)| {
                key.strip_prefix(prefix)
                    .map(|attr| (attr.to_string(), value.trim().to_string()))
            })
            .collect();

        Self { values }
    }

    #[cfg(test)]
    pub fn from_pairs(pairs: &[(&str, &str)]) -> Self {
        Self {
            values: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Raw lookup of an unscoped attribute
    pub fn get(&self, attr: &str) -> Option<&str> {
        self.values.get(attr).map(String::as_str)
    }

    /// Lookup honoring provider scoping: `<provider_type>.<attr>` wins over
    /// the generic `<attr>`.
    pub fn scoped(&self, provider_type: &str, attr: &str) -> Option<&str> {
        self.values
            .get(&format!("{}.{}", provider_type, attr))
            .or_else(|| self.values.get(attr))
            .map(String::as_str)
    }

    /// Scoped lookup coerced to a type, with a structured error on junk
    pub fn scoped_parsed<T: FromStr>(
        &self,
        provider_type: &str,
        attr: &str,
        expected: &'static str,
    ) -> Result<Option<T>, ValidationError> {
        match self.scoped(provider_type, attr) {
            None => Ok(None),
            Some(raw) => raw
                .parse::<T>()
                .map(Some)
                .map_err(|_| ValidationError::BadLabelValue {
                    field: attr.to_string(),
                    value: raw.to_string(),
                    expected,
                }),
        }
    }

    /// Scoped boolean lookup; accepts true/false, 1/0, yes/no
    pub fn scoped_bool(
        &self,
        provider_type: &str,
        attr: &str,
    ) -> Result<Option<bool>, ValidationError> {
        match self.scoped(provider_type, attr) {
            None => Ok(None),
            Some(raw) => parse_bool(raw).map(Some).ok_or(ValidationError::BadLabelValue {
                field: attr.to_string(),
                value: raw.to_string(),
                expected: "boolean",
            }),
        }
    }

    /// Unscoped boolean lookup (for policy labels like `skip` and `manage`)
    pub fn flag(&self, attr: &str) -> Option<bool> {
        self.get(attr).and_then(parse_bool)
    }

    /// Hostnames declared directly on the container, used in direct mode.
    ///
    /// Recognized forms, all of which may be combined:
    /// - `hostname=h1,h2,h3`
    /// - `domain=d` + `subdomain=s1,s2`
    /// - `domain=d` + `use_apex=true`
    /// - `host.1=h`, `host.2=h`, ...
    pub fn hostnames(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();

        if let Some(list) = self.get("hostname") {
            out.extend(split_list(list));
        }

        if let Some(domain) = self.get("domain") {
            let domain = normalize_hostname(domain);

            if let Some(subs) = self.get("subdomain") {
                for sub in split_list(subs) {
                    out.push(format!("{}.{}", sub, domain));
                }
            }

            if self.flag("use_apex") == Some(true) {
                out.push(domain.clone());
            }
        }

        // dns.host.N=h for N=1,2,...
        let mut n = 1;
        while let Some(host) = self.get(&format!("host.{}", n)) {
            out.push(host.to_string());
            n += 1;
        }

        let mut seen = std::collections::HashSet::new();
        out.into_iter()
            .map(|h| normalize_hostname(&h))
            .filter(|h| !h.is_empty() && seen.insert(h.clone()))
            .collect()
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|part| part.trim().to_lowercase())
        .filter(|part| !part.is_empty())
        .collect()
}
