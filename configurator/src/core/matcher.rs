//! Role applicability: does a role's matcher accept the current host?
//!
//! Matching never fails. Malformed matchers (wrong arity, bad regex, tags
//! without a `:`) resolve to "no match".

use std::collections::{BTreeMap, BTreeSet};

use regex::Regex;

use crate::core::types::{HostIdentity, Matchers};

/// Token in a hostname matcher value replaced by the current host name.
pub const HOSTNAME_TOKEN: &str = "$HOSTNAME";

/// Decide whether `matchers` accept `host`, expanding `$VAR` references from
/// the process environment.
pub fn matches(matchers: &Matchers, host: &HostIdentity) -> bool {
    matches_with_env(matchers, host, |key| std::env::var(key).ok())
}

/// Like [`matches`], but resolves environment references through `lookup`.
///
/// The hostname matcher takes precedence: when it is declared, tags are not
/// consulted. A role with neither matcher never matches.
pub fn matches_with_env<F>(matchers: &Matchers, host: &HostIdentity, lookup: F) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    if !matchers.hostname.is_empty() {
        return hostname_matches(&matchers.hostname, &host.hostname, lookup);
    }
    if !matchers.tags.is_empty() {
        return tags_match(&matchers.tags, &host.tags);
    }
    false
}

fn hostname_matches<F>(rule: &[String], hostname: &str, lookup: F) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    let [operator, value] = rule else {
        return false;
    };
    let value = value.replace(HOSTNAME_TOKEN, hostname);
    match operator.as_str() {
        "=" => expand_env(&value, lookup) == hostname,
        "~" => Regex::new(&value).is_ok_and(|re| re.is_match(hostname)),
        _ => false,
    }
}

/// Every `key:value` matcher tag must appear in the union of the host's tag sources.
pub fn tags_match(matcher_tags: &[String], host_tags: &[BTreeMap<String, String>]) -> bool {
    let mut available: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for source in host_tags {
        for (key, value) in source {
            available.entry(key).or_default().insert(value);
        }
    }

    matcher_tags.iter().all(|tag| {
        tag.split_once(':').is_some_and(|(key, value)| {
            available
                .get(key)
                .is_some_and(|values| values.contains(value))
        })
    })
}

/// Expand `$NAME` and `${NAME}` references. Unset variables expand to "".
///
/// A `$` that does not start a valid reference is kept as-is.
pub fn expand_env<F>(value: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];

        if let Some(braced) = after.strip_prefix('{')
            && let Some(end) = braced.find('}')
        {
            let name = &braced[..end];
            if is_env_name(name) {
                out.push_str(&lookup(name).unwrap_or_default());
                rest = &braced[end + 1..];
                continue;
            }
        }

        let name_len = after
            .char_indices()
            .find(|(_, ch)| !(ch.is_ascii_alphanumeric() || *ch == '_'))
            .map_or(after.len(), |(idx, _)| idx);
        if name_len == 0 {
            out.push('$');
            rest = after;
            continue;
        }
        out.push_str(&lookup(&after[..name_len]).unwrap_or_default());
        rest = &after[name_len..];
    }

    out.push_str(rest);
    out
}

fn is_env_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
}
