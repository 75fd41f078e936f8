//! Container metadata decoding
//!
//! Service definitions come from container labels and environment variables.
//! Only `SERVICE_*` keys contribute; env wins over labels on conflict. A key
//! of the form `SERVICE_<port>_<rest>` applies only to that port and takes
//! precedence over the unscoped `SERVICE_<rest>` key.

use std::collections::{HashMap, HashSet};

/// Look up `key` in `map`, falling back to `default` when the key is missing
/// or its value is empty.
pub fn map_default(map: &HashMap<String, String>, key: &str, default: &str) -> String {
    match map.get(key) {
        Some(v) if !v.is_empty() => v.clone(),
        _ => default.to_string(),
    }
}

/// Case-insensitive lookup of `key` in a `NAME=value` environment list.
pub fn lookup_env(env: &[String], key: &str) -> String {
    for entry in env {
        if let Some((name, value)) = entry.split_once('=') {
            if name.eq_ignore_ascii_case(key) {
                return value.to_string();
            }
        }
    }
    String::new()
}

/// Split a comma-separated tag list, honoring `\,` as an escaped literal
/// comma. Empty segments are dropped.
pub fn parse_escaped_comma(input: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' && chars.peek() == Some(&',') {
            current.push(',');
            chars.next();
        } else if c == ',' {
            if !current.is_empty() {
                out.push(std::mem::take(&mut current));
            }
        } else {
            current.push(c);
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

/// Parse and concatenate several tag lists.
pub fn combine_tags(parts: &[&str]) -> Vec<String> {
    let mut tags = Vec::new();
    for part in parts {
        tags.extend(parse_escaped_comma(part));
    }
    tags
}

/// Decode the `SERVICE_*` metadata for one port.
///
/// Returns the metadata map (keys lower-cased, prefix stripped) and the set
/// of keys that came from a port-scoped variable. Keys in that set were
/// matched to `port` explicitly and must not be clobbered by the unscoped
/// spelling of the same key.
pub fn service_metadata(
    labels: &HashMap<String, String>,
    env: &[String],
    port: &str,
) -> (HashMap<String, String>, HashSet<String>) {
    // Env takes precedence over labels
    let mut merged: HashMap<String, String> = labels.clone();
    for entry in env {
        if let Some((name, value)) = entry.split_once('=') {
            merged.insert(name.to_string(), value.to_string());
        }
    }

    let mut metadata = HashMap::new();
    let mut from_port = HashSet::new();
    for (name, value) in &merged {
        let Some(stripped) = name.strip_prefix("SERVICE_") else {
            continue;
        };
        if stripped.is_empty() {
            continue;
        }
        let key = stripped.to_lowercase();
        if from_port.contains(&key) {
            continue;
        }
        match key.split_once('_') {
            Some((prefix, rest)) if prefix.parse::<u32>().is_ok() && !rest.is_empty() => {
                if prefix != port {
                    continue;
                }
                metadata.insert(rest.to_string(), value.clone());
                from_port.insert(rest.to_string());
            }
            _ => {
                metadata.insert(key, value.clone());
            }
        }
    }
    (metadata, from_port)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sorted(mut v: Vec<String>) -> Vec<String> {
        v.sort();
        v
    }

    #[test]
    fn escaped_comma_grid() {
        let cases: Vec<(&str, Vec<&str>)> = vec![
            ("", vec![]),
            ("foobar", vec!["foobar"]),
            ("foo,bar", vec!["foo", "bar"]),
            ("foo\\,bar", vec!["foo,bar"]),
            ("foo,bar\\,baz", vec!["foo", "bar,baz"]),
            ("\\,foobar\\,", vec![",foobar,"]),
            (",,,,foo,,,bar,,,", vec!["foo", "bar"]),
            (",,,,", vec![]),
            (",,\\,,", vec![","]),
        ];
        for (input, expected) in cases {
            let expected: Vec<String> = expected.into_iter().map(String::from).collect();
            assert_eq!(
                sorted(parse_escaped_comma(input)),
                sorted(expected),
                "input: {input:?}"
            );
        }
    }

    #[test]
    fn map_default_returns_default_when_missing() {
        let metadata = HashMap::from([("test-item".to_string(), "test-value".to_string())]);
        assert_eq!(map_default(&metadata, "bla", "my-default"), "my-default");
    }

    #[test]
    fn map_default_returns_value_when_present() {
        let metadata = HashMap::from([("test-item".to_string(), "test-value".to_string())]);
        assert_eq!(map_default(&metadata, "test-item", "my-default"), "test-value");
    }

    #[test]
    fn map_default_treats_empty_as_missing() {
        let metadata = HashMap::from([("empty".to_string(), String::new())]);
        assert_eq!(map_default(&metadata, "empty", "fallback"), "fallback");
    }

    #[test]
    fn lookup_env_returns_value_when_present() {
        let env = vec!["MY_VAR=a".to_string(), "MY_VAR2=b".to_string()];
        assert_eq!(lookup_env(&env, "MY_VAR"), "a");
        assert_eq!(lookup_env(&env, "my_var"), "a");
    }

    #[test]
    fn lookup_env_returns_empty_when_absent() {
        let env = vec!["MY_VAR=a".to_string(), "MY_VAR2=b".to_string()];
        assert_eq!(lookup_env(&env, "NOT_HERE"), "");
    }

    #[test]
    fn port_scoped_value_takes_precedence() {
        let labels = HashMap::from([("SERVICE_FOO".to_string(), "a".to_string())]);
        let env = vec![
            "SERVICE_FOO=b".to_string(),
            "SERVICE_BAR=c".to_string(),
            "NOT_ME=d".to_string(),
            "SERVICE_1234_FOO=e".to_string(),
        ];

        let (metadata, from_port) = service_metadata(&labels, &env, "1234");
        assert_eq!(
            metadata,
            HashMap::from([
                ("foo".to_string(), "e".to_string()),
                ("bar".to_string(), "c".to_string()),
            ])
        );
        assert_eq!(from_port, HashSet::from(["foo".to_string()]));
    }

    #[test]
    fn unscoped_value_used_for_other_ports() {
        let labels = HashMap::from([("SERVICE_FOO".to_string(), "a".to_string())]);
        let env = vec![
            "SERVICE_FOO=b".to_string(),
            "SERVICE_BAR=c".to_string(),
            "NOT_ME=d".to_string(),
            "SERVICE_1234_FOO=e".to_string(),
        ];

        let (metadata, from_port) = service_metadata(&labels, &env, "");
        assert_eq!(
            metadata,
            HashMap::from([
                ("foo".to_string(), "b".to_string()),
                ("bar".to_string(), "c".to_string()),
            ])
        );
        assert!(from_port.is_empty());
    }

    #[test]
    fn labels_alone_are_decoded() {
        let labels = HashMap::from([
            ("SERVICE_NAME".to_string(), "web".to_string()),
            ("SERVICE_TAGS".to_string(), "prod,edge".to_string()),
            ("traefik.enable".to_string(), "true".to_string()),
        ]);

        let (metadata, _) = service_metadata(&labels, &[], "80");
        assert_eq!(metadata.get("name"), Some(&"web".to_string()));
        assert_eq!(metadata.get("tags"), Some(&"prod,edge".to_string()));
        assert!(!metadata.contains_key("traefik.enable"));
    }

    #[test]
    fn numeric_key_without_rest_is_kept_verbatim() {
        let env = vec!["SERVICE_80=enabled".to_string()];
        let (metadata, from_port) = service_metadata(&HashMap::new(), &env, "80");
        assert_eq!(metadata.get("80"), Some(&"enabled".to_string()));
        assert!(from_port.is_empty());
    }

    #[test]
    fn backend_prefixed_keys_pass_through() {
        let env = vec![
            "NOT_ME=d".to_string(),
            "SERVICE_FOO=b".to_string(),
            "SERVICE_1234_FOO=e".to_string(),
            "SERVICE_EUREKA_METADATA_branch=testbranch".to_string(),
        ];

        let (metadata, from_port) = service_metadata(&HashMap::new(), &env, "");
        assert_eq!(
            metadata,
            HashMap::from([
                ("eureka_metadata_branch".to_string(), "testbranch".to_string()),
                ("foo".to_string(), "b".to_string()),
            ])
        );
        assert!(from_port.is_empty());
    }
}
