//! Channel schema: key names and value encodings

// Deployment partition (leader-written)
pub const MEMBERS_IPS: &str = "members-ips";
pub const CLUSTER_INITIALISED: &str = "cluster_initialised";
pub const PROMOTED_CLUSTER_COUNTER: &str = "promoted-cluster-counter";
pub const STANZA: &str = "stanza";
pub const CREDENTIALS_SECRET_ID: &str = "credentials-secret-id";
pub const WITNESS_ADDRESS: &str = "witness-address";

// Link partition (leader-written, one per side)
pub const PRIMARY_CLUSTER_DATA: &str = "primary-cluster-data";
pub const PROMOTED_CLUSTER_CONFIRMED: &str = "promoted-cluster-confirmed";

// Witness link partition (leader-written)
pub const RAFT_SECRET_ID: &str = "raft-secret-id";
pub const PG_ENDPOINTS: &str = "pg-endpoints";
pub const RAFT_PARTNER_ADDRS: &str = "raft-partner-addrs";
pub const RAFT_PORT: &str = "raft-port";
pub const CLUSTER_NAME: &str = "cluster-name";

// Member partition
pub const IP: &str = "ip";
pub const IP_TO_REMOVE: &str = "ip-to-remove";
pub const UNIT_PROMOTED_CLUSTER_COUNTER: &str = "unit-promoted-cluster-counter";
pub const STOPPED: &str = "stopped";
pub const REINITIALISED_COUNTER: &str = "reinitialised-counter";

// Link-member partition
pub const UNIT_ADDRESS: &str = "unit-address";

pub const TRUE: &str = "True";

/// Flags are stored as `"True"`; anything else (or absence) is false
pub fn flag(value: Option<&str>) -> bool {
    value == Some(TRUE)
}

/// Counters are decimal strings; absent or empty means 0
pub fn counter(value: Option<&str>) -> u64 {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

/// JSON string arrays; malformed values read as empty
pub fn string_list(value: Option<&str>) -> Vec<String> {
    value
        .and_then(|v| serde_json::from_str(v).ok())
        .unwrap_or_default()
}

pub fn encode_list<S: AsRef<str>>(items: &[S]) -> String {
    let items: Vec<&str> = items.iter().map(AsRef::as_ref).collect();
    serde_json::to_string(&items).unwrap_or_else(|_| "[]".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter() {
        assert_eq!(counter(None), 0);
        assert_eq!(counter(Some("")), 0);
        assert_eq!(counter(Some("7")), 7);
        assert_eq!(counter(Some("junk")), 0);
    }

    #[test]
    fn test_flag() {
        assert!(flag(Some("True")));
        assert!(!flag(Some("true")));
        assert!(!flag(None));
    }

    #[test]
    fn test_lists() {
        let encoded = encode_list(&["10.0.0.1", "10.0.0.2"]);
        assert_eq!(encoded, r#"["10.0.0.1","10.0.0.2"]"#);
        assert_eq!(string_list(Some(&encoded)), vec!["10.0.0.1", "10.0.0.2"]);
        assert!(string_list(Some("not json")).is_empty());
    }
}
