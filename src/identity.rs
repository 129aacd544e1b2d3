//! Stable agent identity: a UUID generated once and persisted, plus the
//! runtime/platform descriptors sent to the coordinator on connect.

use serde::{Deserialize, Serialize};

use crate::PROTOCOL_VERSION;

/// Identity advertised to the coordinator in the control-channel connect URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentIdentity {
    pub uuid: String,
    pub name: String,
    pub runtime: String,
    pub platform: String,
    pub version: String,
}

impl AgentIdentity {
    pub fn new(uuid: String, name: String) -> Self {
        Self {
            uuid,
            name,
            runtime: runtime_descriptor(),
            platform: platform_descriptor(),
            version: PROTOCOL_VERSION.to_string(),
        }
    }

    /// URL-encode the display name once, for embedding in the connect URL.
    pub fn encoded_name(&self) -> String {
        percent_encoding::utf8_percent_encode(&self.name, percent_encoding::NON_ALPHANUMERIC)
            .to_string()
    }
}

fn runtime_descriptor() -> String {
    format!("Rust{}", env!("CARGO_PKG_VERSION"))
}

fn platform_descriptor() -> String {
    match std::env::consts::ARCH {
        "x86_64" => "win64".to_string(),
        _ => "win32".to_string(),
    }
}

/// Generate a fresh uppercase `XXXXXXXX-XXXX-XXXX-XXXX-XXXXXXXXXXXXX` uuid
/// suffixed with the literal "infoc", matching the wire format the
/// coordinator and the broadcast auth frame expect.
pub fn generate_uuid() -> String {
    let raw = uuid::Uuid::new_v4().simple().to_string().to_uppercase();
    // raw is 32 hex chars; re-group as 8-4-4-4-12 then append the suffix.
    let (a, rest) = raw.split_at(8);
    let (b, rest) = rest.split_at(4);
    let (c, rest) = rest.split_at(4);
    let (d, e) = rest.split_at(4);
    format!("{a}-{b}-{c}-{d}-{e}infoc")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_uuid_has_expected_shape() {
        let id = generate_uuid();
        assert!(id.ends_with("infoc"));
        let body = &id[..id.len() - "infoc".len()];
        let groups: Vec<&str> = body.split('-').collect();
        assert_eq!(groups.len(), 5);
        assert_eq!(groups.iter().map(|g| g.len()).collect::<Vec<_>>(), vec![
            8, 4, 4, 4, 12
        ]);
        assert!(body.chars().all(|c| c == '-' || c.is_ascii_hexdigit()));
        assert_eq!(body, body.to_uppercase());
    }

    #[test]
    fn encoded_name_percent_encodes() {
        let id = AgentIdentity::new("u".into(), "DD 测试".into());
        assert!(!id.encoded_name().contains(' '));
    }
}
