//! Version information for hostbridge.

/// Hostbridge version from Cargo.toml
pub const HOSTBRIDGE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Environment descriptor returned to the backend as the user agent.
#[derive(Debug, Clone, serde::Serialize)]
pub struct VersionInfo {
    /// Engine version.
    pub hostbridge: &'static str,
    /// Operating system (if known).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
    /// CPU architecture (if known).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arch: Option<String>,
    /// Embedding host, e.g. a browser shell or test harness.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            hostbridge: HOSTBRIDGE_VERSION,
            os: None,
            arch: None,
            host: None,
        }
    }
}

impl VersionInfo {
    /// Create version info with the engine version only.
    pub fn new() -> Self {
        Self::default()
    }

    /// Version info for the running process.
    pub fn detect() -> Self {
        Self::new()
            .with_os(std::env::consts::OS.to_string())
            .with_arch(std::env::consts::ARCH.to_string())
    }

    pub fn with_os(mut self, os: String) -> Self {
        self.os = Some(os);
        self
    }

    pub fn with_arch(mut self, arch: String) -> Self {
        self.arch = Some(arch);
        self
    }

    pub fn with_host(mut self, host: String) -> Self {
        self.host = Some(host);
        self
    }

    /// User-agent style string: `hostbridge/<version> (<os>; <arch>) <host>`.
    pub fn user_agent(&self) -> String {
        let mut ua = format!("hostbridge/{}", self.hostbridge);
        let platform: Vec<&str> = [self.os.as_deref(), self.arch.as_deref()]
            .into_iter()
            .flatten()
            .collect();
        if !platform.is_empty() {
            ua.push_str(&format!(" ({})", platform.join("; ")));
        }
        if let Some(host) = &self.host {
            ua.push(' ');
            ua.push_str(host);
        }
        ua
    }
}

pub fn default_user_agent() -> String {
    VersionInfo::detect().user_agent()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_info_has_engine_version() {
        let info = VersionInfo::new();
        assert_eq!(info.hostbridge, HOSTBRIDGE_VERSION);
        assert!(info.os.is_none());
        assert!(info.host.is_none());
    }

    #[test]
    fn user_agent_formats() {
        let info = VersionInfo {
            hostbridge: "0.1.0",
            os: None,
            arch: None,
            host: None,
        };
        assert_eq!(info.user_agent(), "hostbridge/0.1.0");

        let info = info
            .with_os("linux".to_string())
            .with_arch("x86_64".to_string())
            .with_host("demo".to_string());
        assert_eq!(info.user_agent(), "hostbridge/0.1.0 (linux; x86_64) demo");
    }

    #[test]
    fn version_info_serializes_minimal() {
        let info = VersionInfo {
            hostbridge: "0.1.0",
            os: None,
            arch: None,
            host: None,
        };
        insta::assert_json_snapshot!(info, @r#"
        {
          "hostbridge": "0.1.0"
        }
        "#);
    }

    #[test]
    fn detected_agent_mentions_platform() {
        let ua = default_user_agent();
        assert!(ua.starts_with("hostbridge/"));
        assert!(ua.contains(std::env::consts::OS));
    }
}
