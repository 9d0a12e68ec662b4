//! Persisted model and host path layout
//!
//! The model file is the single source of truth for what natctl manages. It
//! is read once at startup, validated, and rewritten atomically after every
//! committed mutation. Unknown fields are ignored and every field added
//! since the first release carries a serde default, so older files keep
//! loading.

use crate::core::error::{Error, Result, ValidationError};
use crate::core::model::{Bridge, PortForward, Protocol};
use crate::utils;
use crate::validators;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

/// Directory holding the model file and generated dnsmasq config.
/// Packagers may relocate it at build time.
pub const SYSTEM_CONFIG_DIR: &str = match option_env!("NATCTL_SYSTEM_CONFIG_DIR") {
    Some(dir) => dir,
    None => "/etc/natctl",
};

pub const CONFIG_FILE_NAME: &str = "natctl.json";
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:9090";
pub const DEFAULT_PAM_SERVICE: &str = "natctl";

pub const AUTH_MODE_LOCAL: &str = "local";
pub const AUTH_MODE_PAM: &str = "pam";

/// Every fixed filesystem location natctl touches
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPaths {
    pub config_file: PathBuf,
    pub rules_dir: PathBuf,
    pub rules_file: PathBuf,
    pub sysctl_file: PathBuf,
    pub ip_forward: PathBuf,
    pub dnsmasq_config: PathBuf,
    pub lease_file: PathBuf,
    pub audit_log: PathBuf,
    pub sys_class_net: PathBuf,
}

impl Default for HostPaths {
    fn default() -> Self {
        let config_dir = Path::new(SYSTEM_CONFIG_DIR);
        Self {
            config_file: config_dir.join(CONFIG_FILE_NAME),
            rules_dir: PathBuf::from("/run/natctl"),
            rules_file: PathBuf::from("/run/natctl/rules.nft"),
            sysctl_file: PathBuf::from("/etc/sysctl.d/90-natctl.conf"),
            ip_forward: PathBuf::from("/proc/sys/net/ipv4/ip_forward"),
            dnsmasq_config: config_dir.join("dnsmasq.conf"),
            lease_file: PathBuf::from("/var/lib/natctl/dnsmasq.leases"),
            audit_log: PathBuf::from("/var/log/natctl/audit.log"),
            sys_class_net: PathBuf::from("/sys/class/net"),
        }
    }
}

impl HostPaths {
    /// Same layout re-rooted under `root`; used by tests and dry runs.
    pub fn under(root: &Path) -> Self {
        Self {
            config_file: root.join("etc/natctl").join(CONFIG_FILE_NAME),
            rules_dir: root.join("run/natctl"),
            rules_file: root.join("run/natctl/rules.nft"),
            sysctl_file: root.join("etc/sysctl.d/90-natctl.conf"),
            ip_forward: root.join("ip_forward"),
            dnsmasq_config: root.join("etc/natctl/dnsmasq.conf"),
            lease_file: root.join("var/lib/natctl/dnsmasq.leases"),
            audit_log: root.join("var/log/natctl/audit.log"),
            sys_class_net: root.join("sys/class/net"),
        }
    }

    /// Defaults with a different model file
    pub fn with_config_file(path: impl Into<PathBuf>) -> Self {
        Self {
            config_file: path.into(),
            ..Self::default()
        }
    }
}

/// The persisted declaration: host settings plus managed bridges
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    #[serde(default)]
    pub listen_addr: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub auth_mode: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub auth_pam_service: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub auth_allow_users: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub admin_user: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub admin_pass_hash: String,
    #[serde(default)]
    pub session_secret: String,
    #[serde(default)]
    pub proxmox_url: String,
    #[serde(default)]
    pub proxmox_token_id: String,
    #[serde(default)]
    pub proxmox_secret: String,
    #[serde(default)]
    pub proxmox_node: String,
    #[serde(default)]
    pub wan_interface: String,
    #[serde(default)]
    pub bridges: Vec<Bridge>,

    #[serde(skip)]
    path: PathBuf,
}

/// Settings accepted by `natctl init`
#[derive(Debug, Clone, Default)]
pub struct InitOptions {
    pub wan_interface: String,
    pub listen_addr: Option<String>,
    pub auth_mode: Option<String>,
    pub auth_pam_service: Option<String>,
    pub auth_allow_users: Vec<String>,
    pub admin_user: Option<String>,
    pub admin_pass_hash: Option<String>,
    pub proxmox_url: Option<String>,
    pub proxmox_token_id: Option<String>,
    pub proxmox_secret: Option<String>,
    pub proxmox_node: Option<String>,
}

/// 64 hex characters from two UUID v4 values (244 random bits)
pub fn generate_session_secret() -> String {
    format!(
        "{}{}",
        uuid::Uuid::new_v4().simple(),
        uuid::Uuid::new_v4().simple()
    )
}

impl Config {
    /// Reads, defaults and validates the model file.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the file cannot be read, is not valid JSON, or fails
    /// validation.
    pub async fn load(path: &Path) -> Result<Self> {
        let json = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| Error::Config(format!("read {}: {e}", path.display())))?;
        Self::from_json(&json, path)
    }

    /// Parses model text as if it had been read from `path`.
    ///
    /// # Errors
    ///
    /// Returns `Err` on malformed JSON or failed validation.
    pub fn from_json(json: &str, path: &Path) -> Result<Self> {
        let mut config: Config = serde_json::from_str(json)
            .map_err(|e| Error::Config(format!("parse {}: {e}", path.display())))?;
        config.path = path.to_path_buf();
        config.apply_defaults();
        config
            .validate()
            .map_err(|e| Error::Config(format!("invalid config: {e}")))?;
        Ok(config)
    }

    /// Builds and writes a fresh model file with a new session secret.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the file already exists, the settings are invalid,
    /// or the file cannot be written.
    pub async fn init(path: &Path, options: InitOptions) -> Result<Self> {
        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Err(Error::Config(format!("{} already exists", path.display())));
        }

        let mut config = Config {
            listen_addr: options.listen_addr.unwrap_or_default(),
            auth_mode: options.auth_mode.unwrap_or_default(),
            auth_pam_service: options.auth_pam_service.unwrap_or_default(),
            auth_allow_users: options.auth_allow_users,
            admin_user: options.admin_user.unwrap_or_default(),
            admin_pass_hash: options.admin_pass_hash.unwrap_or_default(),
            session_secret: generate_session_secret(),
            proxmox_url: options.proxmox_url.unwrap_or_default(),
            proxmox_token_id: options.proxmox_token_id.unwrap_or_default(),
            proxmox_secret: options.proxmox_secret.unwrap_or_default(),
            proxmox_node: options.proxmox_node.unwrap_or_default(),
            wan_interface: options.wan_interface.trim().to_string(),
            bridges: Vec::new(),
            path: path.to_path_buf(),
        };
        config.apply_defaults();
        config.validate()?;

        if let Some(parent) = path.parent() {
            utils::ensure_dir(parent, 0o700)
                .await
                .map_err(|source| Error::Persist {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }
        config.save().await?;
        info!("Wrote new config to {}", path.display());
        Ok(config)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn set_path(&mut self, path: impl Into<PathBuf>) {
        self.path = path.into();
    }

    /// Atomically rewrites the model file (pretty JSON, mode 0600).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Persist`] if the temp file cannot be written or
    /// renamed; the previous file is left untouched.
    pub async fn save(&self) -> Result<()> {
        let mut json = serde_json::to_string_pretty(self)?;
        json.push('\n');
        utils::write_atomic(&self.path, json.as_bytes(), 0o600)
            .await
            .map_err(|source| Error::Persist {
                path: self.path.clone(),
                source,
            })
    }

    /// Fills the listen address, auth mode and PAM service when unset.
    pub fn apply_defaults(&mut self) {
        if self.listen_addr.is_empty() {
            self.listen_addr = DEFAULT_LISTEN_ADDR.to_string();
        }
        if self.auth_mode.is_empty() {
            // Files from before auth_mode existed carry only a password hash
            self.auth_mode = if self.admin_pass_hash.is_empty() {
                AUTH_MODE_PAM.to_string()
            } else {
                AUTH_MODE_LOCAL.to_string()
            };
        }
        if self.auth_mode == AUTH_MODE_PAM && self.auth_pam_service.is_empty() {
            self.auth_pam_service = DEFAULT_PAM_SERVICE.to_string();
        }
    }

    /// Checks settings and every bridge.
    ///
    /// # Errors
    ///
    /// Returns the first violation found.
    pub fn validate(&self) -> std::result::Result<(), ValidationError> {
        let invalid = |field: &str, message: String| ValidationError::Invalid {
            field: field.to_string(),
            message,
        };

        match self.auth_mode.as_str() {
            AUTH_MODE_LOCAL => {
                if self.admin_user.is_empty() {
                    return Err(invalid("admin_user", "required for local auth".into()));
                }
                if self.admin_pass_hash.is_empty() {
                    return Err(invalid("admin_pass_hash", "required for local auth".into()));
                }
            }
            AUTH_MODE_PAM => {}
            other => {
                return Err(invalid(
                    "auth_mode",
                    format!("invalid value {other:?} (expected \"local\" or \"pam\")"),
                ));
            }
        }
        if self.session_secret.is_empty() {
            return Err(invalid("session_secret", "is required".into()));
        }
        if self.wan_interface.is_empty() {
            return Err(invalid("wan_interface", "is required".into()));
        }
        validators::validate_host_interface(&self.wan_interface)?;

        let mut seen = std::collections::HashSet::new();
        for bridge in &self.bridges {
            bridge.validate()?;
            if !seen.insert(bridge.name.as_str()) {
                return Err(ValidationError::DuplicateBridge(bridge.name.clone()));
            }
        }
        Ok(())
    }

    pub fn find_bridge(&self, name: &str) -> Option<&Bridge> {
        self.bridges.iter().find(|b| b.name == name)
    }

    pub fn find_bridge_mut(&mut self, name: &str) -> Option<&mut Bridge> {
        self.bridges.iter_mut().find(|b| b.name == name)
    }

    /// Looks a forward up by id across all bridges
    pub fn find_forward(&self, id: &str) -> Option<(&Bridge, &PortForward)> {
        self.bridges
            .iter()
            .find_map(|b| b.forwards.iter().find(|f| f.id == id).map(|f| (b, f)))
    }

    pub fn find_forward_mut(&mut self, id: &str) -> Option<&mut PortForward> {
        self.bridges
            .iter_mut()
            .flat_map(|b| b.forwards.iter_mut())
            .find(|f| f.id == id)
    }

    /// Removes a forward by id. Returns whether it existed.
    pub fn delete_forward(&mut self, id: &str) -> bool {
        for bridge in &mut self.bridges {
            if let Some(idx) = bridge.forwards.iter().position(|f| f.id == id) {
                bridge.forwards.remove(idx);
                return true;
            }
        }
        false
    }

    /// Removes a bridge from the model. The host interface is untouched.
    pub fn delete_bridge(&mut self, name: &str) -> bool {
        let before = self.bridges.len();
        self.bridges.retain(|b| b.name != name);
        self.bridges.len() != before
    }

    /// Rejects an enabled forward whose external port collides with another
    /// enabled forward on any bridge. All bridges share the WAN interface,
    /// so ports form one namespace. `ignore_id` excludes the forward being
    /// re-enabled.
    pub fn check_port_conflict(
        &self,
        ext_port: u16,
        protocol: Protocol,
        ignore_id: Option<&str>,
    ) -> std::result::Result<(), ValidationError> {
        let clash = self
            .bridges
            .iter()
            .flat_map(|b| b.enabled_forwards())
            .filter(|f| Some(f.id.as_str()) != ignore_id)
            .find(|f| f.ext_port == ext_port && f.protocol.overlaps(protocol));

        match clash {
            Some(existing) => Err(ValidationError::PortConflict {
                port: ext_port,
                protocol: existing.protocol.to_string(),
                existing: existing.id.clone(),
            }),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_helpers::{forward, test_config};

    #[test]
    fn test_defaults_filled_on_load() {
        let json = r#"{"session_secret":"s","wan_interface":"vmbr0"}"#;
        let config = Config::from_json(json, Path::new("/tmp/natctl.json")).unwrap();
        assert_eq!(config.listen_addr, DEFAULT_LISTEN_ADDR);
        assert_eq!(config.auth_mode, AUTH_MODE_PAM);
        assert_eq!(config.auth_pam_service, DEFAULT_PAM_SERVICE);
        assert!(config.bridges.is_empty());
    }

    #[test]
    fn test_password_hash_implies_local_auth() {
        let json = r#"{"session_secret":"s","wan_interface":"vmbr0","admin_user":"root","admin_pass_hash":"$2a$10$x"}"#;
        let config = Config::from_json(json, Path::new("/tmp/natctl.json")).unwrap();
        assert_eq!(config.auth_mode, AUTH_MODE_LOCAL);

        let json = r#"{"session_secret":"s","wan_interface":"vmbr0","admin_pass_hash":"$2a$10$x"}"#;
        let err = Config::from_json(json, Path::new("/tmp/natctl.json")).unwrap_err();
        assert!(err.to_string().contains("admin_user"));
    }

    #[test]
    fn test_required_settings() {
        let err = Config::from_json(r#"{"wan_interface":"vmbr0"}"#, Path::new("/x")).unwrap_err();
        assert!(err.to_string().contains("session_secret"));
        let err = Config::from_json(r#"{"session_secret":"s"}"#, Path::new("/x")).unwrap_err();
        assert!(err.to_string().contains("wan_interface"));
        let err = Config::from_json(
            r#"{"session_secret":"s","wan_interface":"vmbr0","auth_mode":"ldap"}"#,
            Path::new("/x"),
        )
        .unwrap_err();
        assert!(err.to_string().contains("auth_mode"));
    }

    #[test]
    fn test_duplicate_bridges_rejected() {
        let mut config = test_config(Path::new("/tmp/natctl.json"));
        config.bridges.push(Bridge::new("vmbr1", "10.10.10.0/24", "10.10.10.1"));
        config.bridges.push(Bridge::new("vmbr1", "10.20.0.0/24", "10.20.0.1"));
        assert_eq!(
            config.validate(),
            Err(ValidationError::DuplicateBridge("vmbr1".into()))
        );
    }

    #[test]
    fn test_session_secret_shape() {
        let a = generate_session_secret();
        let b = generate_session_secret();
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_hand_edited_pool_rejected_on_load() {
        let json = r#"{"session_secret":"s","wan_interface":"vmbr0",
            "bridges":[{"name":"vmbr1","subnet":"10.0.0.0/24","gateway_ip":"10.0.0.1",
            "dhcp":{"range_start":"10.0.0.1\ndhcp-script=/tmp/evil","range_end":"10.0.0.0"}}]}"#;
        let err = Config::from_json(json, Path::new("/x")).unwrap_err();
        assert!(err.to_string().contains("range_start"));

        let json = r#"{"session_secret":"s","wan_interface":"vmbr0",
            "bridges":[{"name":"vmbr1","subnet":"10.0.0.0/24","gateway_ip":"10.0.0.1",
            "dhcp":{"range_start":"10.0.0.1","range_end":"10.0.0.50"}}]}"#;
        assert!(Config::from_json(json, Path::new("/x")).is_err());
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let json = r#"{"session_secret":"s","wan_interface":"vmbr0","theme":"dark",
            "bridges":[{"name":"vmbr1","subnet":"10.10.10.0/24","gateway_ip":"10.10.10.1","future":1}]}"#;
        let config = Config::from_json(json, Path::new("/x")).unwrap();
        assert_eq!(config.bridges.len(), 1);
        assert!(!config.bridges[0].nat_enabled);
    }

    #[test]
    fn test_find_and_delete() {
        let mut config = test_config(Path::new("/x"));
        let mut bridge = Bridge::new("vmbr1", "10.10.10.0/24", "10.10.10.1");
        let mut fwd = forward(Protocol::Tcp, 2222, "10.10.10.5", 22);
        fwd.id = "fwd1".into();
        bridge.forwards.push(fwd);
        config.bridges.push(bridge);

        let (owner, found) = config.find_forward("fwd1").unwrap();
        assert_eq!(owner.name, "vmbr1");
        assert_eq!(found.ext_port, 2222);

        assert!(config.delete_forward("fwd1"));
        assert!(!config.delete_forward("fwd1"));
        assert!(config.find_forward("fwd1").is_none());

        assert!(config.delete_bridge("vmbr1"));
        assert!(!config.delete_bridge("vmbr1"));
        assert!(config.find_bridge("vmbr1").is_none());
    }

    #[test]
    fn test_port_conflicts_span_bridges_and_protocols() {
        let mut config = test_config(Path::new("/x"));
        let mut a = Bridge::new("vmbr1", "10.10.10.0/24", "10.10.10.1");
        let mut fwd = forward(Protocol::Tcp, 8080, "10.10.10.5", 80);
        fwd.id = "web".into();
        a.forwards.push(fwd);
        config.bridges.push(a);
        config.bridges.push(Bridge::new("vmbr2", "10.20.0.0/24", "10.20.0.1"));

        assert!(config.check_port_conflict(8080, Protocol::Udp, None).is_ok());
        assert!(config.check_port_conflict(8081, Protocol::Tcp, None).is_ok());
        assert!(matches!(
            config.check_port_conflict(8080, Protocol::Tcp, None),
            Err(ValidationError::PortConflict { port: 8080, .. })
        ));
        assert!(config.check_port_conflict(8080, Protocol::TcpAndUdp, None).is_err());
        assert!(config.check_port_conflict(8080, Protocol::Tcp, Some("web")).is_ok());

        config.find_forward_mut("web").unwrap().enabled = false;
        assert!(config.check_port_conflict(8080, Protocol::Tcp, None).is_ok());
    }

    #[tokio::test]
    async fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("natctl.json");
        let mut config = test_config(&path);
        let mut bridge = Bridge::new("vmbr1", "10.10.10.0/24", "10.10.10.1");
        bridge.nat_enabled = true;
        config.bridges.push(bridge);

        config.save().await.unwrap();
        let reloaded = Config::load(&path).await.unwrap();
        assert_eq!(reloaded, config);

        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn test_save_failure_keeps_previous_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("natctl.json");
        let config = test_config(&path);
        config.save().await.unwrap();
        let before = std::fs::read_to_string(&path).unwrap();

        // A directory squatting on the temp path makes the write fail
        std::fs::create_dir(utils::temp_path_for(&path)).unwrap();
        let mut changed = config.clone();
        changed.wan_interface = "eth9".into();
        let err = changed.save().await.unwrap_err();

        assert!(matches!(err, Error::Persist { .. }));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), before);
    }

    #[tokio::test]
    async fn test_init_writes_secret_and_refuses_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("etc").join("natctl.json");
        let options = InitOptions {
            wan_interface: "vmbr0".into(),
            ..InitOptions::default()
        };

        let config = Config::init(&path, options.clone()).await.unwrap();
        assert_eq!(config.session_secret.len(), 64);
        assert!(config.session_secret.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(Config::load(&path).await.unwrap(), config);

        assert!(Config::init(&path, options).await.is_err());
    }

    #[test]
    fn test_host_paths_under_root() {
        let paths = HostPaths::under(Path::new("/tmp/root"));
        assert_eq!(paths.rules_file, PathBuf::from("/tmp/root/run/natctl/rules.nft"));
        assert!(paths.config_file.starts_with("/tmp/root"));
        assert_eq!(HostPaths::default().rules_file, PathBuf::from("/run/natctl/rules.nft"));
    }
}
