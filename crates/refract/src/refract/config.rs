use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use base64::{Engine as _, engine::general_purpose::STANDARD as B64};
#[cfg(not(target_os = "linux"))]
use directories::ProjectDirs;
use serde::Deserialize;
use uuid::Uuid;

use crate::refract::{
    net::{self, WildcardMode},
    version::TargetVersion,
};

#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: PathBuf,
    pub source: ConfigPathSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigPathSource {
    Flag,
    Env,
    Cwd,
    Default,
}

impl std::fmt::Display for ConfigPathSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigPathSource::Flag => write!(f, "flag"),
            ConfigPathSource::Env => write!(f, "env"),
            ConfigPathSource::Cwd => write!(f, "cwd"),
            ConfigPathSource::Default => write!(f, "default"),
        }
    }
}

pub fn resolve_config_path(explicit_flag_path: Option<PathBuf>) -> anyhow::Result<ResolvedConfigPath> {
    if let Some(p) = explicit_flag_path {
        return Ok(ResolvedConfigPath {
            path: normalize_explicit_path(&p)?,
            source: ConfigPathSource::Flag,
        });
    }

    // clap already folds REFRACT_CONFIG into the flag; this covers callers that bypass clap.
    if let Some(p) = std::env::var_os("REFRACT_CONFIG")
        && !p.is_empty()
    {
        return Ok(ResolvedConfigPath {
            path: normalize_explicit_path(Path::new(&p))?,
            source: ConfigPathSource::Env,
        });
    }

    if let Ok(p) = discover_config_path(Path::new(".")) {
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Cwd,
        });
    }

    Ok(ResolvedConfigPath {
        path: default_config_path()?,
        source: ConfigPathSource::Default,
    })
}

fn normalize_explicit_path(p: &Path) -> anyhow::Result<PathBuf> {
    if p.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    if let Ok(m) = fs::metadata(p) {
        if m.is_dir() {
            return Ok(discover_config_path(p).unwrap_or_else(|_| p.join("refract.toml")));
        }
        return Ok(p.to_path_buf());
    }

    let mut out = p.to_path_buf();
    if out.extension().is_none() {
        out.set_extension("toml");
    }
    Ok(out)
}

fn discover_config_path(dir: &Path) -> anyhow::Result<PathBuf> {
    for c in ["refract.toml", "refract.yaml", "refract.yml"] {
        let p = dir.join(c);
        if fs::metadata(&p).map(|m| m.is_file()).unwrap_or(false) {
            return Ok(p);
        }
    }
    anyhow::bail!("config: no refract.* found")
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        Ok(PathBuf::from("/etc/refract/refract.toml"))
    }

    #[cfg(not(target_os = "linux"))]
    {
        let proj = ProjectDirs::from("dev", "refract", "refract")
            .context("config: resolve user config dir")?;
        Ok(proj.config_dir().join("refract.toml"))
    }
}

/// Writes the default template if nothing exists at `path`. Returns whether it did.
pub fn ensure_config_file(path: &Path) -> anyhow::Result<bool> {
    if path.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    match fs::metadata(path) {
        Ok(m) if m.is_file() => return Ok(false),
        Ok(_) => anyhow::bail!("config: {} exists but is not a regular file", path.display()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err).with_context(|| format!("config: stat {}", path.display())),
    }

    let tmpl = default_config_template_for_path(path)?;

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).with_context(|| format!("config: mkdir {}", parent.display()))?;
    }

    let mut f = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .with_context(|| format!("config: create {}", path.display()))?;
    use std::io::Write;
    f.write_all(tmpl.as_bytes())
        .with_context(|| format!("config: write {}", path.display()))?;
    Ok(true)
}

fn config_ext(path: &Path) -> String {
    path.extension()
        .and_then(|s| s.to_str())
        .unwrap_or("")
        .to_ascii_lowercase()
}

fn default_config_template_for_path(path: &Path) -> anyhow::Result<&'static str> {
    match config_ext(path).as_str() {
        "toml" => Ok(DEFAULT_CONFIG_TEMPLATE_TOML),
        "yaml" | "yml" => Ok(DEFAULT_CONFIG_TEMPLATE_YAML),
        _ => anyhow::bail!(
            "config: unsupported config extension {:?} (expected .toml or .yaml/.yml)",
            path.extension()
        ),
    }
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let s = String::from_utf8_lossy(&data);

    let fc: FileConfig = match config_ext(path).as_str() {
        "toml" => toml::from_str(&s).with_context(|| format!("parse toml {}", path.display()))?,
        "yaml" | "yml" => {
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml {}", path.display()))?
        }
        other => anyhow::bail!("config: unsupported config extension {other}"),
    };

    Config::from_file_config(fc, path)
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub target_addr: String,
    pub target_version: TargetVersion,
    pub proxy_online_mode: bool,
    /// `None` leaves the client leg uncompressed.
    pub compression_threshold: Option<i32>,
    pub chat_signing: bool,
    pub allow_legacy_client_passthrough: bool,
    pub backend_haproxy: bool,
    pub wildcard_domain_handling: WildcardMode,
    pub custom_motd: String,
    /// 0 = unlimited.
    pub max_sessions: usize,
    pub pending_packet_limit: usize,
    pub admin_addr: String,
    pub timeouts: Timeouts,
    pub auth: AuthConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timeouts {
    pub connect: Duration,
    pub legacy_connect: Duration,
    pub handshake: Duration,
    pub status_probe: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    None,
    Account,
    Companion,
    OpenAuthMod,
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub method: AuthMethod,
    pub account: Option<AccountConfig>,
    pub companion: CompanionConfig,
    pub openauthmod: OpenAuthModConfig,
}

#[derive(Debug, Clone)]
pub struct AccountConfig {
    pub name: String,
    pub uuid: Uuid,
    pub access_token: String,
    pub session_server: String,
    /// PKCS#8 PEM chat key, resolved against the config file's directory.
    pub key_file: Option<PathBuf>,
    pub key_expires_at_ms: i64,
    pub key_signature: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompanionConfig {
    pub addr: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenAuthModConfig {
    pub join_timeout: Duration,
    pub sign_nonce_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    bind_addr: Option<String>,
    target_addr: Option<String>,
    target_version: Option<String>,
    #[serde(default)]
    proxy_online_mode: bool,
    compression_threshold: Option<i32>,
    chat_signing: Option<bool>,
    #[serde(default)]
    allow_legacy_client_passthrough: bool,
    #[serde(default)]
    backend_haproxy: bool,
    wildcard_domain_handling: Option<String>,
    #[serde(default)]
    custom_motd: String,
    #[serde(default)]
    max_sessions: i64,
    pending_packet_limit: Option<i64>,
    #[serde(default)]
    admin_addr: String,
    timeouts: Option<FileTimeouts>,
    auth: Option<FileAuth>,
    logging: Option<FileLogging>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileTimeouts {
    connect_timeout_ms: Option<i64>,
    legacy_connect_timeout_ms: Option<i64>,
    handshake_timeout_ms: Option<i64>,
    status_probe_timeout_ms: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileAuth {
    method: Option<String>,
    account: Option<FileAccount>,
    companion: Option<FileCompanion>,
    openauthmod: Option<FileOpenAuthMod>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileAccount {
    name: String,
    uuid: String,
    access_token: String,
    session_server: Option<String>,
    key_file: Option<String>,
    #[serde(default)]
    key_expires_at_ms: i64,
    key_signature: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileCompanion {
    addr: Option<String>,
    timeout_ms: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileOpenAuthMod {
    join_timeout_ms: Option<i64>,
    sign_nonce_timeout_ms: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}

fn millis(v: Option<i64>, default: u64) -> Duration {
    Duration::from_millis(v.map(|n| n.max(0) as u64).unwrap_or(default))
}

fn trimmed_or(v: Option<&String>, default: &str) -> String {
    match v.map(|s| s.trim()) {
        Some(s) if !s.is_empty() => s.to_string(),
        _ => default.to_string(),
    }
}

impl Config {
    fn from_file_config(fc: FileConfig, config_path: &Path) -> anyhow::Result<Config> {
        let bind_addr = trimmed_or(fc.bind_addr.as_ref(), ":25568");
        let target_addr = trimmed_or(fc.target_addr.as_ref(), "127.0.0.1:25565");
        let target_addr = if net::needs_port(&target_addr) {
            net::join_host_port(&target_addr, net::DEFAULT_GAME_PORT)
        } else {
            target_addr
        };
        net::split_host_port(&target_addr)
            .with_context(|| format!("config: invalid target_addr {target_addr:?}"))?;

        let raw_version = trimmed_or(fc.target_version.as_ref(), "auto");
        let target_version = TargetVersion::parse(&raw_version)
            .with_context(|| format!("config: unknown target_version {raw_version:?}"))?;

        let raw_wildcard = fc.wildcard_domain_handling.clone().unwrap_or_default();
        let wildcard_domain_handling = WildcardMode::parse(&raw_wildcard).with_context(|| {
            format!("config: wildcard_domain_handling must be none|public|internal, got {raw_wildcard:?}")
        })?;

        if fc.max_sessions < 0 {
            anyhow::bail!("config: max_sessions must not be negative");
        }
        let pending_packet_limit = fc.pending_packet_limit.unwrap_or(1024);
        if pending_packet_limit <= 0 {
            anyhow::bail!("config: pending_packet_limit must be positive");
        }

        let t = fc.timeouts.as_ref();
        let timeouts = Timeouts {
            connect: millis(t.and_then(|t| t.connect_timeout_ms), 5000),
            legacy_connect: millis(t.and_then(|t| t.legacy_connect_timeout_ms), 4000),
            handshake: millis(t.and_then(|t| t.handshake_timeout_ms), 5000),
            status_probe: millis(t.and_then(|t| t.status_probe_timeout_ms), 3000),
        };

        let auth = Self::auth_from_file(fc.auth, config_path)?;

        let mut logging = LoggingConfig {
            level: "info".into(),
            format: "json".into(),
            output: "stderr".into(),
            add_source: false,
        };
        if let Some(l) = &fc.logging {
            logging.level = trimmed_or(l.level.as_ref(), &logging.level);
            logging.format = trimmed_or(l.format.as_ref(), &logging.format);
            logging.output = trimmed_or(l.output.as_ref(), &logging.output);
            logging.add_source = l.add_source;
        }

        Ok(Config {
            bind_addr,
            target_addr,
            target_version,
            proxy_online_mode: fc.proxy_online_mode,
            compression_threshold: Some(fc.compression_threshold.unwrap_or(256)).filter(|t| *t >= 0),
            chat_signing: fc.chat_signing.unwrap_or(true),
            allow_legacy_client_passthrough: fc.allow_legacy_client_passthrough,
            backend_haproxy: fc.backend_haproxy,
            wildcard_domain_handling,
            custom_motd: fc.custom_motd.trim().to_string(),
            max_sessions: fc.max_sessions as usize,
            pending_packet_limit: pending_packet_limit as usize,
            admin_addr: fc.admin_addr.trim().to_string(),
            timeouts,
            auth,
            logging,
        })
    }

    fn auth_from_file(fa: Option<FileAuth>, config_path: &Path) -> anyhow::Result<AuthConfig> {
        let fa = fa.unwrap_or(FileAuth {
            method: None,
            account: None,
            companion: None,
            openauthmod: None,
        });

        let method = match fa.method.as_deref().map(|m| m.trim().to_ascii_lowercase()).as_deref() {
            None | Some("") | Some("none") => AuthMethod::None,
            Some("account") => AuthMethod::Account,
            Some("companion") => AuthMethod::Companion,
            Some("openauthmod") => AuthMethod::OpenAuthMod,
            Some(other) => anyhow::bail!(
                "config: auth.method must be none|account|companion|openauthmod, got {other:?}"
            ),
        };

        let account = match fa.account {
            Some(a) => {
                let uuid = Uuid::parse_str(a.uuid.trim())
                    .with_context(|| format!("config: auth.account.uuid {:?}", a.uuid))?;
                let config_dir = config_path.parent().unwrap_or_else(|| Path::new("."));
                let key_file = a
                    .key_file
                    .map(|k| k.trim().to_string())
                    .filter(|k| !k.is_empty())
                    .map(|k| {
                        let p = PathBuf::from(k);
                        if p.is_relative() { config_dir.join(p) } else { p }
                    });
                let key_signature = match a.key_signature.as_deref().map(str::trim) {
                    Some(s) if !s.is_empty() => B64
                        .decode(s)
                        .context("config: auth.account.key_signature is not base64")?,
                    _ => Vec::new(),
                };
                Some(AccountConfig {
                    name: a.name.trim().to_string(),
                    uuid,
                    access_token: a.access_token.trim().to_string(),
                    session_server: trimmed_or(
                        a.session_server.as_ref(),
                        crate::refract::auth::DEFAULT_SESSION_SERVER,
                    ),
                    key_file,
                    key_expires_at_ms: a.key_expires_at_ms,
                    key_signature,
                })
            }
            None => None,
        };

        if method == AuthMethod::Account && account.is_none() {
            anyhow::bail!("config: auth.method = \"account\" requires an [auth.account] table");
        }

        let companion = CompanionConfig {
            addr: trimmed_or(
                fa.companion.as_ref().and_then(|c| c.addr.as_ref()),
                "127.0.0.1:48941",
            ),
            timeout: millis(fa.companion.as_ref().and_then(|c| c.timeout_ms), 500),
        };
        let openauthmod = OpenAuthModConfig {
            join_timeout: millis(fa.openauthmod.as_ref().and_then(|o| o.join_timeout_ms), 6000),
            sign_nonce_timeout: millis(
                fa.openauthmod.as_ref().and_then(|o| o.sign_nonce_timeout_ms),
                5000,
            ),
        };

        Ok(AuthConfig {
            method,
            account,
            companion,
            openauthmod,
        })
    }
}

const DEFAULT_CONFIG_TEMPLATE_TOML: &str = r#"# Refract configuration (auto-generated)
#
# This file was created because refract could not find a configuration file at the
# resolved config path. It accepts clients on :25568 and forwards them to a backend on
# 127.0.0.1:25565 whose version is detected automatically.

bind_addr = ":25568"
target_addr = "127.0.0.1:25565"
target_version = "auto" # auto | 1.8 | 1.12.2 | 1.20.4 | ...

proxy_online_mode = false
compression_threshold = 256 # -1 disables compression towards clients
chat_signing = true
allow_legacy_client_passthrough = false
backend_haproxy = false
wildcard_domain_handling = "none" # none | public | internal
custom_motd = ""

max_sessions = 0
pending_packet_limit = 1024

# admin_addr = ":8080"

[timeouts]
connect_timeout_ms = 5000
legacy_connect_timeout_ms = 4000
handshake_timeout_ms = 5000
status_probe_timeout_ms = 3000

[auth]
method = "none" # none | account | companion | openauthmod

[auth.companion]
addr = "127.0.0.1:48941"
timeout_ms = 500

[auth.openauthmod]
join_timeout_ms = 6000
sign_nonce_timeout_ms = 5000

[logging]
level = "info"
format = "json"
output = "stderr"
add_source = false
"#;

const DEFAULT_CONFIG_TEMPLATE_YAML: &str = r#"# Refract configuration (auto-generated)
#
# This file was created because refract could not find a configuration file at the
# resolved config path. It accepts clients on :25568 and forwards them to a backend on
# 127.0.0.1:25565 whose version is detected automatically.

bind_addr: ":25568"
target_addr: "127.0.0.1:25565"
target_version: "auto" # auto | 1.8 | 1.12.2 | 1.20.4 | ...

proxy_online_mode: false
compression_threshold: 256 # -1 disables compression towards clients
chat_signing: true
allow_legacy_client_passthrough: false
backend_haproxy: false
wildcard_domain_handling: "none" # none | public | internal
custom_motd: ""

max_sessions: 0
pending_packet_limit: 1024

timeouts:
  connect_timeout_ms: 5000
  legacy_connect_timeout_ms: 4000
  handshake_timeout_ms: 5000
  status_probe_timeout_ms: 3000

auth:
  method: "none" # none | account | companion | openauthmod
  companion:
    addr: "127.0.0.1:48941"
    timeout_ms: 500
  openauthmod:
    join_timeout_ms: 6000
    sign_nonce_timeout_ms: 5000

logging:
  level: "info"
  format: "json"
  output: "stderr"
  add_source: false
"#;

#[cfg(test)]
pub(crate) fn parse_toml_for_test(body: &str) -> Config {
    let fc: FileConfig = toml::from_str(body).expect("test config parses");
    Config::from_file_config(fc, Path::new("refract.toml")).expect("test config is valid")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::refract::version::ProtocolVersion;

    fn temp_dir(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        p.push(format!(
            "refract_cfg_test_{name}_{}_{}",
            std::process::id(),
            now
        ));
        std::fs::create_dir_all(&p).expect("mkdir");
        p
    }

    #[test]
    fn default_templates_load_with_defaults() {
        for name in ["refract.toml", "refract.yaml"] {
            let dir = temp_dir("template");
            let path = dir.join(name);
            assert!(ensure_config_file(&path).unwrap());
            assert!(!ensure_config_file(&path).unwrap());

            let cfg = load_config(&path).unwrap();
            assert_eq!(cfg.bind_addr, ":25568");
            assert_eq!(cfg.target_addr, "127.0.0.1:25565");
            assert_eq!(cfg.target_version, TargetVersion::Auto);
            assert_eq!(cfg.compression_threshold, Some(256));
            assert!(cfg.chat_signing);
            assert!(!cfg.allow_legacy_client_passthrough);
            assert_eq!(cfg.pending_packet_limit, 1024);
            assert_eq!(cfg.auth.method, AuthMethod::None);
            assert_eq!(cfg.auth.companion.timeout, Duration::from_millis(500));
            assert_eq!(cfg.timeouts.status_probe, Duration::from_secs(3));
            assert_eq!(cfg.admin_addr, "");
        }
    }

    #[test]
    fn fixed_version_and_disabled_compression() {
        let dir = temp_dir("fixed");
        let path = dir.join("refract.toml");
        std::fs::write(
            &path,
            r#"
target_addr = "mc.example.net"
target_version = "1.12.2"
compression_threshold = -1
wildcard_domain_handling = "public"
"#,
        )
        .unwrap();
        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.target_addr, "mc.example.net:25565");
        assert_eq!(
            cfg.target_version,
            TargetVersion::Fixed(ProtocolVersion::V1_12_2)
        );
        assert_eq!(cfg.compression_threshold, None);
        assert_eq!(cfg.wildcard_domain_handling, WildcardMode::Public);
    }

    #[test]
    fn account_table_is_required_and_resolved() {
        let dir = temp_dir("account");
        let path = dir.join("refract.toml");
        std::fs::write(&path, "[auth]\nmethod = \"account\"\n").unwrap();
        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("[auth.account]"));

        std::fs::write(
            &path,
            r#"
[auth]
method = "account"

[auth.account]
name = "Steve"
uuid = "069a79f4-44e9-4726-a5be-fca90e38aaf5"
access_token = "token"
key_file = "keys/chat.pem"
key_signature = "AQID"
"#,
        )
        .unwrap();
        let cfg = load_config(&path).unwrap();
        let account = cfg.auth.account.unwrap();
        assert_eq!(account.name, "Steve");
        assert_eq!(account.key_file, Some(dir.join("keys/chat.pem")));
        assert_eq!(account.key_signature, vec![1, 2, 3]);
        assert_eq!(
            account.session_server,
            crate::refract::auth::DEFAULT_SESSION_SERVER
        );
    }

    #[test]
    fn unknown_fields_and_bad_values_are_rejected() {
        let dir = temp_dir("reject");
        let path = dir.join("refract.toml");

        std::fs::write(&path, "listeners = []\n").unwrap();
        assert!(load_config(&path).is_err());

        std::fs::write(&path, "target_version = \"0.9\"\n").unwrap();
        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("target_version"));

        std::fs::write(&path, "wildcard_domain_handling = \"sometimes\"\n").unwrap();
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn explicit_directory_discovers_config() {
        let dir = temp_dir("discover");
        std::fs::write(dir.join("refract.yml"), "bind_addr: \":1\"\n").unwrap();
        let resolved = resolve_config_path(Some(dir.clone())).unwrap();
        assert_eq!(resolved.source, ConfigPathSource::Flag);
        assert_eq!(resolved.path, dir.join("refract.yml"));

        let bare = dir.join("custom");
        let resolved = resolve_config_path(Some(bare.clone())).unwrap();
        assert_eq!(resolved.path, bare.with_extension("toml"));
    }
}
