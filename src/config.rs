use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use eyre::{Context, Result, eyre};
use serde::Deserialize;
use url::Url;

use crate::builder::AssetFailurePolicy;
use crate::transport::{BlobTransport, DirectTransport, HostConnection, ProxiedTransport};

pub const DEFAULT_SERVER_URL: &str = "http://127.0.0.1:8000/";

/// Settings as written in `config.toml`. Every key is optional.
#[derive(Deserialize, Default, Debug)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub user_hash: Option<String>,
    pub use_proxy: Option<bool>,
    pub cors_proxy: Option<String>,
    pub server_url: Option<String>,
    pub headers: Option<BTreeMap<String, String>>,
    pub strict_assets: Option<bool>,
}

/// Values given on the command line; they win over the file.
#[derive(Default, Debug)]
pub struct ConfigOverrides {
    pub user_hash: Option<String>,
    pub use_proxy: Option<bool>,
    pub cors_proxy: Option<String>,
    pub server_url: Option<String>,
    pub headers: Vec<(String, String)>,
    pub strict_assets: bool,
}

/// Everything needed to talk to the file host.
/// Built once per run and handed to the transport; nothing reads settings globally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareConfig {
    pub user_hash: String,
    /// Upload through `cors_proxy` instead of the server plugin.
    pub use_proxy: bool,
    /// Proxy URL template with a `{url}` placeholder.
    pub cors_proxy: String,
    pub server_url: String,
    /// Forwarded verbatim on every request.
    pub headers: BTreeMap<String, String>,
    pub strict_assets: bool,
}

impl Default for ShareConfig {
    fn default() -> Self {
        Self {
            user_hash: String::new(),
            use_proxy: true,
            cors_proxy: String::new(),
            server_url: DEFAULT_SERVER_URL.to_string(),
            headers: BTreeMap::new(),
            strict_assets: false,
        }
    }
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("chatlog-share/config.toml"))
}

pub fn load_file_config(explicit_path: Option<&Path>) -> Result<FileConfig> {
    let path = if let Some(p) = explicit_path {
        if !p.exists() {
            return Err(eyre!("Config file not found: {}", p.display()));
        }
        Some(p.to_path_buf())
    } else {
        default_config_path().filter(|p| p.exists())
    };

    match path {
        None => Ok(FileConfig::default()),
        Some(p) => {
            let content = fs::read_to_string(&p)
                .wrap_err_with(|| format!("Failed to read config: {}", p.display()))?;
            toml::from_str(&content)
                .wrap_err_with(|| format!("Failed to parse config: {}", p.display()))
        }
    }
}

impl ShareConfig {
    /// CLI > config file > defaults.
    pub fn resolve(file: FileConfig, cli: ConfigOverrides) -> Self {
        let defaults = Self::default();
        let mut headers = file.headers.unwrap_or_default();
        headers.extend(cli.headers);

        let config = Self {
            user_hash: cli.user_hash.or(file.user_hash).unwrap_or(defaults.user_hash),
            use_proxy: cli.use_proxy.or(file.use_proxy).unwrap_or(defaults.use_proxy),
            cors_proxy: cli.cors_proxy.or(file.cors_proxy).unwrap_or(defaults.cors_proxy),
            server_url: cli.server_url.or(file.server_url).unwrap_or(defaults.server_url),
            headers,
            strict_assets: cli.strict_assets || file.strict_assets.unwrap_or(defaults.strict_assets),
        };

        if config.use_proxy && config.cors_proxy.trim().is_empty() {
            tracing::warn!("proxy mode is on but no CORS proxy URL is set; uploads will be skipped");
        }
        config
    }

    pub fn failure_policy(&self) -> AssetFailurePolicy {
        if self.strict_assets {
            AssetFailurePolicy::Abort
        } else {
            AssetFailurePolicy::Skip
        }
    }

    /// The transport this configuration selects.
    pub fn transport(&self) -> Result<Box<dyn BlobTransport>> {
        let server_url = Url::parse(&self.server_url)
            .wrap_err_with(|| format!("Invalid server URL: {}", self.server_url))?;
        let host = HostConnection::new(server_url, self.user_hash.clone(), &self.headers)
            .wrap_err("Failed to set up HTTP client")?;

        let transport: Box<dyn BlobTransport> = if self.use_proxy {
            Box::new(ProxiedTransport::new(host, Some(self.cors_proxy.clone())))
        } else {
            Box::new(DirectTransport::new(host))
        };
        Ok(transport)
    }
}

/// Parse a `Name: value` header argument.
pub fn parse_header(raw: &str) -> Result<(String, String)> {
    let (name, value) = raw
        .split_once(':')
        .ok_or_else(|| eyre!("Header {:?} must look like `Name: value`", raw))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(eyre!("Header {:?} has an empty name", raw));
    }
    Ok((name.to_string(), value.trim().to_string()))
}
