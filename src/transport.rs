//! Upload transports for the public file host.
//!
//! Both transports answer the same two calls and return the hosted URL. Which
//! one is used is decided once, when the configuration is turned into a
//! transport; nothing re-branches per upload.
use std::collections::BTreeMap;

use reqwest::StatusCode;
use reqwest::blocking::multipart::{Form, Part};
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use serde::Serialize;
use url::Url;

use crate::error::UploadError;

/// File host API that proxied uploads are forwarded to.
pub const CATBOX_API: &str = "https://catbox.moe/user/api.php";

/// Placeholder in the proxy template replaced by the encoded target URL.
pub const PROXY_PLACEHOLDER: &str = "{url}";

const UPLOAD_FILE_ENDPOINT: &str = "api/plugins/catbox/uploadFile";
const UPLOAD_JSON_ENDPOINT: &str = "api/plugins/catbox/uploadJson";

/// Blob store as seen by the archive: two upload calls, each returning a URL.
pub trait BlobTransport {
    /// Upload a file the chat server can serve, given as a server-relative path.
    fn upload_local_file(&self, path: &str, name: &str) -> Result<String, UploadError>;

    /// Upload an in-memory payload.
    fn upload_bytes(&self, bytes: Vec<u8>, name: &str) -> Result<String, UploadError>;
}

impl<T: BlobTransport + ?Sized> BlobTransport for Box<T> {
    fn upload_local_file(&self, path: &str, name: &str) -> Result<String, UploadError> {
        (**self).upload_local_file(path, name)
    }

    fn upload_bytes(&self, bytes: Vec<u8>, name: &str) -> Result<String, UploadError> {
        (**self).upload_bytes(bytes, name)
    }
}

/// Connection to the chat server plus the credentials every upload carries.
#[derive(Debug, Clone)]
pub struct HostConnection {
    client: Client,
    server_url: Url,
    user_hash: String,
    headers: HeaderMap,
}

impl HostConnection {
    /// `headers` are forwarded verbatim on every request, except `Content-Type`
    /// which each request sets for its own body.
    pub fn new(
        server_url: Url,
        user_hash: impl Into<String>,
        headers: &BTreeMap<String, String>,
    ) -> Result<Self, UploadError> {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| UploadError::Encoding(format!("header name {name:?}: {e}")))?;
            if name == CONTENT_TYPE {
                continue;
            }
            let value = HeaderValue::from_str(value)
                .map_err(|e| UploadError::Encoding(format!("header {name}: {e}")))?;
            map.insert(name, value);
        }

        let client = Client::builder()
            .user_agent(concat!("chatlog-share/", env!("CARGO_PKG_VERSION")))
            .build()?;

        // Paths are joined relative to the base, so it must end in a slash.
        let mut server_url = server_url;
        if !server_url.path().ends_with('/') {
            let path = format!("{}/", server_url.path());
            server_url.set_path(&path);
        }

        Ok(Self {
            client,
            server_url,
            user_hash: user_hash.into(),
            headers: map,
        })
    }

    /// Resolve a server-relative path below the base URL, keeping any prefix
    /// the server is mounted under.
    pub fn server_join(&self, path: &str) -> Result<Url, UploadError> {
        self.server_url
            .join(path.trim_start_matches('/'))
            .map_err(|e| UploadError::Transport(format!("bad server path {path:?}: {e}")))
    }

    fn post(&self, url: &str) -> RequestBuilder {
        self.client.post(url).headers(self.headers.clone())
    }
}

/// Map a host response to the URL it carries.
fn read_url(response: Response) -> Result<String, UploadError> {
    let status = response.status();
    let body = response.text().unwrap_or_default();
    url_from_reply(status, &body)
}

fn url_from_reply(status: StatusCode, body: &str) -> Result<String, UploadError> {
    if status == StatusCode::UNAUTHORIZED {
        return Err(UploadError::Authentication);
    }
    if !status.is_success() {
        return Err(UploadError::Transport(format!("HTTP error! status: {status}")));
    }
    let url = body.trim();
    if url.is_empty() {
        return Err(UploadError::Transport("file host returned an empty reply".into()));
    }
    Ok(url.to_string())
}

// ---------------------------------------------------------------------------
// Direct: the chat server's upload plugin reads the file itself
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct FileRequest<'a> {
    filepath: &'a str,
    userhash: &'a str,
}

#[derive(Serialize)]
struct JsonRequest<'a> {
    chatlog: serde_json::Value,
    userhash: &'a str,
}

/// Delegates uploads to the server-side plugin, which forwards to the file host.
#[derive(Debug, Clone)]
pub struct DirectTransport {
    host: HostConnection,
}

impl DirectTransport {
    pub fn new(host: HostConnection) -> Self {
        Self { host }
    }
}

impl BlobTransport for DirectTransport {
    fn upload_local_file(&self, path: &str, name: &str) -> Result<String, UploadError> {
        let endpoint = self.host.server_join(UPLOAD_FILE_ENDPOINT)?;
        tracing::debug!(%endpoint, path, name, "uploading file through server plugin");

        let response = self
            .host
            .post(endpoint.as_str())
            .json(&FileRequest {
                filepath: path,
                userhash: &self.host.user_hash,
            })
            .send()?;
        let url = read_url(response)?;
        tracing::info!(name, %url, "file uploaded");
        Ok(url)
    }

    /// The plugin only accepts JSON documents, so `bytes` must hold JSON.
    fn upload_bytes(&self, bytes: Vec<u8>, name: &str) -> Result<String, UploadError> {
        let chatlog: serde_json::Value = serde_json::from_slice(&bytes)
            .map_err(|e| UploadError::Encoding(format!("{name} is not JSON: {e}")))?;
        let endpoint = self.host.server_join(UPLOAD_JSON_ENDPOINT)?;
        tracing::debug!(%endpoint, name, bytes = bytes.len(), "uploading JSON through server plugin");

        let response = self
            .host
            .post(endpoint.as_str())
            .json(&JsonRequest {
                chatlog,
                userhash: &self.host.user_hash,
            })
            .send()?;
        let url = read_url(response)?;
        tracing::info!(name, %url, "JSON uploaded");
        Ok(url)
    }
}

// ---------------------------------------------------------------------------
// Proxied: fetch bytes here, post multipart through a rewriting proxy
// ---------------------------------------------------------------------------

/// Uploads straight to the file host through a CORS proxy.
#[derive(Debug, Clone)]
pub struct ProxiedTransport {
    host: HostConnection,
    cors_proxy: Option<String>,
}

impl ProxiedTransport {
    pub fn new(host: HostConnection, cors_proxy: Option<String>) -> Self {
        Self {
            host,
            cors_proxy: cors_proxy.filter(|p| !p.trim().is_empty()),
        }
    }

    /// The proxy URL for the file host API.
    pub fn proxy_url(&self) -> Result<String, UploadError> {
        let template = self
            .cors_proxy
            .as_deref()
            .ok_or(UploadError::UnconfiguredProxy)?;
        proxied(template, CATBOX_API)
    }

    fn send_form(&self, proxy_url: &str, part: Part, name: &str) -> Result<String, UploadError> {
        let form = Form::new()
            .text("reqtype", "fileupload")
            .text("userhash", self.host.user_hash.clone())
            .part("fileToUpload", part);

        let response = self.host.post(proxy_url).multipart(form).send()?;
        let url = read_url(response)?;
        tracing::info!(name, %url, "uploaded through proxy");
        Ok(url)
    }
}

/// Substitute the URL-encoded `target` into a proxy template.
pub fn proxied(template: &str, target: &str) -> Result<String, UploadError> {
    if !template.contains(PROXY_PLACEHOLDER) {
        return Err(UploadError::Transport(format!(
            "CORS proxy template {template:?} has no {PROXY_PLACEHOLDER} placeholder"
        )));
    }
    Ok(template.replace(PROXY_PLACEHOLDER, &urlencoding::encode(target)))
}

fn mime_for(name: &str, bytes: &[u8]) -> &'static str {
    if name.to_ascii_lowercase().ends_with(".json") {
        return "application/json";
    }
    infer::get(bytes)
        .map(|kind| kind.mime_type())
        .unwrap_or("application/octet-stream")
}

fn file_part(bytes: Vec<u8>, name: &str) -> Result<Part, UploadError> {
    let mime = mime_for(name, &bytes);
    Part::bytes(bytes)
        .file_name(name.to_string())
        .mime_str(mime)
        .map_err(|e| UploadError::Encoding(format!("invalid MIME type {mime}: {e}")))
}

impl BlobTransport for ProxiedTransport {
    fn upload_local_file(&self, path: &str, name: &str) -> Result<String, UploadError> {
        let proxy_url = self.proxy_url()?;
        let source = self.host.server_join(path)?;
        tracing::debug!(%source, name, "fetching local file");

        let response = self
            .host
            .client
            .get(source.clone())
            .headers(self.host.headers.clone())
            .send()?;
        if !response.status().is_success() {
            return Err(UploadError::Transport(format!(
                "fetching {source} failed: {}",
                response.status()
            )));
        }
        let bytes = response.bytes()?.to_vec();

        self.send_form(&proxy_url, file_part(bytes, name)?, name)
    }

    fn upload_bytes(&self, bytes: Vec<u8>, name: &str) -> Result<String, UploadError> {
        let proxy_url = self.proxy_url()?;
        tracing::debug!(name, bytes = bytes.len(), "uploading payload through proxy");
        self.send_form(&proxy_url, file_part(bytes, name)?, name)
    }
}
