//! HTTPS client for the control-plane REST surface.
//!
//! Request/response shapes are grounded directly on `original_source/rest/*.go`;
//! the CA-pinning and error-mapping idiom is grounded on
//! `gnosis_vpn-lib::wg_client`, generalized from `reqwest::blocking` to the
//! async client since the Controller itself is fully async.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("no host configured")]
    ErrMissingHost,
    #[error("bad HTTP status {0}")]
    ErrHttpStatusBad(u16),
    #[error("application update required")]
    ErrAppUpdateRequired,
    #[error("TLS certificate pin mismatch")]
    ErrBadPin,
    #[error("request validation failed: {0}")]
    Validation(String),
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AccessTokenRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    pub domain: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<Vec<u8>>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub username: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub password: String,
}

impl AccessTokenRequest {
    pub fn check(&self) -> Result<(), Error> {
        if self.domain.is_empty() {
            return Err(Error::Validation("no domain".into()));
        }
        if self.access_token.as_ref().is_none_or(|t| t.is_empty()) {
            if self.username.is_empty() {
                return Err(Error::Validation("no username".into()));
            }
            if self.username.len() > 64 {
                return Err(Error::Validation("too many characters in username".into()));
            }
            if self.password.is_empty() {
                return Err(Error::Validation("no password".into()));
            }
            if self.password.len() > 64 {
                return Err(Error::Validation("too many characters in password".into()));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectRequest {
    pub host: String,
    pub domain: String,
    pub access_token: Vec<u8>,
    pub public_key: Vec<u8>,
}

impl ConnectRequest {
    pub fn check(&self) -> Result<(), Error> {
        if self.host.is_empty() {
            return Err(Error::Validation("no host".into()));
        }
        if self.domain.is_empty() {
            return Err(Error::Validation("no domain".into()));
        }
        if self.access_token.is_empty() {
            return Err(Error::Validation("no Access-Token".into()));
        }
        if self.public_key.len() != 32 {
            return Err(Error::Validation("public key invalid".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectResponse {
    pub public_key: Vec<u8>,
    pub endpoint: SocketAddr,
    #[serde(default)]
    pub preshared_key: Option<Vec<u8>>,
    #[serde(default, with = "humantime_serde")]
    pub persistent_keepalive: Option<Duration>,
    #[serde(default)]
    pub allowed_ips: Vec<IpAddr>,
    #[serde(default)]
    pub dns: Vec<IpAddr>,
    #[serde(default)]
    pub gateway: Vec<IpAddr>,
    #[serde(default)]
    pub stale_access_token: bool,
    pub session_token: Vec<u8>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DisconnectRequest {
    pub host: String,
    pub domain: String,
    pub session_token: Vec<u8>,
}

impl DisconnectRequest {
    pub fn check(&self) -> Result<(), Error> {
        if self.session_token.is_empty() {
            return Err(Error::Validation("no Session-Token".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FilterRequest {
    #[serde(skip_serializing_if = "is_false")]
    pub ads: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub trackers: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub malicious: bool,
    #[serde(rename = "PG", skip_serializing_if = "is_zero")]
    pub pg: i32,
    #[serde(skip_serializing_if = "is_false")]
    pub safe_search: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub categories: Vec<String>,
}

fn is_zero(v: &i32) -> bool {
    *v == 0
}

fn is_false(v: &bool) -> bool {
    !*v
}

impl FilterRequest {
    pub fn check(&self) -> Result<(), Error> {
        match self.pg {
            0 | 12 | 18 | 21 => Ok(()),
            other => Err(Error::Validation(format!("unsupported PG {other}"))),
        }
    }
}

pub struct Config {
    pub host: String,
    pub domain: String,
    pub ca_pem: Vec<u8>,
    pub access_token_path: Option<PathBuf>,
    pub timeout: Duration,
    pub api_version: u8,
}

pub struct Client {
    http: reqwest::Client,
    config: Config,
    access_token: std::sync::Mutex<Option<Vec<u8>>>,
}

impl Client {
    pub fn init(config: Config) -> Result<Self, Error> {
        if config.host.is_empty() {
            return Err(Error::ErrMissingHost);
        }
        let ca = reqwest::Certificate::from_pem(&config.ca_pem)?;
        let http = reqwest::Client::builder()
            .add_root_certificate(ca)
            .tls_built_in_root_certs(false)
            .timeout(config.timeout)
            .build()?;

        let access_token = config
            .access_token_path
            .as_ref()
            .and_then(|p| std::fs::read(p).ok());

        Ok(Client { http, config, access_token: std::sync::Mutex::new(access_token) })
    }

    pub fn have_access_token(&self) -> bool {
        self.access_token.lock().unwrap().as_ref().is_some_and(|t| !t.is_empty())
    }

    fn base_url(&self) -> String {
        format!("https://{}/{}", self.config.host, self.config.api_version)
    }

    async fn post_json<Req: Serialize, Resp: for<'de> Deserialize<'de>>(&self, path: &str, body: &Req) -> Result<Resp, Error> {
        let url = format!("{}{}", self.base_url(), path);
        let response = self.http.post(&url).json(body).send().await.map_err(classify_transport)?;

        let status = response.status();
        if status.as_u16() == 426 {
            return Err(Error::ErrAppUpdateRequired);
        }
        if !status.is_success() {
            return Err(Error::ErrHttpStatusBad(status.as_u16()));
        }
        Ok(response.json::<Resp>().await?)
    }

    pub async fn connect(&self, public_key: &[u8; 32]) -> Result<ConnectResponse, Error> {
        let token = self.access_token.lock().unwrap().clone().unwrap_or_default();
        let request = ConnectRequest {
            host: self.config.host.clone(),
            domain: self.config.domain.clone(),
            access_token: token,
            public_key: public_key.to_vec(),
        };
        request.check()?;
        let response: ConnectResponse = self.post_json("/connect", &request).await?;
        if response.stale_access_token {
            tracing::warn!("access token reported stale by server");
        }
        Ok(response)
    }

    pub async fn disconnect(&self, session_token: &[u8]) -> Result<(), Error> {
        let request = DisconnectRequest {
            host: self.config.host.clone(),
            domain: self.config.domain.clone(),
            session_token: session_token.to_vec(),
        };
        request.check()?;
        let _: serde_json::Value = self.post_json("/disconnect", &request).await.unwrap_or(serde_json::Value::Null);
        Ok(())
    }

    pub async fn get_access_token(&self, username: &str, password: &str) -> Result<Vec<u8>, Error> {
        let request = AccessTokenRequest {
            host: Some(self.config.host.clone()),
            domain: self.config.domain.clone(),
            access_token: self.access_token.lock().unwrap().clone(),
            username: username.to_string(),
            password: password.to_string(),
        };
        request.check()?;

        #[derive(Deserialize)]
        struct TokenResponse {
            access_token: Vec<u8>,
        }
        let response: TokenResponse = self.post_json("/accessToken", &request).await?;

        *self.access_token.lock().unwrap() = Some(response.access_token.clone());
        if let Some(path) = &self.config.access_token_path {
            std::fs::write(path, &response.access_token)?;
        }
        Ok(response.access_token)
    }

    pub async fn apply_filter(&self, filter: &FilterRequest) -> Result<(), Error> {
        filter.check()?;
        let _: serde_json::Value = match self.post_json("/applyFilter", filter).await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(%e, "applyFilter request failed, continuing best-effort");
                return Ok(());
            }
        };
        Ok(())
    }

    pub async fn enable_port_forwarding(&self) -> Result<(), Error> {
        let body = serde_json::json!({});
        let _: serde_json::Value = match self.post_json("/enablePortForwarding", &body).await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(%e, "enablePortForwarding request failed, continuing best-effort");
                return Ok(());
            }
        };
        Ok(())
    }
}

fn classify_transport(e: reqwest::Error) -> Error {
    if e.is_connect() && e.to_string().to_lowercase().contains("certificate") {
        Error::ErrBadPin
    } else {
        Error::Transport(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_token_request_requires_domain() {
        let req = AccessTokenRequest { domain: String::new(), ..Default::default() };
        assert!(req.check().is_err());
    }

    #[test]
    fn access_token_request_accepts_bearer_token_without_credentials() {
        let req = AccessTokenRequest { domain: "example.net".into(), access_token: Some(vec![1, 2, 3]), ..Default::default() };
        assert!(req.check().is_ok());
    }

    #[test]
    fn connect_request_rejects_short_public_key() {
        let req = ConnectRequest { host: "h".into(), domain: "d".into(), access_token: vec![1], public_key: vec![0; 16] };
        assert!(req.check().is_err());
    }

    #[test]
    fn filter_request_rejects_unsupported_pg() {
        let req = FilterRequest { pg: 7, ..Default::default() };
        assert!(req.check().is_err());
    }

    #[test]
    fn disconnect_request_requires_session_token() {
        let req = DisconnectRequest { host: "h".into(), domain: "d".into(), session_token: vec![] };
        assert!(req.check().is_err());
    }
}
