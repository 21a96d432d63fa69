use crate::config::Config;
use anyhow::{bail, Context};
use reqwest::Client;
use serde_json::json;
use url::Url;

/// HTTP client for the demo token server.
///
/// The server hands out access tokens and keeps the push binding for an
/// identity. Paths are fixed: `accessToken`, `register`, `unregister`.
pub struct RegistrationClient {
    client: Client,
    base_url: Url,
    identity: String,
}

impl RegistrationClient {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        Ok(Self {
            client: Client::new(),
            base_url: parse_base(config.server_base_url)?,
            identity: config.identity.clone(),
        })
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// GET {base}/accessToken?identity={identity}
    ///
    /// 响应体就是裸的 JWT 文本
    pub async fn fetch_access_token(&self) -> anyhow::Result<String> {
        let mut url = self.endpoint("accessToken")?;
        url.query_pairs_mut().append_pair("identity", &self.identity);

        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .with_context(|| format!("access token request to {} failed", url))?;
        if !response.status().is_success() {
            bail!("access token request failed: HTTP {}", response.status());
        }

        let token = response
            .text()
            .await
            .context("reading access token body")?
            .trim()
            .to_string();
        if token.is_empty() {
            bail!("server returned an empty access token");
        }
        Ok(token)
    }

    /// POST {base}/register, binding this identity to a device token.
    pub async fn register(&self, access_token: &str, device_token: &str) -> anyhow::Result<()> {
        self.post_binding("register", access_token, device_token)
            .await
    }

    /// POST {base}/unregister, releasing the binding.
    pub async fn unregister(&self, access_token: &str, device_token: &str) -> anyhow::Result<()> {
        self.post_binding("unregister", access_token, device_token)
            .await
    }

    async fn post_binding(
        &self,
        path: &str,
        access_token: &str,
        device_token: &str,
    ) -> anyhow::Result<()> {
        let url = self.endpoint(path)?;
        let body = json!({
            "identity": self.identity,
            "access_token": access_token,
            "device_token": device_token,
        });

        let response = self
            .client
            .post(url.clone())
            .json(&body)
            .send()
            .await
            .with_context(|| format!("{} request to {} failed", path, url))?;
        if !response.status().is_success() {
            bail!("{} failed: HTTP {}", path, response.status());
        }
        Ok(())
    }

    fn endpoint(&self, path: &str) -> anyhow::Result<Url> {
        self.base_url
            .join(path)
            .with_context(|| format!("cannot build {} URL from {}", path, self.base_url))
    }
}

/// A base without a trailing slash would otherwise drop its last path segment
/// on join.
fn parse_base(raw: &str) -> anyhow::Result<Url> {
    let mut url = Url::parse(raw).with_context(|| format!("invalid server base URL: {}", raw))?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(base: &str, identity: &str) -> RegistrationClient {
        RegistrationClient {
            client: Client::new(),
            base_url: parse_base(base).unwrap(),
            identity: identity.to_string(),
        }
    }

    #[test]
    fn builds_endpoints_from_bare_host() {
        let c = client("http://127.0.0.1:5000", "alice");
        assert_eq!(
            c.endpoint("register").unwrap().as_str(),
            "http://127.0.0.1:5000/register"
        );
    }

    #[test]
    fn keeps_base_path_segments() {
        let c = client("https://example.com/voice/api", "alice");
        assert_eq!(
            c.endpoint("unregister").unwrap().as_str(),
            "https://example.com/voice/api/unregister"
        );
    }

    #[test]
    fn token_url_carries_identity_query() {
        let c = client("http://127.0.0.1:5000", "alice smith");
        let mut url = c.endpoint("accessToken").unwrap();
        url.query_pairs_mut().append_pair("identity", c.identity());
        assert_eq!(
            url.as_str(),
            "http://127.0.0.1:5000/accessToken?identity=alice+smith"
        );
    }

    #[test]
    fn rejects_garbage_base() {
        assert!(parse_base("not a url").is_err());
    }
}
