use std::sync::Arc;

use anyhow::{Context, Result, bail};
use url::Url;

/// Builds the URL the realtime layer fetches its capability token from.
pub trait TokenProvider: Send + Sync {
    fn auth_url(&self, workspace_id: &str, session_id: Option<&str>) -> Result<String>;
}

pub type SharedTokenProvider = Arc<dyn TokenProvider>;

/// `{base}/realtime/token?workspaceId=..&sessionId=..`
#[derive(Clone, Debug)]
pub struct UrlTokenProvider {
    base: Url,
}

impl UrlTokenProvider {
    pub fn new(base: &str) -> Result<Self> {
        let mut base = Url::parse(base).context("invalid widget api base url")?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(Self { base })
    }
}

impl TokenProvider for UrlTokenProvider {
    fn auth_url(&self, workspace_id: &str, session_id: Option<&str>) -> Result<String> {
        if workspace_id.trim().is_empty() {
            bail!("workspace id is required to request a realtime token");
        }
        let mut url = self
            .base
            .join("realtime/token")
            .context("failed to build token url")?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("workspaceId", workspace_id);
            if let Some(session_id) = session_id.filter(|id| !id.is_empty()) {
                query.append_pair("sessionId", session_id);
            }
        }
        Ok(url.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_url_under_base_path() {
        let provider = UrlTokenProvider::new("https://api.widget.test/v1").unwrap();
        assert_eq!(
            provider.auth_url("acme", Some("s 1")).unwrap(),
            "https://api.widget.test/v1/realtime/token?workspaceId=acme&sessionId=s+1"
        );
        assert_eq!(
            provider.auth_url("acme", None).unwrap(),
            "https://api.widget.test/v1/realtime/token?workspaceId=acme"
        );
    }

    #[test]
    fn rejects_missing_workspace() {
        let provider = UrlTokenProvider::new("https://api.widget.test/").unwrap();
        assert!(provider.auth_url(" ", Some("s")).is_err());
        assert!(UrlTokenProvider::new("not a url").is_err());
    }
}
