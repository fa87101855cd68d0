//! Bridge to the document editor host.
//!
//! The host publishes a WOPI discovery document listing, per application,
//! the URL template (`urlsrc`) to open a file for viewing or editing. We fetch
//! it, cache it for a while, and turn templates into launch URLs.

use crate::config::DiscoveryConfig;
use crate::error::WopiError;
use crate::models::{Action, AppName, DiscoveryDescriptor};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use url::Url;

const DISCOVERY_PATH: &str = "hosting/discovery";

/// Extensions we open, and the editor app for each.
pub const SUPPORTED_EXTENSIONS: &[(&str, AppName)] = &[
    ("xlsx", AppName::Calc),
    ("xls", AppName::Calc),
    ("xlsm", AppName::Calc),
    ("ods", AppName::Calc),
    ("csv", AppName::Calc),
    ("docx", AppName::Writer),
    ("doc", AppName::Writer),
    ("odt", AppName::Writer),
    ("rtf", AppName::Writer),
    ("txt", AppName::Writer),
    ("pptx", AppName::Impress),
    ("ppt", AppName::Impress),
    ("odp", AppName::Impress),
    ("odg", AppName::Draw),
];

/// Map a file extension to the app that edits it. Case-insensitive, and a
/// leading dot is ignored.
pub fn resolve_app(extension: &str) -> Result<AppName, WopiError> {
    let ext = extension.trim().trim_start_matches('.').to_lowercase();
    SUPPORTED_EXTENSIONS
        .iter()
        .find(|(known, _)| *known == ext)
        .map(|(_, app)| *app)
        .ok_or(WopiError::UnsupportedExtension(ext))
}

/// Parsed discovery document: raw `urlsrc` templates per app and action.
#[derive(Debug, Clone, Default)]
pub struct Discovery {
    actions: HashMap<(AppName, Action), String>,
}

impl Discovery {
    pub fn parse(xml: &str) -> Result<Self, WopiError> {
        let malformed =
            |e: &dyn std::fmt::Display| WopiError::DiscoveryUnavailable(format!("malformed discovery: {}", e));

        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        let mut actions = HashMap::new();
        let mut current_app: Option<AppName> = None;

        loop {
            match reader.read_event() {
                Ok(Event::Start(e)) if e.name().as_ref() == b"app" => {
                    current_app = attribute(&e, "name")
                        .map_err(|e| malformed(&e))?
                        .and_then(|name| AppName::from_discovery_name(&name));
                }
                Ok(Event::End(e)) if e.name().as_ref() == b"app" => current_app = None,
                Ok(Event::Start(e)) | Ok(Event::Empty(e)) if e.name().as_ref() == b"action" => {
                    let Some(app) = current_app else { continue };
                    let action = match attribute(&e, "name").map_err(|e| malformed(&e))? {
                        Some(name) if name == "edit" => Action::Edit,
                        Some(name) if name == "view" => Action::View,
                        _ => continue,
                    };
                    if let Some(urlsrc) = attribute(&e, "urlsrc").map_err(|e| malformed(&e))? {
                        actions.entry((app, action)).or_insert(urlsrc);
                    }
                }
                Ok(Event::Eof) => break,
                Err(e) => return Err(malformed(&e)),
                _ => {}
            }
        }

        if actions.is_empty() {
            return Err(WopiError::DiscoveryUnavailable(
                "discovery lists no usable actions".to_string(),
            ));
        }
        Ok(Self { actions })
    }

    pub fn urlsrc(&self, app: AppName, action: Action) -> Option<&str> {
        self.actions.get(&(app, action)).map(String::as_str)
    }

    pub fn publishes(&self, app: AppName) -> bool {
        self.urlsrc(app, Action::Edit).is_some()
    }
}

fn attribute(element: &BytesStart<'_>, name: &str) -> Result<Option<String>, anyhow::Error> {
    match element.try_get_attribute(name)? {
        Some(attr) => Ok(Some(attr.unescape_value()?.into_owned())),
        None => Ok(None),
    }
}

/// Remove `<name=VALUE&>` placeholders and any dangling `?` or `&`.
pub fn strip_placeholders(urlsrc: &str) -> String {
    let mut out = String::with_capacity(urlsrc.len());
    let mut depth = 0usize;
    for c in urlsrc.chars() {
        match c {
            '<' => depth += 1,
            '>' if depth > 0 => depth -= 1,
            _ if depth == 0 => out.push(c),
            _ => {}
        }
    }
    out.trim_end_matches(['?', '&']).to_string()
}

struct CachedDiscovery {
    discovery: Arc<Discovery>,
    fetched_at: Instant,
}

pub struct DiscoveryClient {
    http: reqwest::Client,
    discovery_url: Url,
    public_editor_url: Url,
    wopi_base_url: Url,
    cache_ttl: Duration,
    cache: RwLock<Option<CachedDiscovery>>,
}

impl DiscoveryClient {
    pub fn new(config: &DiscoveryConfig) -> Result<Self, anyhow::Error> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()?;

        let mut editor_url = Url::parse(&config.editor_url)?;
        if !editor_url.path().ends_with('/') {
            let path = format!("{}/", editor_url.path());
            editor_url.set_path(&path);
        }

        Ok(Self {
            http,
            discovery_url: editor_url.join(DISCOVERY_PATH)?,
            public_editor_url: Url::parse(&config.public_editor_url)?,
            wopi_base_url: Url::parse(&config.wopi_base_url)?,
            cache_ttl: Duration::from_secs(config.cache_ttl_seconds),
            cache: RwLock::new(None),
        })
    }

    /// Current discovery document, fetched when the cache is empty or stale.
    pub async fn discover(&self) -> Result<Arc<Discovery>, WopiError> {
        if let Some(cached) = self.cache.read().await.as_ref() {
            if cached.fetched_at.elapsed() < self.cache_ttl {
                return Ok(cached.discovery.clone());
            }
        }

        let mut cache = self.cache.write().await;
        // Another request may have refreshed it while we waited.
        if let Some(cached) = cache.as_ref() {
            if cached.fetched_at.elapsed() < self.cache_ttl {
                return Ok(cached.discovery.clone());
            }
        }

        let discovery = Arc::new(self.fetch().await?);
        *cache = Some(CachedDiscovery {
            discovery: discovery.clone(),
            fetched_at: Instant::now(),
        });
        Ok(discovery)
    }

    async fn fetch(&self) -> Result<Discovery, WopiError> {
        let unavailable = |reason: String| {
            tracing::error!(url = %self.discovery_url, reason = %reason, "Discovery fetch failed");
            WopiError::DiscoveryUnavailable(reason)
        };

        let response = self
            .http
            .get(self.discovery_url.clone())
            .send()
            .await
            .map_err(|e| unavailable(format!("request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(unavailable(format!(
                "editor host returned {}",
                response.status()
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| unavailable(format!("failed to read body: {}", e)))?;
        let discovery = Discovery::parse(&body).map_err(|e| unavailable(e.to_string()))?;

        tracing::info!(
            url = %self.discovery_url,
            actions = discovery.actions.len(),
            "Discovery document refreshed"
        );
        Ok(discovery)
    }

    pub async fn descriptor(&self, app: AppName) -> Result<DiscoveryDescriptor, WopiError> {
        let discovery = self.discover().await?;
        self.describe(&discovery, app)
    }

    fn describe(
        &self,
        discovery: &Discovery,
        app: AppName,
    ) -> Result<DiscoveryDescriptor, WopiError> {
        Ok(DiscoveryDescriptor {
            app_name: app,
            edit_action_url: self.action_base(discovery, app, Action::Edit)?.to_string(),
            view_action_url: self.action_base(discovery, app, Action::View)?.to_string(),
        })
    }

    /// Every supported extension whose app the host publishes.
    pub async fn extension_map(&self) -> Result<BTreeMap<String, DiscoveryDescriptor>, WopiError> {
        let discovery = self.discover().await?;
        let mut descriptors = HashMap::new();
        let mut map = BTreeMap::new();

        for (ext, app) in SUPPORTED_EXTENSIONS {
            if !discovery.publishes(*app) {
                continue;
            }
            if !descriptors.contains_key(app) {
                descriptors.insert(*app, self.describe(&discovery, *app)?);
            }
            if let Some(descriptor) = descriptors.get(app) {
                map.insert(ext.to_string(), descriptor.clone());
            }
        }
        Ok(map)
    }

    /// Launch URL for the editor with WOPISrc and the access token attached.
    pub async fn build_action_url(
        &self,
        app: AppName,
        action: Action,
        file_id: &str,
        access_token: &str,
        access_token_ttl_ms: i64,
    ) -> Result<Url, WopiError> {
        let discovery = self.discover().await?;
        let mut url = self.action_base(&discovery, app, action)?;
        url.query_pairs_mut()
            .append_pair("WOPISrc", self.wopi_src(file_id)?.as_str())
            .append_pair("access_token", access_token)
            .append_pair("access_token_ttl", &access_token_ttl_ms.to_string());
        Ok(url)
    }

    /// Scheme, host and port the browser loads the editor from.
    pub fn editor_origin(&self) -> String {
        self.public_editor_url.origin().ascii_serialization()
    }

    /// The URL the editor host calls back on for this file.
    pub fn wopi_src(&self, file_id: &str) -> Result<Url, WopiError> {
        let mut url = self.wopi_base_url.clone();
        url.path_segments_mut()
            .map_err(|_| {
                WopiError::Internal(anyhow::anyhow!("WOPI base URL cannot carry a path"))
            })?
            .pop_if_empty()
            .extend(["wopi", "files", file_id]);
        Ok(url)
    }

    /// Absolute action URL without file parameters. A missing `view` action
    /// falls back to `edit` opened read-only.
    fn action_base(
        &self,
        discovery: &Discovery,
        app: AppName,
        action: Action,
    ) -> Result<Url, WopiError> {
        if let Some(urlsrc) = discovery.urlsrc(app, action) {
            return self.resolve(urlsrc);
        }

        match (action, discovery.urlsrc(app, Action::Edit)) {
            (Action::View, Some(edit)) => {
                let mut url = self.resolve(edit)?;
                url.query_pairs_mut().append_pair("permission", "readonly");
                Ok(url)
            }
            _ => Err(WopiError::DiscoveryUnavailable(format!(
                "editor host publishes no {} action for {}",
                action.as_str(),
                app
            ))),
        }
    }

    fn resolve(&self, urlsrc: &str) -> Result<Url, WopiError> {
        let stripped = strip_placeholders(urlsrc);
        let parsed = match Url::parse(&stripped) {
            Ok(url) => Ok(url),
            Err(url::ParseError::RelativeUrlWithoutBase) => self.public_editor_url.join(&stripped),
            Err(e) => Err(e),
        };
        parsed.map_err(|e| {
            WopiError::DiscoveryUnavailable(format!("invalid action url {}: {}", stripped, e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DISCOVERY_XML: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<wopi-discovery>
  <net-zone name="external-http">
    <app name="application/vnd.ms-excel">
      <action ext="" name="edit" urlsrc="http://ignored/"/>
    </app>
    <app name="calc">
      <action default="true" ext="xlsx" name="edit" urlsrc="http://collabora:9980/browser/abc/cool.html?&lt;ui=UI_LLCC&amp;&gt;"/>
      <action ext="xlsx" name="view" urlsrc="http://collabora:9980/browser/abc/cool.html?permission=readonly&amp;"/>
    </app>
    <app name="writer">
      <action ext="docx" name="edit" urlsrc="/browser/abc/cool.html?"/>
    </app>
  </net-zone>
</wopi-discovery>"#;

    fn client() -> DiscoveryClient {
        DiscoveryClient::new(&DiscoveryConfig {
            editor_url: "http://collabora:9980".to_string(),
            public_editor_url: "https://office.example.com".to_string(),
            wopi_base_url: "http://wopi:8080".to_string(),
            cache_ttl_seconds: 300,
            request_timeout_seconds: 10,
        })
        .unwrap()
    }

    #[test]
    fn extensions_resolve_to_apps() {
        assert_eq!(resolve_app("xlsx").unwrap(), AppName::Calc);
        assert_eq!(resolve_app(".XLSX").unwrap(), AppName::Calc);
        assert_eq!(resolve_app("Docx").unwrap(), AppName::Writer);
        assert_eq!(resolve_app("odp").unwrap(), AppName::Impress);
        assert_eq!(resolve_app("odg").unwrap(), AppName::Draw);
        assert!(matches!(
            resolve_app("exe"),
            Err(WopiError::UnsupportedExtension(ext)) if ext == "exe"
        ));
        assert!(resolve_app("").is_err());
    }

    #[test]
    fn placeholders_are_stripped() {
        assert_eq!(
            strip_placeholders("https://h/cool.html?<ui=UI_LLCC&><rs=DC_LLCC&>"),
            "https://h/cool.html"
        );
        assert_eq!(
            strip_placeholders("https://h/cool.html?a=1&<ui=UI_LLCC&>"),
            "https://h/cool.html?a=1"
        );
    }

    #[test]
    fn discovery_xml_is_parsed() {
        let discovery = Discovery::parse(DISCOVERY_XML).unwrap();
        assert!(discovery.publishes(AppName::Calc));
        assert!(discovery.publishes(AppName::Writer));
        assert!(!discovery.publishes(AppName::Impress));
        assert_eq!(
            discovery.urlsrc(AppName::Calc, Action::Edit),
            Some("http://collabora:9980/browser/abc/cool.html?<ui=UI_LLCC&>")
        );
        assert!(discovery.urlsrc(AppName::Writer, Action::View).is_none());
    }

    #[test]
    fn garbage_is_not_a_discovery_document() {
        assert!(matches!(
            Discovery::parse("<html><body>502</body></html>"),
            Err(WopiError::DiscoveryUnavailable(_))
        ));
        assert!(Discovery::parse("<wopi-discovery><app name=\"calc\">").is_err());
    }

    #[test]
    fn absolute_action_urls_are_kept() {
        let client = client();
        let discovery = Discovery::parse(DISCOVERY_XML).unwrap();
        let url = client
            .action_base(&discovery, AppName::Calc, Action::Edit)
            .unwrap();
        assert_eq!(url.as_str(), "http://collabora:9980/browser/abc/cool.html");
    }

    #[test]
    fn relative_action_urls_join_the_public_origin_once() {
        let client = client();
        let discovery = Discovery::parse(DISCOVERY_XML).unwrap();
        let url = client
            .action_base(&discovery, AppName::Writer, Action::Edit)
            .unwrap();
        assert_eq!(url.as_str(), "https://office.example.com/browser/abc/cool.html");
    }

    #[test]
    fn missing_view_action_falls_back_to_readonly_edit() {
        let client = client();
        let discovery = Discovery::parse(DISCOVERY_XML).unwrap();
        let descriptor = client.describe(&discovery, AppName::Writer).unwrap();
        assert_eq!(
            descriptor.view_action_url,
            "https://office.example.com/browser/abc/cool.html?permission=readonly"
        );
        assert!(client.describe(&discovery, AppName::Draw).is_err());
    }

    #[test]
    fn wopi_src_points_at_the_file_endpoint() {
        let client = client();
        assert_eq!(
            client.wopi_src("f1").unwrap().as_str(),
            "http://wopi:8080/wopi/files/f1"
        );
    }

    #[test]
    fn editor_origin_drops_the_path() {
        assert_eq!(client().editor_origin(), "https://office.example.com");

        let client = DiscoveryClient::new(&DiscoveryConfig {
            editor_url: "http://collabora:9980".to_string(),
            public_editor_url: "https://office.example.com:9443/collabora/".to_string(),
            wopi_base_url: "http://wopi:8080".to_string(),
            cache_ttl_seconds: 300,
            request_timeout_seconds: 10,
        })
        .unwrap();
        assert_eq!(client.editor_origin(), "https://office.example.com:9443");
    }
}
