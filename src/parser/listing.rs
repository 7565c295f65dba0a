use std::collections::BTreeSet;
use std::sync::LazyLock;

use scraper::{Html, Selector};
use tracing::debug;
use url::Url;

use crate::config::Settings;
use crate::error::HarvestError;
use crate::record::JobKey;

static ANCHOR: LazyLock<Selector> = LazyLock::new(|| Selector::parse("a").unwrap());

/// Finds the posting keys advertised on a listing page.
pub struct KeyDiscoverer {
    base: Url,
    marker_a: String,
    marker_b: String,
    param: String,
}

impl KeyDiscoverer {
    pub fn new(settings: &Settings) -> Result<Self, HarvestError> {
        let base = Url::parse(&settings.search_url)
            .map_err(|e| HarvestError::Config(format!("bad search_url {:?}: {}", settings.search_url, e)))?;
        Ok(Self {
            base,
            marker_a: settings.link_marker_a.clone(),
            marker_b: settings.link_marker_b.clone(),
            param: settings.key_param.clone(),
        })
    }

    /// Keys of every anchor whose text carries both markers. Duplicates collapse.
    pub fn discover(&self, html: &str) -> BTreeSet<JobKey> {
        let doc = Html::parse_document(html);
        let mut keys = BTreeSet::new();

        for link in doc.select(&ANCHOR) {
            let text: String = link.text().collect();
            if !text.contains(&self.marker_a) || !text.contains(&self.marker_b) {
                continue;
            }
            let Some(href) = link.value().attr("href") else {
                continue;
            };
            if let Some(key) = self.key_of(href) {
                debug!("Found job key: {}", key);
                keys.insert(JobKey::new(key));
            }
        }

        keys
    }

    /// Decoded value of the key parameter in `href`, resolved against the listing URL.
    fn key_of(&self, href: &str) -> Option<String> {
        let url = self.base.join(href).ok()?;
        url.query_pairs()
            .find(|(k, _)| *k == self.param)
            .map(|(_, v)| v.into_owned())
            .filter(|v| !v.is_empty())
    }
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;

    fn discoverer() -> KeyDiscoverer {
        KeyDiscoverer::new(&Settings::default()).unwrap()
    }

    #[test]
    fn fixture_keys() {
        let html = std::fs::read_to_string("tests/fixtures/listing.html").unwrap();
        let keys = discoverer().discover(&html);
        let keys: Vec<&str> = keys.iter().map(JobKey::as_str).collect();
        assert_eq!(keys, ["100234", "100235", "AbC-9"]);
    }

    #[test]
    fn no_candidates_is_empty_set() {
        let keys = discoverer().discover("<html><body><a href='x?jjKey=1'>Apply</a></body></html>");
        assert!(keys.is_empty());
    }

    #[test]
    fn custom_markers() {
        let settings = Settings {
            link_marker_a: "Perm".into(),
            link_marker_b: "Ref".into(),
            ..Settings::default()
        };
        let keys = KeyDiscoverer::new(&settings)
            .unwrap()
            .discover("<a href='v?jjKey=7'>Perm Ref 1</a><a href='v?jjKey=8'>Contract Bid</a>");
        assert_eq!(keys.into_iter().collect::<Vec<_>>(), [JobKey::from("7")]);
    }

    #[test]
    fn key_parameter_lookup() {
        let d = discoverer();
        assert_eq!(d.key_of("view.do?a=1&jjKey=42").as_deref(), Some("42"));
        assert_eq!(d.key_of("view.do?jjKey=42&a=1").as_deref(), Some("42"));
        assert_eq!(d.key_of("view.do?xjjKey=42"), None);
        assert_eq!(d.key_of("view.do?jjKey="), None);
        assert_eq!(d.key_of("view.do?jjKey=5#frag").as_deref(), Some("5"));
        assert_eq!(d.key_of("https://other.test/v?jjKey=9").as_deref(), Some("9"));
    }

    #[test]
    fn encoded_and_plain_keys_collapse() {
        let keys = discoverer().discover(
            "<a href='view?jjKey=10%2D1'>Contract Bid</a><a href='view?jjKey=10-1'>Contract Bid</a>",
        );
        assert_eq!(keys.into_iter().collect::<Vec<_>>(), [JobKey::from("10-1")]);
    }

    #[test]
    fn unparsable_search_url_is_config_error() {
        let settings = Settings {
            search_url: "not a url".into(),
            ..Settings::default()
        };
        assert!(matches!(KeyDiscoverer::new(&settings), Err(HarvestError::Config(_))));
    }

    #[test]
    fn keys_are_case_sensitive() {
        let keys = discoverer()
            .discover("<a href='v?jjKey=ab'>Contract Bid</a><a href='v?jjKey=AB'>Contract Bid</a>");
        assert_eq!(keys.len(), 2);
    }
}
