use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::HarvestError;

const SEARCH_URL: &str = "https://infotech.com.hk/itjs/job/fe-search.do?method=feList&sortByField=jjm_activedate&sortByOrder=DESC";
const DETAIL_URL_TEMPLATE: &str =
    "https://www.infotech.com.hk/itjs/job/fe-view.do?method=feView&jjKey={key}";
const ENV_PREFIX: &str = "HARVEST";

/// Everything the pipeline needs to know about the source and the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Field names never stored, compared against the trimmed first cell.
    pub excluded_fields: Vec<String>,
    pub search_url: String,
    /// Detail page URL with a `{key}` placeholder.
    pub detail_url_template: String,
    pub timeout_ms: u64,
    pub user_agent: String,
    /// Max detail pages in flight at once.
    pub concurrency: usize,

    pub store_path: PathBuf,
    pub sheet_name: String,
    /// Identifier column, always written first.
    pub key_field: String,

    pub key_param: String,
    /// Listing anchors must contain both markers in their text.
    pub link_marker_a: String,
    pub link_marker_b: String,

    pub form_name: String,
    pub fields: FieldNames,

    /// Delay between the end of one scheduled run and the start of the next.
    pub interval_secs: u64,
}

/// Detail-page rows that get special treatment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldNames {
    pub duties: String,
    pub requirements: String,
    pub title_category: String,
    pub contract_period: String,
}

impl Default for FieldNames {
    fn default() -> Self {
        Self {
            duties: "Duties".into(),
            requirements: "Requirements".into(),
            title_category: "Job Title/ Category".into(),
            contract_period: "Contract Period".into(),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            excluded_fields: [
                "Monthly Salary Range HK$",
                "Payroll",
                "Apply To",
                "Direct Line",
                "Employer Business",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            search_url: SEARCH_URL.into(),
            detail_url_template: DETAIL_URL_TEMPLATE.into(),
            timeout_ms: 60_000,
            user_agent: concat!("job_harvest/", env!("CARGO_PKG_VERSION")).into(),
            concurrency: 4,
            store_path: PathBuf::from("data/job_detail.sqlite"),
            sheet_name: "Details".into(),
            key_field: "Job Key No".into(),
            key_param: "jjKey".into(),
            link_marker_a: "Contract".into(),
            link_marker_b: "Bid".into(),
            form_name: "jobForm".into(),
            fields: FieldNames::default(),
            interval_secs: 86_400,
        }
    }
}

impl Settings {
    /// Layer defaults, an optional TOML file, then `HARVEST_*` environment variables.
    pub fn load(file: Option<&Path>) -> Result<Self, HarvestError> {
        let defaults = config::Config::try_from(&Settings::default()).map_err(config_err)?;
        let mut builder = config::Config::builder().add_source(defaults);

        builder = match file {
            Some(path) => builder.add_source(config::File::from(path).required(true)),
            None => builder.add_source(config::File::with_name("harvest").required(false)),
        };

        let settings: Settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()
            .map_err(config_err)?
            .try_deserialize()
            .map_err(config_err)?;

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), HarvestError> {
        let fail = |msg: &str| Err(HarvestError::Config(msg.to_string()));
        if self.timeout_ms == 0 {
            return fail("timeout_ms must be greater than 0");
        }
        if self.concurrency == 0 {
            return fail("concurrency must be greater than 0");
        }
        if !self.detail_url_template.contains("{key}") {
            return fail("detail_url_template must contain {key}");
        }
        if self.link_marker_a.is_empty() || self.link_marker_b.is_empty() {
            return fail("link markers must not be empty");
        }
        if self.key_field.trim().is_empty() || self.sheet_name.trim().is_empty() {
            return fail("key_field and sheet_name must not be empty");
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Detail page URL for `key`, percent-encoded as a query value.
    pub fn detail_url(&self, key: &str) -> String {
        let encoded: String = url::form_urlencoded::byte_serialize(key.as_bytes()).collect();
        self.detail_url_template.replace("{key}", &encoded)
    }

    pub fn lock_path(&self) -> PathBuf {
        let mut name = self.store_path.as_os_str().to_owned();
        name.push(".lock");
        PathBuf::from(name)
    }
}

fn config_err(e: config::ConfigError) -> HarvestError {
    HarvestError::Config(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let s = Settings::default();
        assert!(s.validate().is_ok());
        assert_eq!(s.timeout(), Duration::from_secs(60));
        assert!(s.excluded_fields.iter().any(|f| f == "Payroll"));
    }

    #[test]
    fn detail_url_substitutes_key() {
        let s = Settings::default();
        assert!(s.detail_url("12345").ends_with("jjKey=12345"));
        assert!(s.detail_url("A&B 1").ends_with("jjKey=A%26B+1"));
    }

    #[test]
    fn rejects_template_without_placeholder() {
        let s = Settings {
            detail_url_template: "https://example.com/view".into(),
            ..Settings::default()
        };
        assert!(matches!(s.validate(), Err(HarvestError::Config(_))));
    }

    #[test]
    fn rejects_zero_timeout() {
        let s = Settings {
            timeout_ms: 0,
            ..Settings::default()
        };
        assert!(s.validate().is_err());
    }

    #[test]
    fn lock_sits_next_to_store() {
        let s = Settings {
            store_path: PathBuf::from("out/jobs.sqlite"),
            ..Settings::default()
        };
        assert_eq!(s.lock_path(), PathBuf::from("out/jobs.sqlite.lock"));
    }

    #[test]
    fn loads_file_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("harvest.toml");
        std::fs::write(
            &path,
            "timeout_ms = 1500\nsheet_name = \"Jobs\"\n[fields]\nduties = \"Job Duties\"\n",
        )
        .unwrap();

        let s = Settings::load(Some(&path)).unwrap();
        assert_eq!(s.timeout_ms, 1500);
        assert_eq!(s.sheet_name, "Jobs");
        assert_eq!(s.fields.duties, "Job Duties");
        assert_eq!(s.fields.requirements, "Requirements");
        assert_eq!(s.key_param, "jjKey");
    }
}
