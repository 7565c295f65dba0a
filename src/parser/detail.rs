use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use scraper::{ElementRef, Html, Node, Selector};

use super::derive;
use crate::config::{FieldNames, Settings};
use crate::error::{ExtractionError, HarvestError};
use crate::record::JobRecord;

static ROW: LazyLock<Selector> = LazyLock::new(|| Selector::parse("tr").unwrap());
static CELL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("td").unwrap());
static BR_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)<br\s*/*>").unwrap());

/// Elements whose boundaries separate words in visible text.
const BREAKING: &[&str] = &["br", "p", "div", "li", "tr", "td", "th", "table", "ul", "ol"];

/// Turns a detail page into a record of its attribute table.
pub struct DetailExtractor {
    form: Selector,
    form_name: String,
    excluded: HashSet<String>,
    fields: FieldNames,
}

impl DetailExtractor {
    pub fn new(settings: &Settings) -> Result<Self, HarvestError> {
        let css = format!("form[name=\"{}\"]", settings.form_name);
        let form = Selector::parse(&css)
            .map_err(|e| HarvestError::Config(format!("bad form name {:?}: {}", settings.form_name, e)))?;
        Ok(Self {
            form,
            form_name: settings.form_name.clone(),
            excluded: settings.excluded_fields.iter().cloned().collect(),
            fields: settings.fields.clone(),
        })
    }

    pub fn extract(&self, html: &str) -> Result<JobRecord, ExtractionError> {
        let doc = Html::parse_document(html);
        let form = doc
            .select(&self.form)
            .next()
            .ok_or_else(|| ExtractionError::FormNotFound(self.form_name.clone()))?;

        let mut record = JobRecord::new();
        for row in form.select(&ROW) {
            let cells: Vec<ElementRef> = row.select(&CELL).collect();
            let [label, data] = cells.as_slice() else {
                continue;
            };

            let name = visible_text(*label);
            if name.is_empty() || self.excluded.contains(&name) {
                continue;
            }

            let value = if self.keeps_lines(&name) {
                multiline_text(*data)
            } else {
                visible_text(*data)
            };

            record.insert(name.as_str(), value.as_str());
            derive::apply(&self.fields, &name, &value, &mut record)?;
        }

        Ok(record)
    }

    fn keeps_lines(&self, name: &str) -> bool {
        name == self.fields.duties || name == self.fields.requirements
    }
}

/// Rendered text with whitespace runs collapsed to single spaces.
fn visible_text(el: ElementRef) -> String {
    let mut raw = String::new();
    for node in el.descendants() {
        match node.value() {
            Node::Text(text) => raw.push_str(text),
            Node::Element(e) if BREAKING.contains(&e.name()) => raw.push(' '),
            _ => {}
        }
    }
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Cell markup with `<br>` as newlines and `&nbsp;` / `&amp;` decoded.
fn multiline_text(el: ElementRef) -> String {
    let html = el.inner_html();
    BR_RE
        .replace_all(&html, "\n")
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .trim()
        .to_string()
}

// ── Tests ──
