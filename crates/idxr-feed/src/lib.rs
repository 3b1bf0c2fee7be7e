//! IDX feed registry, pipe-delimited feed parsing, and feed file downloads.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use idxr_core::{ListingRecord, DEFAULT_INACTIVE_STATUS};
use idxr_storage::{write_atomic, HttpFetcher};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "idxr-feed";

const DELIMITER: char = '|';
const TOKEN_PLACEHOLDER: &str = "{token}";

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("feed file {file} has no header row")]
    MissingHeader { file: String },
    #[error("feed file {file} has no `{column}` identifier column")]
    MissingIdentifierColumn { file: String, column: String },
    #[error("download url for {file} needs a token but none is configured")]
    MissingToken { file: String },
    #[error("download of {file} returned an empty body")]
    EmptyDownload { file: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedConfig {
    pub file_name: String,
    pub property_type: String,
    pub label: String,
    pub priority: u32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub download_url: Option<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldMap {
    pub identifier_column: String,
    pub columns: BTreeMap<String, String>,
    pub constants: BTreeMap<String, String>,
}

impl Default for FieldMap {
    fn default() -> Self {
        let columns = [
            ("ListingID", "LIST_NO"),
            ("ListPrice", "LIST_PRICE"),
            ("StreetName", "STREET_NAME"),
            ("City", "TOWN_NUM"),
            ("PostalCode", "ZIP_CODE"),
            ("BedroomsTotal", "NO_BEDROOMS"),
            ("BathroomsTotalInteger", "NO_FULL_BATHS"),
            ("LivingArea", "SQUARE_FEET"),
            ("ListingStatus", "STATUS"),
        ]
        .into_iter()
        .map(|(field, column)| (field.to_string(), column.to_string()))
        .collect();
        Self {
            identifier_column: "LIST_NO".to_string(),
            columns,
            constants: BTreeMap::from([("StateOrProvince".to_string(), "MA".to_string())]),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedRegistry {
    pub feeds: Vec<FeedConfig>,
    #[serde(default)]
    pub field_map: FieldMap,
    #[serde(default = "default_inactive_status")]
    pub inactive_status: String,
    #[serde(default = "default_comparison_fields")]
    pub comparison_fields: Vec<String>,
    #[serde(default)]
    pub priority_agent_id: Option<String>,
}

fn default_inactive_status() -> String {
    DEFAULT_INACTIVE_STATUS.to_string()
}

pub fn default_comparison_fields() -> Vec<String> {
    ["ListPrice", "ListingStatus", "ModificationTimestamp"]
        .into_iter()
        .map(ToString::to_string)
        .collect()
}

impl FeedRegistry {
    pub fn from_yaml(text: &str) -> anyhow::Result<Self> {
        let registry: Self = serde_yaml::from_str(text).context("parsing feed registry")?;
        if registry.field_map.identifier_column.trim().is_empty() {
            anyhow::bail!("feed registry field_map.identifier_column is empty");
        }
        Ok(registry)
    }

    pub async fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("loading {}", path.display()))
    }

    pub fn enabled_feeds(&self) -> Vec<&FeedConfig> {
        let mut feeds = self.feeds.iter().filter(|f| f.enabled).collect::<Vec<_>>();
        feeds.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.file_name.cmp(&b.file_name)));
        feeds
    }
}

fn clean_value(value: &str) -> &str {
    let value = value.trim();
    if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
        &value[1..value.len() - 1]
    } else {
        value
    }
}

/// Lazily parses a pipe-delimited feed with a header row into listing records.
#[derive(Debug)]
pub struct FeedRows<'m> {
    text: String,
    pos: usize,
    header: Vec<String>,
    identifier_index: usize,
    source_file: String,
    field_map: &'m FieldMap,
    dropped: usize,
    yielded: usize,
}

pub fn parse_feed<'m>(
    bytes: &[u8],
    source_file: &str,
    field_map: &'m FieldMap,
) -> Result<FeedRows<'m>, FeedError> {
    let text = String::from_utf8_lossy(bytes).into_owned();
    let mut rows = FeedRows {
        text,
        pos: 0,
        header: Vec::new(),
        identifier_index: 0,
        source_file: source_file.to_string(),
        field_map,
        dropped: 0,
        yielded: 0,
    };

    let header_line = rows
        .next_line()
        .ok_or_else(|| FeedError::MissingHeader {
            file: source_file.to_string(),
        })?
        .trim_start_matches('\u{feff}')
        .to_string();
    rows.header = header_line
        .split(DELIMITER)
        .map(|name| clean_value(name).to_string())
        .collect();
    rows.identifier_index = rows
        .header
        .iter()
        .position(|name| name == &field_map.identifier_column)
        .ok_or_else(|| FeedError::MissingIdentifierColumn {
            file: source_file.to_string(),
            column: field_map.identifier_column.clone(),
        })?;
    Ok(rows)
}

impl<'m> FeedRows<'m> {
    pub fn header(&self) -> &[String] {
        &self.header
    }

    pub fn dropped_rows(&self) -> usize {
        self.dropped
    }

    pub fn yielded_rows(&self) -> usize {
        self.yielded
    }

    fn next_line(&mut self) -> Option<String> {
        while self.pos < self.text.len() {
            let rest = &self.text[self.pos..];
            let (line, advance) = match rest.find('\n') {
                Some(idx) => (&rest[..idx], idx + 1),
                None => (rest, rest.len()),
            };
            self.pos += advance;
            let line = line.trim_end_matches('\r');
            if !line.trim().is_empty() {
                return Some(line.to_string());
            }
        }
        None
    }

    fn build_record(&self, line: &str) -> Option<ListingRecord> {
        let values = line.split(DELIMITER).collect::<Vec<_>>();
        let listing_key = values
            .get(self.identifier_index)
            .map(|v| clean_value(v))
            .filter(|v| !v.is_empty())?
            .to_string();

        let mut raw = BTreeMap::new();
        for (idx, value) in values.iter().enumerate() {
            let name = match self.header.get(idx) {
                Some(name) => name.clone(),
                None => format!("_extra_{}", idx - self.header.len()),
            };
            raw.insert(name, clean_value(value).to_string());
        }

        let mut fields = BTreeMap::new();
        for (field, column) in &self.field_map.columns {
            if let Some(value) = raw.get(column).filter(|v| !v.is_empty()) {
                fields.insert(field.clone(), value.clone());
            }
        }
        for (field, value) in &self.field_map.constants {
            fields.insert(field.clone(), value.clone());
        }

        Some(ListingRecord {
            listing_key,
            fields,
            raw,
            source_file: self.source_file.clone(),
        })
    }
}

impl Iterator for FeedRows<'_> {
    type Item = ListingRecord;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = self.next_line()?;
            match self.build_record(&line) {
                Some(record) => {
                    self.yielded += 1;
                    return Some(record);
                }
                None => self.dropped += 1,
            }
        }
    }
}

pub fn resolve_download_url(
    feed: &FeedConfig,
    template: &str,
    token: Option<&str>,
) -> Result<String, FeedError> {
    if !template.contains(TOKEN_PLACEHOLDER) {
        return Ok(template.to_string());
    }
    match token.filter(|t| !t.is_empty()) {
        Some(token) => Ok(template.replace(TOKEN_PLACEHOLDER, token)),
        None => Err(FeedError::MissingToken {
            file: feed.file_name.clone(),
        }),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DownloadReport {
    pub file_name: String,
    pub path: Option<PathBuf>,
    pub bytes: usize,
    pub error: Option<String>,
}

pub struct FeedDownloader<'a> {
    http: &'a HttpFetcher,
    feed_dir: PathBuf,
    token: Option<String>,
}

impl<'a> FeedDownloader<'a> {
    pub fn new(http: &'a HttpFetcher, feed_dir: impl Into<PathBuf>, token: Option<String>) -> Self {
        Self {
            http,
            feed_dir: feed_dir.into(),
            token,
        }
    }

    pub async fn download_all(&self, run_id: Uuid, feeds: &[&FeedConfig]) -> Vec<DownloadReport> {
        let mut reports = Vec::with_capacity(feeds.len());
        for feed in feeds {
            let Some(template) = feed.download_url.as_deref() else {
                continue;
            };
            let report = match self.download_one(run_id, feed, template).await {
                Ok((path, bytes)) => {
                    info!(file = %feed.file_name, bytes, "downloaded feed file");
                    DownloadReport {
                        file_name: feed.file_name.clone(),
                        path: Some(path),
                        bytes,
                        error: None,
                    }
                }
                Err(err) => {
                    warn!(file = %feed.file_name, error = %format!("{err:#}"), "feed download failed");
                    DownloadReport {
                        file_name: feed.file_name.clone(),
                        path: None,
                        bytes: 0,
                        error: Some(format!("{err:#}")),
                    }
                }
            };
            reports.push(report);
        }
        reports
    }

    async fn download_one(
        &self,
        run_id: Uuid,
        feed: &FeedConfig,
        template: &str,
    ) -> anyhow::Result<(PathBuf, usize)> {
        let url = resolve_download_url(feed, template, self.token.as_deref())?;
        let response = self
            .http
            .fetch_bytes(run_id, &feed.file_name, &url)
            .await
            .with_context(|| format!("fetching {}", feed.file_name))?;
        // An empty body would otherwise replace a good file and read as "no listings".
        if response.body.is_empty() {
            return Err(FeedError::EmptyDownload {
                file: feed.file_name.clone(),
            }
            .into());
        }
        let path = self.feed_dir.join(&feed.file_name);
        write_atomic(&path, &response.body).await?;
        Ok((path, response.body.len()))
    }
}

pub async fn prune_old_files(
    dir: &Path,
    max_age: Duration,
    now: DateTime<Utc>,
) -> anyhow::Result<Vec<PathBuf>> {
    let cutoff = now - chrono::Duration::from_std(max_age).context("retention out of range")?;
    let mut removed = Vec::new();
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(removed),
        Err(err) => return Err(err).with_context(|| format!("reading {}", dir.display())),
    };
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("listing {}", dir.display()))?
    {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("txt") {
            continue;
        }
        let modified = entry
            .metadata()
            .await
            .and_then(|m| m.modified())
            .with_context(|| format!("reading mtime of {}", path.display()))?;
        if DateTime::<Utc>::from(modified) < cutoff {
            fs::remove_file(&path)
                .await
                .with_context(|| format!("removing {}", path.display()))?;
            removed.push(path);
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const SAMPLE: &str = "LIST_NO|LIST_PRICE|STATUS|TOWN_NUM|LIST_AGENT_ID\n\
73000001|650000|ACT|Dracut|CN000001\n\
|999|ACT|Lowell|CN000002\n\
73000002|425000|NEW|Lowell|CN000003\n";

    #[test]
    fn parses_rows_and_promotes_mapped_fields() {
        let map = FieldMap::default();
        let rows = parse_feed(SAMPLE.as_bytes(), "idx_sf.txt", &map).unwrap();
        let records = rows.collect::<Vec<_>>();

        assert_eq!(records.len(), 2);
        let first = &records[0];
        assert_eq!(first.listing_key, "73000001");
        assert_eq!(first.field("ListPrice"), Some("650000"));
        assert_eq!(first.field("City"), Some("Dracut"));
        assert_eq!(first.field("StateOrProvince"), Some("MA"));
        assert_eq!(first.field("ListingID"), Some("73000001"));
        assert_eq!(first.raw["LIST_AGENT_ID"], "CN000001");
        assert_eq!(first.source_file, "idx_sf.txt");
    }

    #[test]
    fn rows_without_identifier_are_counted_not_raised() {
        let map = FieldMap::default();
        let mut rows = parse_feed(SAMPLE.as_bytes(), "idx_sf.txt", &map).unwrap();
        let keys = rows.by_ref().map(|r| r.listing_key).collect::<Vec<_>>();
        assert_eq!(keys, vec!["73000001", "73000002"]);
        assert_eq!(rows.dropped_rows(), 1);
        assert_eq!(rows.yielded_rows(), 2);
    }

    #[test]
    fn tolerates_bom_crlf_blank_lines_and_bad_bytes() {
        let mut bytes = b"\xEF\xBB\xBFLIST_NO|REMARKS|LIST_PRICE\r\n".to_vec();
        bytes.extend_from_slice(b"\r\n73000003|Caf\xE9 nearby|300000\r\n");
        let map = FieldMap::default();
        let records = parse_feed(&bytes, "idx_cc.txt", &map)
            .unwrap()
            .collect::<Vec<_>>();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].listing_key, "73000003");
        assert!(records[0].raw["REMARKS"].starts_with("Caf"));
        assert_eq!(records[0].field("ListPrice"), Some("300000"));
    }

    #[test]
    fn unknown_and_overflow_columns_are_kept_in_raw() {
        let text = "LIST_NO|NEW_VENDOR_FIELD\n73000004|x|overflow\n";
        let map = FieldMap::default();
        let records = parse_feed(text.as_bytes(), "idx_ld.txt", &map)
            .unwrap()
            .collect::<Vec<_>>();
        assert_eq!(records[0].raw["NEW_VENDOR_FIELD"], "x");
        assert_eq!(records[0].raw["_extra_0"], "overflow");
    }

    #[test]
    fn empty_file_or_missing_identifier_column_is_a_file_error() {
        let map = FieldMap::default();
        assert!(matches!(
            parse_feed(b"", "idx_mh.txt", &map),
            Err(FeedError::MissingHeader { .. })
        ));
        assert!(matches!(
            parse_feed(b"MLS_NUM|PRICE\n1|2\n", "idx_mh.txt", &map),
            Err(FeedError::MissingIdentifierColumn { .. })
        ));
    }

    #[test]
    fn registry_yaml_applies_defaults_and_orders_by_priority() {
        let yaml = r#"
feeds:
  - file_name: idx_mf.txt
    property_type: MF
    label: Multi Family
    priority: 2
  - file_name: idx_sf.txt
    property_type: SF
    label: Single Family
    priority: 1
  - file_name: idx_bu.txt
    property_type: BU
    label: Business
    priority: 5
    enabled: false
priority_agent_id: CN000001
"#;
        let registry = FeedRegistry::from_yaml(yaml).unwrap();
        let names = registry
            .enabled_feeds()
            .iter()
            .map(|f| f.file_name.as_str())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["idx_sf.txt", "idx_mf.txt"]);
        assert_eq!(registry.inactive_status, "SOLD");
        assert_eq!(registry.field_map.identifier_column, "LIST_NO");
        assert_eq!(registry.comparison_fields, default_comparison_fields());
        assert_eq!(registry.priority_agent_id.as_deref(), Some("CN000001"));
    }

    #[test]
    fn download_url_token_substitution() {
        let feed = FeedConfig {
            file_name: "idx_sf.txt".into(),
            property_type: "SF".into(),
            label: "Single Family".into(),
            priority: 1,
            enabled: true,
            download_url: None,
        };
        let template = "https://idx.example.com/idx.asp?user={token}&proptype=SF";
        assert_eq!(
            resolve_download_url(&feed, template, Some("abc")).unwrap(),
            "https://idx.example.com/idx.asp?user=abc&proptype=SF"
        );
        assert!(matches!(
            resolve_download_url(&feed, template, None),
            Err(FeedError::MissingToken { .. })
        ));
    }

    #[tokio::test]
    async fn prune_removes_only_stale_text_files() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("idx_sf.txt"), "x").unwrap();
        std::fs::write(dir.path().join("processed_files.json"), "{}").unwrap();

        let kept = prune_old_files(dir.path(), Duration::from_secs(3600), Utc::now())
            .await
            .unwrap();
        assert!(kept.is_empty());

        let later = Utc::now() + chrono::Duration::days(30);
        let removed = prune_old_files(dir.path(), Duration::from_secs(7 * 86_400), later)
            .await
            .unwrap();
        assert_eq!(removed.len(), 1);
        assert!(dir.path().join("processed_files.json").exists());
    }
}
