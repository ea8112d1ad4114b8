// src/ingest/providers/pepper_rss.rs
//! RSS provider for Pepper-platform deal sites (mydealz.de, preisjaeger.at, ...).
//! All of them publish the same RSS dialect with a `pepper:merchant` element.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::histogram;
use quick_xml::de::from_str;
use reqwest::StatusCode;
use serde::Deserialize;
use time::{format_description::well_known::Rfc2822, OffsetDateTime};

use crate::ingest::types::{FeedSource, FetchError, RawEntry};

const USER_AGENT: &str = concat!("deal-notifier/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Deserialize)]
struct Rss {
    channel: Channel,
}

#[derive(Debug, Deserialize)]
struct Channel {
    #[serde(rename = "item", default)]
    item: Vec<Item>,
}

#[derive(Debug, Deserialize)]
struct Item {
    title: Option<String>,
    link: Option<String>,
    guid: Option<Guid>,
    #[serde(rename = "pubDate")]
    pub_date: Option<String>,
    // Pepper items may carry several categories.
    #[serde(default)]
    category: Vec<String>,
    #[serde(rename = "pepper:merchant", alias = "merchant")]
    merchant: Option<Merchant>,
}

/// `<guid isPermaLink="false">2400003</guid>`
#[derive(Debug, Deserialize)]
struct Guid {
    #[serde(rename = "$text")]
    value: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Merchant {
    #[serde(rename = "@name")]
    name: Option<String>,
    #[serde(rename = "@price")]
    price: Option<String>,
}

fn parse_rfc2822(ts: &str) -> Option<DateTime<Utc>> {
    OffsetDateTime::parse(ts.trim(), &Rfc2822)
        .ok()
        .and_then(|dt| DateTime::from_timestamp(dt.unix_timestamp(), 0))
}

pub struct PepperRssProvider {
    name: String,
    mode: Mode,
}

enum Mode {
    // Own copy so tests can hand in any &str.
    Fixture(String),
    Http { url: String, client: reqwest::Client },
}

impl PepperRssProvider {
    pub fn from_fixture(name: impl Into<String>, xml: &str) -> Self {
        Self {
            name: name.into(),
            mode: Mode::Fixture(xml.to_string()),
        }
    }

    pub fn from_url(
        name: impl Into<String>,
        url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(timeout.min(Duration::from_secs(5)))
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::Permanent(format!("building http client: {e}")))?;
        Ok(Self {
            name: name.into(),
            mode: Mode::Http {
                url: url.into(),
                client,
            },
        })
    }

    pub fn parse_items_from_str(s: &str) -> Result<Vec<RawEntry>, FetchError> {
        let t0 = std::time::Instant::now();
        let xml_clean = scrub_html_entities_for_xml(s);
        let rss: Rss =
            from_str(&xml_clean).map_err(|e| FetchError::Permanent(format!("parsing rss xml: {e}")))?;

        let out: Vec<RawEntry> = rss
            .channel
            .item
            .into_iter()
            .map(|it| {
                let (merchant, price) = match it.merchant {
                    Some(m) => (m.name, m.price),
                    None => (None, None),
                };
                RawEntry {
                    title: it.title,
                    url: it.link,
                    guid: it.guid.and_then(|g| g.value),
                    price,
                    merchant,
                    category: it.category.into_iter().next(),
                    published_at: it.pub_date.as_deref().and_then(parse_rfc2822),
                }
            })
            .collect();

        let ms = t0.elapsed().as_secs_f64() * 1_000.0;
        histogram!("deal_feed_parse_ms").record(ms);
        Ok(out)
    }

    async fn fetch_http(client: &reqwest::Client, url: &str) -> Result<String, FetchError> {
        let resp = client.get(url).send().await.map_err(|e| {
            // Anything that fails before a status line is network trouble.
            FetchError::Transient(format!("GET {url}: {e}"))
        })?;

        let status = resp.status();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(FetchError::Transient(format!("GET {url}: HTTP {status}")));
        }
        if !status.is_success() {
            return Err(FetchError::Permanent(format!("GET {url}: HTTP {status}")));
        }

        resp.text()
            .await
            .map_err(|e| FetchError::Transient(format!("reading body of {url}: {e}")))
    }
}

#[async_trait]
impl FeedSource for PepperRssProvider {
    async fn fetch_latest(&self) -> Result<Vec<RawEntry>, FetchError> {
        match &self.mode {
            Mode::Fixture(s) => Self::parse_items_from_str(s),
            Mode::Http { url, client } => {
                let body = Self::fetch_http(client, url).await?;
                Self::parse_items_from_str(&body)
            }
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// RSS bodies sometimes carry HTML entities that XML does not define.
fn scrub_html_entities_for_xml(s: &str) -> String {
    s.replace("&nbsp;", " ")
        .replace("&ndash;", "-")
        .replace("&mdash;", "-")
        .replace("&euro;", "€")
        .replace("&ldquo;", "\"")
        .replace("&rdquo;", "\"")
        .replace("&bdquo;", "\"")
        .replace("&lsquo;", "'")
        .replace("&rsquo;", "'")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rfc2822_dates_convert_to_utc() {
        let dt = parse_rfc2822("Mon, 19 Oct 2026 12:00:00 +0200").unwrap();
        assert_eq!(dt.to_rfc3339(), "2026-10-19T10:00:00+00:00");
        assert!(parse_rfc2822("yesterday").is_none());
    }

    #[test]
    fn scrub_replaces_html_only_entities() {
        assert_eq!(
            scrub_html_entities_for_xml("a&nbsp;b &euro; &amp;"),
            "a b € &amp;"
        );
    }

    #[test]
    fn empty_channel_is_valid() {
        let xml = r#"<rss version="2.0"><channel><title>x</title></channel></rss>"#;
        let items = PepperRssProvider::parse_items_from_str(xml).unwrap();
        assert!(items.is_empty());
    }

    #[test]
    fn repeated_categories_keep_the_item() {
        let xml = r#"<rss version="2.0" xmlns:pepper="http://www.pepper.com/rss"><channel>
            <item>
              <title>Kopfhörer</title>
              <link>https://www.mydealz.de/deals/kopfhoerer-2400010</link>
              <category>Elektronik</category>
              <pepper:merchant name="Otto" price="99€"/>
              <category>Audio</category>
            </item>
            <item>
              <title>Zelt</title>
              <link>https://www.mydealz.de/deals/zelt-2400011</link>
            </item>
          </channel></rss>"#;
        let items = PepperRssProvider::parse_items_from_str(xml).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].category.as_deref(), Some("Elektronik"));
        assert_eq!(items[0].merchant.as_deref(), Some("Otto"));
        assert!(items[1].category.is_none());
    }

    #[test]
    fn garbage_is_permanent() {
        let err = PepperRssProvider::parse_items_from_str("<html>oops").unwrap_err();
        assert!(!err.is_transient());
    }
}
