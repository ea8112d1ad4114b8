// src/ingest/normalize.rs
//! Deal normalizer: raw feed entry -> canonical `Deal` with a stable id.
//!
//! The id is the canonical URL, except on Pepper sites where it is the host plus
//! the numeric thread id (their links embed a slug of the editable title). Two
//! fetches of the same deal must produce the same id even when the feed
//! decorates links with tracking parameters or the title/price were edited in
//! between.

use once_cell::sync::OnceCell;
use thiserror::Error;
use url::Url;

use crate::ingest::normalize_text;
use crate::ingest::types::{Deal, RawEntry};

/// Query parameters that never contribute to deal identity.
const TRACKING_PARAMS: &[&str] = &[
    "ref",
    "referrer",
    "source",
    "campaign",
    "fbclid",
    "gclid",
    "mc_cid",
    "mc_eid",
    "cmpid",
];

/// Pepper-platform sites, without `www.`.
const PEPPER_HOSTS: &[&str] = &[
    "mydealz.de",
    "preisjaeger.at",
    "hotukdeals.com",
    "dealabs.com",
    "pepper.pl",
    "pepper.it",
    "chollometro.com",
    "nl.pepper.com",
];

/// First path segment of a Pepper deal page.
const PEPPER_DEAL_SECTIONS: &[&str] = &["deals", "bons-plans", "ofertas", "promocje", "offerte"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SkipReason {
    #[error("malformed entry: {0}")]
    Malformed(&'static str),
}

fn is_tracking_param(key: &str) -> bool {
    let k = key.to_ascii_lowercase();
    k.starts_with("utm_") || TRACKING_PARAMS.contains(&k.as_str())
}

/// Canonical form of a deal link, or `None` when it is not an absolute http(s) URL.
pub fn canonical_url(raw: &str) -> Option<String> {
    let mut url = Url::parse(raw.trim()).ok()?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return None;
    }

    url.set_fragment(None);

    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !is_tracking_param(k))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if kept.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(kept);
    }

    let path = url.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        url.set_path(path.trim_end_matches('/'));
    }

    let mut out = url.to_string();
    // `Url` renders an empty root path as "/"; drop it so "a.de" and "a.de/" agree.
    if url.path() == "/" && url.query().is_none() && out.ends_with('/') {
        out.pop();
    }
    Some(out)
}

fn pepper_host(url: &Url) -> Option<String> {
    let host = url.host_str()?.to_ascii_lowercase();
    let bare = host.strip_prefix("www.").unwrap_or(&host);
    PEPPER_HOSTS.contains(&bare).then(|| bare.to_string())
}

/// `/deals/<slug>-2400003` or `/deals/2400003` -> `2400003`.
fn pepper_thread_id(url: &Url) -> Option<String> {
    let mut segments = url.path_segments()?.filter(|s| !s.is_empty());
    let section = segments.next()?;
    let page = segments.next()?;
    if segments.next().is_some() || !PEPPER_DEAL_SECTIONS.contains(&section) {
        return None;
    }
    let tail = page.rsplit('-').next()?;
    is_numeric(tail).then(|| tail.to_string())
}

/// Pepper guids are either the bare thread id or a deal link.
fn guid_thread_id(guid: &str) -> Option<String> {
    let g = guid.trim();
    if is_numeric(g) {
        return Some(g.to_string());
    }
    Url::parse(g).ok().as_ref().and_then(pepper_thread_id)
}

fn is_numeric(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

/// Stable deal identifier.
///
/// Pepper deals are keyed on host and thread id (taken from the link, else from
/// the feed guid), so a retitled deal keeps its id. Everything else uses the
/// canonical URL.
pub fn deal_id(raw_url: &str, guid: Option<&str>) -> Option<String> {
    let canonical = canonical_url(raw_url)?;
    let url = Url::parse(&canonical).ok()?;
    if let Some(host) = pepper_host(&url) {
        let thread = pepper_thread_id(&url).or_else(|| guid.and_then(guid_thread_id));
        if let Some(thread) = thread {
            return Some(format!("https://{host}/deals/{thread}"));
        }
    }
    Some(canonical)
}

/// First "<amount>€" (or "€<amount>") found in free text, e.g. a deal title.
pub fn extract_price(text: &str) -> Option<String> {
    static RE_PRICE: OnceCell<regex::Regex> = OnceCell::new();
    let re = RE_PRICE.get_or_init(|| {
        regex::Regex::new(r"(?:(\d{1,3}(?:[.\s]\d{3})*(?:,\d{1,2})?|\d+(?:[.,]\d{1,2})?)\s?€)|(?:€\s?(\d+(?:[.,]\d{1,2})?))")
            .unwrap()
    });
    let caps = re.captures(text)?;
    let amount = caps.get(1).or_else(|| caps.get(2))?.as_str();
    Some(format!("{}€", amount.replace(' ', "")))
}

fn clean_opt(s: Option<&str>) -> Option<String> {
    s.map(normalize_text).filter(|t| !t.is_empty())
}

/// Normalize one raw entry. Entries without title or usable URL are skipped.
pub fn normalize(entry: &RawEntry) -> Result<Deal, SkipReason> {
    let title = clean_opt(entry.title.as_deref()).ok_or(SkipReason::Malformed("missing title"))?;
    let raw_url = entry
        .url
        .as_deref()
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .ok_or(SkipReason::Malformed("missing url"))?;
    let url = canonical_url(raw_url).ok_or(SkipReason::Malformed("unparsable url"))?;
    let id = deal_id(&url, entry.guid.as_deref()).unwrap_or_else(|| url.clone());

    let price = clean_opt(entry.price.as_deref()).or_else(|| extract_price(&title));

    Ok(Deal {
        id,
        url,
        title,
        price,
        merchant: clean_opt(entry.merchant.as_deref()),
        published_at: entry.published_at,
    })
}

/// Normalize a fetched batch, keeping feed order. Returns (deals, skipped_count).
pub fn normalize_batch(entries: &[RawEntry]) -> (Vec<Deal>, usize) {
    let mut skipped = 0usize;
    let mut out = Vec::with_capacity(entries.len());
    for entry in entries {
        match normalize(entry) {
            Ok(deal) => out.push(deal),
            Err(reason) => {
                skipped += 1;
                tracing::debug!(target: "ingest", %reason, title = ?entry.title, "entry skipped");
            }
        }
    }
    (out, skipped)
}
