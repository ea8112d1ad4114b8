// src/ingest/mod.rs
pub mod normalize;
pub mod providers;
pub mod scheduler;
pub mod types;

use metrics::{describe_counter, describe_gauge, describe_histogram};
use once_cell::sync::OnceCell;

/// One-time metrics registration (so series show up on /metrics).
pub(crate) fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("deal_cycles_total", "Completed fetch/dispatch cycles.");
        describe_counter!(
            "deal_cycle_errors_total",
            "Cycles aborted by fetch, store or panic errors."
        );
        describe_counter!("deal_fetched_total", "Raw entries returned by the feeds.");
        describe_counter!(
            "deal_source_errors_total",
            "Feed fetches that failed while the cycle went on, labelled by source."
        );
        describe_counter!(
            "deal_skipped_total",
            "Entries dropped by the normalizer as malformed."
        );
        describe_counter!("deal_new_total", "Deals classified as new by dedup.");
        describe_counter!(
            "deal_deliveries_total",
            "Per-subscriber delivery outcomes, labelled by result."
        );
        describe_counter!(
            "deal_subscribers_suspended_total",
            "Subscribers suspended after a permanent delivery failure."
        );
        describe_counter!(
            "deal_seen_pruned_total",
            "Seen ids removed by the retention policy."
        );
        describe_histogram!("deal_cycle_duration_ms", "Cycle wall time in milliseconds.");
        describe_histogram!("deal_feed_parse_ms", "Feed body parse time in milliseconds.");
        describe_gauge!(
            "deal_pipeline_last_run_ts",
            "Unix ts when the pipeline last finished a cycle."
        );
    });
}

/// Normalize feed text: decode entities, strip tags, collapse whitespace.
pub fn normalize_text(s: &str) -> String {
    // 1) HTML entity decode
    let mut out = html_escape::decode_html_entities(s).to_string();

    // 2) Strip HTML tags
    static RE_TAGS: OnceCell<regex::Regex> = OnceCell::new();
    let re_tags = RE_TAGS.get_or_init(|| regex::Regex::new(r"(?is)</?[^>]+>").unwrap());
    out = re_tags.replace_all(&out, "").to_string();

    // 3) Normalize “ ” ‘ ’ « » to ASCII quotes
    out = out
        .replace(['\u{201C}', '\u{201D}', '\u{00AB}', '\u{00BB}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'");

    // 4) Collapse whitespace (incl. the NBSP decoded from &nbsp;)
    static RE_WS: OnceCell<regex::Regex> = OnceCell::new();
    let re_ws = RE_WS.get_or_init(|| regex::Regex::new(r"[\s\u{00A0}]+").unwrap());
    out = re_ws.replace_all(&out, " ").to_string();
    out = out.trim().to_string();

    // 5) Length cap: Telegram messages max out at 4096 chars, titles stay well below
    if out.chars().count() > 512 {
        out = out.chars().take(512).collect();
    }

    out
}
