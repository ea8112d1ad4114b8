//! Notification text for a deal (Telegram HTML parse mode).

use html_escape::{encode_double_quoted_attribute, encode_text};

use crate::ingest::types::Deal;

pub fn format_deal(deal: &Deal) -> String {
    let mut out = format!("<b>{}</b>\n", encode_text(&deal.title));
    if let Some(price) = &deal.price {
        out.push_str(&format!("💶 {}\n", encode_text(price)));
    }
    if let Some(merchant) = &deal.merchant {
        out.push_str(&format!("🏬 {}\n", encode_text(merchant)));
    }
    out.push_str(&format!(
        "<a href=\"{}\">{}</a>",
        encode_double_quoted_attribute(&deal.url),
        encode_text(&deal.url)
    ));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deal() -> Deal {
        Deal {
            id: "https://mydealz.de/deal/123".into(),
            title: "Laptop -50%".into(),
            price: Some("299€".into()),
            merchant: None,
            url: "https://mydealz.de/deal/123".into(),
            published_at: None,
        }
    }

    #[test]
    fn contains_title_price_and_link() {
        let text = format_deal(&deal());
        assert!(text.contains("Laptop -50%"));
        assert!(text.contains("299€"));
        assert!(text.contains("https://mydealz.de/deal/123"));
        assert!(!text.contains("🏬"));
    }

    #[test]
    fn markup_in_feed_text_is_escaped() {
        let mut d = deal();
        d.title = "<script>x</script> & more".into();
        d.merchant = Some("A&B".into());
        let text = format_deal(&d);
        assert!(text.contains("&lt;script&gt;x&lt;/script&gt; &amp; more"));
        assert!(text.contains("🏬 A&amp;B"));
    }
}
