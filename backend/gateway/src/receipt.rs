//! Donation receipts and their two delivery documents: a paginated printable
//! text document and a print-formatted HTML page.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::fees::{format_cedis, PaymentMethod};
use crate::network::Network;

/// Lines per page of the printable document.
pub const PAGE_HEIGHT_LINES: usize = 60;

const LINE_WIDTH: usize = 48;

/// Issued once the payment is confirmed and the guest donation is recorded.
/// Never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReceiptRecord {
    pub receipt_number: String,
    pub campaign_slug: String,
    pub donor_name: String,
    pub amount: Decimal,
    pub fee_amount: Decimal,
    pub total_amount: Decimal,
    pub payment_method: PaymentMethod,
    pub network: Option<Network>,
    pub timestamp: DateTime<Utc>,
    pub transaction_id: Option<String>,
    pub reference_no: Option<String>,
}

/// `MED-20250124-1A2B3C4D`: issue date plus a random suffix.
pub fn new_receipt_number(now: DateTime<Utc>) -> String {
    let suffix = Uuid::new_v4().simple().to_string()[..8].to_uppercase();
    format!("MED-{}-{suffix}", now.format("%Y%m%d"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReceiptFormat {
    #[default]
    Json,
    Text,
    Html,
    DataUrl,
}

/// A document split into fixed-height pages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PagedDocument {
    pub pages: Vec<Vec<String>>,
}

impl PagedDocument {
    /// Split `lines` into pages of `page_height` lines. Content that does not
    /// fit one page continues on as many further pages as needed.
    pub fn paginate(lines: Vec<String>, page_height: usize) -> Self {
        let page_height = page_height.max(1);
        let pages = if lines.is_empty() {
            vec![Vec::new()]
        } else {
            lines.chunks(page_height).map(<[String]>::to_vec).collect()
        };
        Self { pages }
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Render with a page footer; pages are separated by form feeds.
    pub fn to_text(&self) -> String {
        let total = self.page_count();
        self.pages
            .iter()
            .enumerate()
            .map(|(i, page)| {
                let mut out = page.join("\n");
                out.push_str(&format!("\n\n{:>width$}", format!("Page {} of {total}", i + 1), width = LINE_WIDTH));
                out
            })
            .collect::<Vec<_>>()
            .join("\n\x0c\n")
    }
}

fn rule() -> String {
    "-".repeat(LINE_WIDTH)
}

fn row(label: &str, value: &str) -> String {
    let pad = LINE_WIDTH.saturating_sub(label.chars().count() + value.chars().count()).max(1);
    format!("{label}{}{value}", " ".repeat(pad))
}

/// Body lines of the printable receipt.
pub fn receipt_lines(receipt: &ReceiptRecord) -> Vec<String> {
    let mut lines = vec![
        format!("{:^LINE_WIDTH$}", "MyEasyDonate"),
        format!("{:^LINE_WIDTH$}", "Donation Receipt"),
        rule(),
        row("Receipt No.", &receipt.receipt_number),
        row("Date", &receipt.timestamp.format("%Y-%m-%d %H:%M UTC").to_string()),
        row("Campaign", &receipt.campaign_slug),
        row("Donor", &receipt.donor_name),
        rule(),
        row("Donation", &format_cedis(receipt.amount)),
        row("Service fee", &format_cedis(receipt.fee_amount)),
        row("Total paid", &format_cedis(receipt.total_amount)),
        rule(),
        row("Payment method", receipt.payment_method.label()),
    ];
    if let Some(network) = receipt.network.filter(Network::is_known) {
        lines.push(row("Network", network.as_str()));
    }
    if let Some(tx) = &receipt.transaction_id {
        lines.push(row("Transaction ID", tx));
    }
    if let Some(reference) = &receipt.reference_no {
        lines.push(row("Reference", reference));
    }
    lines.push(rule());
    lines.push(format!("{:^LINE_WIDTH$}", "Thank you for your donation!"));
    lines
}

pub fn render_document(receipt: &ReceiptRecord, page_height: usize) -> PagedDocument {
    PagedDocument::paginate(receipt_lines(receipt), page_height)
}

fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Print-formatted page; the browser's print dialog opens on load.
pub fn render_html(receipt: &ReceiptRecord) -> String {
    let mut rows = vec![
        ("Receipt No.", receipt.receipt_number.clone()),
        ("Date", receipt.timestamp.format("%Y-%m-%d %H:%M UTC").to_string()),
        ("Campaign", receipt.campaign_slug.clone()),
        ("Donor", receipt.donor_name.clone()),
        ("Donation", format_cedis(receipt.amount)),
        ("Service fee", format_cedis(receipt.fee_amount)),
        ("Total paid", format_cedis(receipt.total_amount)),
        ("Payment method", receipt.payment_method.label().to_string()),
    ];
    if let Some(network) = receipt.network.filter(Network::is_known) {
        rows.push(("Network", network.as_str().to_string()));
    }
    if let Some(tx) = &receipt.transaction_id {
        rows.push(("Transaction ID", tx.clone()));
    }
    if let Some(reference) = &receipt.reference_no {
        rows.push(("Reference", reference.clone()));
    }

    let table: String = rows
        .iter()
        .map(|(label, value)| {
            format!(
                "<tr><th>{}</th><td>{}</td></tr>",
                escape_html(label),
                escape_html(value)
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<title>Receipt {number}</title>
<style>
body {{ font-family: sans-serif; max-width: 480px; margin: 2em auto; }}
h1 {{ text-align: center; font-size: 1.4em; }}
table {{ width: 100%; border-collapse: collapse; }}
th {{ text-align: left; font-weight: normal; color: #555; }}
td {{ text-align: right; }}
th, td {{ padding: 6px 0; border-bottom: 1px solid #eee; }}
@media print {{ @page {{ size: A4; margin: 20mm; }} }}
</style>
</head>
<body onload="window.print()">
<h1>MyEasyDonate Donation Receipt</h1>
<table>
{table}
</table>
<p style="text-align:center">Thank you for your donation!</p>
</body>
</html>
"#,
        number = escape_html(&receipt.receipt_number),
    )
}

/// `data:` link for downloading the HTML receipt without a second request.
pub fn html_data_url(receipt: &ReceiptRecord) -> String {
    format!(
        "data:text/html;base64,{}",
        STANDARD.encode(render_html(receipt))
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn sample() -> ReceiptRecord {
        ReceiptRecord {
            receipt_number: "MED-20250124-ABCDEF01".to_string(),
            campaign_slug: "clean-water".to_string(),
            donor_name: "Ama <Mensah>".to_string(),
            amount: dec!(100),
            fee_amount: dec!(2.5),
            total_amount: dec!(102.5),
            payment_method: PaymentMethod::Momo,
            network: Some(Network::Mtn),
            timestamp: Utc.with_ymd_and_hms(2025, 1, 24, 10, 0, 0).unwrap(),
            transaction_id: Some("TX-1".to_string()),
            reference_no: Some("REF-1".to_string()),
        }
    }

    #[test]
    fn receipt_number_carries_issue_date() {
        let now = Utc.with_ymd_and_hms(2025, 1, 24, 10, 0, 0).unwrap();
        let a = new_receipt_number(now);
        let b = new_receipt_number(now);
        assert!(a.starts_with("MED-20250124-"));
        assert_eq!(a.len(), "MED-20250124-".len() + 8);
        assert_ne!(a, b);
    }

    #[test]
    fn short_receipt_fits_one_page() {
        let doc = render_document(&sample(), PAGE_HEIGHT_LINES);
        assert_eq!(doc.page_count(), 1);
        let text = doc.to_text();
        assert!(text.contains("Total paid"));
        assert!(text.contains("₵102.50"));
        assert!(text.contains("Page 1 of 1"));
        assert!(!text.contains('\x0c'));
    }

    #[test]
    fn long_content_spans_multiple_pages() {
        let lines = receipt_lines(&sample());
        let n = lines.len();
        let doc = PagedDocument::paginate(lines, 5);
        assert_eq!(doc.page_count(), n.div_ceil(5));
        assert!(doc.pages.iter().all(|p| p.len() <= 5));
        let text = doc.to_text();
        assert_eq!(text.matches('\x0c').count(), doc.page_count() - 1);
        assert!(text.contains(&format!("Page {0} of {0}", doc.page_count())));
    }

    #[test]
    fn empty_document_has_one_page() {
        assert_eq!(PagedDocument::paginate(Vec::new(), 10).page_count(), 1);
    }

    #[test]
    fn html_escapes_donor_name() {
        let html = render_html(&sample());
        assert!(html.contains("Ama &lt;Mensah&gt;"));
        assert!(html.contains("window.print()"));
        assert!(html.contains("MTN"));
    }

    #[test]
    fn unknown_network_is_omitted() {
        let mut receipt = sample();
        receipt.network = Some(Network::Unknown);
        assert!(!receipt_lines(&receipt).iter().any(|l| l.starts_with("Network")));
    }

    #[test]
    fn data_url_decodes_to_html() {
        let url = html_data_url(&sample());
        let encoded = url.strip_prefix("data:text/html;base64,").unwrap();
        let decoded = String::from_utf8(STANDARD.decode(encoded).unwrap()).unwrap();
        assert_eq!(decoded, render_html(&sample()));
    }
}
