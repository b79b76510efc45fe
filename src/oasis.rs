//! OASIS treasury export renderer.
//!
//! Pure function from (ordered invoices, batch metadata) to the fixed-width
//! file: ASCII, 100 characters per record, `\r\n` separated with a trailing
//! `\r\n`, header / detail / footer layout. Equal inputs produce equal bytes
//! and an equal SHA-256; the renderer never touches storage.
//!
//! ```text
//! H  batch_code:20  MMDDYYYY  count:06  total:012  fund:5  version:10  38sp
//! D  vendor:10  invoice:15  MMDDYYYY  amount:012  fund:5  org:5  obj:4  desc:30  10sp
//! F  batch_code:20  count:06  total:012  61sp
//! ```

use crate::domain::ids::sha256_hex;
use crate::errors::{CoreError, CoreResult};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

pub const RECORD_LEN: usize = 100;
pub const FORMAT_VERSION: &str = "OASIS-1.0";
pub const CONTENT_TYPE: &str = "text/plain; charset=us-ascii";

/// Treasury coding defaults for this program.
pub const FUND_CODE: &str = "WVSNP";
pub const ORG_CODE: &str = "WVDA";
pub const OBJECT_CODE: &str = "5100";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OasisInvoice {
    pub invoice_id: String,
    pub clinic_id: String,
    pub oasis_vendor_code: String,
    /// Non-negative.
    pub amount_cents: i64,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchMetadata {
    pub batch_code: String,
    pub generation_date: NaiveDate,
    pub fund_code: String,
    pub org_code: String,
    pub object_code: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedFile {
    pub content: Vec<u8>,
    pub record_count: u32,
    pub control_total_cents: i64,
    pub sha256: String,
}

fn pad_right(value: &str, width: usize) -> String {
    let mut s: String = value.chars().take(width).collect();
    while s.len() < width {
        s.push(' ');
    }
    s
}

fn zero_pad(value: i64, width: usize) -> String {
    format!("{:0width$}", value, width = width)
}

fn mmddyyyy(date: NaiveDate) -> String {
    date.format("%m%d%Y").to_string()
}

fn check_line(line: &str) -> CoreResult<()> {
    if line.len() != RECORD_LEN {
        return Err(CoreError::BatchInvariant {
            detail: format!("record length {} != {}", line.len(), RECORD_LEN),
        });
    }
    if !line.is_ascii() {
        return Err(CoreError::BatchInvariant { detail: "non-ascii record".to_string() });
    }
    Ok(())
}

/// Render the batch file. Deterministic in its inputs; asserts the format
/// post-conditions before returning.
pub fn render_oasis_file(
    invoices: &[OasisInvoice],
    metadata: &BatchMetadata,
) -> CoreResult<RenderedFile> {
    let record_count = invoices.len() as i64;
    let mut control_total: i64 = 0;
    for invoice in invoices {
        if invoice.amount_cents < 0 {
            return Err(CoreError::BatchInvariant {
                detail: format!("negative amount on invoice {}", invoice.invoice_id),
            });
        }
        control_total =
            control_total.checked_add(invoice.amount_cents).ok_or_else(|| {
                CoreError::BatchInvariant { detail: "control total overflow".to_string() }
            })?;
    }

    let mut lines: Vec<String> = Vec::with_capacity(invoices.len() + 2);

    let header = format!(
        "H{}{}{}{}{}{}{}",
        pad_right(&metadata.batch_code, 20),
        mmddyyyy(metadata.generation_date),
        zero_pad(record_count, 6),
        zero_pad(control_total, 12),
        pad_right(&metadata.fund_code, 5),
        pad_right(FORMAT_VERSION, 10),
        " ".repeat(38),
    );
    lines.push(header);

    for invoice in invoices {
        let description = format!("WVSNP Reimbursement {}", invoice.period_start.format("%Y-%m-%d"));
        let detail = format!(
            "D{}{}{}{}{}{}{}{}{}",
            pad_right(&invoice.oasis_vendor_code, 10),
            pad_right(&invoice.invoice_id, 15),
            mmddyyyy(invoice.period_end),
            zero_pad(invoice.amount_cents, 12),
            pad_right(&metadata.fund_code, 5),
            pad_right(&metadata.org_code, 5),
            pad_right(&metadata.object_code, 4),
            pad_right(&description, 30),
            " ".repeat(10),
        );
        lines.push(detail);
    }

    let footer = format!(
        "F{}{}{}{}",
        pad_right(&metadata.batch_code, 20),
        zero_pad(record_count, 6),
        zero_pad(control_total, 12),
        " ".repeat(61),
    );
    lines.push(footer);

    let mut content = String::with_capacity(lines.len() * (RECORD_LEN + 2));
    for line in &lines {
        check_line(line)?;
        content.push_str(line);
        content.push_str("\r\n");
    }

    let bytes = content.into_bytes();
    let sha256 = sha256_hex(&bytes);
    Ok(RenderedFile {
        content: bytes,
        record_count: record_count as u32,
        control_total_cents: control_total,
        sha256,
    })
}
