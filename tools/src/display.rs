//! Presentation-only money formatting. The core never sees decimals.

use songbid_core::types::MinorUnits;

/// Digits after the decimal point for an ISO 4217 code.
fn exponent(currency: &str) -> u32 {
    match currency {
        "JPY" | "KRW" | "VND" | "CLP" | "ISK" => 0,
        "BHD" | "KWD" | "OMR" | "JOD" | "TND" => 3,
        _ => 2,
    }
}

/// `format_minor_units(-1234, "USD")` → `"-12.34 USD"`.
pub fn format_minor_units(amount: MinorUnits, currency: &str) -> String {
    let exp = exponent(currency);
    let sign = if amount < 0 { "-" } else { "" };
    let abs = amount.unsigned_abs();
    if exp == 0 {
        return format!("{sign}{abs} {currency}");
    }
    let scale = 10u64.pow(exp);
    format!(
        "{sign}{}.{:0width$} {currency}",
        abs / scale,
        abs % scale,
        width = exp as usize
    )
}
