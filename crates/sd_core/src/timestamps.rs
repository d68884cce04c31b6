use time::format_description::well_known::Rfc3339;
use time::{format_description, OffsetDateTime, PrimitiveDateTime, UtcOffset};

use crate::domain::ValidationWarning;
use crate::error::AppError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedTimestamp {
    /// Canonical RFC3339 UTC string, if deterministically parseable.
    pub canonical_rfc3339_utc: Option<String>,
    /// Raw input preserved for non-RFC3339 (or unparseable) inputs.
    pub raw: Option<String>,
}

/// Canonical storage form: UTC, whole seconds, `Z` suffix. Stored values compare
/// lexicographically in time order.
pub fn format_utc(dt: OffsetDateTime) -> Result<String, AppError> {
    let utc = dt.to_offset(UtcOffset::UTC);
    let utc = utc.replace_nanosecond(0).unwrap_or(utc);
    utc.format(&Rfc3339).map_err(|e| {
        AppError::new("TIME_FORMAT_FAILED", "Failed to format timestamp").with_details(e.to_string())
    })
}

pub fn parse_utc(field: &str, s: &str) -> Result<OffsetDateTime, AppError> {
    OffsetDateTime::parse(s.trim(), &Rfc3339).map_err(|e| {
        AppError::new("TIME_PARSE_FAILED", format!("Failed to parse {field}"))
            .with_details(format!("value={s}; err={e}"))
    })
}

fn parse_primitive_assume_utc(
    raw: &str,
    fmt: &str,
    field: &str,
    warnings: &mut Vec<ValidationWarning>,
) -> Option<String> {
    let items = match format_description::parse(fmt) {
        Ok(i) => i,
        Err(e) => {
            warnings.push(
                ValidationWarning::new(
                    "TS_FORMAT_CONFIG_FAILED",
                    format!("Timestamp format config error for {field}"),
                )
                .with_details(format!("fmt={fmt}; err={e}")),
            );
            return None;
        }
    };

    let pdt = PrimitiveDateTime::parse(raw, &items).ok()?;

    warnings.push(
        ValidationWarning::new("TS_TZ_ASSUMED_UTC", format!("Assumed UTC timezone for {field}"))
            .with_details(format!("value={raw}; fmt={fmt}")),
    );

    format_utc(pdt.assume_utc()).ok()
}

/// Normalize a provider-supplied timestamp into canonical RFC3339 UTC.
///
/// - RFC3339 input (any offset) is converted to UTC; `raw` stays `None`.
/// - Zone-less ISO-like input is accepted from a fixed allowlist, assumed UTC, and
///   reported with a warning; `raw` keeps the original.
/// - Anything else yields `canonical_rfc3339_utc = None` with the raw input preserved
///   and a warning. Callers decide whether that makes the record invalid.
pub fn normalize_timestamp(
    field: &str,
    raw_input: &str,
    warnings: &mut Vec<ValidationWarning>,
) -> NormalizedTimestamp {
    let trimmed = raw_input.trim();
    if trimmed.is_empty() {
        return NormalizedTimestamp {
            canonical_rfc3339_utc: None,
            raw: None,
        };
    }

    if let Ok(dt) = OffsetDateTime::parse(trimmed, &Rfc3339) {
        return NormalizedTimestamp {
            canonical_rfc3339_utc: format_utc(dt).ok(),
            raw: None,
        };
    }

    for fmt in [
        "[year]-[month]-[day]T[hour]:[minute]:[second]",
        "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond]",
        "[year]-[month]-[day] [hour]:[minute]:[second]",
    ] {
        if let Some(canon) = parse_primitive_assume_utc(trimmed, fmt, field, warnings) {
            return NormalizedTimestamp {
                canonical_rfc3339_utc: Some(canon),
                raw: Some(trimmed.to_string()),
            };
        }
    }

    warnings.push(
        ValidationWarning::new("TS_UNPARSEABLE", format!("Unparseable timestamp for {field}"))
            .with_details(format!("raw={trimmed}")),
    );

    NormalizedTimestamp {
        canonical_rfc3339_utc: None,
        raw: Some(trimmed.to_string()),
    }
}
