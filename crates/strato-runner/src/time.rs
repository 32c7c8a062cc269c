use crate::error::RunnerError;

/// Parse a duration like `10`, `10s`, `5m` or `2h` into seconds.
///
/// Only those four unit forms are valid; negatives, non-integers and any
/// other unit letter are rejected.
pub fn parse_time(spec: &str) -> Result<u64, RunnerError> {
    let digits_end = spec
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit())
        .map(|(i, _)| i)
        .unwrap_or(spec.len());
    let (digits, unit) = spec.split_at(digits_end);

    let count: u64 = digits
        .parse()
        .map_err(|_| RunnerError::InvalidTime(spec.to_string()))?;

    let multiplier = match unit {
        "" | "s" => 1,
        "m" => 60,
        "h" => 60 * 60,
        _ => return Err(RunnerError::InvalidTime(spec.to_string())),
    };

    Ok(count * multiplier)
}
