//! Numeric formatting in the firmware's canonical form

/// Strip a numeric string down to the form the firmware echoes.
///
/// Surrounding spaces go first, then trailing zeros after a decimal point,
/// then leading zeros and a bare trailing decimal point. `"004.610"`
/// becomes `"4.61"`, `"0.50"` becomes `".5"`, and `"0"` becomes `""`.
pub fn canonicalize(s: &str) -> String {
    let s = s.trim_matches(' ');
    let s = if s.contains('.') {
        s.trim_end_matches('0')
    } else {
        s
    };
    let s = s.trim_start_matches('0');
    s.strip_suffix('.').unwrap_or(s).to_string()
}

/// Render a number for the wire. Zero is sent as `0` rather than an empty field.
pub fn format_number(value: f64) -> String {
    let s = canonicalize(&value.to_string());
    if s.is_empty() {
        "0".to_string()
    } else {
        s
    }
}

/// Parse a number the pump reported, e.g. `"   4.6100"` or `".5"`
pub fn parse_number(s: &str) -> Option<f64> {
    s.trim().parse::<f64>().ok()
}

/// Round to three decimal places
pub fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonicalize_examples() {
        assert_eq!(canonicalize("004.610"), "4.61");
        assert_eq!(canonicalize("120.0"), "120");
        assert_eq!(canonicalize("120"), "120");
        assert_eq!(canonicalize("100"), "100");
        assert_eq!(canonicalize(" 1.5 "), "1.5");
        assert_eq!(canonicalize("0.50"), ".5");
        assert_eq!(canonicalize("0"), "");
        assert_eq!(canonicalize("1.0 "), "1");
        assert_eq!(canonicalize("4.610 "), "4.61");
        assert_eq!(canonicalize("100."), "100");
    }

    #[test]
    fn test_canonicalize_idempotent() {
        for s in [
            "004.610", "0", "120.000", "  7.", "0.001", "10", "3.14159", ".5", "", "00", "1.0 ",
            "4.610 ", " 0.50  ", "100. ", "10.0",
        ] {
            let once = canonicalize(s);
            assert_eq!(canonicalize(&once), once, "input {:?}", s);
        }
    }

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(4.61), "4.61");
        assert_eq!(format_number(120.0), "120");
        assert_eq!(format_number(0.1), ".1");
        assert_eq!(format_number(1000.0), "1000");
        assert_eq!(format_number(0.0), "0");
    }

    #[test]
    fn test_parse_number() {
        assert_eq!(parse_number("   4.6100"), Some(4.61));
        assert_eq!(parse_number(".5"), Some(0.5));
        assert_eq!(parse_number("0.0000"), Some(0.0));
        assert_eq!(parse_number("ul/m"), None);
        assert_eq!(parse_number(""), None);
    }

    #[test]
    fn test_round3() {
        assert_eq!(round3(4.6104), 4.61);
        assert_eq!(round3(0.12345), 0.123);
    }
}
