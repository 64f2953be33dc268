use std::fmt;

/// A console value.
///
/// The operand stack holds these directly; coercion opcodes (`STR_TO_UINT`,
/// `FLT_TO_STR`, ...) convert the top of the stack between representations.
#[derive(Clone, PartialEq)]
pub enum Value {
    Uint(u32),
    Float(f64),
    Str(String),
}

impl Default for Value {
    fn default() -> Self {
        Value::Str(String::new())
    }
}

impl Value {
    pub fn empty() -> Self {
        Value::Str(String::new())
    }

    pub fn is_str(&self) -> bool {
        matches!(self, Value::Str(_))
    }

    /// Integer view: floats truncate toward zero, strings parse their leading
    /// integer (`"true"`/`"false"` are 1/0).
    pub fn to_uint(&self) -> u32 {
        match self {
            Value::Uint(n) => *n,
            Value::Float(f) => float_to_uint(*f),
            Value::Str(s) => str_to_int(s) as u32,
        }
    }

    pub fn to_float(&self) -> f64 {
        match self {
            Value::Uint(n) => *n as i32 as f64,
            Value::Float(f) => *f,
            Value::Str(s) => string_to_number(s),
        }
    }

    pub fn to_bool(&self) -> bool {
        match self {
            Value::Uint(n) => *n != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => s.eq_ignore_ascii_case("true") || string_to_number(s) != 0.0,
        }
    }

    /// Render as console text.
    pub fn to_console_string(&self) -> String {
        match self {
            Value::Uint(n) => (*n as i32).to_string(),
            Value::Float(f) => format_float(*f),
            Value::Str(s) => s.clone(),
        }
    }

    /// Consume into console text without copying strings.
    pub fn into_console_string(self) -> String {
        match self {
            Value::Str(s) => s,
            other => other.to_console_string(),
        }
    }

    /// Name of the representation, for traces.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Uint(_) => "uint",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Uint(b as u32)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Uint(n) => write!(f, "Uint({})", n),
            Value::Float(n) => write!(f, "Float({})", n),
            Value::Str(s) => write!(f, "Str({:?})", s),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Str(s) => f.write_str(s),
            other => f.write_str(&other.to_console_string()),
        }
    }
}

fn float_to_uint(f: f64) -> u32 {
    f as i32 as u32
}

/// Numeric value of a console string: `true`/`false` are 1/0, otherwise the
/// longest numeric prefix (0 when there is none).
pub fn string_to_number(s: &str) -> f64 {
    let trimmed = s.trim_start();
    if trimmed.eq_ignore_ascii_case("true") {
        return 1.0;
    }
    if trimmed.eq_ignore_ascii_case("false") {
        return 0.0;
    }
    if let Some(hex) = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        return parse_hex_prefix(hex) as f64;
    }
    let end = float_prefix_len(trimmed.as_bytes());
    trimmed[..end].parse::<f64>().unwrap_or(0.0)
}

fn str_to_int(s: &str) -> i32 {
    let trimmed = s.trim_start();
    if trimmed.eq_ignore_ascii_case("true") {
        return 1;
    }
    if trimmed.eq_ignore_ascii_case("false") {
        return 0;
    }
    if let Some(hex) = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        return parse_hex_prefix(hex) as i32;
    }
    let bytes = trimmed.as_bytes();
    let mut end = 0;
    if matches!(bytes.first(), Some(b'-') | Some(b'+')) {
        end = 1;
    }
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }
    trimmed[..end]
        .parse::<i64>()
        .map(|v| v as i32)
        .unwrap_or(0)
}

fn parse_hex_prefix(s: &str) -> u32 {
    let digits: String = s.chars().take_while(|c| c.is_ascii_hexdigit()).collect();
    u32::from_str_radix(&digits, 16).unwrap_or(0)
}

/// Length of the longest prefix of `bytes` that parses as a float.
fn float_prefix_len(bytes: &[u8]) -> usize {
    let mut i = 0;
    if matches!(bytes.first(), Some(b'-') | Some(b'+')) {
        i = 1;
    }
    let digits_start = i;
    while i < bytes.len() && bytes[i].is_ascii_digit() {
        i += 1;
    }
    let mut mantissa_digits = i - digits_start;
    if i < bytes.len() && bytes[i] == b'.' {
        let frac_start = i + 1;
        let mut j = frac_start;
        while j < bytes.len() && bytes[j].is_ascii_digit() {
            j += 1;
        }
        mantissa_digits += j - frac_start;
        if mantissa_digits > 0 {
            i = j;
        }
    }
    if mantissa_digits == 0 {
        return 0;
    }
    if i < bytes.len() && (bytes[i] == b'e' || bytes[i] == b'E') {
        let mut j = i + 1;
        if j < bytes.len() && (bytes[j] == b'-' || bytes[j] == b'+') {
            j += 1;
        }
        let exp_start = j;
        while j < bytes.len() && bytes[j].is_ascii_digit() {
            j += 1;
        }
        if j > exp_start {
            i = j;
        }
    }
    i
}

/// Format a float the way C's `%g` does (six significant digits, trailing
/// zeros removed, exponent form outside `1e-4 .. 1e6`).
pub fn format_float(value: f64) -> String {
    const PRECISION: i32 = 6;

    if value.is_nan() {
        return "nan".to_string();
    }
    if value.is_infinite() {
        return if value < 0.0 { "-inf" } else { "inf" }.to_string();
    }
    if value == 0.0 {
        return if value.is_sign_negative() { "-0" } else { "0" }.to_string();
    }

    // Round to the target precision first; the exponent of the rounded value
    // decides between fixed and exponent notation.
    let sci = format!("{:.*e}", (PRECISION - 1) as usize, value);
    let (mantissa, exp) = match sci.split_once('e') {
        Some((m, e)) => (m, e.parse::<i32>().unwrap_or(0)),
        None => (sci.as_str(), 0),
    };

    if exp < -4 || exp >= PRECISION {
        let mantissa = trim_fraction(mantissa);
        let sign = if exp < 0 { '-' } else { '+' };
        format!("{}e{}{:02}", mantissa, sign, exp.abs())
    } else {
        let decimals = (PRECISION - 1 - exp).max(0) as usize;
        let fixed = format!("{:.*}", decimals, value);
        trim_fraction(&fixed).to_string()
    }
}

fn trim_fraction(s: &str) -> &str {
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.')
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_float_matches_percent_g() {
        assert_eq!(format_float(3.0), "3");
        assert_eq!(format_float(0.5), "0.5");
        assert_eq!(format_float(-2.25), "-2.25");
        assert_eq!(format_float(1.0 / 3.0), "0.333333");
        assert_eq!(format_float(123456.0), "123456");
        assert_eq!(format_float(1234567.0), "1.23457e+06");
        assert_eq!(format_float(0.0001), "0.0001");
        assert_eq!(format_float(0.00001), "1e-05");
        assert_eq!(format_float(0.0), "0");
    }

    #[test]
    fn test_string_to_number() {
        assert_eq!(string_to_number("12abc"), 12.0);
        assert_eq!(string_to_number("  -3.5"), -3.5);
        assert_eq!(string_to_number("true"), 1.0);
        assert_eq!(string_to_number("FALSE"), 0.0);
        assert_eq!(string_to_number("hello"), 0.0);
        assert_eq!(string_to_number("1e3"), 1000.0);
        assert_eq!(string_to_number("0x10"), 16.0);
        assert_eq!(string_to_number("."), 0.0);
    }

    #[test]
    fn test_coercions() {
        assert_eq!(Value::from("42").to_uint(), 42);
        assert_eq!(Value::from("3.9").to_uint(), 3);
        assert_eq!(Value::from("true").to_uint(), 1);
        assert_eq!(Value::Float(-2.7).to_uint() as i32, -2);
        assert_eq!(Value::Uint(u32::MAX).to_console_string(), "-1");
        assert_eq!(Value::Uint(7).to_float(), 7.0);
        assert_eq!(Value::Float(2.5).to_console_string(), "2.5");
    }

    #[test]
    fn test_truthiness() {
        assert!(Value::from("TRUE").to_bool());
        assert!(Value::from("0.5").to_bool());
        assert!(!Value::from("abc").to_bool());
        assert!(!Value::empty().to_bool());
        assert!(Value::Uint(2).to_bool());
    }
}
