use bigdecimal::{BigDecimal, FromPrimitive, ToPrimitive, Zero};
use sparql::{escape, unescape, xsd};
use std::cmp::Ordering;
use std::str::FromStr;
use time::OffsetDateTime;

/// The SPARQL value model: a decoded RDF term, or the `Unbound` and
/// `Error` values that flow through three-valued evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Iri(String),
    Blank(String),
    /// Simple literal or xsd:string.
    String(String),
    LangString {
        value: String,
        lang: String,
    },
    /// Literal with a datatype the model does not interpret; compared
    /// by lexical form and datatype identity only.
    Typed {
        value: String,
        datatype: String,
    },
    Boolean(bool),
    Integer(i64),
    Decimal(BigDecimal),
    Double(f64),
    DateTime {
        at: OffsetDateTime,
        has_tz: bool,
    },
    Unbound,
    Error,
}

impl Value {
    /// Decode a canonical atom-store term string: `<iri>`, `_:label`,
    /// or a quoted literal with optional `@lang` / `^^<datatype>`.
    pub fn from_term_text(text: &str) -> Value {
        if let Some(inner) = text.strip_prefix('<').and_then(|t| t.strip_suffix('>')) {
            return Value::Iri(inner.to_string());
        }
        if let Some(label) = text.strip_prefix("_:") {
            return Value::Blank(label.to_string());
        }
        if let Some(rest) = text.strip_prefix('"') {
            // Find the closing quote, skipping escapes.
            let bytes = rest.as_bytes();
            let mut at = 0;
            while at < bytes.len() {
                match bytes[at] {
                    b'\\' => at += 2,
                    b'"' => break,
                    _ => at += 1,
                }
            }
            if at > bytes.len() {
                return Value::Error;
            }
            let lexical = unescape(&rest[..at.min(rest.len())]);
            let suffix = rest.get(at + 1..).unwrap_or("");
            if let Some(lang) = suffix.strip_prefix('@') {
                return Value::LangString {
                    value: lexical,
                    lang: lang.to_string(),
                };
            }
            if let Some(dt) = suffix
                .strip_prefix("^^<")
                .and_then(|t| t.strip_suffix('>'))
            {
                return Value::typed_literal(lexical, dt);
            }
            return Value::String(lexical);
        }
        // Not a recognized term shape; treat as an opaque typed value.
        Value::Typed {
            value: text.to_string(),
            datatype: String::new(),
        }
    }

    /// Interpret a lexical form under a datatype IRI.
    pub fn typed_literal(lexical: String, datatype: &str) -> Value {
        match datatype {
            xsd::STRING => Value::String(lexical),
            xsd::BOOLEAN => match lexical.as_str() {
                "true" | "1" => Value::Boolean(true),
                "false" | "0" => Value::Boolean(false),
                _ => Value::Typed {
                    value: lexical,
                    datatype: datatype.to_string(),
                },
            },
            xsd::INTEGER => match lexical.parse::<i64>() {
                Ok(n) => Value::Integer(n),
                Err(_) => Value::Typed {
                    value: lexical,
                    datatype: datatype.to_string(),
                },
            },
            xsd::DECIMAL => match BigDecimal::from_str(&lexical) {
                Ok(d) => Value::Decimal(d),
                Err(_) => Value::Typed {
                    value: lexical,
                    datatype: datatype.to_string(),
                },
            },
            xsd::DOUBLE => match lexical.parse::<f64>() {
                Ok(d) => Value::Double(d),
                Err(_) => Value::Typed {
                    value: lexical,
                    datatype: datatype.to_string(),
                },
            },
            xsd::DATE_TIME => match parse_date_time(&lexical) {
                Some((at, has_tz)) => Value::DateTime { at, has_tz },
                None => Value::Typed {
                    value: lexical,
                    datatype: datatype.to_string(),
                },
            },
            _ => Value::Typed {
                value: lexical,
                datatype: datatype.to_string(),
            },
        }
    }

    /// Render back to canonical atom-store term text. `None` for
    /// `Unbound` and `Error`, which have no term form.
    pub fn to_term_text(&self) -> Option<String> {
        Some(match self {
            Value::Iri(iri) => format!("<{iri}>"),
            Value::Blank(label) => format!("_:{label}"),
            Value::String(s) => format!("\"{}\"", escape(s)),
            Value::LangString { value, lang } => format!("\"{}\"@{}", escape(value), lang),
            Value::Typed { value, datatype } => {
                format!("\"{}\"^^<{}>", escape(value), datatype)
            }
            Value::Boolean(b) => format!("\"{b}\"^^<{}>", xsd::BOOLEAN),
            Value::Integer(n) => format!("\"{n}\"^^<{}>", xsd::INTEGER),
            Value::Decimal(d) => format!("\"{d}\"^^<{}>", xsd::DECIMAL),
            Value::Double(d) => format!("\"{d}\"^^<{}>", xsd::DOUBLE),
            Value::DateTime { .. } => {
                format!("\"{}\"^^<{}>", self.lexical_form(), xsd::DATE_TIME)
            }
            Value::Unbound | Value::Error => return None,
        })
    }

    /// The bare lexical form, as STR() sees it.
    pub fn lexical_form(&self) -> String {
        match self {
            Value::Iri(iri) => iri.clone(),
            Value::Blank(label) => label.clone(),
            Value::String(s) => s.clone(),
            Value::LangString { value, .. } => value.clone(),
            Value::Typed { value, .. } => value.clone(),
            Value::Boolean(b) => b.to_string(),
            Value::Integer(n) => n.to_string(),
            Value::Decimal(d) => d.to_string(),
            Value::Double(d) => d.to_string(),
            Value::DateTime { at, has_tz } => {
                let base = format!(
                    "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}",
                    at.year(),
                    at.month() as u8,
                    at.day(),
                    at.hour(),
                    at.minute(),
                    at.second()
                );
                if *has_tz {
                    let offset = at.offset();
                    if offset.is_utc() {
                        format!("{base}Z")
                    } else {
                        format!(
                            "{base}{}{:02}:{:02}",
                            if offset.whole_seconds() < 0 { "-" } else { "+" },
                            offset.whole_hours().abs(),
                            (offset.whole_minutes().abs() % 60)
                        )
                    }
                } else {
                    base
                }
            }
            Value::Unbound | Value::Error => String::new(),
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            Value::Integer(_) | Value::Decimal(_) | Value::Double(_)
        )
    }

    pub fn is_literal(&self) -> bool {
        matches!(
            self,
            Value::String(_)
                | Value::LangString { .. }
                | Value::Typed { .. }
                | Value::Boolean(_)
                | Value::Integer(_)
                | Value::Decimal(_)
                | Value::Double(_)
                | Value::DateTime { .. }
        )
    }

    /// The datatype IRI of a literal, per DATATYPE().
    pub fn datatype(&self) -> Option<&str> {
        Some(match self {
            Value::String(_) => xsd::STRING,
            Value::LangString { .. } => sparql::RDF_LANG_STRING,
            Value::Typed { datatype, .. } => datatype,
            Value::Boolean(_) => xsd::BOOLEAN,
            Value::Integer(_) => xsd::INTEGER,
            Value::Decimal(_) => xsd::DECIMAL,
            Value::Double(_) => xsd::DOUBLE,
            Value::DateTime { .. } => xsd::DATE_TIME,
            _ => return None,
        })
    }

    /// Effective boolean value; `Error` when undefined.
    pub fn ebv(&self) -> Value {
        match self {
            Value::Boolean(b) => Value::Boolean(*b),
            Value::Integer(n) => Value::Boolean(*n != 0),
            Value::Decimal(d) => Value::Boolean(!d.is_zero()),
            Value::Double(d) => Value::Boolean(*d != 0.0 && !d.is_nan()),
            Value::String(s) => Value::Boolean(!s.is_empty()),
            Value::LangString { value, .. } => Value::Boolean(!value.is_empty()),
            _ => Value::Error,
        }
    }

    pub fn as_double(&self) -> Option<f64> {
        match self {
            Value::Integer(n) => Some(*n as f64),
            Value::Decimal(d) => d.to_f64(),
            Value::Double(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_decimal(&self) -> Option<BigDecimal> {
        match self {
            Value::Integer(n) => BigDecimal::from_i64(*n),
            Value::Decimal(d) => Some(d.clone()),
            _ => None,
        }
    }
}

fn parse_date_time(lexical: &str) -> Option<(OffsetDateTime, bool)> {
    use time::format_description::well_known::Rfc3339;
    use time::{Date, Month, PrimitiveDateTime, Time};

    if let Ok(at) = OffsetDateTime::parse(lexical, &Rfc3339) {
        return Some((at, true));
    }
    // No timezone: YYYY-MM-DDTHH:MM:SS(.fff)? — interpreted on the
    // UTC timeline for comparison purposes.
    let (date_part, time_part) = lexical.split_once('T')?;
    let mut date_it = date_part.splitn(3, '-');
    let year: i32 = date_it.next()?.parse().ok()?;
    let month: u8 = date_it.next()?.parse().ok()?;
    let day: u8 = date_it.next()?.parse().ok()?;

    let (hms, frac) = match time_part.split_once('.') {
        Some((hms, frac)) => (hms, frac),
        None => (time_part, ""),
    };
    let mut time_it = hms.splitn(3, ':');
    let hour: u8 = time_it.next()?.parse().ok()?;
    let minute: u8 = time_it.next()?.parse().ok()?;
    let second: u8 = time_it.next()?.parse().ok()?;
    let nanos: u32 = if frac.is_empty() {
        0
    } else {
        let padded = format!("{frac:0<9}");
        padded[..9].parse().ok()?
    };

    let date = Date::from_calendar_date(year, Month::try_from(month).ok()?, day).ok()?;
    let time = Time::from_hms_nano(hour, minute, second, nanos).ok()?;
    Some((PrimitiveDateTime::new(date, time).assume_utc(), false))
}

/// SPARQL `=` semantics. `None` means the comparison is an error
/// (e.g. unknown datatypes with differing lexical forms).
pub fn value_eq(a: &Value, b: &Value) -> Option<bool> {
    use Value::*;
    match (a, b) {
        (Unbound, _) | (_, Unbound) | (Error, _) | (_, Error) => None,
        (Iri(x), Iri(y)) => Some(x == y),
        (Blank(x), Blank(y)) => Some(x == y),
        (String(x), String(y)) => Some(x == y),
        (LangString { value: xv, lang: xl }, LangString { value: yv, lang: yl }) => {
            Some(xv == yv && xl.eq_ignore_ascii_case(yl))
        }
        (Boolean(x), Boolean(y)) => Some(x == y),
        (DateTime { at: x, .. }, DateTime { at: y, .. }) => Some(x == y),
        _ if a.is_numeric() && b.is_numeric() => numeric_cmp(a, b).map(|o| o == Ordering::Equal),
        (
            Typed {
                value: xv,
                datatype: xd,
            },
            Typed {
                value: yv,
                datatype: yd,
            },
        ) => {
            if xd == yd && xv == yv {
                Some(true)
            } else {
                // Same unknown datatype with different lexical forms is
                // not decidable; different datatypes even less so.
                None
            }
        }
        // Different term categories are simply not equal.
        _ if a.is_literal() != b.is_literal() => Some(false),
        (Iri(_), Blank(_)) | (Blank(_), Iri(_)) => Some(false),
        _ => None,
    }
}

/// SPARQL `<`/`>` operator mapping. `None` when the operands are not
/// comparable under the operator rules.
pub fn value_cmp(a: &Value, b: &Value) -> Option<Ordering> {
    use Value::*;
    match (a, b) {
        _ if a.is_numeric() && b.is_numeric() => numeric_cmp(a, b),
        (String(x), String(y)) => Some(x.cmp(y)),
        (Boolean(x), Boolean(y)) => Some(x.cmp(y)),
        (DateTime { at: x, .. }, DateTime { at: y, .. }) => Some(x.cmp(y)),
        _ => None,
    }
}

fn numeric_cmp(a: &Value, b: &Value) -> Option<Ordering> {
    use Value::*;
    match (a, b) {
        (Integer(x), Integer(y)) => Some(x.cmp(y)),
        (Double(_), _) | (_, Double(_)) => a.as_double()?.partial_cmp(&b.as_double()?),
        _ => Some(a.as_decimal()?.cmp(&b.as_decimal()?)),
    }
}

/// Total order for ORDER BY: Unbound < blank < IRI < literal, then the
/// operator mapping where defined, then a stable lexical fallback.
pub fn order_cmp(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Unbound | Value::Error => 0,
            Value::Blank(_) => 1,
            Value::Iri(_) => 2,
            _ => 3,
        }
    }
    let (ra, rb) = (rank(a), rank(b));
    if ra != rb {
        return ra.cmp(&rb);
    }
    if let Some(ord) = value_cmp(a, b) {
        return ord;
    }
    if let Some(true) = value_eq(a, b) {
        return Ordering::Equal;
    }
    a.lexical_form().cmp(&b.lexical_form())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_term_text_round_trip() {
        for text in [
            "<http://example.com/x>",
            "_:b7",
            "\"plain\"",
            "\"chat\"@fr",
            "\"42\"^^<http://www.w3.org/2001/XMLSchema#integer>",
        ] {
            let value = Value::from_term_text(text);
            assert_eq!(value.to_term_text().unwrap(), text, "for {text}");
        }
    }

    #[test]
    fn test_typed_decoding() {
        assert_eq!(
            Value::from_term_text("\"42\"^^<http://www.w3.org/2001/XMLSchema#integer>"),
            Value::Integer(42)
        );
        assert_eq!(
            Value::from_term_text("\"true\"^^<http://www.w3.org/2001/XMLSchema#boolean>"),
            Value::Boolean(true)
        );
        assert!(matches!(
            Value::from_term_text("\"x\"^^<http://example.com/custom>"),
            Value::Typed { .. }
        ));
    }

    #[test]
    fn test_numeric_promotion() {
        // integer vs decimal vs double all compare numerically.
        let i = Value::Integer(2);
        let d = Value::Decimal(BigDecimal::from_str("2.0").unwrap());
        let f = Value::Double(2.0);
        assert_eq!(value_eq(&i, &d), Some(true));
        assert_eq!(value_eq(&i, &f), Some(true));
        assert_eq!(
            value_cmp(&Value::Integer(1), &Value::Double(1.5)),
            Some(Ordering::Less)
        );
    }

    #[test]
    fn test_incomparable_is_error() {
        assert_eq!(value_cmp(&Value::Iri("a".into()), &Value::Integer(1)), None);
        assert_eq!(
            value_eq(
                &Value::Typed {
                    value: "a".into(),
                    datatype: "http://e/dt".into()
                },
                &Value::Typed {
                    value: "b".into(),
                    datatype: "http://e/dt".into()
                }
            ),
            None
        );
    }

    #[test]
    fn test_ebv() {
        assert_eq!(Value::Boolean(true).ebv(), Value::Boolean(true));
        assert_eq!(Value::Integer(0).ebv(), Value::Boolean(false));
        assert_eq!(Value::String("".into()).ebv(), Value::Boolean(false));
        assert_eq!(Value::String("x".into()).ebv(), Value::Boolean(true));
        assert_eq!(Value::Iri("x".into()).ebv(), Value::Error);
    }

    #[test]
    fn test_date_time_parsing() {
        let with_tz = Value::from_term_text(
            "\"2001-10-26T21:32:52Z\"^^<http://www.w3.org/2001/XMLSchema#dateTime>",
        );
        let Value::DateTime { has_tz: true, .. } = with_tz else {
            panic!("expected dateTime with tz, got {with_tz:?}");
        };
        let without = Value::from_term_text(
            "\"2001-10-26T21:32:52\"^^<http://www.w3.org/2001/XMLSchema#dateTime>",
        );
        let Value::DateTime { has_tz: false, .. } = without else {
            panic!("expected dateTime without tz, got {without:?}");
        };
    }

    #[test]
    fn test_order_cmp_is_total() {
        let values = [
            Value::Unbound,
            Value::Blank("b".into()),
            Value::Iri("http://e/a".into()),
            Value::Integer(1),
            Value::String("s".into()),
            Value::Iri("http://e/b".into()),
        ];
        for a in &values {
            for b in &values {
                // Antisymmetry is enough of a sanity check here.
                assert_eq!(order_cmp(a, b), order_cmp(b, a).reverse());
            }
        }
    }
}
