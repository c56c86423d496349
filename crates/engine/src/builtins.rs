use crate::expr::{eval, EvalContext};
use crate::{Row, Value};
use bigdecimal::{BigDecimal, FromPrimitive, ToPrimitive};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use sha1::Digest;
use sparql::{Expr, Func, Term};

// ENCODE_FOR_URI keeps only the RFC 3986 unreserved characters.
const ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Dispatch one built-in call. Ill-typed arguments produce
/// `Value::Error`, which the caller's context interprets (row exclusion
/// in filters, alternative in COALESCE, propagation in arithmetic).
pub fn call(ctx: &EvalContext<'_>, row: &Row, func: Func, args: &[Expr]) -> Value {
    match func {
        // BOUND inspects the variable itself, not its value.
        Func::Bound => match args.first() {
            Some(Expr::Term(Term::Var(name))) => {
                Value::Boolean(row.get_by_name(ctx.plan.text(*name)).is_some())
            }
            _ => Value::Error,
        },
        Func::If => {
            let cond = eval(ctx, row, &args[0]).ebv();
            match cond {
                Value::Boolean(true) => eval(ctx, row, &args[1]),
                Value::Boolean(false) => eval(ctx, row, &args[2]),
                _ => Value::Error,
            }
        }
        Func::Coalesce => {
            for arg in args {
                let v = eval(ctx, row, arg);
                if !matches!(v, Value::Error | Value::Unbound) {
                    return v;
                }
            }
            Value::Error
        }
        _ => {
            let values: Vec<Value> = args.iter().map(|a| eval(ctx, row, a)).collect();
            strict(ctx, func, values)
        }
    }
}

/// Built-ins with all arguments evaluated eagerly.
fn strict(ctx: &EvalContext<'_>, func: Func, args: Vec<Value>) -> Value {
    match func {
        Func::Bound | Func::If | Func::Coalesce => unreachable!("handled lazily"),

        Func::Str => match &args[0] {
            Value::Unbound | Value::Error => Value::Error,
            other => Value::String(other.lexical_form()),
        },
        Func::StrLen => match string_arg(&args[0]) {
            Some((s, _)) => Value::Integer(s.chars().count() as i64),
            None => Value::Error,
        },
        Func::SubStr => {
            let Some((s, lang)) = string_arg(&args[0]) else {
                return Value::Error;
            };
            let Value::Integer(start) = coerce_integer(&args[1]) else {
                return Value::Error;
            };
            let chars: Vec<char> = s.chars().collect();
            let from = (start.max(1) - 1) as usize;
            let taken: String = match args.get(2) {
                None => chars.iter().skip(from).collect(),
                Some(len) => {
                    let Value::Integer(len) = coerce_integer(len) else {
                        return Value::Error;
                    };
                    chars.iter().skip(from).take(len.max(0) as usize).collect()
                }
            };
            with_lang(taken, lang)
        }
        Func::UCase => match string_arg(&args[0]) {
            Some((s, lang)) => with_lang(s.to_uppercase(), lang),
            None => Value::Error,
        },
        Func::LCase => match string_arg(&args[0]) {
            Some((s, lang)) => with_lang(s.to_lowercase(), lang),
            None => Value::Error,
        },
        Func::Contains => binary_string(&args, |a, b| Value::Boolean(a.contains(b))),
        Func::StrStarts => binary_string(&args, |a, b| Value::Boolean(a.starts_with(b))),
        Func::StrEnds => binary_string(&args, |a, b| Value::Boolean(a.ends_with(b))),
        Func::StrBefore => {
            let Some((a, lang)) = string_arg(&args[0]) else {
                return Value::Error;
            };
            let Some((b, _)) = string_arg(&args[1]) else {
                return Value::Error;
            };
            match a.find(&b as &str) {
                Some(at) => with_lang(a[..at].to_string(), lang),
                None => Value::String(String::new()),
            }
        }
        Func::StrAfter => {
            let Some((a, lang)) = string_arg(&args[0]) else {
                return Value::Error;
            };
            let Some((b, _)) = string_arg(&args[1]) else {
                return Value::Error;
            };
            match a.find(&b as &str) {
                Some(at) => with_lang(a[at + b.len()..].to_string(), lang),
                None => Value::String(String::new()),
            }
        }
        Func::Concat => {
            let mut out = String::new();
            let mut lang: Option<Option<String>> = None;
            for arg in &args {
                let Some((s, l)) = string_arg(arg) else {
                    return Value::Error;
                };
                out.push_str(&s);
                match &lang {
                    None => lang = Some(l),
                    Some(prev) if *prev == l => {}
                    Some(_) => lang = Some(None),
                }
            }
            with_lang(out, lang.flatten())
        }
        Func::EncodeForUri => match string_arg(&args[0]) {
            Some((s, _)) => Value::String(utf8_percent_encode(&s, ENCODE_SET).to_string()),
            None => Value::Error,
        },

        Func::Regex => {
            let Some((text, _)) = string_arg(&args[0]) else {
                return Value::Error;
            };
            match build_regex(&args[1], args.get(2)) {
                Some(re) => Value::Boolean(re.is_match(&text)),
                None => Value::Error,
            }
        }
        Func::Replace => {
            let Some((text, lang)) = string_arg(&args[0]) else {
                return Value::Error;
            };
            let Some((replacement, _)) = string_arg(&args[2]) else {
                return Value::Error;
            };
            match build_regex(&args[1], args.get(3)) {
                Some(re) => with_lang(
                    re.replace_all(&text, replacement.as_str()).into_owned(),
                    lang,
                ),
                None => Value::Error,
            }
        }

        Func::SameTerm => match (args[0].to_term_text(), args[1].to_term_text()) {
            (Some(a), Some(b)) => Value::Boolean(a == b),
            _ => Value::Error,
        },
        Func::IsIri => term_test(&args[0], matches!(args[0], Value::Iri(_))),
        Func::IsBlank => term_test(&args[0], matches!(args[0], Value::Blank(_))),
        Func::IsLiteral => term_test(&args[0], args[0].is_literal()),
        Func::IsNumeric => term_test(&args[0], args[0].is_numeric()),

        Func::Abs => match &args[0] {
            Value::Integer(n) => Value::Integer(n.abs()),
            Value::Decimal(d) => Value::Decimal(d.abs()),
            Value::Double(d) => Value::Double(d.abs()),
            _ => Value::Error,
        },
        Func::Round => numeric_unary(&args[0], f64::round, |d| d.round(0)),
        Func::Ceil => numeric_unary(&args[0], f64::ceil, |d| {
            ceil_decimal(d)
        }),
        Func::Floor => numeric_unary(&args[0], f64::floor, |d| {
            floor_decimal(d)
        }),

        Func::Lang => match &args[0] {
            Value::LangString { lang, .. } => Value::String(lang.clone()),
            v if v.is_literal() => Value::String(String::new()),
            _ => Value::Error,
        },
        Func::Datatype => match args[0].datatype() {
            Some(dt) => Value::Iri(dt.to_string()),
            None => Value::Error,
        },
        Func::LangMatches => {
            let (Value::String(tag), Value::String(range)) = (&args[0], &args[1]) else {
                return Value::Error;
            };
            Value::Boolean(lang_matches(tag, range))
        }
        Func::Iri => match &args[0] {
            Value::Iri(iri) => Value::Iri(iri.clone()),
            Value::String(s) => Value::Iri(s.clone()),
            _ => Value::Error,
        },
        Func::StrDt => {
            let (Value::String(lexical), Value::Iri(dt)) = (&args[0], &args[1]) else {
                return Value::Error;
            };
            Value::typed_literal(lexical.clone(), dt)
        }
        Func::StrLang => {
            let (Value::String(lexical), Value::String(tag)) = (&args[0], &args[1]) else {
                return Value::Error;
            };
            Value::LangString {
                value: lexical.clone(),
                lang: tag.clone(),
            }
        }
        Func::BNode => match args.first() {
            None => Value::Blank(format!("gen{}", uuid::Uuid::new_v4().simple())),
            Some(Value::String(s)) => Value::Blank(s.clone()),
            _ => Value::Error,
        },

        Func::Md5 => match string_arg(&args[0]) {
            Some((s, _)) => Value::String(format!("{:x}", md5::compute(s.as_bytes()))),
            None => Value::Error,
        },
        Func::Sha1 => hash_hex::<sha1::Sha1>(&args[0]),
        Func::Sha256 => hash_hex::<sha2::Sha256>(&args[0]),
        Func::Sha384 => hash_hex::<sha2::Sha384>(&args[0]),
        Func::Sha512 => hash_hex::<sha2::Sha512>(&args[0]),

        Func::Uuid => Value::Iri(format!("urn:uuid:{}", uuid::Uuid::new_v4())),
        Func::StrUuid => Value::String(uuid::Uuid::new_v4().to_string()),

        Func::Now => Value::DateTime {
            at: ctx.now,
            has_tz: true,
        },
        Func::Year => date_part(&args[0], |at| at.year() as i64),
        Func::Month => date_part(&args[0], |at| at.month() as u8 as i64),
        Func::Day => date_part(&args[0], |at| at.day() as i64),
        Func::Hours => date_part(&args[0], |at| at.hour() as i64),
        Func::Minutes => date_part(&args[0], |at| at.minute() as i64),
        Func::Seconds => match &args[0] {
            Value::DateTime { at, .. } => {
                let seconds = at.second() as f64 + at.nanosecond() as f64 / 1e9;
                match BigDecimal::from_f64(seconds) {
                    Some(d) => Value::Decimal(d.with_scale(3).normalized()),
                    None => Value::Error,
                }
            }
            _ => Value::Error,
        },
        Func::Tz => match &args[0] {
            Value::DateTime { has_tz: false, .. } => Value::String(String::new()),
            Value::DateTime { at, has_tz: true } => {
                let offset = at.offset();
                if offset.is_utc() {
                    Value::String("Z".to_string())
                } else {
                    Value::String(format!(
                        "{}{:02}:{:02}",
                        if offset.whole_seconds() < 0 { "-" } else { "+" },
                        offset.whole_hours().abs(),
                        offset.whole_minutes().abs() % 60
                    ))
                }
            }
            _ => Value::Error,
        },
        Func::Timezone => match &args[0] {
            Value::DateTime { has_tz: false, .. } => Value::Error,
            Value::DateTime { at, has_tz: true } => {
                let offset = at.offset();
                let total = offset.whole_seconds();
                let (sign, total) = if total < 0 { ("-", -total) } else { ("", total) };
                let (hours, minutes) = (total / 3600, (total % 3600) / 60);
                let lexical = if total == 0 {
                    "PT0S".to_string()
                } else if minutes == 0 {
                    format!("{sign}PT{hours}H")
                } else {
                    format!("{sign}PT{hours}H{minutes}M")
                };
                Value::Typed {
                    value: lexical,
                    datatype: "http://www.w3.org/2001/XMLSchema#dayTimeDuration".to_string(),
                }
            }
            _ => Value::Error,
        },
    }
}

/// Accept a string-like argument: simple/xsd:string or lang string.
fn string_arg(v: &Value) -> Option<(String, Option<String>)> {
    match v {
        Value::String(s) => Some((s.clone(), None)),
        Value::LangString { value, lang } => Some((value.clone(), Some(lang.clone()))),
        _ => None,
    }
}

fn with_lang(s: String, lang: Option<String>) -> Value {
    match lang {
        Some(lang) => Value::LangString { value: s, lang },
        None => Value::String(s),
    }
}

fn binary_string(args: &[Value], f: impl Fn(&str, &str) -> Value) -> Value {
    let (Some((a, la)), Some((b, lb))) = (string_arg(&args[0]), string_arg(&args[1])) else {
        return Value::Error;
    };
    // Argument compatibility: second must be simple or share the tag.
    if lb.is_some() && la != lb {
        return Value::Error;
    }
    f(&a, &b)
}

fn term_test(v: &Value, answer: bool) -> Value {
    match v {
        Value::Unbound | Value::Error => Value::Error,
        _ => Value::Boolean(answer),
    }
}

fn coerce_integer(v: &Value) -> Value {
    match v {
        Value::Integer(n) => Value::Integer(*n),
        Value::Decimal(d) => match d.to_i64() {
            Some(n) => Value::Integer(n),
            None => Value::Error,
        },
        Value::Double(d) if d.fract() == 0.0 => Value::Integer(*d as i64),
        _ => Value::Error,
    }
}

fn numeric_unary(
    v: &Value,
    on_double: impl Fn(f64) -> f64,
    on_decimal: impl Fn(&BigDecimal) -> BigDecimal,
) -> Value {
    match v {
        Value::Integer(n) => Value::Integer(*n),
        Value::Decimal(d) => Value::Decimal(on_decimal(d)),
        Value::Double(d) => Value::Double(on_double(*d)),
        _ => Value::Error,
    }
}

fn ceil_decimal(d: &BigDecimal) -> BigDecimal {
    let truncated = d.with_scale(0);
    if &truncated < d {
        truncated + BigDecimal::from(1)
    } else {
        truncated
    }
}

fn floor_decimal(d: &BigDecimal) -> BigDecimal {
    let truncated = d.with_scale(0);
    if &truncated > d {
        truncated - BigDecimal::from(1)
    } else {
        truncated
    }
}

fn build_regex(pattern: &Value, flags: Option<&Value>) -> Option<regex::Regex> {
    let Value::String(pattern) = pattern else {
        return None;
    };
    let mut inline = String::new();
    if let Some(flags) = flags {
        let Value::String(flags) = flags else {
            return None;
        };
        for flag in flags.chars() {
            match flag {
                'i' => inline.push('i'),
                's' => inline.push('s'),
                'm' => inline.push('m'),
                'x' => inline.push('x'),
                _ => return None,
            }
        }
    }
    let full = if inline.is_empty() {
        pattern.clone()
    } else {
        format!("(?{inline}){pattern}")
    };
    regex::Regex::new(&full).ok()
}

fn lang_matches(tag: &str, range: &str) -> bool {
    if tag.is_empty() {
        return false;
    }
    if range == "*" {
        return true;
    }
    let tag = tag.to_ascii_lowercase();
    let range = range.to_ascii_lowercase();
    tag == range || (tag.starts_with(&range) && tag.as_bytes().get(range.len()) == Some(&b'-'))
}

fn hash_hex<D: Digest>(v: &Value) -> Value {
    match string_arg(v) {
        Some((s, _)) => Value::String(hex::encode(D::digest(s.as_bytes()))),
        None => Value::Error,
    }
}

fn date_part(v: &Value, f: impl Fn(&time::OffsetDateTime) -> i64) -> Value {
    match v {
        Value::DateTime { at, .. } => Value::Integer(f(at)),
        _ => Value::Error,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::expr::EvalContext;
    use sparql::parse;

    fn run(expr_src: &str) -> Value {
        let src = format!("ASK {{ ?s ?p ?o FILTER({expr_src}) }}");
        let plan = parse(&src).unwrap();
        let sparql::Query::Ask(ask) = &plan.query else {
            panic!()
        };
        let sparql::Pattern::Filter(expr) = &ask.patterns[1] else {
            panic!()
        };
        let ctx = EvalContext::new(&plan);
        eval(&ctx, &Row::new(), expr)
    }

    #[test]
    fn test_string_builtins() {
        assert_eq!(run("STRLEN(\"chat\")"), Value::Integer(4));
        assert_eq!(run("UCASE(\"chat\")"), Value::String("CHAT".into()));
        assert_eq!(run("SUBSTR(\"motor car\", 7)"), Value::String("car".into()));
        assert_eq!(run("SUBSTR(\"motor\", 2, 3)"), Value::String("oto".into()));
        assert_eq!(run("CONTAINS(\"foobar\", \"oba\")"), Value::Boolean(true));
        assert_eq!(run("STRBEFORE(\"abc\", \"b\")"), Value::String("a".into()));
        assert_eq!(run("STRAFTER(\"abc\", \"b\")"), Value::String("c".into()));
        assert_eq!(
            run("CONCAT(\"foo\", \"bar\")"),
            Value::String("foobar".into())
        );
        assert_eq!(
            run("ENCODE_FOR_URI(\"Los Angeles\")"),
            Value::String("Los%20Angeles".into())
        );
    }

    #[test]
    fn test_lang_builtins() {
        assert_eq!(run("LANG(\"chat\"@fr)"), Value::String("fr".into()));
        assert_eq!(run("LANG(\"chat\")"), Value::String("".into()));
        assert_eq!(
            run("LANGMATCHES(LANG(\"x\"@en-US), \"en\")"),
            Value::Boolean(true)
        );
        assert_eq!(
            run("LANGMATCHES(LANG(\"x\"@fr), \"en\")"),
            Value::Boolean(false)
        );
        assert_eq!(run("STRLANG(\"abc\", \"en\")"), Value::LangString {
            value: "abc".into(),
            lang: "en".into()
        });
    }

    #[test]
    fn test_numeric_builtins() {
        assert_eq!(run("ABS(-3)"), Value::Integer(3));
        assert_eq!(run("CEIL(2.2) = 3"), Value::Boolean(true));
        assert_eq!(run("FLOOR(2.8) = 2"), Value::Boolean(true));
        assert_eq!(run("ROUND(2.5) = 3"), Value::Boolean(true));
        assert_eq!(run("CEIL(-2.2) = -2"), Value::Boolean(true));
    }

    #[test]
    fn test_regex_and_replace() {
        assert_eq!(run("REGEX(\"Alice\", \"^ali\", \"i\")"), Value::Boolean(true));
        assert_eq!(run("REGEX(\"Alice\", \"^ali\")"), Value::Boolean(false));
        assert_eq!(
            run("REPLACE(\"abcd\", \"b\", \"Z\")"),
            Value::String("aZcd".into())
        );
    }

    #[test]
    fn test_term_tests() {
        assert_eq!(run("isIRI(<http://e/x>)"), Value::Boolean(true));
        assert_eq!(run("isLiteral(\"x\")"), Value::Boolean(true));
        assert_eq!(run("isNumeric(4)"), Value::Boolean(true));
        assert_eq!(run("isNumeric(\"4\")"), Value::Boolean(false));
        assert_eq!(run("sameTerm(\"x\", \"x\")"), Value::Boolean(true));
        assert_eq!(run("sameTerm(\"1\", 1)"), Value::Boolean(false));
    }

    #[test]
    fn test_hash_builtins() {
        assert_eq!(
            run("MD5(\"abc\")"),
            Value::String("900150983cd24fb0d6963f7d28e17f72".into())
        );
        assert_eq!(
            run("SHA1(\"abc\")"),
            Value::String("a9993e364706816aba3e25717850c26c9cd0d89d".into())
        );
        assert_eq!(
            run("SHA256(\"abc\")"),
            Value::String(
                "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad".into()
            )
        );
    }

    #[test]
    fn test_constructors() {
        assert_eq!(run("IRI(\"http://e/x\")"), Value::Iri("http://e/x".into()));
        assert_eq!(
            run("STRDT(\"42\", <http://www.w3.org/2001/XMLSchema#integer>)"),
            Value::Integer(42)
        );
        let Value::Blank(_) = run("BNODE()") else {
            panic!("BNODE() should produce a blank node");
        };
        let Value::Iri(u) = run("UUID()") else {
            panic!("UUID() should produce an IRI");
        };
        assert!(u.starts_with("urn:uuid:"));
    }

    #[test]
    fn test_datetime_builtins() {
        let dt = "\"2011-01-10T14:45:13.815Z\"^^<http://www.w3.org/2001/XMLSchema#dateTime>";
        assert_eq!(run(&format!("YEAR({dt})")), Value::Integer(2011));
        assert_eq!(run(&format!("MONTH({dt})")), Value::Integer(1));
        assert_eq!(run(&format!("DAY({dt})")), Value::Integer(10));
        assert_eq!(run(&format!("HOURS({dt})")), Value::Integer(14));
        assert_eq!(run(&format!("MINUTES({dt})")), Value::Integer(45));
        assert_eq!(run(&format!("TZ({dt})")), Value::String("Z".into()));
        let Value::DateTime { has_tz: true, .. } = run("NOW()") else {
            panic!("NOW() should produce a zoned dateTime");
        };
    }

    #[test]
    fn test_coalesce_and_if() {
        assert_eq!(run("COALESCE(?missing, 5)"), Value::Integer(5));
        assert_eq!(run("COALESCE(1/0, \"fallback\")"), Value::String("fallback".into()));
        assert_eq!(run("IF(1 < 2, \"yes\", \"no\")"), Value::String("yes".into()));
        assert_eq!(run("BOUND(?missing)"), Value::Boolean(false));
    }
}
