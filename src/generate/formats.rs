//! Format-aware string and number draws.

use base64::Engine;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use rand::distributions::{Alphanumeric, DistString};
use rand::seq::SliceRandom;
use rand::Rng;
use std::net::{Ipv4Addr, Ipv6Addr};

use super::value::{GeneratedValue, Scalar};

/// Length of the unconstrained fallback string
pub const FALLBACK_STRING_LEN: usize = 100;

const LOWER: &[u8] = b"abcdefghijklmnopqrstuvwxyz";
const UPPER: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const DIGITS: &[u8] = b"0123456789";
const SPECIAL: &[u8] = b"!@#$%&*+-_.:;?/<>=[]{}()^~|";
const TLDS: &[&str] = &["com", "net", "org", "io", "dev", "info", "biz"];

/// Dispatch on a string `format`
pub fn string_for_format<R: Rng + ?Sized>(rng: &mut R, format: &str) -> GeneratedValue {
    match format {
        "date" => GeneratedValue::string(random_date(rng).format("%Y-%m-%d").to_string()),
        "date-time" => GeneratedValue::string(random_datetime(rng).to_rfc3339()),
        "password" => {
            let len = rng.gen_range(0..=255);
            GeneratedValue::string(password(rng, len))
        }
        "byte" => {
            let len = rng.gen_range(0..=255);
            let bytes = random_bytes(rng, len);
            GeneratedValue::string(base64::engine::general_purpose::STANDARD.encode(bytes))
        }
        "binary" => {
            let len = rng.gen_range(0..=1024);
            GeneratedValue::Scalar(Scalar::Bytes(random_bytes(rng, len)))
        }
        "email" => GeneratedValue::string(format!(
            "{}@{}",
            lower_word(rng, 3, 12),
            hostname(rng)
        )),
        "uuid" => GeneratedValue::string(
            uuid::Builder::from_random_bytes(rng.gen())
                .into_uuid()
                .to_string(),
        ),
        "uri" | "url" => GeneratedValue::string(format!(
            "{}://{}/{}",
            ["http", "https"].choose(rng).copied().unwrap_or("http"),
            hostname(rng),
            lower_word(rng, 1, 16)
        )),
        "hostname" => GeneratedValue::string(hostname(rng)),
        "ipv4" => GeneratedValue::string(Ipv4Addr::from(rng.gen::<u32>()).to_string()),
        "ipv6" => GeneratedValue::string(Ipv6Addr::from(rng.gen::<u128>()).to_string()),
        _ => {
            let len = rng.gen_range(0..=255);
            GeneratedValue::string(letters(rng, len))
        }
    }
}

/// `number` draw: `float` and `double` use random finite bit patterns,
/// anything else an integer-valued number over the full `i64` range
pub fn number_for_format<R: Rng + ?Sized>(rng: &mut R, format: Option<&str>) -> GeneratedValue {
    match format {
        Some("float") => GeneratedValue::Scalar(Scalar::Float(f64::from(finite_f32(rng)))),
        Some("double") => GeneratedValue::Scalar(Scalar::Float(finite_f64(rng))),
        _ => GeneratedValue::Scalar(Scalar::Integer(rng.gen::<i64>())),
    }
}

/// `integer` draw: `int32` spans `i32`, everything else spans `i64`
pub fn integer_for_format<R: Rng + ?Sized>(rng: &mut R, format: Option<&str>) -> GeneratedValue {
    let value = match format {
        Some("int32") => i64::from(rng.gen::<i32>()),
        _ => rng.gen::<i64>(),
    };
    GeneratedValue::Scalar(Scalar::Integer(value))
}

/// Random alphanumeric string used when a string node has no constraints
pub fn fallback_string<R: Rng + ?Sized>(rng: &mut R) -> String {
    Alphanumeric.sample_string(rng, FALLBACK_STRING_LEN)
}

pub fn letters<R: Rng + ?Sized>(rng: &mut R, len: usize) -> String {
    (0..len)
        .map(|_| {
            let set = if rng.gen_bool(0.5) { LOWER } else { UPPER };
            set[rng.gen_range(0..set.len())] as char
        })
        .collect()
}

fn finite_f32<R: Rng + ?Sized>(rng: &mut R) -> f32 {
    loop {
        let candidate = f32::from_bits(rng.gen());
        if candidate.is_finite() {
            return candidate;
        }
    }
}

fn finite_f64<R: Rng + ?Sized>(rng: &mut R) -> f64 {
    loop {
        let candidate = f64::from_bits(rng.gen());
        if candidate.is_finite() {
            return candidate;
        }
    }
}

fn random_bytes<R: Rng + ?Sized>(rng: &mut R, len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    rng.fill(&mut bytes[..]);
    bytes
}

fn random_date<R: Rng + ?Sized>(rng: &mut R) -> NaiveDate {
    let epoch = NaiveDate::from_ymd_opt(1900, 1, 1).unwrap_or_default();
    // 1900-01-01 ..= 2099-12-31
    epoch + Duration::days(rng.gen_range(0..73_049))
}

fn random_datetime<R: Rng + ?Sized>(rng: &mut R) -> DateTime<Utc> {
    let secs = rng.gen_range(-2_208_988_800i64..4_102_444_800i64);
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

fn password<R: Rng + ?Sized>(rng: &mut R, len: usize) -> String {
    let pools: [&[u8]; 5] = [LOWER, UPPER, DIGITS, SPECIAL, b" "];
    (0..len)
        .map(|_| {
            let pool = pools[rng.gen_range(0..pools.len())];
            pool[rng.gen_range(0..pool.len())] as char
        })
        .collect()
}

fn lower_word<R: Rng + ?Sized>(rng: &mut R, min: usize, max: usize) -> String {
    let len = rng.gen_range(min..=max);
    (0..len)
        .map(|_| LOWER[rng.gen_range(0..LOWER.len())] as char)
        .collect()
}

fn hostname<R: Rng + ?Sized>(rng: &mut R) -> String {
    format!(
        "{}.{}",
        lower_word(rng, 3, 16),
        TLDS.choose(rng).copied().unwrap_or("com")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use regex::Regex;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    fn text(value: GeneratedValue) -> String {
        match value {
            GeneratedValue::Scalar(Scalar::String(s)) => s,
            other => panic!("expected string, got {:?}", other),
        }
    }

    #[test]
    fn test_date_formats_are_well_formed() {
        let mut rng = rng();
        for _ in 0..50 {
            let date = text(string_for_format(&mut rng, "date"));
            assert!(NaiveDate::parse_from_str(&date, "%Y-%m-%d").is_ok(), "{date}");
            let stamp = text(string_for_format(&mut rng, "date-time"));
            assert!(DateTime::parse_from_rfc3339(&stamp).is_ok(), "{stamp}");
        }
    }

    #[test]
    fn test_network_formats_parse() {
        let mut rng = rng();
        for _ in 0..50 {
            let v4 = text(string_for_format(&mut rng, "ipv4"));
            assert!(v4.parse::<Ipv4Addr>().is_ok());
            let v6 = text(string_for_format(&mut rng, "ipv6"));
            assert!(v6.parse::<Ipv6Addr>().is_ok());
            let uri = text(string_for_format(&mut rng, "uri"));
            assert!(url::Url::parse(&uri).is_ok(), "{uri}");
            let id = text(string_for_format(&mut rng, "uuid"));
            assert!(uuid::Uuid::parse_str(&id).is_ok());
        }
    }

    #[test]
    fn test_email_shape() {
        let email_re = Regex::new(r"^[a-z]+@[a-z]+\.[a-z]+$").unwrap();
        let mut rng = rng();
        for _ in 0..20 {
            let email = text(string_for_format(&mut rng, "email"));
            assert!(email_re.is_match(&email), "{email}");
        }
    }

    #[test]
    fn test_byte_is_base64_and_binary_is_bounded() {
        let mut rng = rng();
        for _ in 0..20 {
            let encoded = text(string_for_format(&mut rng, "byte"));
            assert!(base64::engine::general_purpose::STANDARD.decode(&encoded).is_ok());
            match string_for_format(&mut rng, "binary") {
                GeneratedValue::Scalar(Scalar::Bytes(bytes)) => assert!(bytes.len() <= 1024),
                other => panic!("expected bytes, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_unknown_format_is_letters() {
        let mut rng = rng();
        let value = text(string_for_format(&mut rng, "x-custom"));
        assert!(value.len() <= 255);
        assert!(value.chars().all(|c| c.is_ascii_alphabetic()));
    }

    #[test]
    fn test_numbers_are_finite_and_in_width() {
        let mut rng = rng();
        for _ in 0..200 {
            match number_for_format(&mut rng, Some("float")) {
                GeneratedValue::Scalar(Scalar::Float(x)) => {
                    assert!(x.is_finite());
                    assert!(x.abs() <= f64::from(f32::MAX));
                }
                other => panic!("expected float, got {:?}", other),
            }
            match integer_for_format(&mut rng, Some("int32")) {
                GeneratedValue::Scalar(Scalar::Integer(i)) => {
                    assert!(i >= i64::from(i32::MIN) && i <= i64::from(i32::MAX));
                }
                other => panic!("expected integer, got {:?}", other),
            }
        }
        assert!(matches!(
            number_for_format(&mut rng, None),
            GeneratedValue::Scalar(Scalar::Integer(_))
        ));
    }

    #[test]
    fn test_fallback_string_length() {
        let mut rng = rng();
        let s = fallback_string(&mut rng);
        assert_eq!(s.len(), FALLBACK_STRING_LEN);
        assert!(s.chars().all(|c| c.is_ascii_alphanumeric()));
    }
}
