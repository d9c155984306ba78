//! Resource quantities and quotas.
//!
//! A [`Quantity`] is an exact amount held as a count of nano-units, so `0.1`
//! cores and `100m` compare equal and arithmetic never rounds. A [`Quota`]
//! maps resource names such as `limits.cpu` onto quantities; absent names
//! behave as zero.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use crate::{Error, Result};

/// CPU limit, in cores (500m = .5 cores).
pub const LIMITS_CPU: &str = "limits.cpu";
/// Memory limit, in bytes (500Mi = 500 * 1024 * 1024).
pub const LIMITS_MEMORY: &str = "limits.memory";
/// CPU request, in cores.
pub const REQUESTS_CPU: &str = "requests.cpu";
/// Memory request, in bytes.
pub const REQUESTS_MEMORY: &str = "requests.memory";

const NANOS_PER_UNIT: i128 = 1_000_000_000;

const DECIMAL_SUFFIXES: [(&str, i128); 10] = [
    ("E", 1_000_000_000_000_000_000_000_000_000),
    ("P", 1_000_000_000_000_000_000_000_000),
    ("T", 1_000_000_000_000_000_000_000),
    ("G", 1_000_000_000_000_000_000),
    ("M", 1_000_000_000_000_000),
    ("k", 1_000_000_000_000),
    ("", NANOS_PER_UNIT),
    ("m", 1_000_000),
    ("u", 1_000),
    ("n", 1),
];

const BINARY_SUFFIXES: [(&str, u32); 6] = [
    ("Ki", 1),
    ("Mi", 2),
    ("Gi", 3),
    ("Ti", 4),
    ("Pi", 5),
    ("Ei", 6),
];

/// How a quantity renders back to text.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Format {
    /// Decimal SI suffixes (`500m`, `2`, `4G`); used for CPU.
    #[default]
    DecimalSi,
    /// Binary suffixes (`512Mi`, `4Gi`); used for byte counts.
    BinarySi,
    /// Exponent notation (`1e3`).
    DecimalExponent,
}

/// A single resource measurement.
#[derive(Debug, Clone, Copy, Default)]
pub struct Quantity {
    nanos: i128,
    format: Format,
}

impl Quantity {
    pub const fn zero() -> Self {
        Self {
            nanos: 0,
            format: Format::DecimalSi,
        }
    }

    pub fn from_nanos(nanos: i128, format: Format) -> Self {
        Self { nanos, format }
    }

    /// An amount of CPU cores, e.g. `Quantity::cores(1.5)`.
    pub fn cores(value: f64) -> Self {
        Self::from_nanos((value * 1e9).round() as i128, Format::DecimalSi)
    }

    pub fn millicores(value: i64) -> Self {
        Self::from_nanos(value as i128 * 1_000_000, Format::DecimalSi)
    }

    /// A byte count, rendered with binary suffixes.
    pub fn bytes(value: i64) -> Self {
        Self::from_nanos(value as i128 * NANOS_PER_UNIT, Format::BinarySi)
    }

    pub fn nanos(&self) -> i128 {
        self.nanos
    }

    pub fn format(&self) -> Format {
        self.format
    }

    /// Whole units, rounded up.
    pub fn value(&self) -> i64 {
        clamp_i64(ceil_div(self.nanos, NANOS_PER_UNIT))
    }

    /// Thousandths of a unit, rounded up.
    pub fn milli_value(&self) -> i64 {
        clamp_i64(ceil_div(self.nanos, 1_000_000))
    }

    pub fn is_zero(&self) -> bool {
        self.nanos == 0
    }

    pub fn add(&mut self, other: &Quantity) {
        if self.nanos == 0 {
            self.format = other.format;
        }
        self.nanos = self.nanos.saturating_add(other.nanos);
    }

    pub fn sub(&mut self, other: &Quantity) {
        self.nanos = self.nanos.saturating_sub(other.nanos);
    }
}

fn ceil_div(value: i128, divisor: i128) -> i128 {
    -((-value).div_euclid(divisor))
}

fn clamp_i64(value: i128) -> i64 {
    value.clamp(i64::MIN as i128, i64::MAX as i128) as i64
}

impl PartialEq for Quantity {
    fn eq(&self, other: &Self) -> bool {
        self.nanos == other.nanos
    }
}

impl Eq for Quantity {}

impl PartialOrd for Quantity {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Quantity {
    fn cmp(&self, other: &Self) -> Ordering {
        self.nanos.cmp(&other.nanos)
    }
}

impl Hash for Quantity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.nanos.hash(state);
    }
}

impl FromStr for Quantity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidInput(format!("invalid quantity: {:?}", s));
        let text = s.trim();

        let (negative, rest) = match text.as_bytes().first() {
            Some(b'-') => (true, &text[1..]),
            Some(b'+') => (false, &text[1..]),
            _ => (false, text),
        };

        let number_end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        let (number, suffix) = rest.split_at(number_end);
        let (int_part, frac_part) = number.split_once('.').unwrap_or((number, ""));
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(invalid());
        }
        if frac_part.contains('.') || int_part.len() + frac_part.len() > 30 {
            return Err(invalid());
        }

        let (scale, format) = suffix_scale(suffix).ok_or_else(invalid)?;
        let mantissa: i128 = format!("{int_part}{frac_part}")
            .parse()
            .map_err(|_| invalid())?;
        let denominator = 10i128.pow(frac_part.len() as u32);
        let scaled = mantissa.checked_mul(scale).ok_or_else(invalid)?;
        let nanos = ceil_div(scaled, denominator);

        Ok(Self::from_nanos(if negative { -nanos } else { nanos }, format))
    }
}

fn suffix_scale(suffix: &str) -> Option<(i128, Format)> {
    if let Some((_, scale)) = DECIMAL_SUFFIXES.iter().find(|(s, _)| *s == suffix) {
        return Some((*scale, Format::DecimalSi));
    }
    if let Some((_, power)) = BINARY_SUFFIXES.iter().find(|(s, _)| *s == suffix) {
        return Some((1024i128.pow(*power) * NANOS_PER_UNIT, Format::BinarySi));
    }
    let exponent = suffix.strip_prefix(['e', 'E'])?;
    let exponent: i32 = exponent.parse().ok()?;
    if !(-9..=27).contains(&exponent) {
        return None;
    }
    Some((10i128.pow((exponent + 9) as u32), Format::DecimalExponent))
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.nanos == 0 {
            return write!(f, "0");
        }
        let sign = if self.nanos < 0 { "-" } else { "" };
        let abs = self.nanos.abs();

        match self.format {
            Format::BinarySi if abs % NANOS_PER_UNIT == 0 => {
                let bytes = abs / NANOS_PER_UNIT;
                for (suffix, power) in BINARY_SUFFIXES.iter().rev() {
                    let factor = 1024i128.pow(*power);
                    if bytes % factor == 0 {
                        return write!(f, "{sign}{}{suffix}", bytes / factor);
                    }
                }
                write!(f, "{sign}{bytes}")
            }
            Format::DecimalExponent => {
                for exponent in (-9..=27).rev().step_by(3) {
                    let scale = 10i128.pow((exponent + 9) as u32);
                    if abs % scale == 0 {
                        return if exponent == 0 {
                            write!(f, "{sign}{}", abs / scale)
                        } else {
                            write!(f, "{sign}{}e{exponent}", abs / scale)
                        };
                    }
                }
                write!(f, "{sign}{abs}e-9")
            }
            _ => {
                for (suffix, scale) in DECIMAL_SUFFIXES {
                    if abs % scale == 0 {
                        return write!(f, "{sign}{}{suffix}", abs / scale);
                    }
                }
                write!(f, "{sign}{abs}n")
            }
        }
    }
}

impl Serialize for Quantity {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Quantity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Int(i64),
            Float(f64),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
            Raw::Int(v) => Ok(Self::from_nanos(v as i128 * NANOS_PER_UNIT, Format::DecimalSi)),
            Raw::Float(v) => Ok(Self::cores(v)),
        }
    }
}

/// Resource name to quantity mapping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Quota(BTreeMap<String, Quantity>);

impl Quota {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, name: impl Into<String>, quantity: Quantity) -> Self {
        self.0.insert(name.into(), quantity);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, quantity: Quantity) -> Option<Quantity> {
        self.0.insert(name.into(), quantity)
    }

    pub fn get(&self, name: &str) -> Option<&Quantity> {
        self.0.get(name)
    }

    pub fn get_or_zero(&self, name: &str) -> Quantity {
        self.0.get(name).copied().unwrap_or_default()
    }

    pub fn contains_key(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Quantity)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True if every present quantity is zero. An empty quota is zero.
    pub fn is_zero(&self) -> bool {
        self.0.values().all(Quantity::is_zero)
    }

    /// Adds `other` in place over the union of both key sets.
    pub fn add(&mut self, other: &Quota) {
        for (name, quantity) in &other.0 {
            self.0.entry(name.clone()).or_default().add(quantity);
        }
    }

    /// Subtracts `other` in place for the keys present in `self`.
    pub fn sub(&mut self, other: &Quota) {
        for (name, quantity) in self.0.iter_mut() {
            if let Some(y) = other.0.get(name) {
                quantity.sub(y);
            }
        }
    }

    /// Whether `self` (a limit) minus `used` leaves at least `needed` for
    /// every resource named in `self`. An all-zero limit means unmetered.
    pub fn enough(&self, used: &Quota, needed: &Quota) -> bool {
        if self.is_zero() {
            return true;
        }
        let mut headroom = self.clone();
        headroom.sub(used);
        headroom
            .0
            .iter()
            .all(|(name, free)| *free >= needed.get_or_zero(name))
    }

    /// A copy with every entry of `defaults` that `self` lacks filled in.
    pub fn with_defaults(&self, defaults: &Quota) -> Quota {
        let mut quota = self.clone();
        for (name, quantity) in &defaults.0 {
            quota.0.entry(name.clone()).or_insert(*quantity);
        }
        quota
    }

    /// Clones `self` (the defaults) and applies a worker-specific override.
    pub fn overridden(&self, with: &QuotaOverride) -> Result<Quota> {
        let mut quota = self.clone();
        let entries = [
            (LIMITS_CPU, &with.limits_cpu),
            (LIMITS_MEMORY, &with.limits_memory),
            (REQUESTS_CPU, &with.requests_cpu),
            (REQUESTS_MEMORY, &with.requests_memory),
        ];
        for (name, value) in entries {
            if let Some(value) = value.as_deref().filter(|v| !v.is_empty()) {
                quota.insert(name, value.parse()?);
            }
        }
        Ok(quota)
    }
}

impl FromIterator<(String, Quantity)> for Quota {
    fn from_iter<I: IntoIterator<Item = (String, Quantity)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Per-worker quota requirements, as supplied with an event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuotaOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits_cpu: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits_memory: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests_cpu: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests_memory: Option<String>,
}

/// Quota with zero CPU and memory limits.
pub fn zero_quota() -> Quota {
    Quota::new()
        .with(LIMITS_CPU, Quantity::zero())
        .with(LIMITS_MEMORY, Quantity::bytes(0))
}

/// Process-wide fallback: 0.5 core and 500Mi.
pub fn default_quota() -> Quota {
    Quota::new()
        .with(LIMITS_CPU, Quantity::millicores(500))
        .with(LIMITS_MEMORY, Quantity::bytes(500 * 1024 * 1024))
}

/// Limit and used snapshots of one cloud.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub limit: Quota,
    pub used: Quota,
}

impl Resource {
    pub fn new() -> Self {
        Self {
            limit: zero_quota(),
            used: zero_quota(),
        }
    }

    pub fn add(&mut self, other: &Resource) {
        self.limit.add(&other.limit);
        self.used.add(&other.used);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn q(s: &str) -> Quantity {
        s.parse().unwrap()
    }

    fn cpu(s: &str) -> Quota {
        Quota::new().with(LIMITS_CPU, q(s))
    }

    #[test]
    fn test_parse_cpu_forms() {
        assert_eq!(q("500m"), Quantity::cores(0.5));
        assert_eq!(q("0.5"), q("500m"));
        assert_eq!(q("2"), Quantity::cores(2.0));
        assert_eq!(q("1e3"), q("1k"));
        assert_eq!(q("100u").nanos(), 100_000);
    }

    #[test]
    fn test_parse_memory_forms() {
        assert_eq!(q("512Mi").value(), 512 * 1024 * 1024);
        assert_eq!(q("1Gi"), Quantity::bytes(1024 * 1024 * 1024));
        assert_eq!(q("4G").value(), 4_000_000_000);
        assert_eq!(q("1.5Gi").value(), 1536 * 1024 * 1024);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for bad in ["", "abc", "1.2.3", "5Xi", "--1", "."] {
            assert!(bad.parse::<Quantity>().is_err(), "{bad} should not parse");
        }
    }

    #[test]
    fn test_display_canonical_units() {
        assert_eq!(q("0.5").to_string(), "500m");
        assert_eq!(q("1500m").to_string(), "1500m");
        assert_eq!(q("2000m").to_string(), "2");
        assert_eq!(q("524288Ki").to_string(), "512Mi");
        assert_eq!(Quantity::bytes(1536).to_string(), "1536");
        assert_eq!(Quantity::zero().to_string(), "0");
        assert_eq!(q("-250m").to_string(), "-250m");
    }

    #[test]
    fn test_value_rounds_up() {
        assert_eq!(q("1500m").value(), 2);
        assert_eq!(q("1500m").milli_value(), 1500);
        assert_eq!(q("1n").milli_value(), 1);
    }

    #[test]
    fn test_comparison_normalizes_units() {
        assert!(q("1Gi") > q("1G"));
        assert!(q("999m") < q("1"));
        assert_eq!(q("1024Mi"), q("1Gi"));
    }

    #[test]
    fn test_serde_uses_strings() {
        let quota = Quota::new()
            .with(LIMITS_CPU, q("500m"))
            .with(LIMITS_MEMORY, q("512Mi"));
        let json = serde_json::to_string(&quota).unwrap();
        assert_eq!(json, r#"{"limits.cpu":"500m","limits.memory":"512Mi"}"#);
        let back: Quota = serde_json::from_str(&json).unwrap();
        assert_eq!(back, quota);

        let numeric: Quota = serde_json::from_str(r#"{"limits.cpu":2}"#).unwrap();
        assert_eq!(numeric.get_or_zero(LIMITS_CPU), q("2"));
    }

    #[test]
    fn test_is_zero() {
        assert!(Quota::new().is_zero());
        assert!(zero_quota().is_zero());
        assert!(!default_quota().is_zero());
        assert!(!zero_quota().with(REQUESTS_CPU, q("1m")).is_zero());
    }

    #[test]
    fn test_deep_copy_does_not_alias() {
        let original = default_quota();
        let mut copy = original.clone();
        copy.add(&cpu("1"));
        assert_eq!(original.get_or_zero(LIMITS_CPU), q("500m"));
        assert_eq!(copy.get_or_zero(LIMITS_CPU), q("1500m"));
    }

    #[test]
    fn test_enough_headroom() {
        let limit = cpu("2");
        let used = cpu("1.5");
        assert!(limit.enough(&used, &cpu("0.4")));
        assert!(limit.enough(&used, &cpu("0.5")));
        assert!(!limit.enough(&used, &cpu("0.6")));
    }

    #[test]
    fn test_enough_does_not_mutate_limit() {
        let limit = cpu("2");
        let _ = limit.enough(&cpu("1.5"), &cpu("0.4"));
        assert_eq!(limit.get_or_zero(LIMITS_CPU), q("2"));
    }

    #[test]
    fn test_enough_zero_limit_is_unmetered() {
        let limit = zero_quota();
        assert!(limit.enough(&cpu("100"), &cpu("100")));
        assert!(Quota::new().enough(&Quota::new(), &default_quota()));
    }

    #[test]
    fn test_enough_missing_keys_are_zero() {
        let limit = Quota::new()
            .with(LIMITS_CPU, q("2"))
            .with(LIMITS_MEMORY, q("4Gi"));
        // nothing used yet, nothing asked for memory
        assert!(limit.enough(&Quota::new(), &cpu("1")));
        // needed names a resource the limit does not meter
        assert!(limit.enough(&Quota::new(), &Quota::new().with("requests.storage", q("1Ti"))));
    }

    #[test]
    fn test_add_is_key_union() {
        let mut total = Quota::new().with(LIMITS_CPU, q("1"));
        total.add(&Quota::new().with(LIMITS_MEMORY, q("1Gi")));
        assert_eq!(total.get_or_zero(LIMITS_CPU), q("1"));
        assert_eq!(total.get_or_zero(LIMITS_MEMORY), q("1Gi"));
        assert_eq!(total.get(LIMITS_MEMORY).unwrap().to_string(), "1Gi");
    }

    #[test]
    fn test_with_defaults_fills_missing_only() {
        let quota = cpu("2").with_defaults(&default_quota());
        assert_eq!(quota.get_or_zero(LIMITS_CPU), q("2"));
        assert_eq!(quota.get_or_zero(LIMITS_MEMORY), q("500Mi"));
    }

    #[test]
    fn test_overridden() {
        let defaults = default_quota();
        let quota = defaults
            .overridden(&QuotaOverride {
                limits_memory: Some("2Gi".to_string()),
                requests_cpu: Some("250m".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(quota.get_or_zero(LIMITS_CPU), q("500m"));
        assert_eq!(quota.get_or_zero(LIMITS_MEMORY), q("2Gi"));
        assert_eq!(quota.get_or_zero(REQUESTS_CPU), q("250m"));
        // defaults untouched
        assert_eq!(defaults.get_or_zero(LIMITS_MEMORY), q("500Mi"));

        let bad = defaults.overridden(&QuotaOverride {
            limits_cpu: Some("lots".to_string()),
            ..Default::default()
        });
        assert!(matches!(bad, Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_resource_add() {
        let mut total = Resource::new();
        total.add(&Resource {
            limit: cpu("2"),
            used: cpu("1"),
        });
        total.add(&Resource {
            limit: cpu("4"),
            used: cpu("0.5"),
        });
        assert_eq!(total.limit.get_or_zero(LIMITS_CPU), q("6"));
        assert_eq!(total.used.get_or_zero(LIMITS_CPU), q("1.5"));
    }
}
