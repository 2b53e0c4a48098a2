//! Kernel version strings: `MAJOR.MINOR.PATCH[-suffix]`.
//!
//! Ordering: the numeric triple first, then "no suffix" before "suffix",
//! then suffix components (split on `-`) compared with digit runs taken as
//! numbers, so `5.10.0` > `5.9.0` and `r10` > `r9`.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

#[derive(Debug, Clone)]
pub struct KernelVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    pub suffix: Option<String>,
}

impl KernelVersion {
    /// The numeric part without suffix, e.g. `3.9.11` for `3.9.11-gentoo-r1`.
    pub fn triple(&self) -> String {
        format!("{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for KernelVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ver, suffix) = match s.split_once('-') {
            Some((v, rest)) => (v, Some(rest.to_string())),
            None => (s, None),
        };
        let parts: Vec<&str> = ver.split('.').collect();
        if parts.len() != 3 {
            return Err(Error::config(format!(
                "invalid kernel version \"{}\": expected MAJOR.MINOR.PATCH",
                s
            )));
        }
        let num = |p: &str| {
            p.parse::<u32>()
                .map_err(|_| Error::config(format!("invalid kernel version \"{}\"", s)))
        };
        if suffix.as_deref() == Some("") {
            return Err(Error::config(format!(
                "invalid kernel version \"{}\": empty suffix",
                s
            )));
        }
        Ok(Self {
            major: num(parts[0])?,
            minor: num(parts[1])?,
            patch: num(parts[2])?,
            suffix,
        })
    }
}

impl fmt::Display for KernelVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.triple())?;
        if let Some(suffix) = &self.suffix {
            write!(f, "-{}", suffix)?;
        }
        Ok(())
    }
}

impl Ord for KernelVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch)
            .cmp(&(other.major, other.minor, other.patch))
            .then_with(|| match (&self.suffix, &other.suffix) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (Some(a), Some(b)) => compare_suffix(a, b),
            })
    }
}

impl PartialEq for KernelVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for KernelVersion {}

impl PartialOrd for KernelVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

fn compare_suffix(a: &str, b: &str) -> Ordering {
    let mut left = a.split('-');
    let mut right = b.split('-');
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => match natural_cmp(x, y) {
                Ordering::Equal => continue,
                other => return other,
            },
        }
    }
}

/// Compare two strings treating runs of ASCII digits as numbers.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let mut a = a.as_bytes();
    let mut b = b.as_bytes();
    loop {
        match (a.first(), b.first()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) if x.is_ascii_digit() && y.is_ascii_digit() => {
                let la = a.iter().take_while(|c| c.is_ascii_digit()).count();
                let lb = b.iter().take_while(|c| c.is_ascii_digit()).count();
                let (da, db) = (trim_zeros(&a[..la]), trim_zeros(&b[..lb]));
                let ord = da.len().cmp(&db.len()).then_with(|| da.cmp(db));
                if ord != Ordering::Equal {
                    return ord;
                }
                a = &a[la..];
                b = &b[lb..];
            }
            (Some(x), Some(y)) => {
                if x != y {
                    return x.cmp(y);
                }
                a = &a[1..];
                b = &b[1..];
            }
        }
    }
}

fn trim_zeros(digits: &[u8]) -> &[u8] {
    let start = digits.iter().take_while(|c| **c == b'0').count();
    &digits[start..]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> KernelVersion {
        s.parse().unwrap()
    }

    #[test]
    fn parses_triple_and_suffix() {
        let ver = v("3.9.11-gentoo-r1");
        assert_eq!((ver.major, ver.minor, ver.patch), (3, 9, 11));
        assert_eq!(ver.suffix.as_deref(), Some("gentoo-r1"));
        assert_eq!(ver.triple(), "3.9.11");
        assert_eq!(ver.to_string(), "3.9.11-gentoo-r1");
    }

    #[test]
    fn rejects_malformed() {
        assert!("5.10".parse::<KernelVersion>().is_err());
        assert!("5.x.0".parse::<KernelVersion>().is_err());
        assert!("5.10.0-".parse::<KernelVersion>().is_err());
    }

    #[test]
    fn numeric_components_beat_lexical_order() {
        assert!(v("5.10.0") > v("5.9.0"));
        assert!(v("3.10.7-gentoo") > v("3.9.11-gentoo-r1"));
    }

    #[test]
    fn suffix_rules() {
        assert!(v("5.10.0-r1") > v("5.10.0"));
        assert!(v("5.10.0-r10") > v("5.10.0-r9"));
        assert!(v("5.10.0-gentoo-r1") > v("5.10.0-gentoo"));
        assert_eq!(v("5.10.0-r01"), v("5.10.0-r1"));
    }
}
