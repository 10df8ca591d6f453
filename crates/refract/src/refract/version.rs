use std::fmt;

/// A release protocol number as sent in the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProtocolVersion(pub i32);

impl ProtocolVersion {
    /// Not yet known (before the handshake, or a legacy client).
    pub const UNKNOWN: Self = Self(-1);
    pub const V1_7_2: Self = Self(4);
    pub const V1_7_6: Self = Self(5);
    pub const V1_8: Self = Self(47);
    pub const V1_12_2: Self = Self(340);
    pub const V1_13: Self = Self(393);
    pub const V1_16: Self = Self(735);
    pub const V1_16_5: Self = Self(754);
    pub const V1_19: Self = Self(759);
    pub const V1_19_1: Self = Self(760);
    pub const V1_19_3: Self = Self(761);
    pub const V1_19_4: Self = Self(762);
    pub const V1_20: Self = Self(763);
    pub const V1_20_2: Self = Self(764);
    pub const V1_20_3: Self = Self(765);
    pub const V1_20_5: Self = Self(766);
    pub const V1_21: Self = Self(767);

    pub fn raw(self) -> i32 {
        self.0
    }

    pub fn name(self) -> &'static str {
        KNOWN
            .iter()
            .rev()
            .find(|(_, v)| *v == self.0)
            .map(|(n, _)| *n)
            .unwrap_or("unknown")
    }

    pub fn is_known(self) -> bool {
        KNOWN.iter().any(|(_, v)| *v == self.0)
    }

    /// Accepts "1.20.4", "v1.20.4", "1.8.x" or a raw protocol number.
    pub fn from_name_lenient(s: &str) -> Option<Self> {
        let s = s.trim().to_ascii_lowercase();
        let s = s.strip_prefix('v').unwrap_or(&s);
        if s.is_empty() {
            return None;
        }
        if let Ok(n) = s.parse::<i32>() {
            return Some(Self(n));
        }
        if let Some((_, v)) = KNOWN.iter().find(|(n, _)| *n == s) {
            return Some(Self(*v));
        }
        // "1.8.x" / "1.8-1.8.9" style ranges resolve to the first listed patch.
        let base = s
            .split(['-', ' '])
            .next()
            .unwrap_or(s)
            .trim_end_matches(".x");
        KNOWN
            .iter()
            .find(|(n, _)| *n == base)
            .map(|(_, v)| Self(*v))
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.0)
    }
}

/// Configured backend version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetVersion {
    Auto,
    Fixed(ProtocolVersion),
}

impl TargetVersion {
    pub fn parse(s: &str) -> Option<Self> {
        let t = s.trim();
        if t.is_empty() || t.eq_ignore_ascii_case("auto") || t.eq_ignore_ascii_case("auto-detect")
        {
            return Some(Self::Auto);
        }
        ProtocolVersion::from_name_lenient(t).map(Self::Fixed)
    }
}

impl fmt::Display for TargetVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetVersion::Auto => write!(f, "auto"),
            TargetVersion::Fixed(v) => write!(f, "{v}"),
        }
    }
}

const KNOWN: &[(&str, i32)] = &[
    ("1.7.2", 4),
    ("1.7.4", 4),
    ("1.7.5", 4),
    ("1.7.6", 5),
    ("1.7.10", 5),
    ("1.8", 47),
    ("1.8.9", 47),
    ("1.9", 107),
    ("1.9.4", 110),
    ("1.10", 210),
    ("1.11", 315),
    ("1.11.2", 316),
    ("1.12", 335),
    ("1.12.1", 338),
    ("1.12.2", 340),
    ("1.13", 393),
    ("1.13.1", 401),
    ("1.13.2", 404),
    ("1.14", 477),
    ("1.14.4", 498),
    ("1.15", 573),
    ("1.15.2", 578),
    ("1.16", 735),
    ("1.16.1", 736),
    ("1.16.2", 751),
    ("1.16.3", 753),
    ("1.16.4", 754),
    ("1.16.5", 754),
    ("1.17", 755),
    ("1.17.1", 756),
    ("1.18", 757),
    ("1.18.2", 758),
    ("1.19", 759),
    ("1.19.1", 760),
    ("1.19.2", 760),
    ("1.19.3", 761),
    ("1.19.4", 762),
    ("1.20", 763),
    ("1.20.1", 763),
    ("1.20.2", 764),
    ("1.20.3", 765),
    ("1.20.4", 765),
    ("1.20.5", 766),
    ("1.20.6", 766),
    ("1.21", 767),
    ("1.21.1", 767),
];
