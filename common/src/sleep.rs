use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepPlan {
    Timed(Duration),
    /// No timer wakeup; only a reset brings the device back.
    Indefinite,
}

impl SleepPlan {
    pub fn from_micros(micros: i64) -> Self {
        if micros > 0 {
            Self::Timed(Duration::from_micros(micros as u64))
        } else {
            Self::Indefinite
        }
    }

    pub fn as_micros(self) -> u64 {
        match self {
            Self::Timed(duration) => duration.as_micros().try_into().unwrap_or(u64::MAX),
            Self::Indefinite => 0,
        }
    }
}

/// Parses the refresh field the way C `atoi` reads it: leading whitespace,
/// an optional sign, then as many digits as follow. Anything else is 0.
/// Overflow saturates instead of wrapping.
pub fn parse_refresh_micros(raw: &str) -> i64 {
    let mut chars = raw
        .trim_start_matches(|c: char| c.is_ascii_whitespace() || c == '\x0b')
        .chars()
        .peekable();

    let negative = match chars.peek() {
        Some('-') => {
            chars.next();
            true
        }
        Some('+') => {
            chars.next();
            false
        }
        _ => false,
    };

    let mut value: i64 = 0;
    for digit in chars.map_while(|c| c.to_digit(10)) {
        value = value.saturating_mul(10).saturating_add(i64::from(digit));
    }

    if negative {
        -value
    } else {
        value
    }
}
