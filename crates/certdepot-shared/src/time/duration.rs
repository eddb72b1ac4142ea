//! This module contains a common [`Duration`] struct which is able to parse
//! human-readable duration formats, like `5s`, `24h`, `365d` or `2d12h30m`.
//! It additionally implements [`Deserialize`][serde::Deserialize] and
//! [`Serialize`][serde::Serialize], so that certificate lifetimes and expiry
//! windows can be written the same way in configuration files.
//!
//! Furthermore, it implements [`Deref`], which enables us to use all associated
//! functions of [`std::time::Duration`] without re-implementing the public
//! functions on our own type.

use std::{
    cmp::Ordering,
    fmt::Display,
    num::ParseIntError,
    ops::{Add, AddAssign, Deref, Sub, SubAssign},
    str::FromStr,
    time::SystemTime,
};

use snafu::{OptionExt, ResultExt, Snafu};
use strum::IntoEnumIterator;

#[derive(Debug, Snafu, PartialEq, Eq)]
#[snafu(module)]
pub enum DurationParseError {
    #[snafu(display("invalid input, either empty or contains non-ascii characters"))]
    InvalidInput,

    #[snafu(display("unexpected character {chr:?}"))]
    UnexpectedCharacter { chr: char },

    #[snafu(display("fragment with value {value:?} has no unit"))]
    NoUnit { value: u128 },

    #[snafu(display("invalid fragment order, {current} must be before {previous}"))]
    InvalidUnitOrdering {
        previous: DurationUnit,
        current: DurationUnit,
    },

    #[snafu(display("fragment unit {unit} was specified multiple times"))]
    DuplicateUnit { unit: DurationUnit },

    #[snafu(display("failed to parse fragment unit {unit:?}"))]
    ParseUnitError { unit: String },

    #[snafu(display("failed to parse fragment value as integer"))]
    ParseIntError { source: ParseIntError },

    #[snafu(display("fragment with value {value:?} overflows the supported duration range"))]
    Overflow { value: u128 },
}

#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct Duration(std::time::Duration);

impl FromStr for Duration {
    type Err = DurationParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        use duration_parse_error::*;
        let input = s.trim();

        // An empty or non-ascii input is invalid
        if input.is_empty() || !input.is_ascii() {
            return Err(DurationParseError::InvalidInput);
        }

        let mut chars = input.char_indices().peekable();
        let mut duration = std::time::Duration::ZERO;
        let mut last_unit = None;

        let mut take_group = |f: fn(char) -> bool| {
            let &(from, first) = chars.peek()?;
            if !f(first) {
                return None;
            }
            let mut to = from;

            while let Some((i, _)) = chars.next_if(|(_, c)| f(*c)) {
                to = i;
            }

            Some(&input[from..=to])
        };

        while let Some(value) = take_group(char::is_numeric) {
            let value = value.parse::<u128>().context(ParseIntSnafu)?;

            let Some(unit) = take_group(char::is_alphabetic) else {
                if let Some(&(_, chr)) = chars.peek() {
                    return UnexpectedCharacterSnafu { chr }.fail();
                } else {
                    return NoUnitSnafu { value }.fail();
                }
            };

            let unit = unit.parse::<DurationUnit>().ok().context(ParseUnitSnafu {
                unit: unit.to_string(),
            })?;

            // Check that the unit is smaller than the previous one, and that
            // it wasn't specified multiple times
            if let Some(last_unit) = last_unit {
                match unit.cmp(&last_unit) {
                    Ordering::Less => {
                        return InvalidUnitOrderingSnafu {
                            previous: last_unit,
                            current: unit,
                        }
                        .fail();
                    }
                    Ordering::Equal => return DuplicateUnitSnafu { unit }.fail(),
                    _ => (),
                }
            }

            let millis = value
                .checked_mul(unit.millis())
                .and_then(|millis| u64::try_from(millis).ok())
                .context(OverflowSnafu { value })?;

            duration = duration
                .checked_add(std::time::Duration::from_millis(millis))
                .context(OverflowSnafu { value })?;
            last_unit = Some(unit);
        }

        // Buffer must not contain any remaining data
        if let Some(&(_, chr)) = chars.peek() {
            return UnexpectedCharacterSnafu { chr }.fail();
        }

        Ok(Self(duration))
    }
}

impl Display for Duration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // If the inner Duration is zero, print out '0s'.
        if self.0.is_zero() {
            return write!(f, "0{}", DurationUnit::Seconds);
        }

        let mut millis = self.0.as_millis();

        for unit in DurationUnit::iter() {
            let whole = millis / unit.millis();
            let rest = millis % unit.millis();

            if whole > 0 {
                write!(f, "{whole}{unit}")?;
            }

            millis = rest;
        }

        Ok(())
    }
}

impl Deref for Duration {
    type Target = std::time::Duration;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<std::time::Duration> for Duration {
    fn from(value: std::time::Duration) -> Self {
        Self(value)
    }
}

impl From<Duration> for std::time::Duration {
    fn from(value: Duration) -> Self {
        value.0
    }
}

impl Add for Duration {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0 + rhs.0)
    }
}

impl AddAssign for Duration {
    fn add_assign(&mut self, rhs: Self) {
        self.0.add_assign(rhs.0)
    }
}

impl Sub for Duration {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self::Output {
        Self(self.0 - rhs.0)
    }
}

impl SubAssign for Duration {
    fn sub_assign(&mut self, rhs: Self) {
        self.0.sub_assign(rhs.0)
    }
}

impl Add<Duration> for SystemTime {
    type Output = SystemTime;

    fn add(self, rhs: Duration) -> Self::Output {
        self + rhs.0
    }
}

impl Duration {
    /// Creates a new [`Duration`] from the specified number of whole seconds.
    pub const fn from_secs(secs: u64) -> Self {
        Self(std::time::Duration::from_secs(secs))
    }

    /// Creates a new [`Duration`] from the specified number of whole minutes.
    ///
    /// Panics (at compile time when used in a const context) if the number
    /// of seconds overflows.
    pub const fn from_minutes_unchecked(minutes: u64) -> Self {
        Self::from_secs(minutes * 60)
    }

    /// Creates a new [`Duration`] from the specified number of whole hours.
    pub const fn from_hours_unchecked(hours: u64) -> Self {
        Self::from_minutes_unchecked(hours * 60)
    }

    /// Creates a new [`Duration`] from the specified number of whole days.
    pub const fn from_days_unchecked(days: u64) -> Self {
        Self::from_hours_unchecked(days * 24)
    }
}

/// Defines supported [`DurationUnit`]s. Each fragment consists of a numeric
/// value followed by a [`DurationUnit`]. The order of variants **MATTERS**.
/// It is the basis for the correct transformation of the
/// [`std::time::Duration`] back to a human-readable format, which is defined
/// in the [`Display`] implementation of [`Duration`].
#[derive(
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    strum::EnumString,
    strum::Display,
    strum::AsRefStr,
    strum::EnumIter,
)]
pub enum DurationUnit {
    #[strum(serialize = "d")]
    Days,

    #[strum(serialize = "h")]
    Hours,

    #[strum(serialize = "m")]
    Minutes,

    #[strum(serialize = "s")]
    Seconds,

    #[strum(serialize = "ms")]
    Milliseconds,
}

impl DurationUnit {
    /// Returns the number of whole milliseconds in each supported
    /// [`DurationUnit`].
    const fn millis(&self) -> u128 {
        match self {
            Self::Days => 24 * Self::Hours.millis(),
            Self::Hours => 60 * Self::Minutes.millis(),
            Self::Minutes => 60 * Self::Seconds.millis(),
            Self::Seconds => 1000,
            Self::Milliseconds => 1,
        }
    }
}
