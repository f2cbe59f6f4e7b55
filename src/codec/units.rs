//! Dimensional units packed into the protocol's 32-bit unit word.
//!
//! Each of the space, time and count dimensions carries a signed 4-bit
//! exponent and a 4-bit scale code.

use crate::core::error::{MmvError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const MIN_EXPONENT: i8 = -8;
const MAX_EXPONENT: i8 = 7;
const MAX_COUNT_SCALE: i8 = 7;

/// Space scales, powers of 1024
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpaceScale {
    #[default]
    Byte = 0,
    Kilobyte = 1,
    Megabyte = 2,
    Gigabyte = 3,
    Terabyte = 4,
    Petabyte = 5,
    Exabyte = 6,
}

/// Time scales
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeScale {
    #[default]
    Nanosecond = 0,
    Microsecond = 1,
    Millisecond = 2,
    Second = 3,
    Minute = 4,
    Hour = 5,
}

impl SpaceScale {
    fn from_code(code: u32) -> Option<Self> {
        [
            SpaceScale::Byte,
            SpaceScale::Kilobyte,
            SpaceScale::Megabyte,
            SpaceScale::Gigabyte,
            SpaceScale::Terabyte,
            SpaceScale::Petabyte,
            SpaceScale::Exabyte,
        ]
        .get(code as usize)
        .copied()
    }

    fn symbol(self) -> &'static str {
        match self {
            SpaceScale::Byte => "byte",
            SpaceScale::Kilobyte => "Kbyte",
            SpaceScale::Megabyte => "Mbyte",
            SpaceScale::Gigabyte => "Gbyte",
            SpaceScale::Terabyte => "Tbyte",
            SpaceScale::Petabyte => "Pbyte",
            SpaceScale::Exabyte => "Ebyte",
        }
    }
}

impl TimeScale {
    fn from_code(code: u32) -> Option<Self> {
        [
            TimeScale::Nanosecond,
            TimeScale::Microsecond,
            TimeScale::Millisecond,
            TimeScale::Second,
            TimeScale::Minute,
            TimeScale::Hour,
        ]
        .get(code as usize)
        .copied()
    }

    fn symbol(self) -> &'static str {
        match self {
            TimeScale::Nanosecond => "nanosec",
            TimeScale::Microsecond => "microsec",
            TimeScale::Millisecond => "millisec",
            TimeScale::Second => "sec",
            TimeScale::Minute => "min",
            TimeScale::Hour => "hour",
        }
    }
}

/// Compound unit such as bytes per second (space¹ time⁻¹)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Unit {
    dim_space: i8,
    dim_time: i8,
    dim_count: i8,
    scale_space: SpaceScale,
    scale_time: TimeScale,
    scale_count: i8,
}

impl Unit {
    /// Dimensionless
    pub const fn none() -> Self {
        Self {
            dim_space: 0,
            dim_time: 0,
            dim_count: 0,
            scale_space: SpaceScale::Byte,
            scale_time: TimeScale::Nanosecond,
            scale_count: 0,
        }
    }

    /// Space¹ at `scale`
    pub const fn space(scale: SpaceScale) -> Self {
        let mut unit = Self::none();
        unit.dim_space = 1;
        unit.scale_space = scale;
        unit
    }

    /// Time¹ at `scale`
    pub const fn time(scale: TimeScale) -> Self {
        let mut unit = Self::none();
        unit.dim_time = 1;
        unit.scale_time = scale;
        unit
    }

    /// Count¹ scaled by `10^power`
    pub fn count_scaled(power: i8) -> Result<Self> {
        if !(0..=MAX_COUNT_SCALE).contains(&power) {
            return Err(MmvError::unmappable(
                format!("count x 10^{}", power),
                "count scale must be between 10^0 and 10^7",
            ));
        }
        let mut unit = Self::none();
        unit.dim_count = 1;
        unit.scale_count = power;
        Ok(unit)
    }

    /// Count¹
    pub const fn count() -> Self {
        let mut unit = Self::none();
        unit.dim_count = 1;
        unit
    }

    /// Bytes
    pub const fn bytes() -> Self {
        Self::space(SpaceScale::Byte)
    }

    /// Product of two units
    pub fn times(self, other: Unit) -> Result<Self> {
        self.combine(other, 1)
    }

    /// Quotient of two units
    pub fn per(self, other: Unit) -> Result<Self> {
        self.combine(other, -1)
    }

    /// Raises every dimension to `power`
    pub fn pow(self, power: i8) -> Result<Self> {
        let mut result = Self::none();
        for _ in 0..power.unsigned_abs() {
            result = result.combine(self, power.signum())?;
        }
        Ok(result)
    }

    /// Exponents as (space, time, count)
    pub fn exponents(&self) -> (i8, i8, i8) {
        (self.dim_space, self.dim_time, self.dim_count)
    }

    /// True when no dimension is present
    pub fn is_dimensionless(&self) -> bool {
        self.exponents() == (0, 0, 0)
    }

    fn combine(self, other: Unit, sign: i8) -> Result<Self> {
        let mut unit = self;

        if other.dim_space != 0 {
            if unit.dim_space != 0 && unit.scale_space != other.scale_space {
                return Err(MmvError::unmappable(
                    format!("{} * {}", self, other),
                    "space appears at two different scales",
                ));
            }
            unit.dim_space = checked_exponent(unit.dim_space, other.dim_space * sign, &self, &other)?;
            unit.scale_space = other.scale_space;
        }
        if other.dim_time != 0 {
            if unit.dim_time != 0 && unit.scale_time != other.scale_time {
                return Err(MmvError::unmappable(
                    format!("{} * {}", self, other),
                    "time appears at two different scales",
                ));
            }
            unit.dim_time = checked_exponent(unit.dim_time, other.dim_time * sign, &self, &other)?;
            unit.scale_time = other.scale_time;
        }
        if other.dim_count != 0 {
            if unit.dim_count != 0 && unit.scale_count != other.scale_count {
                return Err(MmvError::unmappable(
                    format!("{} * {}", self, other),
                    "count appears at two different scales",
                ));
            }
            unit.dim_count = checked_exponent(unit.dim_count, other.dim_count * sign, &self, &other)?;
            unit.scale_count = other.scale_count;
        }

        // A cancelled dimension carries no scale
        if unit.dim_space == 0 {
            unit.scale_space = SpaceScale::Byte;
        }
        if unit.dim_time == 0 {
            unit.scale_time = TimeScale::Nanosecond;
        }
        if unit.dim_count == 0 {
            unit.scale_count = 0;
        }
        Ok(unit)
    }

    /// Packed unit word
    pub fn pack(&self) -> u32 {
        let nibble = |v: i8| (v as u32) & 0xF;
        nibble(self.dim_space) << 28
            | nibble(self.dim_time) << 24
            | nibble(self.dim_count) << 20
            | (self.scale_space as u32) << 16
            | (self.scale_time as u32) << 12
            | nibble(self.scale_count) << 8
    }

    /// Inverse of [`Unit::pack`]
    pub fn unpack(word: u32) -> Result<Self> {
        let signed = |shift: u32| (((word >> shift) & 0xF) as i8) << 4 >> 4;
        let space_code = (word >> 16) & 0xF;
        let time_code = (word >> 12) & 0xF;

        Ok(Self {
            dim_space: signed(28),
            dim_time: signed(24),
            dim_count: signed(20),
            scale_space: SpaceScale::from_code(space_code)
                .ok_or_else(|| MmvError::corrupt(format!("space scale {}", space_code)))?,
            scale_time: TimeScale::from_code(time_code)
                .ok_or_else(|| MmvError::corrupt(format!("time scale {}", time_code)))?,
            scale_count: signed(8),
        })
    }

    /// Parses a compound expression such as `bytes/second` or `KiB/s`
    pub fn parse(expression: &str) -> Result<Self> {
        let normalized = expression.trim().replace(" per ", "/");
        if normalized.is_empty() || normalized.eq_ignore_ascii_case("none") {
            return Ok(Self::none());
        }

        let mut unit = Self::none();
        let mut sign = 1i8;
        let mut term = String::new();

        for ch in normalized.chars().chain(std::iter::once('\0')) {
            match ch {
                '/' | '*' | '·' | '\0' => {
                    let parsed = parse_term(term.trim(), expression)?;
                    unit = unit.combine(parsed, sign)?;
                    term.clear();
                    sign = if ch == '/' { -1 } else { 1 };
                },
                _ => term.push(ch),
            }
        }
        Ok(unit)
    }
}

impl FromStr for Unit {
    type Err = MmvError;

    fn from_str(s: &str) -> Result<Self> {
        Unit::parse(s)
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_dimensionless() {
            return f.write_str("none");
        }

        let count = if self.scale_count == 0 {
            "count".to_string()
        } else {
            format!("count x 10^{}", self.scale_count)
        };
        let parts = [
            (self.dim_space, self.scale_space.symbol().to_string()),
            (self.dim_time, self.scale_time.symbol().to_string()),
            (self.dim_count, count),
        ];

        let render = |positive: bool| {
            parts
                .iter()
                .filter(|(dim, _)| if positive { *dim > 0 } else { *dim < 0 })
                .map(|(dim, name)| match dim.abs() {
                    1 => name.clone(),
                    n => format!("{}^{}", name, n),
                })
                .collect::<Vec<_>>()
                .join(" * ")
        };

        let numerator = render(true);
        let denominator = render(false);
        match (numerator.is_empty(), denominator.is_empty()) {
            (false, true) => f.write_str(&numerator),
            (true, false) => write!(f, "1 / {}", denominator),
            _ => write!(f, "{} / {}", numerator, denominator),
        }
    }
}

fn checked_exponent(current: i8, delta: i8, left: &Unit, right: &Unit) -> Result<i8> {
    let exponent = current + delta;
    if !(MIN_EXPONENT..=MAX_EXPONENT).contains(&exponent) {
        return Err(MmvError::unmappable(
            format!("{} * {}", left, right),
            format!("exponent {} outside {}..={}", exponent, MIN_EXPONENT, MAX_EXPONENT),
        ));
    }
    Ok(exponent)
}

fn parse_term(term: &str, expression: &str) -> Result<Unit> {
    let (atom, power) = match term.split_once('^') {
        Some((atom, power)) => {
            let power: i8 = power.trim().parse().map_err(|_| {
                MmvError::unmappable(expression, format!("bad exponent in '{}'", term))
            })?;
            (atom.trim(), power)
        },
        None => (term, 1),
    };

    if !(MIN_EXPONENT..=MAX_EXPONENT).contains(&power) {
        return Err(MmvError::unmappable(
            expression,
            format!("exponent {} outside {}..={}", power, MIN_EXPONENT, MAX_EXPONENT),
        ));
    }
    parse_atom(atom, expression)?.pow(power)
}

fn parse_atom(atom: &str, expression: &str) -> Result<Unit> {
    // Case matters for the short symbols: "B" is a byte, "b" is a bit
    let unit = match atom {
        "" => return Err(MmvError::unmappable(expression, "empty unit component")),
        "1" => Unit::none(),
        "B" => Unit::bytes(),
        "KB" | "kB" | "KiB" => Unit::space(SpaceScale::Kilobyte),
        "MB" | "MiB" => Unit::space(SpaceScale::Megabyte),
        "GB" | "GiB" => Unit::space(SpaceScale::Gigabyte),
        "TB" | "TiB" => Unit::space(SpaceScale::Terabyte),
        "PB" | "PiB" => Unit::space(SpaceScale::Petabyte),
        "EB" | "EiB" => Unit::space(SpaceScale::Exabyte),
        "b" | "kb" | "Kb" | "Mb" | "Gb" | "kbit" | "Mbit" | "Gbit" => {
            return Err(MmvError::unmappable(expression, format!("'{}' has no byte-based scale", atom)))
        },
        "s" => Unit::time(TimeScale::Second),
        "h" => Unit::time(TimeScale::Hour),
        "d" => {
            return Err(MmvError::unmappable(expression, "days have no representable time scale"))
        },
        _ => match atom.to_ascii_lowercase().as_str() {
            "byte" | "bytes" => Unit::bytes(),
            "kilobyte" | "kilobytes" | "kibibyte" | "kibibytes" => Unit::space(SpaceScale::Kilobyte),
            "megabyte" | "megabytes" | "mebibyte" | "mebibytes" => Unit::space(SpaceScale::Megabyte),
            "gigabyte" | "gigabytes" | "gibibyte" | "gibibytes" => Unit::space(SpaceScale::Gigabyte),
            "terabyte" | "terabytes" => Unit::space(SpaceScale::Terabyte),
            "petabyte" | "petabytes" => Unit::space(SpaceScale::Petabyte),
            "exabyte" | "exabytes" => Unit::space(SpaceScale::Exabyte),
            "ns" | "nsec" | "nanosecond" | "nanoseconds" => Unit::time(TimeScale::Nanosecond),
            "us" | "µs" | "usec" | "microsecond" | "microseconds" => Unit::time(TimeScale::Microsecond),
            "ms" | "msec" | "millisecond" | "milliseconds" => Unit::time(TimeScale::Millisecond),
            "sec" | "secs" | "second" | "seconds" => Unit::time(TimeScale::Second),
            "min" | "mins" | "minute" | "minutes" => Unit::time(TimeScale::Minute),
            "hr" | "hrs" | "hour" | "hours" => Unit::time(TimeScale::Hour),
            "count" | "counts" | "one" | "ops" | "events" | "calls" | "requests" => Unit::count(),
            "ten" | "tens" => Unit::count_scaled(1)?,
            "hundred" | "hundreds" => Unit::count_scaled(2)?,
            "thousand" | "thousands" => Unit::count_scaled(3)?,
            "million" | "millions" => Unit::count_scaled(6)?,
            "bit" | "bits" => {
                return Err(MmvError::unmappable(expression, "bits have no byte-based scale"))
            },
            "day" | "days" | "week" | "weeks" => {
                return Err(MmvError::unmappable(
                    expression,
                    format!("'{}' has no representable time scale", atom),
                ))
            },
            _ => {
                return Err(MmvError::unmappable(
                    expression,
                    format!("unknown unit component '{}'", atom),
                ))
            },
        },
    };
    Ok(unit)
}
