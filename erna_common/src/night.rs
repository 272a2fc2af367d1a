//! Observation nights.
//!
//! A night is named after the calendar date on which it started, and the
//! observatory's run catalog writes it as an integer `YYYYMMDD`. We store it
//! the same way, so that ordering by the raw column orders by date.

use chrono::{Datelike, NaiveDate};
use diesel::{
    deserialize::{self, FromSql},
    serialize::{self, IsNull, Output, ToSql},
    sql_types::Integer,
    sqlite::{Sqlite, SqliteValue},
    AsExpression, FromSqlRow,
};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::{fmt, str::FromStr};

use crate::prelude::*;

/// One observing session.
#[derive(AsExpression, Clone, Copy, Debug, Eq, FromSqlRow, Hash, Ord, PartialEq, PartialOrd)]
#[diesel(sql_type = Integer)]
pub struct Night(NaiveDate);

impl Night {
    /// Wrap a calendar date.
    pub fn new(date: NaiveDate) -> Night {
        Night(date)
    }

    /// Build a night from its year, month and day.
    pub fn from_ymd(year: i32, month: u32, day: u32) -> Result<Night> {
        NaiveDate::from_ymd_opt(year, month, day)
            .map(Night)
            .ok_or_else(|| format_err!("invalid night {:04}-{:02}-{:02}", year, month, day))
    }

    /// Parse an integer of the form `YYYYMMDD`.
    pub fn from_int(night: i32) -> Result<Night> {
        if night <= 0 {
            return Err(format_err!("invalid night {}", night));
        }
        let (year, month, day) = (night / 10000, (night % 10000) / 100, night % 100);
        Night::from_ymd(year, cast::u32(month)?, cast::u32(day)?)
            .with_context(|| format!("invalid night {}", night))
    }

    /// The integer `YYYYMMDD` form of this night.
    pub fn as_int(self) -> i32 {
        self.0.year() * 10000 + self.0.month() as i32 * 100 + self.0.day() as i32
    }

    /// The calendar date on which this night started.
    pub fn date(self) -> NaiveDate {
        self.0
    }

    /// The `YYYY/MM/DD` directory fragment used by the raw data archive.
    pub fn directory(self) -> PathBuf {
        PathBuf::from(format!("{:04}", self.0.year()))
            .join(format!("{:02}", self.0.month()))
            .join(format!("{:02}", self.0.day()))
    }
}

impl fmt::Display for Night {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08}", self.as_int())
    }
}

impl FromStr for Night {
    type Err = Error;

    fn from_str(s: &str) -> Result<Night> {
        let night = s
            .trim()
            .parse::<i32>()
            .with_context(|| format!("cannot parse night {:?}", s))?;
        Night::from_int(night)
    }
}

impl Serialize for Night {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i32(self.as_int())
    }
}

impl<'de> Deserialize<'de> for Night {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Night, D::Error> {
        let night = i32::deserialize(deserializer)?;
        Night::from_int(night).map_err(de::Error::custom)
    }
}

impl ToSql<Integer, Sqlite> for Night {
    fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, Sqlite>) -> serialize::Result {
        out.set_value(self.as_int());
        Ok(IsNull::No)
    }
}

impl FromSql<Integer, Sqlite> for Night {
    fn from_sql(bytes: SqliteValue<'_, '_, '_>) -> deserialize::Result<Self> {
        let night = <i32 as FromSql<Integer, Sqlite>>::from_sql(bytes)?;
        Night::from_int(night).map_err(|err| err.to_string().into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn night_round_trips_through_its_integer_form() {
        let night = Night::from_int(20230101).unwrap();
        assert_eq!(night.date(), NaiveDate::from_ymd_opt(2023, 1, 1).unwrap());
        assert_eq!(night.as_int(), 20230101);
        assert_eq!(night.to_string(), "20230101");
    }

    #[test]
    fn invalid_nights_are_rejected() {
        assert!(Night::from_int(20231301).is_err());
        assert!(Night::from_int(20230230).is_err());
        assert!(Night::from_int(0).is_err());
        assert!("2023-01-01".parse::<Night>().is_err());
    }

    #[test]
    fn directory_uses_zero_padded_components() {
        let night = Night::from_int(20130102).unwrap();
        assert_eq!(night.directory(), PathBuf::from("2013/01/02"));
    }

    #[test]
    fn nights_order_like_dates() {
        let earlier = Night::from_int(20221231).unwrap();
        let later = Night::from_int(20230101).unwrap();
        assert!(earlier < later);
        assert!(earlier.as_int() < later.as_int());
    }
}
