//! Rate limit strings and their structured form.
//!
//! A rate limit string looks like `100 per hour`, `10/minute` or
//! `5 per 30 seconds`. Several limits may be combined in one string using
//! `;`, `,` or `|` as separators.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LimiterError, Result};

/// Characters accepted between limits in a combined rate string.
pub(crate) const SEPARATORS: [char; 3] = [';', ',', '|'];

/// Longest period a rate limit may span: one thousand years.
pub const MAX_PERIOD: Duration = Duration::from_secs(1000 * 12 * 30 * 86400);

/// Time granularity of a rate limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Second,
    Minute,
    Hour,
    Day,
    /// Thirty days
    Month,
    /// Twelve months
    Year,
}

impl Granularity {
    /// Length of one unit in seconds.
    pub fn seconds(&self) -> u64 {
        match self {
            Granularity::Second => 1,
            Granularity::Minute => 60,
            Granularity::Hour => 3600,
            Granularity::Day => 86400,
            Granularity::Month => 30 * 86400,
            Granularity::Year => 12 * 30 * 86400,
        }
    }

    /// Lowercase name used in rate strings and counter keys.
    pub fn name(&self) -> &'static str {
        match self {
            Granularity::Second => "second",
            Granularity::Minute => "minute",
            Granularity::Hour => "hour",
            Granularity::Day => "day",
            Granularity::Month => "month",
            Granularity::Year => "year",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        let singular = name.strip_suffix('s').unwrap_or(name);
        match singular {
            "second" => Some(Granularity::Second),
            "minute" => Some(Granularity::Minute),
            "hour" => Some(Granularity::Hour),
            "day" => Some(Granularity::Day),
            "month" => Some(Granularity::Month),
            "year" => Some(Granularity::Year),
            _ => None,
        }
    }
}

/// A single parsed rate limit: `amount` hits per `multiples` x `granularity`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RateLimitItem {
    /// Hits allowed within one period
    pub amount: u64,
    /// Number of granularity units making up one period
    pub multiples: u64,
    /// The unit of the period
    pub granularity: Granularity,
}

impl RateLimitItem {
    /// Create a new rate limit item.
    pub fn new(amount: u64, multiples: u64, granularity: Granularity) -> Self {
        Self {
            amount,
            multiples,
            granularity,
        }
    }

    /// Length of the limit's period.
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.multiples.saturating_mul(self.granularity.seconds()))
    }

    /// Storage key for this limit tracked against `key` within `scope`.
    pub fn counter_key(&self, key: &str, scope: &str) -> String {
        format!(
            "LIMITER/{}/{}/{}/{}/{}",
            key,
            scope,
            self.amount,
            self.multiples,
            self.granularity.name()
        )
    }
}

impl fmt::Display for RateLimitItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} per {} {}",
            self.amount,
            self.multiples,
            self.granularity.name()
        )
    }
}

impl FromStr for RateLimitItem {
    type Err = LimiterError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || LimiterError::RuleParse(format!("couldn't parse rate limit string '{}'", s.trim()));

        let text = s.trim().to_ascii_lowercase();
        let (amount, rest) = split_number(&text);
        let amount: u64 = amount.parse().map_err(|_| invalid())?;

        let rest = rest.trim_start();
        let rest = rest
            .strip_prefix('/')
            .or_else(|| rest.strip_prefix("per"))
            .ok_or_else(invalid)?
            .trim_start();

        let (multiples, rest) = split_number(rest);
        let granularity = Granularity::from_name(rest.trim()).ok_or_else(invalid)?;
        let multiples: u64 = match multiples {
            "" => 1,
            digits => digits.parse().map_err(|_| invalid())?,
        };
        if multiples == 0 {
            return Err(LimiterError::RuleParse(format!(
                "rate limit '{}' has an empty period",
                s.trim()
            )));
        }

        let within_bounds = multiples
            .checked_mul(granularity.seconds())
            .is_some_and(|secs| secs <= MAX_PERIOD.as_secs());
        if !within_bounds {
            return Err(LimiterError::RuleParse(format!(
                "rate limit '{}' spans more than {} years",
                s.trim(),
                MAX_PERIOD.as_secs() / Granularity::Year.seconds()
            )));
        }

        Ok(Self::new(amount, multiples, granularity))
    }
}

/// Split the leading decimal digits off `text`.
fn split_number(text: &str) -> (&str, &str) {
    let end = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    text.split_at(end)
}

/// Parse a combined rate string into its individual limits, in written order.
///
/// Fails if any component is malformed or the string holds no limits at all.
pub fn parse_many(limits: &str) -> Result<Vec<RateLimitItem>> {
    let items = limits
        .split(&SEPARATORS[..])
        .filter(|part| !part.trim().is_empty())
        .map(RateLimitItem::from_str)
        .collect::<Result<Vec<_>>>()?;

    if items.is_empty() {
        return Err(LimiterError::RuleParse(format!(
            "no rate limits found in '{}'",
            limits
        )));
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_per_form() {
        let item: RateLimitItem = "100 per hour".parse().unwrap();
        assert_eq!(item, RateLimitItem::new(100, 1, Granularity::Hour));
    }

    #[test]
    fn test_parse_slash_form() {
        let item: RateLimitItem = "10/minute".parse().unwrap();
        assert_eq!(item, RateLimitItem::new(10, 1, Granularity::Minute));
    }

    #[test]
    fn test_parse_multiples_and_plural() {
        let item: RateLimitItem = "5 per 30 Seconds".parse().unwrap();
        assert_eq!(item, RateLimitItem::new(5, 30, Granularity::Second));
        assert_eq!(item.period(), Duration::from_secs(30));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("".parse::<RateLimitItem>().is_err());
        assert!("per hour".parse::<RateLimitItem>().is_err());
        assert!("10 per fortnight".parse::<RateLimitItem>().is_err());
        assert!("10 hour".parse::<RateLimitItem>().is_err());
    }

    #[test]
    fn test_parse_rejects_empty_and_oversized_periods() {
        assert!(matches!(
            "1 per 0 hours".parse::<RateLimitItem>(),
            Err(LimiterError::RuleParse(_))
        ));
        assert!(matches!(
            "1 per 1000000000000 years".parse::<RateLimitItem>(),
            Err(LimiterError::RuleParse(_))
        ));
        assert!(matches!(
            "1 per 99999999999999999999 seconds".parse::<RateLimitItem>(),
            Err(LimiterError::RuleParse(_))
        ));

        let longest: RateLimitItem = "1 per 1000 years".parse().unwrap();
        assert_eq!(longest.period(), MAX_PERIOD);
    }

    #[test]
    fn test_parse_many_keeps_written_order() {
        let items = parse_many("100 per hour;10/minute").unwrap();
        assert_eq!(
            items,
            vec![
                RateLimitItem::new(100, 1, Granularity::Hour),
                RateLimitItem::new(10, 1, Granularity::Minute),
            ]
        );
    }

    #[test]
    fn test_parse_many_mixed_separators() {
        let items = parse_many("1 per second, 10 per day | 100/year").unwrap();
        assert_eq!(items.len(), 3);
        assert_eq!(items[2].granularity, Granularity::Year);
    }

    #[test]
    fn test_parse_many_fails_on_any_bad_part() {
        assert!(parse_many("1 per hour; bogus").is_err());
        assert!(parse_many(" ; ").is_err());
    }

    #[test]
    fn test_display() {
        let item: RateLimitItem = "1/day".parse().unwrap();
        assert_eq!(item.to_string(), "1 per 1 day");
    }

    #[test]
    fn test_granularity_seconds() {
        assert_eq!(Granularity::Second.seconds(), 1);
        assert_eq!(Granularity::Minute.seconds(), 60);
        assert_eq!(Granularity::Hour.seconds(), 3600);
        assert_eq!(Granularity::Day.seconds(), 86400);
        assert_eq!(Granularity::Month.seconds(), 2_592_000);
    }

    #[test]
    fn test_counter_key() {
        let item = RateLimitItem::new(10, 1, Granularity::Minute);
        assert_eq!(
            item.counter_key("127.0.0.1", "app::t1"),
            "LIMITER/127.0.0.1/app::t1/10/1/minute"
        );
    }
}
