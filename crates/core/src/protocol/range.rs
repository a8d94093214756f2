use std::fmt;

use rtsp_types::headers::{self, NptRange, NptTime, SmpteTime, SmpteType, UtcRange, UtcTime};

use crate::error::{ParseErrorKind, Result, RtspError};

/// Time format of a `Range` header (RFC 2326 §3.5–3.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RangeUnit {
    #[default]
    Npt,
    Smpte,
    Smpte30Drop,
    Smpte25,
    Clock,
}

impl RangeUnit {
    pub fn as_str(self) -> &'static str {
        match self {
            RangeUnit::Npt => "npt",
            RangeUnit::Smpte => "smpte",
            RangeUnit::Smpte30Drop => "smpte-30-drop",
            RangeUnit::Smpte25 => "smpte-25",
            RangeUnit::Clock => "clock",
        }
    }

    /// Matches the unit names accepted in `Range` and `Accept-Ranges`.
    pub fn from_token(token: &str) -> Option<Self> {
        Some(match token.trim() {
            "npt" => RangeUnit::Npt,
            "smpte" => RangeUnit::Smpte,
            "smpte-30-drop" => RangeUnit::Smpte30Drop,
            "smpte-25" => RangeUnit::Smpte25,
            "clock" => RangeUnit::Clock,
            _ => return None,
        })
    }

    fn from_smpte_type(ty: &SmpteType) -> Option<Self> {
        match ty {
            SmpteType::Smpte => Some(RangeUnit::Smpte),
            SmpteType::Smpte30Drop => Some(RangeUnit::Smpte30Drop),
            SmpteType::Smpte25 => Some(RangeUnit::Smpte25),
            SmpteType::Other(_) => None,
        }
    }

    fn frame_rate(self) -> f64 {
        match self {
            RangeUnit::Smpte25 => 25.0,
            RangeUnit::Smpte30Drop => 29.97,
            _ => 30.0,
        }
    }
}

/// One end of a range.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TimeValue {
    /// Seconds from the start of the presentation, or seconds since the
    /// Unix epoch for `clock` ranges.
    Seconds(f64),
    /// `npt=now`.
    Now,
    /// The end was left open.
    End,
}

/// A parsed `Range` header value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeRange {
    pub unit: RangeUnit,
    pub min: TimeValue,
    pub max: TimeValue,
}

impl TimeRange {
    pub fn npt(min: TimeValue, max: TimeValue) -> Self {
        TimeRange {
            unit: RangeUnit::Npt,
            min,
            max,
        }
    }

    /// Parse a `Range` header value.
    ///
    /// ```
    /// use rtsp::protocol::{RangeUnit, TimeRange, TimeValue};
    ///
    /// let r = TimeRange::parse("npt=10.5-").unwrap();
    /// assert_eq!(r.min, TimeValue::Seconds(10.5));
    /// assert!(r.is_open_end());
    ///
    /// let r = TimeRange::parse("npt=now-").unwrap();
    /// assert_eq!(r.min, TimeValue::Now);
    ///
    /// let r = TimeRange::parse("smpte-25=0:00:01:25-").unwrap();
    /// assert_eq!(r.unit, RangeUnit::Smpte25);
    /// assert_eq!(r.min, TimeValue::Seconds(2.0));
    ///
    /// assert!(TimeRange::parse("npt=abc-").is_err());
    /// ```
    pub fn parse(value: &str) -> Result<Self> {
        let bad = || RtspError::parse(ParseErrorKind::InvalidRange);
        // a `;time=` suffix is allowed after the range
        let value = value.split(';').next().unwrap_or_default().trim();

        // `SmpteRange::from_str` wants a doubled `=`, so SMPTE ends are
        // parsed one at a time
        if value.starts_with("smpte") {
            let (ty, times) = value.split_once('=').ok_or_else(bad)?;
            let ty: SmpteType = ty.parse().map_err(|_| bad())?;
            let unit = RangeUnit::from_smpte_type(&ty).ok_or_else(bad)?;
            let (min, max) = times.split_once('-').ok_or_else(bad)?;
            let end = |s: &str| -> Result<TimeValue> {
                if s.is_empty() {
                    return Ok(TimeValue::End);
                }
                let time: SmpteTime = s.parse().map_err(|_| bad())?;
                Ok(TimeValue::Seconds(smpte_seconds(&time, unit.frame_rate())))
            };
            return TimeRange {
                unit,
                min: end(min.trim())?,
                max: end(max.trim())?,
            }
            .checked();
        }

        let range: headers::Range = value.parse().map_err(|_| bad())?;
        let range = match range {
            headers::Range::Npt(npt) => {
                let (min, max) = match npt {
                    NptRange::Empty => return Err(bad()),
                    NptRange::From(from) => (Some(from), None),
                    NptRange::FromTo(from, to) => (Some(from), Some(to)),
                    NptRange::To(to) => (None, Some(to)),
                };
                TimeRange::npt(
                    min.map_or(TimeValue::End, npt_value),
                    max.map_or(TimeValue::End, npt_value),
                )
            }
            headers::Range::Utc(utc) => {
                let (min, max) = match utc {
                    UtcRange::Empty => return Err(bad()),
                    UtcRange::From(from) => (Some(from), None),
                    UtcRange::FromTo(from, to) => (Some(from), Some(to)),
                    UtcRange::To(to) => (None, Some(to)),
                };
                let end = |t: Option<UtcTime>| -> Result<TimeValue> {
                    match t {
                        Some(t) => utc_seconds(&t).map(TimeValue::Seconds).ok_or_else(bad),
                        None => Ok(TimeValue::End),
                    }
                };
                TimeRange {
                    unit: RangeUnit::Clock,
                    min: end(min)?,
                    max: end(max)?,
                }
            }
            headers::Range::Smpte(_) | headers::Range::Other(_) => return Err(bad()),
        };
        range.checked()
    }

    fn checked(self) -> Result<Self> {
        if self.min == TimeValue::End && self.max == TimeValue::End {
            return Err(RtspError::parse(ParseErrorKind::InvalidRange));
        }
        Ok(self)
    }

    /// No start position was given (`npt=-30`).
    pub fn is_open_start(&self) -> bool {
        self.min == TimeValue::End
    }

    /// No stop position was given (`npt=5-`).
    pub fn is_open_end(&self) -> bool {
        self.max == TimeValue::End
    }
}

fn nanos(ns: Option<u32>) -> f64 {
    f64::from(ns.unwrap_or(0)) / 1e9
}

fn npt_value(t: NptTime) -> TimeValue {
    match t {
        NptTime::Now => TimeValue::Now,
        NptTime::Seconds(s, ns) => TimeValue::Seconds(s as f64 + nanos(ns)),
        NptTime::Hms(h, m, s, ns) => TimeValue::Seconds(
            h as f64 * 3600.0 + f64::from(m) * 60.0 + f64::from(s) + nanos(ns),
        ),
    }
}

fn smpte_seconds(t: &SmpteTime, fps: f64) -> f64 {
    let frames = match t.frames {
        Some((frames, subframes)) => f64::from(frames) + f64::from(subframes.unwrap_or(0)) / 100.0,
        None => 0.0,
    };
    f64::from(t.hours) * 3600.0 + f64::from(t.minutes) * 60.0 + f64::from(t.seconds) + frames / fps
}

/// `YYYYMMDDThhmmss[.fraction]Z` to seconds since the epoch.
fn utc_seconds(t: &UtcTime) -> Option<f64> {
    let year = i64::from(t.date / 10000);
    let month = i64::from(t.date / 100 % 100);
    let day = i64::from(t.date % 100);
    let (hour, minute, second) = (t.time / 10000, t.time / 100 % 100, t.time % 100);
    if !(1..=12).contains(&month) || !(1..=31).contains(&day) || hour > 23 || minute > 59 || second > 60 {
        return None;
    }
    let days = days_from_civil(year, month, day) as f64;
    Some(days * 86400.0 + f64::from(hour * 3600 + minute * 60 + second) + nanos(t.nanoseconds))
}

fn days_from_civil(y: i64, m: i64, d: i64) -> i64 {
    let y = if m <= 2 { y - 1 } else { y };
    let era = (if y >= 0 { y } else { y - 399 }) / 400;
    let yoe = y - era * 400;
    let mp = (m + 9) % 12;
    let doy = (153 * mp + 2) / 5 + d - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146097 + doe - 719468
}

impl fmt::Display for TimeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeValue::Seconds(s) => write!(f, "{s}"),
            TimeValue::Now => f.write_str("now"),
            TimeValue::End => Ok(()),
        }
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}-{}", self.unit.as_str(), self.min, self.max)
    }
}
