use chrono::{Datelike, Duration, Months, NaiveDate, NaiveTime, Weekday};
use concierge_types::{FieldSpec, FieldType, FieldValue, Normalizer, Preferences};
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// What normalizers may consult besides the value itself.
#[derive(Debug, Clone, Copy)]
pub struct NormalizeContext<'a> {
    /// "Today" in the session's local offset.
    pub today: NaiveDate,
    pub preferences: &'a Preferences,
}

impl<'a> NormalizeContext<'a> {
    pub fn new(today: NaiveDate, preferences: &'a Preferences) -> Self {
        Self { today, preferences }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizeError {
    #[error("value is empty")]
    Empty,
    #[error("could not resolve `{0}` to a calendar date")]
    UnresolvedDate(String),
    #[error("could not read `{0}` as a clock time")]
    UnresolvedTime(String),
    #[error("`{0}` is ambiguous without am or pm")]
    AmbiguousTime(String),
    #[error("`{0}` is out of range")]
    OutOfRange(String),
    #[error("`{value}` is not one of {}", .options.join(", "))]
    NotAnOption { value: String, options: Vec<String> },
    #[error("`{0}` is not an email address")]
    InvalidEmail(String),
}

/// Converts one field value to its canonical form. Values already in the
/// normalizer's output kind pass through untouched, so running a task's
/// fields through here twice yields the same map.
pub fn normalize(
    spec: &FieldSpec,
    value: &FieldValue,
    ctx: &NormalizeContext<'_>,
) -> Result<FieldValue, NormalizeError> {
    let normalizer = spec.effective_normalizer();
    match (normalizer, value) {
        (Normalizer::Text | Normalizer::EmailAddress, FieldValue::Text(_))
        | (Normalizer::RelativeDate, FieldValue::Date(_))
        | (Normalizer::ClockTime, FieldValue::Time(_)) => Ok(value.clone()),
        (Normalizer::EnumChoice, FieldValue::Choice(choice)) => {
            normalize_raw(normalizer, spec, choice, ctx)
        }
        (_, FieldValue::Raw(raw)) => normalize_raw(normalizer, spec, raw, ctx),
        (_, other) => normalize_raw(normalizer, spec, &other.display(), ctx),
    }
}

fn normalize_raw(
    normalizer: Normalizer,
    spec: &FieldSpec,
    raw: &str,
    ctx: &NormalizeContext<'_>,
) -> Result<FieldValue, NormalizeError> {
    let text = collapse_whitespace(raw);
    if text.is_empty() {
        return Err(NormalizeError::Empty);
    }
    match normalizer {
        Normalizer::Text => Ok(FieldValue::Text(text)),
        Normalizer::RelativeDate => resolve_date(&text, ctx.today).map(FieldValue::Date),
        Normalizer::ClockTime => resolve_time(&text).map(FieldValue::Time),
        Normalizer::EnumChoice => {
            let options = match &spec.field_type {
                FieldType::Enum { options } => options.as_slice(),
                _ => &[],
            };
            let wanted = text.trim_end_matches(['.', '!', '?']);
            options
                .iter()
                .find(|opt| opt.eq_ignore_ascii_case(wanted))
                .map(|opt| FieldValue::Choice(opt.clone()))
                .ok_or_else(|| NormalizeError::NotAnOption {
                    value: text.clone(),
                    options: options.to_vec(),
                })
        }
        Normalizer::EmailAddress => normalize_email(&text).map(FieldValue::Text),
    }
}

fn collapse_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

static EMAIL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9._%+\-]+@[a-z0-9\-]+(\.[a-z0-9\-]+)*\.[a-z]{2,}$").expect("email regex")
});

fn normalize_email(input: &str) -> Result<String, NormalizeError> {
    let lowered = input
        .trim_start_matches("mailto:")
        .trim_matches(['<', '>', '.', ','])
        .to_ascii_lowercase();
    if EMAIL_RE.is_match(&lowered) {
        Ok(lowered)
    } else {
        Err(NormalizeError::InvalidEmail(input.to_string()))
    }
}

const MONTHS: [&str; 12] = [
    "january",
    "february",
    "march",
    "april",
    "may",
    "june",
    "july",
    "august",
    "september",
    "october",
    "november",
    "december",
];

fn month_number(name: &str) -> Option<u32> {
    MONTHS
        .iter()
        .position(|full| *full == name || &full[..3] == name || (name == "sept" && *full == "september"))
        .map(|idx| idx as u32 + 1)
}

fn weekday_from_name(name: &str) -> Option<Weekday> {
    let weekday = match name {
        "monday" | "mon" => Weekday::Mon,
        "tuesday" | "tue" | "tues" => Weekday::Tue,
        "wednesday" | "wed" => Weekday::Wed,
        "thursday" | "thu" | "thurs" => Weekday::Thu,
        "friday" | "fri" => Weekday::Fri,
        "saturday" | "sat" => Weekday::Sat,
        "sunday" | "sun" => Weekday::Sun,
        _ => return None,
    };
    Some(weekday)
}

fn small_number(word: &str) -> Option<i64> {
    let n = match word {
        "a" | "an" | "one" => 1,
        "two" => 2,
        "three" => 3,
        "four" => 4,
        "five" => 5,
        "six" => 6,
        "seven" => 7,
        "eight" => 8,
        "nine" => 9,
        "ten" => 10,
        other => return other.parse().ok(),
    };
    Some(n)
}

static IN_N_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^in (?P<n>\d+|an?|one|two|three|four|five|six|seven|eight|nine|ten) (?P<unit>days?|weeks?)$")
        .expect("in-n regex")
});
static MONTH_DAY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<month>[a-z]+)\.? (?P<day>\d{1,2})(?:st|nd|rd|th)?(?:,? (?P<year>\d{4}))?$")
        .expect("month-day regex")
});
static DAY_MONTH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<day>\d{1,2})(?:st|nd|rd|th)? (?:of )?(?P<month>[a-z]+)\.?(?:,? (?P<year>\d{4}))?$")
        .expect("day-month regex")
});

fn strip_day_part(input: &str) -> &str {
    for suffix in [" morning", " afternoon", " evening", " night"] {
        if let Some(head) = input.strip_suffix(suffix) {
            return head;
        }
    }
    input
}

/// Resolves a date phrase against `today`.
pub fn resolve_date(input: &str, today: NaiveDate) -> Result<NaiveDate, NormalizeError> {
    let lowered = input.trim().to_lowercase();
    let mut phrase = lowered.trim_end_matches(['.', ',', '!', '?']);
    if let Some((head, _)) = phrase.split_once(" at ") {
        phrase = head;
    }
    phrase = phrase.strip_prefix("on ").unwrap_or(phrase);
    phrase = phrase.strip_prefix("the ").unwrap_or(phrase);
    let phrase = strip_day_part(phrase.trim());
    let unresolved = || NormalizeError::UnresolvedDate(input.trim().to_string());
    let out_of_range = || NormalizeError::OutOfRange(input.trim().to_string());

    match phrase {
        "today" | "tonight" => return Ok(today),
        "tomorrow" => return shift_days(today, 1).ok_or_else(out_of_range),
        "day after tomorrow" => return shift_days(today, 2).ok_or_else(out_of_range),
        "yesterday" => return shift_days(today, -1).ok_or_else(out_of_range),
        "next week" => return shift_days(today, 7).ok_or_else(out_of_range),
        "next month" => {
            return today
                .checked_add_months(Months::new(1))
                .ok_or_else(out_of_range)
        }
        _ => {}
    }

    if let Some(caps) = IN_N_RE.captures(phrase) {
        let n = small_number(&caps["n"]).ok_or_else(out_of_range)?;
        let days = if caps["unit"].starts_with("week") {
            n.checked_mul(7).ok_or_else(out_of_range)?
        } else {
            n
        };
        return shift_days(today, days).ok_or_else(out_of_range);
    }

    if let Some(rest) = phrase.strip_prefix("next ") {
        if let Some(weekday) = weekday_from_name(rest) {
            return next_weekday(today, weekday, true).ok_or_else(out_of_range);
        }
    }
    let bare = phrase.strip_prefix("this ").unwrap_or(phrase);
    if let Some(weekday) = weekday_from_name(bare) {
        return next_weekday(today, weekday, false).ok_or_else(out_of_range);
    }

    if let Ok(date) = NaiveDate::parse_from_str(phrase, "%Y-%m-%d") {
        return Ok(date);
    }
    if let Ok(date) = NaiveDate::parse_from_str(phrase, "%m/%d/%Y") {
        return Ok(date);
    }

    let caps = MONTH_DAY_RE
        .captures(phrase)
        .or_else(|| DAY_MONTH_RE.captures(phrase))
        .ok_or_else(unresolved)?;
    let month = month_number(&caps["month"]).ok_or_else(unresolved)?;
    let day: u32 = caps["day"].parse().map_err(|_| unresolved())?;
    match caps.name("year") {
        Some(year) => {
            let year: i32 = year.as_str().parse().map_err(|_| unresolved())?;
            NaiveDate::from_ymd_opt(year, month, day).ok_or_else(out_of_range)
        }
        None => {
            let this_year = NaiveDate::from_ymd_opt(today.year(), month, day);
            match this_year {
                Some(date) if date >= today => Ok(date),
                _ => NaiveDate::from_ymd_opt(today.year() + 1, month, day)
                    .or(this_year)
                    .ok_or_else(out_of_range),
            }
        }
    }
}

/// `None` past the ends of the calendar.
fn shift_days(today: NaiveDate, days: i64) -> Option<NaiveDate> {
    Duration::try_days(days).and_then(|delta| today.checked_add_signed(delta))
}

fn next_weekday(today: NaiveDate, target: Weekday, strictly_after: bool) -> Option<NaiveDate> {
    let current = i64::from(today.weekday().num_days_from_monday());
    let wanted = i64::from(target.num_days_from_monday());
    let mut delta = (wanted - current).rem_euclid(7);
    if strictly_after && delta == 0 {
        delta = 7;
    }
    shift_days(today, delta)
}

static CLOCK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?P<h>\d{1,2})(?::(?P<m>\d{2}))?(?P<oclock> ?o'?clock)? ?(?P<ap>am|pm|a\.m\.?|p\.m\.?)?\.?$",
    )
    .expect("clock regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Meridiem {
    Am,
    Pm,
}

/// Reads a clock time. A bare hour up to 12 without am/pm is refused as
/// ambiguous instead of guessed.
pub fn resolve_time(input: &str) -> Result<NaiveTime, NormalizeError> {
    let lowered = input.trim().to_lowercase();
    let mut phrase = lowered.trim_end_matches([',', '!', '?']);
    for prefix in ["at ", "around ", "about "] {
        phrase = phrase.strip_prefix(prefix).unwrap_or(phrase);
    }
    let mut hint = None;
    for (suffix, meridiem) in [
        (" in the morning", Meridiem::Am),
        (" in the afternoon", Meridiem::Pm),
        (" in the evening", Meridiem::Pm),
        (" at night", Meridiem::Pm),
        (" tonight", Meridiem::Pm),
    ] {
        if let Some(head) = phrase.strip_suffix(suffix) {
            phrase = head;
            hint = Some(meridiem);
            break;
        }
    }
    let phrase = phrase.trim();

    match phrase {
        "noon" | "midday" | "12 noon" => return hm(12, 0, input),
        "midnight" => return hm(0, 0, input),
        _ => {}
    }

    let caps = CLOCK_RE
        .captures(phrase)
        .ok_or_else(|| NormalizeError::UnresolvedTime(input.trim().to_string()))?;
    let hour: u32 = caps["h"]
        .parse()
        .map_err(|_| NormalizeError::UnresolvedTime(input.trim().to_string()))?;
    let minute: u32 = match caps.name("m") {
        Some(m) => m
            .as_str()
            .parse()
            .map_err(|_| NormalizeError::UnresolvedTime(input.trim().to_string()))?,
        None => 0,
    };
    let meridiem = caps
        .name("ap")
        .map(|ap| {
            if ap.as_str().starts_with('a') {
                Meridiem::Am
            } else {
                Meridiem::Pm
            }
        })
        .or(hint);

    match meridiem {
        Some(meridiem) => {
            if !(1..=12).contains(&hour) {
                return Err(NormalizeError::OutOfRange(input.trim().to_string()));
            }
            let hour = match (meridiem, hour) {
                (Meridiem::Am, 12) => 0,
                (Meridiem::Am, h) => h,
                (Meridiem::Pm, 12) => 12,
                (Meridiem::Pm, h) => h + 12,
            };
            hm(hour, minute, input)
        }
        None if caps.name("m").is_some() && caps.name("oclock").is_none() => hm(hour, minute, input),
        None if hour > 12 && caps.name("oclock").is_none() => hm(hour, 0, input),
        None => Err(NormalizeError::AmbiguousTime(input.trim().to_string())),
    }
}

fn hm(hour: u32, minute: u32, input: &str) -> Result<NaiveTime, NormalizeError> {
    NaiveTime::from_hms_opt(hour, minute, 0)
        .ok_or_else(|| NormalizeError::OutOfRange(input.trim().to_string()))
}
