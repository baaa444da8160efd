//! Catalog domain records, term identifiers and schedule encodings for the flow importer.

use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "flow-core";

/// Timestamp layout used by the catalog API: ISO 8601 without a zone.
pub const API_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Weekday codes in Monday-first order, matching the API's seven-letter day patterns.
pub const WEEKDAY_CODES: [&str; 7] = ["M", "T", "W", "Th", "F", "S", "Su"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("invalid term name {0:?}")]
    TermName(String),
    #[error("invalid term id {0:?}")]
    TermId(String),
    #[error("invalid timestamp {0:?}")]
    Timestamp(String),
    #[error("invalid time of day {0:?}")]
    TimeOfDay(String),
    #[error("invalid weekday pattern {0:?}")]
    WeekdayPattern(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Season {
    Winter,
    Spring,
    Fall,
}

impl Season {
    const ALL: [Season; 3] = [Season::Winter, Season::Spring, Season::Fall];

    pub fn digit(self) -> i32 {
        match self {
            Season::Winter => 1,
            Season::Spring => 5,
            Season::Fall => 9,
        }
    }

    pub fn containing_month(month: u32) -> Self {
        match month {
            9..=12 => Season::Fall,
            5..=8 => Season::Spring,
            _ => Season::Winter,
        }
    }

    fn index(self) -> i32 {
        match self {
            Season::Winter => 0,
            Season::Spring => 1,
            Season::Fall => 2,
        }
    }

    fn from_digit(digit: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.digit() == digit)
    }

    fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|s| s.to_string().eq_ignore_ascii_case(name))
    }
}

impl fmt::Display for Season {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Season::Winter => "Winter",
            Season::Spring => "Spring",
            Season::Fall => "Fall",
        };
        f.write_str(name)
    }
}

/// Four-digit term identifier: `(year - 1900) * 10 + season digit`, so `1209` is Fall 2020.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub struct TermId(i32);

impl TermId {
    pub fn new(year: i32, season: Season) -> Self {
        Self((year - 1900) * 10 + season.digit())
    }

    pub fn containing(date: NaiveDate) -> Self {
        Self::new(date.year(), Season::containing_month(date.month()))
    }

    pub fn current() -> Self {
        Self::containing(Utc::now().date_naive())
    }

    /// Parses names like `"Fall 2019"` as they appear in important-date records.
    pub fn from_name(name: &str) -> Result<Self, ParseError> {
        let mut parts = name.split_whitespace();
        let (Some(season), Some(year), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(ParseError::TermName(name.to_string()));
        };
        let season = Season::from_name(season).ok_or_else(|| ParseError::TermName(name.to_string()))?;
        let year: i32 = year
            .parse()
            .map_err(|_| ParseError::TermName(name.to_string()))?;
        if year < 1900 {
            return Err(ParseError::TermName(name.to_string()));
        }
        Ok(Self::new(year, season))
    }

    pub fn get(self) -> i32 {
        self.0
    }

    pub fn year(self) -> i32 {
        1900 + self.0 / 10
    }

    pub fn season(self) -> Season {
        // Constructors only admit valid season digits.
        Season::from_digit(self.0 % 10).unwrap_or(Season::Winter)
    }

    /// The term `n` terms before this one.
    pub fn previous(self, n: u32) -> Self {
        self.offset(-(n as i32))
    }

    pub fn next(self) -> Self {
        self.offset(1)
    }

    /// Terms whose courses and sections an import run refreshes.
    pub fn import_window(self) -> [TermId; 4] {
        [self.previous(2), self.previous(1), self, self.next()]
    }

    fn offset(self, delta: i32) -> Self {
        let ordinal = self.year() * 3 + self.season().index() + delta;
        let season = Season::ALL[ordinal.rem_euclid(3) as usize];
        Self::new(ordinal.div_euclid(3), season)
    }
}

impl TryFrom<i32> for TermId {
    type Error = ParseError;

    fn try_from(id: i32) -> Result<Self, Self::Error> {
        if id <= 0 || Season::from_digit(id % 10).is_none() {
            return Err(ParseError::TermId(id.to_string()));
        }
        Ok(Self(id))
    }
}

impl From<TermId> for i32 {
    fn from(id: TermId) -> Self {
        id.0
    }
}

impl FromStr for TermId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let id: i32 = s
            .trim()
            .parse()
            .map_err(|_| ParseError::TermId(s.to_string()))?;
        Self::try_from(id)
    }
}

impl fmt::Display for TermId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Term {
    pub id: TermId,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

impl Term {
    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start_date <= date && date <= self.end_date
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Course {
    pub code: String,
    pub name: String,
    pub description: Option<String>,
    pub prereqs: Option<String>,
    pub coreqs: Option<String>,
    pub antireqs: Option<String>,
}

/// Edge from a course to a course it requires, or must be taken alongside.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Prerequisite {
    pub course_code: String,
    pub prereq_code: String,
    pub is_coreq: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Antirequisite {
    pub course_code: String,
    pub antireq_code: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prof {
    pub code: String,
    pub name: String,
}

impl Prof {
    pub fn from_name(name: &str) -> Self {
        let name = last_first_to_first_last(name);
        Self {
            code: prof_code(&name),
            name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Section {
    pub course_code: String,
    pub class_number: i32,
    pub section_name: String,
    pub campus: String,
    pub enrollment_capacity: i32,
    pub enrollment_total: i32,
    pub term_id: TermId,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Meeting {
    pub class_number: i32,
    pub term_id: TermId,
    pub prof_code: Option<String>,
    pub location: Option<String>,
    pub start_seconds: Option<i32>,
    pub end_seconds: Option<i32>,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub days: Vec<String>,
    pub is_cancelled: bool,
    pub is_closed: bool,
    pub is_tba: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exam {
    pub course_code: String,
    pub section_name: String,
    pub term_id: TermId,
    pub location: Option<String>,
    pub start_seconds: Option<i32>,
    pub end_seconds: Option<i32>,
    pub date: Option<NaiveDate>,
    pub day: Option<String>,
    pub is_tba: bool,
}

/// Per-kind classification of every record an import considered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportOutcome {
    pub inserted: usize,
    pub updated: usize,
    pub untouched: usize,
    pub rejected: usize,
}

impl ImportOutcome {
    /// Tally for kinds that update matched rows and insert the rest.
    ///
    /// `matched` counts staged rows that joined an existing canonical row; staged rows that
    /// neither matched nor got inserted lacked a join dependency and are rejected.
    pub fn merged(
        pre_rejected: usize,
        staged: usize,
        matched: usize,
        updated: usize,
        inserted: usize,
    ) -> Self {
        Self {
            inserted,
            updated,
            untouched: matched.saturating_sub(updated),
            rejected: pre_rejected + staged.saturating_sub(matched + inserted),
        }
    }

    /// Tally for kinds that never overwrite an existing row.
    pub fn insert_only(pre_rejected: usize, staged: usize, inserted: usize) -> Self {
        Self {
            inserted,
            updated: 0,
            untouched: staged.saturating_sub(inserted),
            rejected: pre_rejected,
        }
    }

    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.untouched + self.rejected
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct VacuumOutcome {
    pub sections: usize,
    pub profs: usize,
}

impl VacuumOutcome {
    pub fn deleted(&self) -> usize {
        self.sections + self.profs
    }
}

/// Lowercase `subject+number` code, e.g. `("CS", "145")` to `cs145`.
pub fn course_code(subject: &str, number: &str) -> String {
    subject
        .chars()
        .chain(number.chars())
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}

pub fn parse_api_timestamp(value: &str) -> Result<NaiveDateTime, ParseError> {
    NaiveDateTime::parse_from_str(value.trim(), API_TIMESTAMP_FORMAT)
        .map_err(|_| ParseError::Timestamp(value.to_string()))
}

pub fn seconds_since_midnight(timestamp: &str) -> Result<i32, ParseError> {
    let parsed = parse_api_timestamp(timestamp)?;
    Ok(parsed.time().num_seconds_from_midnight() as i32)
}

pub fn seconds_from_12h(time: &str) -> Result<i32, ParseError> {
    let parsed = NaiveTime::parse_from_str(time.trim(), "%I:%M %p")
        .map_err(|_| ParseError::TimeOfDay(time.to_string()))?;
    Ok(parsed.num_seconds_from_midnight() as i32)
}

/// Expands a seven-character `Y`/`N` day pattern (Monday first) into weekday codes.
pub fn weekdays_from_pattern(pattern: &str) -> Result<Vec<String>, ParseError> {
    let flags: Vec<char> = pattern.trim().chars().collect();
    if flags.len() != WEEKDAY_CODES.len() {
        return Err(ParseError::WeekdayPattern(pattern.to_string()));
    }
    let mut days = Vec::new();
    for (flag, code) in flags.into_iter().zip(WEEKDAY_CODES) {
        match flag {
            'Y' | 'y' => days.push(code.to_string()),
            'N' | 'n' => {}
            _ => return Err(ParseError::WeekdayPattern(pattern.to_string())),
        }
    }
    Ok(days)
}

pub fn weekday_code(date: NaiveDate) -> &'static str {
    WEEKDAY_CODES[date.weekday().num_days_from_monday() as usize]
}

/// Section numbers are three digits.
pub const MAX_SECTION_NUMBER: u32 = 999;

/// Expands compact section notation like `"001,003-005"` into `[1, 3, 4, 5]`.
///
/// Anything other than digits and a dash between two numbers acts as a separator, so
/// `"LEC 001,003"` yields `[1, 3]`. A descending range contributes only its first number, and
/// range ends are clamped to [`MAX_SECTION_NUMBER`].
pub fn expand_number_range(input: &str) -> Vec<u32> {
    let bytes = input.as_bytes();
    let mut numbers = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let Some((first, consumed)) = leading_number(&bytes[i..]) else {
            i += 1;
            continue;
        };
        i += consumed;
        numbers.push(first);
        if bytes.get(i) == Some(&b'-') {
            if let Some((last, consumed)) = leading_number(&bytes[i + 1..]) {
                i += consumed + 1;
                numbers.extend(first.saturating_add(1)..=last.min(MAX_SECTION_NUMBER));
            }
        }
    }
    numbers
}

fn leading_number(bytes: &[u8]) -> Option<(u32, usize)> {
    let len = bytes.iter().take_while(|b| b.is_ascii_digit()).count();
    if len == 0 {
        return None;
    }
    let value = bytes[..len]
        .iter()
        .fold(0u32, |acc, b| acc.saturating_mul(10).saturating_add(u32::from(b - b'0')));
    Some((value, len))
}

/// Instructor code: ASCII letters of each name part, lowercased and joined by `_`.
pub fn prof_code(name: &str) -> String {
    name.split(|c: char| !c.is_ascii_alphabetic())
        .filter(|part| !part.is_empty())
        .map(str::to_ascii_lowercase)
        .collect::<Vec<_>>()
        .join("_")
}

/// Rewrites `"Last, First"` as `"First Last"`; names without a comma are returned trimmed.
pub fn last_first_to_first_last(name: &str) -> String {
    match name.split_once(',') {
        Some((last, first)) => format!("{} {}", first.trim(), last.trim()).trim().to_string(),
        None => name.trim().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn term_ids_follow_season_encoding() {
        let date = NaiveDate::from_ymd_opt(2020, 10, 3).unwrap();
        assert_eq!(TermId::containing(date).get(), 1209);
        assert_eq!(
            TermId::containing(NaiveDate::from_ymd_opt(2021, 4, 30).unwrap()).get(),
            1211
        );
        assert_eq!(
            TermId::containing(NaiveDate::from_ymd_opt(2021, 5, 1).unwrap()).get(),
            1215
        );
        assert_eq!(TermId::from_name("Fall 2019").unwrap().get(), 1199);
        assert_eq!(TermId::from_name("winter 2021").unwrap().get(), 1211);
        assert!(TermId::from_name("Autumn 2019").is_err());
        assert!(TermId::from_name("Fall").is_err());
    }

    #[test]
    fn term_arithmetic_wraps_across_years() {
        let winter = TermId::from_name("Winter 2021").unwrap();
        assert_eq!(winter.previous(1).get(), 1209);
        assert_eq!(winter.previous(2).get(), 1205);
        assert_eq!(winter.previous(0), winter);
        assert_eq!(winter.next().get(), 1215);
        assert_eq!(TermId::from_name("Fall 2020").unwrap().next().get(), 1211);
        assert_eq!(
            winter.import_window().map(TermId::get),
            [1205, 1209, 1211, 1215]
        );
        assert_eq!(winter.year(), 2021);
        assert_eq!(winter.season(), Season::Winter);
        assert_eq!(winter.to_string(), "1211");
    }

    #[test]
    fn term_ids_reject_bad_season_digits() {
        assert!(TermId::try_from(1203).is_err());
        assert!(TermId::try_from(-1).is_err());
        assert_eq!("1199".parse::<TermId>().unwrap().get(), 1199);
        assert!("abc".parse::<TermId>().is_err());
        let parsed: TermId = serde_json::from_str("1215").unwrap();
        assert_eq!(parsed.get(), 1215);
        assert!(serde_json::from_str::<TermId>("1212").is_err());
    }

    #[test]
    fn api_times_convert_to_seconds() {
        assert_eq!(seconds_since_midnight("2021-05-13T18:30:00").unwrap(), 66600);
        assert_eq!(seconds_since_midnight("2021-05-13T21:20:00").unwrap(), 76800);
        assert!(seconds_since_midnight("18:30").is_err());
        assert_eq!(seconds_from_12h("7:30 PM").unwrap(), 70200);
        assert_eq!(seconds_from_12h("12:30 PM").unwrap(), 45000);
        assert_eq!(seconds_from_12h("12:00 AM").unwrap(), 0);
        assert!(seconds_from_12h("25:00 PM").is_err());
    }

    #[test]
    fn weekday_patterns_and_dates_map_to_codes() {
        assert_eq!(weekdays_from_pattern("NYNNNNN").unwrap(), vec!["T"]);
        assert_eq!(
            weekdays_from_pattern("YNYNYNN").unwrap(),
            vec!["M", "W", "F"]
        );
        assert!(weekdays_from_pattern("NYN").is_err());
        assert!(weekdays_from_pattern("NYNNNNX").is_err());

        let thursday = NaiveDate::from_ymd_opt(2019, 12, 12).unwrap();
        let sunday = NaiveDate::from_ymd_opt(2019, 12, 15).unwrap();
        assert_eq!(weekday_code(thursday), "Th");
        assert_eq!(weekday_code(sunday), "Su");
    }

    #[test]
    fn number_ranges_expand() {
        assert_eq!(expand_number_range("001-002"), vec![1, 2]);
        assert_eq!(expand_number_range("001,003"), vec![1, 3]);
        assert_eq!(expand_number_range("001,003-005"), vec![1, 3, 4, 5]);
        assert_eq!(expand_number_range("LEC 001, 081"), vec![1, 81]);
        assert_eq!(expand_number_range("005-003"), vec![5]);
        assert_eq!(expand_number_range("001-100000").len(), 999);
        assert_eq!(expand_number_range("998-4000000000"), vec![998, 999]);
        assert_eq!(expand_number_range("1200-1300"), vec![1200]);
        assert!(expand_number_range("").is_empty());
    }

    #[test]
    fn prof_names_normalize() {
        assert_eq!(prof_code("Brad Lushman"), "brad_lushman");
        assert_eq!(prof_code("  J. R. R. Tolkien "), "j_r_r_tolkien");
        assert_eq!(last_first_to_first_last("Lushman, Brad"), "Brad Lushman");
        assert_eq!(Prof::from_name("Lushman,Brad").code, "brad_lushman");
    }

    #[test]
    fn course_codes_are_lowercase_without_spaces() {
        assert_eq!(course_code("CS", "145"), "cs145");
        assert_eq!(course_code("RS ", "305A"), "rs305a");
    }

    #[test]
    fn outcome_tallies_account_for_every_record() {
        let merged = ImportOutcome::merged(2, 10, 6, 4, 3);
        assert_eq!(merged.untouched, 2);
        assert_eq!(merged.rejected, 3);
        assert_eq!(merged.total(), 12);

        let insert_only = ImportOutcome::insert_only(1, 5, 2);
        assert_eq!(insert_only.untouched, 3);
        assert_eq!(insert_only.total(), 6);

        let vacuum = VacuumOutcome { sections: 4, profs: 1 };
        assert_eq!(vacuum.deleted(), 5);
    }
}
