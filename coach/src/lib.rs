//! Coaching plan engine: plan text parsing, day-scoped editing, calendar projection
//! and the chat command dispatcher that ties them together.
//!
//! The weekly plan stays a human-editable text document. Sessions, calendar events and
//! edits are all derived from (or spliced back into) that text; nothing else is authoritative.

pub mod core {
    use chrono::{NaiveDate, NaiveDateTime};
    use indexmap::IndexMap;
    use serde::{Deserialize, Serialize};
    use std::{collections::BTreeSet, fmt, str::FromStr};
    use uuid::Uuid;

    /* ------------------------------- IDs ------------------------------- */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct SessionId(pub Uuid);

    impl SessionId {
        pub fn new() -> Self {
            Self(Uuid::new_v4())
        }
    }

    impl Default for SessionId {
        fn default() -> Self {
            Self::new()
        }
    }

    /* ------------------------------ Plan model ------------------------------ */

    /// Title used when a day header carries no title.
    pub const DEFAULT_TITLE: &str = "Entraînement";

    /// Description used when a day section has no body lines.
    pub const PLACEHOLDER_DESCRIPTION: &str = "Séance d'entraînement";

    /// Case-insensitive title tokens that mark a rest day.
    pub const REST_KEYWORDS: [&str; 4] = ["repos", "rest", "récupération", "recovery"];

    /// One parsed day entry of the plan text.
    ///
    /// Day numbers come straight from the headers: they are neither unique nor sorted.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Session {
        pub day: u32,
        pub title: String,
        pub description: String,
    }

    impl Session {
        pub fn is_rest(&self) -> bool {
            is_rest_title(&self.title)
        }
    }

    pub fn is_rest_title(title: &str) -> bool {
        let lower = title.to_lowercase();
        REST_KEYWORDS.iter().any(|k| lower.contains(k))
    }

    /* ----------------------------- Scheduling ----------------------------- */

    /// Symbolic training slot preference.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum TimeOfDay {
        #[default]
        #[serde(alias = "matin")]
        Morning,
        #[serde(alias = "midi", alias = "noon")]
        Midday,
        #[serde(alias = "après-midi", alias = "apres-midi")]
        Afternoon,
        #[serde(alias = "soir", alias = "nuit")]
        Evening,
    }

    impl TimeOfDay {
        /// Questionnaire label, e.g. `Matin (6h-10h)`.
        pub fn label(self) -> &'static str {
            match self {
                TimeOfDay::Morning => "Matin (6h-10h)",
                TimeOfDay::Midday => "Midi (11h-14h)",
                TimeOfDay::Afternoon => "Après-midi (15h-18h)",
                TimeOfDay::Evening => "Soir / Nuit (19h+)",
            }
        }
    }

    impl fmt::Display for TimeOfDay {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let s = match self {
                TimeOfDay::Morning => "morning",
                TimeOfDay::Midday => "midday",
                TimeOfDay::Afternoon => "afternoon",
                TimeOfDay::Evening => "evening",
            };
            f.write_str(s)
        }
    }

    impl FromStr for TimeOfDay {
        type Err = CoachError;

        /// Accepts English and French names as well as questionnaire labels
        /// such as `Soir / Nuit (19h+)`.
        fn from_str(s: &str) -> Result<Self, Self::Err> {
            let lower = s.trim().to_lowercase();
            let head = lower.split(['(', '/']).next().unwrap_or_default().trim();
            match head {
                "morning" | "matin" => Ok(TimeOfDay::Morning),
                "midday" | "noon" | "midi" => Ok(TimeOfDay::Midday),
                "afternoon" | "après-midi" | "apres-midi" | "après midi" => {
                    Ok(TimeOfDay::Afternoon)
                }
                "evening" | "night" | "soir" | "nuit" => Ok(TimeOfDay::Evening),
                _ => Err(CoachError::UnknownTimeOfDay(s.to_string())),
            }
        }
    }

    /// Calendar projection inputs that live next to the plan text.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct ScheduleSettings {
        pub start_date: NaiveDate,
        pub time_of_day: TimeOfDay,
        pub session_minutes: u32,
    }

    /// Visual class of a calendar event.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum EventKind {
        Rest,
        Training,
    }

    impl EventKind {
        pub fn color(self) -> &'static str {
            match self {
                EventKind::Rest => "#888888",
                EventKind::Training => "#3ea6ff",
            }
        }
    }

    /// A dated, timed projection of one session.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct CalendarEvent {
        pub title: String,
        pub start: NaiveDateTime,
        pub end: NaiveDateTime,
        pub description: String,
        pub day_number: u32,
        pub kind: EventKind,
    }

    /// A replacement request awaiting an explicit yes/no.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct PendingChange {
        pub instruction: String,
    }

    /// Reminder preferences; `reminder_days` holds plan day numbers (1..=7).
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct NotificationSettings {
        pub enabled: bool,
        #[serde(default)]
        pub reminder_days: BTreeSet<u8>,
    }

    impl Default for NotificationSettings {
        fn default() -> Self {
            Self {
                enabled: true,
                reminder_days: [1, 3, 5].into_iter().collect(),
            }
        }
    }

    /* ------------------------------- Profile ------------------------------- */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum Sex {
        #[default]
        #[serde(alias = "homme", alias = "Homme")]
        Male,
        #[serde(alias = "femme", alias = "Femme")]
        Female,
        #[serde(alias = "autre", alias = "other")]
        Unspecified,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum ActivityLevel {
        Sedentary,
        #[default]
        Moderate,
        Active,
        VeryActive,
    }

    impl ActivityLevel {
        /// Multiplier applied to the basal metabolic rate.
        pub fn multiplier(self) -> f64 {
            match self {
                ActivityLevel::Sedentary => 1.2,
                ActivityLevel::Moderate => 1.4,
                ActivityLevel::Active => 1.6,
                ActivityLevel::VeryActive => 1.8,
            }
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum ExperienceLevel {
        #[default]
        #[serde(alias = "débutant", alias = "debutant")]
        Beginner,
        #[serde(alias = "intermédiaire", alias = "intermediaire")]
        Intermediate,
        #[serde(alias = "avancé", alias = "avance")]
        Advanced,
        Expert,
    }

    impl ExperienceLevel {
        pub fn label(self) -> &'static str {
            match self {
                ExperienceLevel::Beginner => "Débutant",
                ExperienceLevel::Intermediate => "Intermédiaire",
                ExperienceLevel::Advanced => "Avancé",
                ExperienceLevel::Expert => "Expert",
            }
        }

        /// Target effort band written on training days.
        pub fn rpe_band(self) -> &'static str {
            match self {
                ExperienceLevel::Beginner => "5-6/10",
                ExperienceLevel::Intermediate => "6-7/10",
                ExperienceLevel::Advanced => "7-8/10",
                ExperienceLevel::Expert => "8-9/10",
            }
        }
    }

    /// Questionnaire answers the generators and collaborators work from.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct Profile {
        pub age: u32,
        pub sex: Sex,
        pub height_cm: f64,
        pub weight_kg: f64,
        pub experience: ExperienceLevel,
        pub injuries: String,
        pub health: String,
        pub activity: ActivityLevel,
        pub primary_goal: String,
        pub secondary_goal: String,
        pub horizon: String,
        pub motivation: u8,
        pub exercise_types: Vec<String>,
        pub days_per_week: u32,
        pub session_minutes: u32,
        pub time_of_day: TimeOfDay,
        pub location: String,
        pub equipment: String,
        pub sleep_hours: f64,
        pub city: String,
        pub wants_nutrition: bool,
        /// Any other answers, kept in questionnaire order.
        pub extra: IndexMap<String, String>,
    }

    impl Default for Profile {
        fn default() -> Self {
            Self {
                age: 30,
                sex: Sex::Male,
                height_cm: 175.0,
                weight_kg: 70.0,
                experience: ExperienceLevel::Beginner,
                injuries: String::new(),
                health: String::new(),
                activity: ActivityLevel::Moderate,
                primary_goal: "Condition générale".into(),
                secondary_goal: String::new(),
                horizon: "3 mois".into(),
                motivation: 7,
                exercise_types: vec![],
                days_per_week: 3,
                session_minutes: 45,
                time_of_day: TimeOfDay::Morning,
                location: String::new(),
                equipment: String::new(),
                sleep_hours: 8.0,
                city: "Montreal".into(),
                wants_nutrition: true,
                extra: IndexMap::new(),
            }
        }
    }

    impl Profile {
        /// Training days per week, clamped to 1..=7.
        pub fn training_days(&self) -> u32 {
            self.days_per_week.clamp(1, 7)
        }

        pub fn goal(&self) -> &str {
            if self.primary_goal.trim().is_empty() {
                "Condition générale"
            } else {
                self.primary_goal.trim()
            }
        }
    }

    /* ---------------------------- Errors (domain) ---------------------------- */

    #[derive(Debug, thiserror::Error)]
    pub enum CoachError {
        #[error("day {0} was not found in the plan")]
        DayNotFound(u32),
        #[error("'{term}' was not found in day {day}")]
        TermNotFound { term: String, day: u32 },
        #[error("invalid date '{0}' (expected YYYY-MM-DD or DD/MM/YYYY)")]
        InvalidDate(String),
        #[error("no date found (expected YYYY-MM-DD or DD/MM/YYYY)")]
        MissingDate,
        #[error("invalid phone number '{0}' (10 to 15 digits expected)")]
        InvalidPhoneNumber(String),
        #[error("unknown time of day '{0}'")]
        UnknownTimeOfDay(String),
        #[error("city '{0}' could not be located")]
        UnknownCity(String),
        #[error("external call failed: {0}")]
        External(String),
        #[error("malformed model output: {0}")]
        MalformedOutput(String),
    }
}

pub mod config {
    //! Runtime settings, loaded from TOML. Every field has a default so a partial
    //! (or missing) file is fine.

    use crate::core::TimeOfDay;
    use anyhow::{Context, Result};
    use chrono::NaiveTime;
    use serde::{Deserialize, Serialize};
    use std::{fs, path::Path};

    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    #[serde(default)]
    pub struct CoachConfig {
        pub parser: ParserConfig,
        pub schedule: ScheduleConfig,
        pub assistant: AssistantConfig,
        pub logging: LoggingConfig,
    }

    impl CoachConfig {
        /// Load from `path`, or defaults when no path is given.
        pub fn load(path: Option<&Path>) -> Result<Self> {
            let Some(path) = path else {
                return Ok(Self::default());
            };
            let text =
                fs::read_to_string(path).with_context(|| format!("reading config {:?}", path))?;
            Self::from_toml_str(&text).with_context(|| format!("parsing config {:?}", path))
        }

        pub fn from_toml_str(text: &str) -> Result<Self> {
            Ok(toml::from_str(text)?)
        }
    }

    /// Bounds applied while accumulating a day's description.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct ParserConfig {
        pub description_max_chars: usize,
        pub description_max_lines: usize,
    }

    impl Default for ParserConfig {
        fn default() -> Self {
            Self {
                description_max_chars: 500,
                description_max_lines: 20,
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct ScheduleConfig {
        pub time_of_day: TimeOfDay,
        pub session_minutes: u32,
        pub slots: TimeSlots,
    }

    impl Default for ScheduleConfig {
        fn default() -> Self {
            Self {
                time_of_day: TimeOfDay::Morning,
                session_minutes: 45,
                slots: TimeSlots::default(),
            }
        }
    }

    /// Clock start time (`HH:MM`) for each time-of-day preference.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct TimeSlots {
        pub morning: String,
        pub midday: String,
        pub afternoon: String,
        pub evening: String,
    }

    impl Default for TimeSlots {
        fn default() -> Self {
            Self {
                morning: "07:00".into(),
                midday: "12:00".into(),
                afternoon: "15:00".into(),
                evening: "18:00".into(),
            }
        }
    }

    impl TimeSlots {
        /// Resolve the start time for `time_of_day`; unparseable entries fall back to the
        /// built-in table.
        pub fn start_time(&self, time_of_day: TimeOfDay) -> NaiveTime {
            let (raw, fallback) = match time_of_day {
                TimeOfDay::Morning => (&self.morning, (7, 0)),
                TimeOfDay::Midday => (&self.midday, (12, 0)),
                TimeOfDay::Afternoon => (&self.afternoon, (15, 0)),
                TimeOfDay::Evening => (&self.evening, (18, 0)),
            };
            NaiveTime::parse_from_str(raw.trim(), "%H:%M").unwrap_or_else(|_| {
                tracing::warn!(slot = %time_of_day, value = %raw, "invalid time slot, using default");
                NaiveTime::from_hms_opt(fallback.0, fallback.1, 0).unwrap_or(NaiveTime::MIN)
            })
        }
    }

    /// Timeouts handed to collaborator implementations (seconds).
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct AssistantConfig {
        pub plan_timeout_secs: u64,
        pub chat_timeout_secs: u64,
        pub lookup_timeout_secs: u64,
    }

    impl Default for AssistantConfig {
        fn default() -> Self {
            Self {
                plan_timeout_secs: 60,
                chat_timeout_secs: 30,
                lookup_timeout_secs: 10,
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct LoggingConfig {
        pub level: String,
    }

    impl Default for LoggingConfig {
        fn default() -> Self {
            Self {
                level: "info".into(),
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn partial_toml_keeps_defaults() {
            let cfg = CoachConfig::from_toml_str(
                r#"
[schedule]
time_of_day = "soir"
session_minutes = 60

[parser]
description_max_chars = 120
"#,
            )
            .expect("config");
            assert_eq!(cfg.schedule.time_of_day, TimeOfDay::Evening);
            assert_eq!(cfg.schedule.session_minutes, 60);
            assert_eq!(cfg.parser.description_max_chars, 120);
            assert_eq!(cfg.parser.description_max_lines, 20);
            assert_eq!(cfg.assistant.plan_timeout_secs, 60);
            assert_eq!(cfg.logging.level, "info");
        }

        #[test]
        fn bad_slot_falls_back_to_builtin_time() {
            let slots = TimeSlots {
                evening: "late".into(),
                ..TimeSlots::default()
            };
            assert_eq!(
                slots.start_time(TimeOfDay::Evening),
                NaiveTime::from_hms_opt(18, 0, 0).unwrap()
            );
            assert_eq!(
                slots.start_time(TimeOfDay::Midday),
                NaiveTime::from_hms_opt(12, 0, 0).unwrap()
            );
        }

        #[test]
        fn missing_path_means_defaults() {
            assert_eq!(CoachConfig::load(None).unwrap(), CoachConfig::default());
        }
    }
}

pub mod parser {
    //! Plan text parser.
    //!
    //! Parsing strategy:
    //! - The scan is line-oriented; each trimmed line is tried against the day header
    //!   grammar (bold `**Jour 3 — Cardio**`, plain `Day 3: Cardio`, Markdown `### Jour 3`).
    //! - Header lines are recognised with `nom`; everything else is body text of the
    //!   currently open day.
    //! - Nothing here fails: malformed headers are body text, unusable input yields no sessions.

    use crate::config::ParserConfig;
    use crate::core::*;
    use chrono::NaiveDate;
    use nom::{
        IResult,
        branch::alt,
        bytes::complete::{tag_no_case, take_while_m_n},
        character::complete::{char, digit1, one_of, space0, space1},
        combinator::{eof, map_res, opt, rest},
        error::VerboseError,
        sequence::{pair, preceded, tuple},
    };
    use regex::Regex;
    use std::sync::LazyLock;
    use tracing::{debug, info, warn};

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    static LOOSE_DAY_MENTION: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?i)(?:jour|day)\s*(\d+)").unwrap());

    /* ------------------------ Public entry points ------------------------ */

    /// A recognised day header.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct DayHeader {
        pub day: u32,
        pub title: Option<String>,
    }

    /// A header line located in the full text; `start..end` covers the line including
    /// its line terminator.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct HeaderLine {
        pub day: u32,
        pub title: Option<String>,
        pub start: usize,
        pub end: usize,
    }

    /// Parse plan text with the default description bounds.
    pub fn parse_plan(plan_text: &str) -> Vec<Session> {
        parse_plan_with(plan_text, &ParserConfig::default())
    }

    /// Parse plan text into one session per header occurrence, in document order.
    ///
    /// Duplicate or out-of-order day numbers are kept as-is. When no header is found the
    /// permissive scan emits one minimal session per line mentioning `jour N` / `day N`.
    pub fn parse_plan_with(plan_text: &str, limits: &ParserConfig) -> Vec<Session> {
        let mut sessions = Vec::new();
        if plan_text.trim().is_empty() {
            warn!("plan text is empty");
            return sessions;
        }

        let mut open: Option<OpenSession> = None;
        for (idx, line) in plan_text.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            if let Some(header) = parse_day_header(trimmed) {
                if let Some(done) = open.take() {
                    sessions.push(done.close(limits));
                }
                debug!(line = idx + 1, day = header.day, "day header");
                open = Some(OpenSession::new(header));
                continue;
            }

            if let Some(current) = open.as_mut() {
                if !is_separator_line(trimmed) && current.lines.len() < limits.description_max_lines
                {
                    current.lines.push(trimmed);
                }
            }
        }
        if let Some(done) = open.take() {
            sessions.push(done.close(limits));
        }

        if sessions.is_empty() {
            warn!("no day headers found, falling back to loose day mentions");
            sessions = loose_scan(plan_text);
        }

        info!(count = sessions.len(), "parsed plan");
        sessions
    }

    /// Try to read `line` as a day header.
    pub fn parse_day_header(line: &str) -> Option<DayHeader> {
        let line = line.trim();
        bold_header(line)
            .or_else(|| day_marker_line(line))
            .or_else(|| markdown_header(line))
    }

    /// All header lines of `text` with their byte spans, in document order.
    pub fn header_lines(text: &str) -> Vec<HeaderLine> {
        let mut out = Vec::new();
        let mut offset = 0;
        for line in text.split_inclusive('\n') {
            if let Some(DayHeader { day, title }) = parse_day_header(line) {
                out.push(HeaderLine {
                    day,
                    title,
                    start: offset,
                    end: offset + line.len(),
                });
            }
            offset += line.len();
        }
        out
    }

    /// Minimal structural check for model-produced plans.
    pub fn contains_day_one_header(text: &str) -> bool {
        header_lines(text).iter().any(|h| h.day == 1)
    }

    /// Decorative rule such as `---`, `***` or `===`.
    pub fn is_separator_line(trimmed: &str) -> bool {
        trimmed.chars().count() >= 3
            && trimmed
                .chars()
                .all(|c| matches!(c, '*' | '-' | '=' | '_' | '#'))
    }

    /// Parse an ISO `YYYY-MM-DD` or `DD/MM/YYYY` date.
    pub fn parse_calendar_date(input: &str) -> Result<NaiveDate, CoachError> {
        let s = input.trim();
        match alt((iso_date, day_first_date))(s) {
            Ok(("", date)) => Ok(date),
            _ => Err(CoachError::InvalidDate(s.to_string())),
        }
    }

    /// Find the first date token in free text.
    ///
    /// Tokens that look like dates but do not parse are reported; with no candidate at all
    /// the error is `MissingDate`.
    pub fn extract_date(text: &str) -> Result<NaiveDate, CoachError> {
        let mut first_error = None;
        for token in text.split_whitespace() {
            let token = token.trim_matches(|c: char| !c.is_ascii_digit());
            if token.is_empty() || !token.contains(['-', '/']) {
                continue;
            }
            match parse_calendar_date(token) {
                Ok(date) => return Ok(date),
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }
        Err(first_error.unwrap_or(CoachError::MissingDate))
    }

    /* ------------------------------- Sessions ------------------------------- */

    struct OpenSession<'a> {
        day: u32,
        title: Option<String>,
        lines: Vec<&'a str>,
    }

    impl<'a> OpenSession<'a> {
        fn new(header: DayHeader) -> Self {
            Self {
                day: header.day,
                title: header.title,
                lines: Vec::new(),
            }
        }

        fn close(self, limits: &ParserConfig) -> Session {
            let joined = self.lines.join("\n");
            let desc = joined.trim();
            let description = if desc.is_empty() {
                PLACEHOLDER_DESCRIPTION.to_string()
            } else {
                desc.chars().take(limits.description_max_chars).collect()
            };
            Session {
                day: self.day,
                title: self.title.unwrap_or_else(|| DEFAULT_TITLE.to_string()),
                description,
            }
        }
    }

    fn loose_scan(plan_text: &str) -> Vec<Session> {
        plan_text
            .lines()
            .filter_map(|line| {
                let caps = LOOSE_DAY_MENTION.captures(line)?;
                let day = caps[1].parse::<u32>().ok()?;
                debug!(day, "loose day mention");
                Some(Session {
                    day,
                    title: format!("Jour {day}"),
                    description: line.trim().to_string(),
                })
            })
            .collect()
    }

    /* ----------------------------- Day headers ----------------------------- */

    fn bold_header(line: &str) -> Option<DayHeader> {
        let inner = line.strip_prefix("**")?.strip_suffix("**")?;
        day_marker_line(inner)
    }

    fn markdown_header(line: &str) -> Option<DayHeader> {
        preceded(take_while_m_n(1, 6, |c: char| c == '#'), day_marker)(line)
            .ok()
            .map(|(_, h)| h)
    }

    fn day_marker_line(line: &str) -> Option<DayHeader> {
        day_marker(line).ok().map(|(_, h)| h)
    }

    /// `Jour|Day <N> [sep <title>]` spanning the whole input, `sep` one of `: - – —`.
    fn day_marker(i: &str) -> PResult<'_, DayHeader> {
        let (i, _) = space0(i)?;
        let (i, _) = alt((tag_no_case("jour"), tag_no_case("day")))(i)?;
        let (i, _) = space1(i)?;
        let (i, day) = map_res(digit1, |d: &str| d.parse::<u32>())(i)?;
        let (i, _) = space0(i)?;
        let (i, title) = opt(preceded(pair(one_of(":-–—"), space0), rest))(i)?;
        let (i, _) = eof(i)?;
        let title = title
            .map(|t: &str| t.trim())
            .filter(|t| !t.is_empty())
            .map(str::to_string);
        Ok((i, DayHeader { day, title }))
    }

    /* -------------------------------- Dates -------------------------------- */

    fn iso_date(i: &str) -> PResult<'_, NaiveDate> {
        map_res(
            tuple((
                number::<i32>(4, 4),
                char('-'),
                number::<u32>(1, 2),
                char('-'),
                number::<u32>(1, 2),
            )),
            |(y, _, m, _, d)| NaiveDate::from_ymd_opt(y, m, d).ok_or("invalid date"),
        )(i)
    }

    fn day_first_date(i: &str) -> PResult<'_, NaiveDate> {
        map_res(
            tuple((
                number::<u32>(1, 2),
                char('/'),
                number::<u32>(1, 2),
                char('/'),
                number::<i32>(4, 4),
            )),
            |(d, _, m, _, y)| NaiveDate::from_ymd_opt(y, m, d).ok_or("invalid date"),
        )(i)
    }

    fn number<T: std::str::FromStr>(min: usize, max: usize) -> impl Fn(&str) -> PResult<'_, T> {
        move |i: &str| {
            map_res(take_while_m_n(min, max, |c: char| c.is_ascii_digit()), |s: &str| {
                s.parse::<T>()
            })(i)
        }
    }

}

pub mod editor {
    //! Day-scoped edits on plan text.
    //!
    //! Every operation locates the span of one day (header through just before the next
    //! header) and splices an edited copy of that span back into the full text. Text outside
    //! the span is never touched. When the day is missing the original text comes back
    //! unchanged with `applied == false`.

    use crate::parser::{header_lines, is_separator_line};
    use regex::{NoExpand, RegexBuilder};
    use tracing::debug;

    /// Term groups treated as interchangeable when a literal replacement finds nothing.
    pub const SYNONYM_GROUPS: &[&[&str]] = &[
        &["tapis roulant", "treadmill", "tapis"],
        &["vélo stationnaire", "vélo", "velo", "bike", "cycling"],
        &["pompes", "push-ups", "pushups"],
        &["squats", "squat"],
        &["fentes", "lunges"],
        &["planche", "plank", "gainage"],
        &["rameur", "rowing machine", "rower"],
        &["course", "running", "jogging"],
        &["corde à sauter", "jump rope"],
    ];

    /// Half-open byte span `[start, end)` of one day section.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DaySpan {
        pub start: usize,
        pub end: usize,
    }

    /// Result of an edit: the (possibly unchanged) full text and whether anything changed.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct EditOutcome {
        pub text: String,
        pub applied: bool,
    }

    impl EditOutcome {
        fn unchanged(text: &str) -> Self {
            Self {
                text: text.to_string(),
                applied: false,
            }
        }

        fn spliced(text: &str, span: DaySpan, section: &str) -> Self {
            let mut out = String::with_capacity(text.len() + section.len());
            out.push_str(&text[..span.start]);
            out.push_str(section);
            out.push_str(&text[span.end..]);
            Self {
                text: out,
                applied: true,
            }
        }
    }

    /// Span of the first header for `day`, up to the next header or end of text.
    pub fn locate_day(text: &str, day: u32) -> Option<DaySpan> {
        let headers = header_lines(text);
        let idx = headers.iter().position(|h| h.day == day)?;
        let start = headers[idx].start;
        let end = headers.get(idx + 1).map_or(text.len(), |next| next.start);
        Some(DaySpan { start, end })
    }

    /// Case-insensitive literal replacement of `old_term` inside the day span.
    ///
    /// With no literal hit, the other members of the term's synonym group are tried,
    /// longest first.
    pub fn replace_in_day(text: &str, day: u32, old_term: &str, new_term: &str) -> EditOutcome {
        let Some(span) = locate_day(text, day) else {
            debug!(day, "replace: day not found");
            return EditOutcome::unchanged(text);
        };
        let old_term = old_term.trim();
        if old_term.is_empty() {
            return EditOutcome::unchanged(text);
        }

        let section = &text[span.start..span.end];
        for candidate in std::iter::once(old_term.to_string()).chain(synonyms_for(old_term)) {
            let Ok(re) = RegexBuilder::new(&regex::escape(&candidate))
                .case_insensitive(true)
                .build()
            else {
                continue;
            };
            if re.is_match(section) {
                debug!(day, term = %candidate, "replace: term found");
                let edited = re.replace_all(section, NoExpand(new_term.trim()));
                return EditOutcome::spliced(text, span, &edited);
            }
        }
        debug!(day, term = old_term, "replace: term not found");
        EditOutcome::unchanged(text)
    }

    /// Append a bullet line after the last content line of the day.
    ///
    /// Trailing blank lines and decorative rules of the section stay after the new line.
    pub fn add_exercise_to_day(text: &str, day: u32, line: &str) -> EditOutcome {
        let Some(span) = locate_day(text, day) else {
            debug!(day, "add: day not found");
            return EditOutcome::unchanged(text);
        };
        let line = line.trim();
        if line.is_empty() {
            return EditOutcome::unchanged(text);
        }
        let bullet = as_bullet(line);

        let section = &text[span.start..span.end];
        let mut insert_at = 0;
        let mut offset = 0;
        for l in section.split_inclusive('\n') {
            offset += l.len();
            let content = l.trim();
            if !content.is_empty() && !is_separator_line(content) {
                insert_at = offset;
            }
        }

        let (head, tail) = section.split_at(insert_at);
        let mut edited = String::with_capacity(section.len() + bullet.len() + 2);
        edited.push_str(head);
        if !head.ends_with('\n') {
            edited.push('\n');
        }
        edited.push_str(&bullet);
        edited.push('\n');
        edited.push_str(tail);
        EditOutcome::spliced(text, span, &edited)
    }

    /// Drop every body line of the day containing `needle` (case-insensitive).
    /// The header line itself is never removed.
    pub fn remove_line_in_day(text: &str, day: u32, needle: &str) -> EditOutcome {
        let Some(span) = locate_day(text, day) else {
            debug!(day, "remove: day not found");
            return EditOutcome::unchanged(text);
        };
        let needle = needle.trim().to_lowercase();
        if needle.is_empty() {
            return EditOutcome::unchanged(text);
        }

        let section = &text[span.start..span.end];
        let mut lines = section.split_inclusive('\n');
        let mut edited = String::with_capacity(section.len());
        edited.push_str(lines.next().unwrap_or_default());
        let mut removed = 0;
        for l in lines {
            if l.to_lowercase().contains(&needle) {
                removed += 1;
            } else {
                edited.push_str(l);
            }
        }

        if removed == 0 {
            return EditOutcome::unchanged(text);
        }
        debug!(day, removed, "remove: lines dropped");
        EditOutcome::spliced(text, span, &edited)
    }

    /// Other members of the synonym group containing `term`, longest first.
    pub fn synonyms_for(term: &str) -> Vec<String> {
        let key = term.trim().to_lowercase();
        let Some(group) = SYNONYM_GROUPS.iter().find(|g| g.iter().any(|t| *t == key)) else {
            return vec![];
        };
        let mut out: Vec<String> = group
            .iter()
            .filter(|t| **t != key)
            .map(|t| t.to_string())
            .collect();
        out.sort_by_key(|t| std::cmp::Reverse(t.chars().count()));
        out
    }

    fn as_bullet(line: &str) -> String {
        if line.starts_with(['-', '*', '•']) {
            line.to_string()
        } else {
            format!("- {line}")
        }
    }

}

pub mod projectors {
    pub mod calendar_projector {
        use crate::config::TimeSlots;
        use crate::core::*;
        use chrono::{Duration, NaiveDate};
        use tracing::{info, warn};

        /// Project sessions onto the calendar with the built-in time slot table.
        pub fn project(
            sessions: &[Session],
            start_date: NaiveDate,
            time_of_day: TimeOfDay,
            session_minutes: u32,
        ) -> Vec<CalendarEvent> {
            project_with_slots(
                sessions,
                start_date,
                time_of_day,
                session_minutes,
                &TimeSlots::default(),
            )
        }

        /// Project sessions onto the calendar.
        ///
        /// Day `N` lands on `start_date + (N - 1)` days; it is an offset from the start
        /// date, not a weekday. End times roll over midnight when the duration demands it.
        pub fn project_with_slots(
            sessions: &[Session],
            start_date: NaiveDate,
            time_of_day: TimeOfDay,
            session_minutes: u32,
            slots: &TimeSlots,
        ) -> Vec<CalendarEvent> {
            let start_time = slots.start_time(time_of_day);
            let duration = Duration::minutes(i64::from(session_minutes));

            let mut events = Vec::with_capacity(sessions.len());
            for session in sessions {
                let offset = Duration::days(i64::from(session.day) - 1);
                let Some(date) = start_date.checked_add_signed(offset) else {
                    warn!(day = session.day, "day offset out of calendar range");
                    continue;
                };
                let start = date.and_time(start_time);
                let Some(end) = start.checked_add_signed(duration) else {
                    warn!(day = session.day, session_minutes, "session end out of calendar range");
                    continue;
                };
                let kind = if session.is_rest() {
                    EventKind::Rest
                } else {
                    EventKind::Training
                };
                events.push(CalendarEvent {
                    title: format!("Jour {}: {}", session.day, session.title),
                    start,
                    end,
                    description: session.description.clone(),
                    day_number: session.day,
                    kind,
                });
            }
            info!(count = events.len(), "projected calendar events");
            events
        }

        #[cfg(test)]
        mod tests {
            use super::*;
            use crate::parser::parse_plan;
            use chrono::NaiveTime;

            fn session(day: u32, title: &str) -> Session {
                Session {
                    day,
                    title: title.into(),
                    description: "desc".into(),
                }
            }

            fn start() -> NaiveDate {
                NaiveDate::from_ymd_opt(2025, 11, 5).unwrap()
            }

            #[test]
            fn days_are_offsets_from_start_date() {
                let events = project(
                    &[session(1, "Full Body"), session(3, "Cardio")],
                    start(),
                    TimeOfDay::Midday,
                    45,
                );
                assert_eq!(events[0].start.date(), start());
                assert_eq!(
                    events[1].start.date(),
                    NaiveDate::from_ymd_opt(2025, 11, 7).unwrap()
                );
                assert_eq!(events[0].start.time(), NaiveTime::from_hms_opt(12, 0, 0).unwrap());
                assert_eq!(events[0].end.time(), NaiveTime::from_hms_opt(12, 45, 0).unwrap());
                assert_eq!(events[1].title, "Jour 3: Cardio");
            }

            #[test]
            fn minutes_carry_into_hours() {
                let events = project(&[session(2, "Run")], start(), TimeOfDay::Evening, 90);
                assert_eq!(events[0].end.time(), NaiveTime::from_hms_opt(19, 30, 0).unwrap());
            }

            #[test]
            fn rest_days_get_their_own_kind() {
                let events = project(
                    &[session(7, "Repos complet"), session(3, "Cardio")],
                    start(),
                    TimeOfDay::Morning,
                    45,
                );
                assert_eq!(events[0].kind, EventKind::Rest);
                assert_eq!(events[1].kind, EventKind::Training);
                assert_eq!(events[0].kind.color(), "#888888");
            }

            #[test]
            fn projection_is_repeatable() {
                let text = "**Jour 1 — A**\n- x\n**Jour 2 — Repos**\n";
                let a = project(&parse_plan(text), start(), TimeOfDay::Afternoon, 60);
                let b = project(&parse_plan(text), start(), TimeOfDay::Afternoon, 60);
                assert_eq!(a, b);
                assert!(project(&[], start(), TimeOfDay::Afternoon, 60).is_empty());
            }

            #[test]
            fn sessions_past_the_calendar_end_are_skipped() {
                let near_max = NaiveDate::from_ymd_opt(262_000, 1, 1).unwrap();
                let events = project(&[session(1, "Run")], near_max, TimeOfDay::Morning, u32::MAX);
                assert!(events.is_empty());

                let events = project(
                    &[session(1, "Run"), session(u32::MAX, "Far")],
                    start(),
                    TimeOfDay::Evening,
                    60,
                );
                assert_eq!(events.len(), 1);
                assert_eq!(events[0].day_number, 1);
            }
        }
    }

    pub mod plan_fallback {
        //! Deterministic local plan generator used whenever no model plan is available.

        use crate::core::Profile;

        const TEMPLATES: [(&str, [&str; 6]); 3] = [
            (
                "Full Body",
                [
                    "- Échauffement: 5-10 min cardio léger",
                    "- Squats: 3 x 10-12",
                    "- Pompes (sur genoux si nécessaire): 3 x 8-10",
                    "- Fentes: 3 x 10 (chaque jambe)",
                    "- Planche: 3 x 20-30 sec",
                    "- Retour au calme: étirements 5 min",
                ],
            ),
            (
                "Cardio + Core",
                [
                    "- Échauffement: 5 min",
                    "- Intervalles cardio: 20-25 min (course/vélo/rameur)",
                    "- Crunches: 3 x 15",
                    "- Mountain climbers: 3 x 20 sec",
                    "- Russian twists: 3 x 15",
                    "- Étirements: 5 min",
                ],
            ),
            (
                "Force haut du corps",
                [
                    "- Échauffement: 5-10 min",
                    "- Développé couché ou pompes: 3 x 8-10",
                    "- Rowing: 3 x 10-12",
                    "- Élévations latérales: 3 x 12-15",
                    "- Gainage: 3 x 30 sec",
                    "- Étirements: 5 min",
                ],
            ),
        ];

        /// Seven day headers: the first `N` are training days, the rest `Repos complet`,
        /// with `N = clamp(days_per_week, 1, 7)`.
        pub fn fallback_plan(profile: &Profile) -> String {
            let training_days = profile.training_days();
            let minutes = profile.session_minutes;

            let mut lines = vec![format!(
                "# Plan d'entraînement personnalisé\n\n\
                 **Niveau :** {}  \n\
                 **Objectif :** {}  \n\
                 **Fréquence :** {} jours/semaine  \n\
                 **Durée par séance :** {} min\n\n---\n",
                profile.experience.label(),
                profile.goal(),
                training_days,
                minutes
            )];

            for day in 1..=7u32 {
                if day <= training_days {
                    let (title, exercises) = TEMPLATES[(day as usize - 1) % TEMPLATES.len()];
                    lines.push(format!("**Jour {day} — {title}**"));
                    lines.push(format!(
                        "⏱ Durée: {minutes} min | 🔥 RPE: {}",
                        profile.experience.rpe_band()
                    ));
                    lines.extend(exercises.iter().map(|e| e.to_string()));
                } else {
                    lines.push(format!("**Jour {day} — Repos complet**"));
                    lines.push(
                        "💤 Aucune séance prévue, concentre-toi sur le sommeil, l'hydratation et la récupération."
                            .to_string(),
                    );
                }
                lines.push("\n---\n".to_string());
            }

            lines.push(
                "**Conseils généraux :**\n\
                 - Hydrate-toi bien avant, pendant et après\n\
                 - Écoute ton corps et ajuste l'intensité\n\
                 - Augmente progressivement la charge\n"
                    .to_string(),
            );
            lines.join("\n")
        }

        #[cfg(test)]
        mod tests {
            use super::*;
            use crate::core::ExperienceLevel;
            use crate::parser::parse_plan;

            #[test]
            fn three_training_days_round_trip_through_the_parser() {
                let profile = Profile {
                    days_per_week: 3,
                    ..Profile::default()
                };
                let sessions = parse_plan(&fallback_plan(&profile));
                let days: Vec<u32> = sessions.iter().map(|s| s.day).collect();
                assert_eq!(days, vec![1, 2, 3, 4, 5, 6, 7]);
                assert_eq!(sessions.iter().filter(|s| !s.is_rest()).count(), 3);
                assert_eq!(sessions[1].title, "Cardio + Core");
            }

            #[test]
            fn training_days_are_clamped() {
                for (asked, expected) in [(0, 1), (5, 5), (12, 7)] {
                    let profile = Profile {
                        days_per_week: asked,
                        ..Profile::default()
                    };
                    let sessions = parse_plan(&fallback_plan(&profile));
                    assert_eq!(sessions.len(), 7);
                    assert_eq!(sessions.iter().filter(|s| !s.is_rest()).count(), expected);
                }
            }

            #[test]
            fn level_and_duration_show_up() {
                let profile = Profile {
                    experience: ExperienceLevel::Advanced,
                    session_minutes: 60,
                    ..Profile::default()
                };
                let plan = fallback_plan(&profile);
                assert!(plan.contains("**Niveau :** Avancé"));
                assert!(plan.contains("⏱ Durée: 60 min | 🔥 RPE: 7-8/10"));
            }
        }
    }

    pub mod nutrition {
        //! Calorie/macro targets and the local seven-day nutrition fallback.

        use crate::core::{Profile, Sex};
        use serde::{Deserialize, Serialize};

        #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
        pub struct CalorieTargets {
            pub calories: i64,
            pub protein_g: i64,
            pub carbs_g: i64,
            pub fat_g: i64,
            pub goal: String,
        }

        /// Mifflin-St Jeor BMR times the activity multiplier, shifted by 400 kcal for
        /// loss or gain goals.
        pub fn calorie_targets(profile: &Profile) -> CalorieTargets {
            let sex_offset = match profile.sex {
                Sex::Male => 5.0,
                Sex::Female | Sex::Unspecified => -161.0,
            };
            let bmr = 10.0 * profile.weight_kg + 6.25 * profile.height_cm
                - 5.0 * f64::from(profile.age)
                + sex_offset;
            let mut calories = (bmr * profile.activity.multiplier()) as i64;

            let goal = profile.goal().to_string();
            let lower = goal.to_lowercase();
            if lower.contains("perte") || lower.contains("loss") {
                calories -= 400;
            } else if lower.contains("masse") || lower.contains("gain") {
                calories += 400;
            }

            CalorieTargets {
                calories,
                protein_g: (profile.weight_kg * 1.8).round() as i64,
                carbs_g: (calories as f64 * 0.5 / 4.0).round() as i64,
                fat_g: (calories as f64 * 0.25 / 9.0).round() as i64,
                goal,
            }
        }

        pub fn fallback_nutrition(profile: &Profile) -> String {
            let t = calorie_targets(profile);
            let share = |pct: f64| (pct * t.calories as f64) as i64;

            let mut out = format!(
                "**Plan nutritionnel — Objectif : {goal}**\n\n\
                 🔹 Apport cible : **{kcal} kcal / jour**  \n\
                 🔹 Répartition macros (approx.) :  \n\
                 - Protéines : {p} g  \n\
                 - Glucides : {c} g  \n\
                 - Lipides : {f} g  \n\n\
                 Ce plan propose 7 jours avec des menus variés mais équilibrés, autour de ces cibles.\n",
                goal = t.goal,
                kcal = t.calories,
                p = t.protein_g,
                c = t.carbs_g,
                f = t.fat_g,
            );

            for day in 1..=7 {
                out.push_str(&format!(
                    "\n---\n\n### Jour {day}\n\n\
                     **Petit-déjeuner** (~{breakfast} kcal)  \n\
                     - Avoine (60g) avec fruits rouges  \n\
                     - Yogourt grec (150g)  \n\
                     - 1 fruit (pomme ou banane)  \n\n\
                     **Dîner** (~{lunch} kcal)  \n\
                     - Source de protéine (poulet, tofu ou poisson, 120-150g)  \n\
                     - Féculent complet (riz brun, quinoa, pâtes de blé entier ~80-100g crus)  \n\
                     - Légumes variés (brocoli, carottes, salade)  \n\n\
                     **Souper** (~{dinner} kcal)  \n\
                     - Source de protéine (saumon, légumineuses, tempeh, 120-150g)  \n\
                     - Légumes cuits ou crus  \n\
                     - Portion modérée de féculents  \n\n\
                     **Collations** (~{snacks} kcal au total)  \n\
                     - 1 poignée d'amandes ou noix (20-30g)  \n\
                     - 1 fruit\n\n\
                     **Total cible** : ~{kcal} kcal (±10%)  \n",
                    breakfast = share(0.25),
                    lunch = share(0.30),
                    dinner = share(0.30),
                    snacks = share(0.15),
                    kcal = t.calories,
                ));
            }

            out.push_str(
                "\n---\n\n\
                 💧 **Hydratation :** 2-3 L d'eau par jour  \n\
                 🚫 **À limiter :** sucres ajoutés, aliments ultra-transformés, alcool en excès  \n\
                 ✅ **À privilégier :** aliments entiers, protéines maigres, légumes, fruits frais, fibres  \n",
            );
            out
        }

    }
}

pub mod assistant {
    //! Collaborator seams: plan/nutrition model, weather lookups and outbound messaging.
    //!
    //! Implementations own their wire formats and timeouts (see `config::AssistantConfig`).
    //! An `Err` or an empty string from any call means "unavailable".

    use crate::core::{CoachError, Profile};
    use crate::parser::contains_day_one_header;
    use anyhow::{Result, bail};
    use regex::Regex;
    use serde::{Deserialize, Serialize};
    use std::sync::LazyLock;

    static FENCED_JSON: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?is)```json\s*(.*?)```").unwrap());

    /// Text generation behind the plan and the chat commands.
    pub trait PlanAssistant {
        /// Whether a model is available at all (e.g. an API key is set).
        fn is_configured(&self) -> bool;

        fn generate_plan(&self, profile: &Profile) -> Result<String>;

        fn generate_nutrition(&self, profile: &Profile) -> Result<String>;

        /// Rewrite the whole plan following `instruction`.
        fn rewrite_plan(
            &self,
            instruction: &str,
            plan_text: &str,
            profile: &Profile,
        ) -> Result<RewriteResult>;

        /// Propose alternatives without touching the plan.
        fn suggest_substitution(
            &self,
            instruction: &str,
            profile: &Profile,
            plan_text: &str,
        ) -> Result<String>;
    }

    /// Outcome of a whole-plan rewrite.
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct RewriteResult {
        pub ok: bool,
        pub new_plan: String,
        pub summary: String,
    }

    #[derive(Deserialize)]
    struct ModelRewrite {
        #[serde(default)]
        new_plan: String,
        #[serde(default)]
        summary: String,
        #[serde(default)]
        changed_days: Vec<u32>,
    }

    impl RewriteResult {
        pub fn failed(reason: impl Into<String>) -> Self {
            Self {
                ok: false,
                new_plan: String::new(),
                summary: reason.into(),
            }
        }

        /// Build a result from raw model output carrying a JSON object with `new_plan`,
        /// `summary` and optionally `changed_days`.
        pub fn from_model_output(text: &str) -> Result<Self, CoachError> {
            let block = extract_json_block(text)
                .ok_or_else(|| CoachError::MalformedOutput("no JSON object in response".into()))?;
            let parsed: ModelRewrite = serde_json::from_str(block)
                .map_err(|e| CoachError::MalformedOutput(e.to_string()))?;
            if parsed.new_plan.trim().is_empty() {
                return Ok(Self::failed("réponse sans nouveau plan"));
            }
            let mut summary = if parsed.summary.trim().is_empty() {
                "Plan mis à jour.".to_string()
            } else {
                parsed.summary.trim().to_string()
            };
            if !parsed.changed_days.is_empty() {
                let days: Vec<String> = parsed.changed_days.iter().map(u32::to_string).collect();
                summary.push_str(&format!(" (jours modifiés : {})", days.join(", ")));
            }
            Ok(Self {
                ok: true,
                new_plan: parsed.new_plan.trim().to_string(),
                summary,
            })
        }

        /// The replacement plan and its summary, if the result may be applied.
        ///
        /// A reported success still fails when the new plan has no day 1 header.
        pub fn accepted(self) -> Result<(String, String), CoachError> {
            if !self.ok {
                let reason = if self.summary.trim().is_empty() {
                    "rewrite failed".to_string()
                } else {
                    self.summary
                };
                return Err(CoachError::External(reason));
            }
            if !contains_day_one_header(&self.new_plan) {
                return Err(CoachError::MalformedOutput(
                    "rewritten plan has no day 1 header".into(),
                ));
            }
            Ok((self.new_plan, self.summary))
        }
    }

    /// The JSON object inside a fenced ```json block, else the outermost `{...}` span.
    pub fn extract_json_block(text: &str) -> Option<&str> {
        if let Some(caps) = FENCED_JSON.captures(text) {
            let inner = caps.get(1)?.as_str().trim();
            if !inner.is_empty() {
                return Some(inner);
            }
        }
        let start = text.find('{')?;
        let end = text.rfind('}')?;
        (start < end).then(|| &text[start..=end])
    }

    /// Used when no model is configured; every call is unavailable.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct OfflineAssistant;

    impl PlanAssistant for OfflineAssistant {
        fn is_configured(&self) -> bool {
            false
        }

        fn generate_plan(&self, _profile: &Profile) -> Result<String> {
            bail!("no plan assistant configured")
        }

        fn generate_nutrition(&self, _profile: &Profile) -> Result<String> {
            bail!("no plan assistant configured")
        }

        fn rewrite_plan(&self, _: &str, _: &str, _: &Profile) -> Result<RewriteResult> {
            bail!("no plan assistant configured")
        }

        fn suggest_substitution(&self, _: &str, _: &Profile, _: &str) -> Result<String> {
            bail!("no plan assistant configured")
        }
    }

    /* ------------------------------- Weather ------------------------------- */

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct GeoLocation {
        pub latitude: f64,
        pub longitude: f64,
        pub name: String,
    }

    /// Hourly series, index-aligned.
    #[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
    pub struct HourlyForecast {
        pub temperature_2m: Vec<f64>,
        pub precipitation_probability: Vec<f64>,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct CurrentWeather {
        pub temperature: f64,
        pub weather_code: u16,
        pub humidity: f64,
        pub wind_speed: f64,
    }

    pub trait WeatherService {
        fn geocode(&self, city: &str) -> Option<GeoLocation>;
        fn forecast(&self, latitude: f64, longitude: f64) -> Option<HourlyForecast>;
        fn current(&self, latitude: f64, longitude: f64) -> Option<CurrentWeather>;
    }

    /* ------------------------------ Messaging ------------------------------ */

    pub trait Messenger {
        /// Send `text` to `to`; `false` when delivery failed.
        fn send_message(&self, to: &str, text: &str) -> bool;
    }

}

pub mod weather {
    //! Training advice from forecasts. An optional enrichment: every lookup failure
    //! degrades to a fixed message or summary.

    use crate::assistant::{GeoLocation, HourlyForecast, WeatherService};
    use crate::core::CoachError;
    use serde::Serialize;
    use tracing::warn;

    pub const UNAVAILABLE: &str = "Météo indisponible.";

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct WeatherSummary {
        pub temperature: String,
        pub condition: String,
        pub humidity: String,
        pub feels_like: String,
    }

    impl WeatherSummary {
        fn fallback() -> Self {
            Self {
                temperature: "20".into(),
                condition: "Ensoleillé".into(),
                humidity: "65".into(),
                feels_like: "18".into(),
            }
        }
    }

    /// Advice from the first hourly sample: unfavourable above 50 % rain, below 0 °C
    /// or above 28 °C.
    pub fn weather_advice(forecast: &HourlyForecast, planned_minutes: u32) -> String {
        let (Some(temp), Some(rain)) = (
            forecast.temperature_2m.first(),
            forecast.precipitation_probability.first(),
        ) else {
            warn!("forecast has no hourly sample");
            return UNAVAILABLE.to_string();
        };
        if *rain > 50.0 || *temp < 0.0 || *temp > 28.0 {
            format!(
                "⚠️ Météo peu favorable ({temp}°C, pluie {rain}%). \
                 Alternative indoor ~{planned_minutes} min : circuit cardio / full body / yoga."
            )
        } else {
            format!("✅ Météo OK ({temp}°C, pluie {rain}%). Entraînement extérieur possible!")
        }
    }

    /// Open-Meteo WMO weather code in words.
    pub fn describe_weather_code(code: u16) -> &'static str {
        match code {
            0 => "Ciel dégagé",
            1 => "Principalement dégagé",
            2 => "Partiellement nuageux",
            3 => "Couvert",
            45 => "Brouillard",
            48 => "Brouillard givrant",
            51 => "Bruine faible",
            53 => "Bruine modérée",
            55 => "Bruine forte",
            61 => "Pluie faible",
            63 => "Pluie modérée",
            65 => "Pluie forte",
            71 => "Neige faible",
            73 => "Neige modérée",
            75 => "Neige forte",
            80 => "Averses faibles",
            81 => "Averses modérées",
            82 => "Averses fortes",
            _ => "Conditions variables",
        }
    }

    pub fn locate_city(service: &dyn WeatherService, city: &str) -> Result<GeoLocation, CoachError> {
        let city = city.trim();
        if city.is_empty() {
            return Err(CoachError::UnknownCity(city.to_string()));
        }
        service
            .geocode(city)
            .ok_or_else(|| CoachError::UnknownCity(city.to_string()))
    }

    /// Current conditions for `city`, or fixed placeholder values when unavailable.
    pub fn summary_for_city(service: &dyn WeatherService, city: &str) -> WeatherSummary {
        let current = locate_city(service, city)
            .ok()
            .and_then(|loc| service.current(loc.latitude, loc.longitude));
        match current {
            Some(cw) => {
                let rounded = format!("{}", cw.temperature.round() as i64);
                WeatherSummary {
                    temperature: rounded.clone(),
                    condition: describe_weather_code(cw.weather_code).to_string(),
                    humidity: format!("{}", cw.humidity.round() as i64),
                    feels_like: rounded,
                }
            }
            None => {
                warn!(city, "weather lookup failed, using fallback summary");
                WeatherSummary::fallback()
            }
        }
    }

    pub fn advice_for_city(service: &dyn WeatherService, city: &str, planned_minutes: u32) -> String {
        match locate_city(service, city) {
            Ok(loc) => match service.forecast(loc.latitude, loc.longitude) {
                Some(forecast) => weather_advice(&forecast, planned_minutes),
                None => UNAVAILABLE.to_string(),
            },
            Err(err) => {
                warn!(%err, "geocoding failed");
                UNAVAILABLE.to_string()
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::assistant::CurrentWeather;

        struct FixedWeather {
            rain: f64,
            temp: f64,
        }

        impl WeatherService for FixedWeather {
            fn geocode(&self, city: &str) -> Option<GeoLocation> {
                (city == "Montreal").then(|| GeoLocation {
                    latitude: 45.5,
                    longitude: -73.6,
                    name: "Montreal, Canada".into(),
                })
            }

            fn forecast(&self, _: f64, _: f64) -> Option<HourlyForecast> {
                Some(HourlyForecast {
                    temperature_2m: vec![self.temp],
                    precipitation_probability: vec![self.rain],
                })
            }

            fn current(&self, _: f64, _: f64) -> Option<CurrentWeather> {
                Some(CurrentWeather {
                    temperature: self.temp,
                    weather_code: 61,
                    humidity: 80.4,
                    wind_speed: 12.0,
                })
            }
        }

        #[test]
        fn advice_thresholds() {
            let ok = FixedWeather { rain: 10.0, temp: 15.0 };
            assert!(advice_for_city(&ok, "Montreal", 45).starts_with("✅ Météo OK (15°C, pluie 10%)"));
            let wet = FixedWeather { rain: 60.0, temp: 15.0 };
            assert!(advice_for_city(&wet, "Montreal", 45).contains("Alternative indoor ~45 min"));
            let hot = FixedWeather { rain: 0.0, temp: 31.5 };
            assert!(advice_for_city(&hot, "Montreal", 30).starts_with("⚠️"));
            assert_eq!(advice_for_city(&ok, "Atlantis", 45), UNAVAILABLE);
            assert_eq!(weather_advice(&HourlyForecast::default(), 45), UNAVAILABLE);
        }

        #[test]
        fn summary_falls_back_when_city_is_unknown() {
            let service = FixedWeather { rain: 0.0, temp: 3.6 };
            let live = summary_for_city(&service, "Montreal");
            assert_eq!(live.temperature, "4");
            assert_eq!(live.condition, "Pluie faible");
            assert_eq!(live.humidity, "80");
            assert_eq!(summary_for_city(&service, "Atlantis"), WeatherSummary::fallback());
            assert!(matches!(
                locate_city(&service, "  "),
                Err(CoachError::UnknownCity(_))
            ));
        }
    }
}

pub mod progress {
    use crate::core::Session;
    use chrono::{Datelike, NaiveDate};

    /// The session to do next.
    ///
    /// With a completed day on record: the first session with a later day number,
    /// wrapping to the first session. Without one: the session whose day matches today's
    /// ISO weekday (Monday = 1), else the first session.
    pub fn next_workout(
        sessions: &[Session],
        last_completed_day: Option<u32>,
        today: NaiveDate,
    ) -> Option<&Session> {
        let first = sessions.first()?;
        let found = match last_completed_day {
            Some(done) => sessions.iter().find(|s| s.day > done),
            None => {
                let weekday = today.weekday().number_from_monday();
                sessions.iter().find(|s| s.day == weekday)
            }
        };
        Some(found.unwrap_or(first))
    }

    /// Consecutive training days ending today or yesterday.
    pub fn workout_streak(completed: &[NaiveDate], today: NaiveDate) -> u32 {
        let mut dates: Vec<NaiveDate> = completed.iter().copied().filter(|d| *d <= today).collect();
        dates.sort_unstable_by(|a, b| b.cmp(a));
        dates.dedup();

        let Some(&latest) = dates.first() else {
            return 0;
        };
        if (today - latest).num_days() > 1 {
            return 0;
        }
        let mut streak = 1;
        for pair in dates.windows(2) {
            if (pair[0] - pair[1]).num_days() != 1 {
                break;
            }
            streak += 1;
        }
        streak
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn s(day: u32) -> Session {
            Session {
                day,
                title: format!("S{day}"),
                description: String::new(),
            }
        }

        fn d(day: u32) -> NaiveDate {
            NaiveDate::from_ymd_opt(2025, 11, day).unwrap()
        }

        #[test]
        fn next_after_completed_day_wraps() {
            let sessions = [s(1), s(3), s(5)];
            assert_eq!(next_workout(&sessions, Some(1), d(3)).unwrap().day, 3);
            assert_eq!(next_workout(&sessions, Some(5), d(3)).unwrap().day, 1);
            assert!(next_workout(&[], Some(1), d(3)).is_none());
        }

        #[test]
        fn without_history_today_weekday_is_used() {
            let sessions = [s(1), s(3), s(5)];
            // 2025-11-05 is a Wednesday
            assert_eq!(next_workout(&sessions, None, d(5)).unwrap().day, 3);
            // Thursday: no day 4, first session
            assert_eq!(next_workout(&sessions, None, d(6)).unwrap().day, 1);
        }

        #[test]
        fn streak_counts_consecutive_days() {
            assert_eq!(workout_streak(&[], d(10)), 0);
            assert_eq!(workout_streak(&[d(10), d(9), d(9), d(8), d(6)], d(10)), 3);
            assert_eq!(workout_streak(&[d(9), d(8)], d(10)), 2);
            assert_eq!(workout_streak(&[d(7), d(6)], d(10)), 0);
            assert_eq!(workout_streak(&[d(8), d(10), d(9)], d(10)), 3);
        }
    }
}

pub mod reminders {
    use crate::assistant::Messenger;
    use crate::core::{CoachError, NotificationSettings, Session};
    use tracing::{info, warn};

    /// Digits only, 10 to 15 of them (international format without `+`).
    pub fn validate_phone_number(phone: &str) -> Result<&str, CoachError> {
        let valid = !phone.is_empty()
            && phone.chars().all(|c| c.is_ascii_digit())
            && (10..=15).contains(&phone.len());
        if valid {
            Ok(phone)
        } else {
            Err(CoachError::InvalidPhoneNumber(phone.to_string()))
        }
    }

    pub fn reminder_message(session: &Session) -> String {
        if session.is_rest() {
            format!(
                "💤 Jour {} — {}\n\nPas de séance aujourd'hui : sommeil, hydratation et récupération.",
                session.day, session.title
            )
        } else {
            format!(
                "🏋️ Rappel Coach : Jour {} — {}\n\n{}\n\nBonne séance ! 💪",
                session.day, session.title, session.description
            )
        }
    }

    /// Send the reminder for `session` when reminders are on and its day is selected.
    ///
    /// `Ok(false)` means nothing was due.
    pub fn send_due_reminder(
        messenger: &dyn Messenger,
        settings: &NotificationSettings,
        phone: &str,
        session: &Session,
    ) -> Result<bool, CoachError> {
        let due = settings.enabled
            && u8::try_from(session.day).is_ok_and(|d| settings.reminder_days.contains(&d));
        if !due {
            return Ok(false);
        }
        let to = validate_phone_number(phone)?;
        if messenger.send_message(to, &reminder_message(session)) {
            info!(day = session.day, "reminder sent");
            Ok(true)
        } else {
            warn!(day = session.day, "reminder delivery failed");
            Err(CoachError::External("reminder delivery failed".into()))
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use std::cell::RefCell;

        #[derive(Default)]
        struct Outbox(RefCell<Vec<(String, String)>>);

        impl Messenger for Outbox {
            fn send_message(&self, to: &str, text: &str) -> bool {
                self.0.borrow_mut().push((to.into(), text.into()));
                true
            }
        }

        fn day(n: u32) -> Session {
            Session {
                day: n,
                title: "Full Body".into(),
                description: "- Squats".into(),
            }
        }

        #[test]
        fn phone_numbers() {
            assert!(validate_phone_number("15141234567").is_ok());
            assert!(validate_phone_number("+15141234567").is_err());
            assert!(validate_phone_number("123456789").is_err());
            assert!(validate_phone_number("1234567890123456").is_err());
            assert!(validate_phone_number("").is_err());
        }

        #[test]
        fn only_selected_days_are_sent() {
            let outbox = Outbox::default();
            let settings = NotificationSettings::default();
            assert!(send_due_reminder(&outbox, &settings, "15141234567", &day(3)).unwrap());
            assert!(!send_due_reminder(&outbox, &settings, "15141234567", &day(2)).unwrap());
            assert_eq!(outbox.0.borrow().len(), 1);
            assert!(outbox.0.borrow()[0].1.contains("Jour 3 — Full Body"));

            let off = NotificationSettings {
                enabled: false,
                ..NotificationSettings::default()
            };
            assert!(!send_due_reminder(&outbox, &off, "15141234567", &day(1)).unwrap());
            assert!(matches!(
                send_due_reminder(&outbox, &settings, "abc", &day(1)),
                Err(CoachError::InvalidPhoneNumber(_))
            ));
        }
    }
}

pub mod session {
    //! Per-user context: the plan text plus everything derived from or scheduled around it.
    //!
    //! The calendar is a cache keyed by a hash of the plan text and the schedule; any
    //! mismatch means recompute, never merge.

    use crate::assistant::PlanAssistant;
    use crate::config::{CoachConfig, ParserConfig, TimeSlots};
    use crate::core::*;
    use crate::editor::{self, EditOutcome};
    use crate::parser::parse_plan_with;
    use crate::progress;
    use crate::projectors::{calendar_projector, nutrition, plan_fallback};
    use anyhow::{Context, Result};
    use chrono::NaiveDate;
    use serde::{Deserialize, Serialize};
    use sha3::{Digest, Sha3_224};
    use std::{fs, path::Path};
    use tracing::{debug, info, warn};

    /// Where a generated text came from.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum PlanSource {
        Assistant,
        Fallback,
    }

    #[derive(Debug, Clone, Default)]
    struct CalendarCache {
        plan_hash: Option<String>,
        schedule: Option<ScheduleSettings>,
        events: Vec<CalendarEvent>,
    }

    #[derive(Debug, Clone, Default)]
    struct SessionSettings {
        parser: ParserConfig,
        slots: TimeSlots,
    }

    #[serde_with::skip_serializing_none]
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct CoachSession {
        pub id: SessionId,
        pub profile: Profile,
        #[serde(default)]
        plan_text: String,
        #[serde(default)]
        pub nutrition_text: String,
        pub schedule: ScheduleSettings,
        pub pending: Option<PendingChange>,
        #[serde(default)]
        pub notifications: NotificationSettings,
        pub city: String,
        pub last_completed_day: Option<u32>,
        #[serde(default)]
        pub completed_workouts: Vec<NaiveDate>,
        #[serde(skip)]
        calendar: CalendarCache,
        #[serde(skip)]
        settings: SessionSettings,
    }

    impl CoachSession {
        pub fn new(profile: Profile, start_date: NaiveDate) -> Self {
            let city = if profile.city.trim().is_empty() {
                "Montreal".to_string()
            } else {
                profile.city.trim().to_string()
            };
            Self {
                id: SessionId::new(),
                schedule: ScheduleSettings {
                    start_date,
                    time_of_day: profile.time_of_day,
                    session_minutes: profile.session_minutes,
                },
                profile,
                plan_text: String::new(),
                nutrition_text: String::new(),
                pending: None,
                notifications: NotificationSettings::default(),
                city,
                last_completed_day: None,
                completed_workouts: Vec::new(),
                calendar: CalendarCache::default(),
                settings: SessionSettings::default(),
            }
        }

        /// Use the parser bounds and time slots from `config`.
        pub fn apply_config(&mut self, config: &CoachConfig) {
            self.settings = SessionSettings {
                parser: config.parser.clone(),
                slots: config.schedule.slots.clone(),
            };
            self.calendar = CalendarCache::default();
        }

        /* ------------------------------ Plan text ------------------------------ */

        pub fn plan_text(&self) -> &str {
            &self.plan_text
        }

        /// Replace the plan text as typed by the user; the calendar catches up on next read.
        pub fn set_plan_text(&mut self, text: impl Into<String>) {
            self.plan_text = text.into();
            debug!(hash = %self.plan_hash(), "plan text replaced");
        }

        /// Replace the plan text and recompute the calendar right away.
        pub fn replace_plan(&mut self, text: impl Into<String>) {
            self.set_plan_text(text);
            self.recompute_calendar();
        }

        pub fn sessions(&self) -> Vec<Session> {
            parse_plan_with(&self.plan_text, &self.settings.parser)
        }

        /// First session for `day` in document order.
        pub fn session_for_day(&self, day: u32) -> Option<Session> {
            self.sessions().into_iter().find(|s| s.day == day)
        }

        /// Hex SHA3-224 of the plan text.
        pub fn plan_hash(&self) -> String {
            let mut hasher = Sha3_224::default();
            hasher.update(self.plan_text.as_bytes());
            hasher
                .finalize()
                .iter()
                .map(|b| format!("{b:02x}"))
                .collect()
        }

        /* ------------------------------- Calendar ------------------------------- */

        pub fn is_calendar_stale(&self) -> bool {
            self.calendar.plan_hash.as_deref() != Some(self.plan_hash().as_str())
                || self.calendar.schedule.as_ref() != Some(&self.schedule)
        }

        /// Calendar events for the current plan, recomputed first when stale.
        pub fn calendar_events(&mut self) -> &[CalendarEvent] {
            if self.is_calendar_stale() {
                self.recompute_calendar();
            }
            &self.calendar.events
        }

        pub fn recompute_calendar(&mut self) -> usize {
            let events = calendar_projector::project_with_slots(
                &self.sessions(),
                self.schedule.start_date,
                self.schedule.time_of_day,
                self.schedule.session_minutes,
                &self.settings.slots,
            );
            info!(session = %self.id.0, count = events.len(), "calendar recomputed");
            self.calendar = CalendarCache {
                plan_hash: Some(self.plan_hash()),
                schedule: Some(self.schedule.clone()),
                events,
            };
            self.calendar.events.len()
        }

        pub fn set_start_date(&mut self, date: NaiveDate) {
            self.schedule.start_date = date;
            self.recompute_calendar();
        }

        pub fn set_time_of_day(&mut self, time_of_day: TimeOfDay) {
            self.schedule.time_of_day = time_of_day;
            self.profile.time_of_day = time_of_day;
            self.recompute_calendar();
        }

        /* ------------------------------ Generation ------------------------------ */

        /// Generate the plan (and nutrition when wanted), falling back to the local
        /// generators whenever the assistant is unavailable.
        pub fn initialize_plans(&mut self, assistant: &dyn PlanAssistant) -> PlanSource {
            let source = self.regenerate_plan(assistant);
            if self.profile.wants_nutrition {
                self.nutrition_text = match generated(assistant.generate_nutrition(&self.profile)) {
                    Some(text) => text,
                    None => nutrition::fallback_nutrition(&self.profile),
                };
            }
            source
        }

        pub fn regenerate_plan(&mut self, assistant: &dyn PlanAssistant) -> PlanSource {
            let (text, source) = match generated(assistant.generate_plan(&self.profile)) {
                Some(text) => (text, PlanSource::Assistant),
                None => (plan_fallback::fallback_plan(&self.profile), PlanSource::Fallback),
            };
            info!(?source, "plan generated");
            self.replace_plan(text);
            source
        }

        /* -------------------------------- Edits -------------------------------- */

        pub fn add_exercise(&mut self, day: u32, line: &str) -> bool {
            let outcome = editor::add_exercise_to_day(&self.plan_text, day, line);
            self.commit_edit(outcome)
        }

        pub fn replace_term(&mut self, day: u32, old_term: &str, new_term: &str) -> bool {
            let outcome = editor::replace_in_day(&self.plan_text, day, old_term, new_term);
            self.commit_edit(outcome)
        }

        pub fn remove_lines(&mut self, day: u32, needle: &str) -> bool {
            let outcome = editor::remove_line_in_day(&self.plan_text, day, needle);
            self.commit_edit(outcome)
        }

        fn commit_edit(&mut self, outcome: EditOutcome) -> bool {
            if outcome.applied {
                self.replace_plan(outcome.text);
            }
            outcome.applied
        }

        /* ------------------------------- Progress ------------------------------- */

        pub fn next_workout(&self, today: NaiveDate) -> Option<Session> {
            progress::next_workout(&self.sessions(), self.last_completed_day, today).cloned()
        }

        pub fn mark_completed(&mut self, day: u32, date: NaiveDate) {
            self.last_completed_day = Some(day);
            if !self.completed_workouts.contains(&date) {
                self.completed_workouts.push(date);
            }
        }

        pub fn streak(&self, today: NaiveDate) -> u32 {
            progress::workout_streak(&self.completed_workouts, today)
        }

        /* ------------------------------ Persistence ------------------------------ */

        pub fn load(path: &Path) -> Result<Self> {
            let text =
                fs::read_to_string(path).with_context(|| format!("reading state {:?}", path))?;
            serde_json::from_str(&text).with_context(|| format!("parsing state {:?}", path))
        }

        pub fn save(&self, path: &Path) -> Result<()> {
            let json = serde_json::to_string_pretty(self)?;
            fs::write(path, json).with_context(|| format!("writing state {:?}", path))
        }
    }

    fn generated(result: Result<String>) -> Option<String> {
        match result {
            Ok(text) if !text.trim().is_empty() => Some(text),
            Ok(_) => {
                warn!("assistant returned an empty text");
                None
            }
            Err(err) => {
                warn!(%err, "assistant unavailable");
                None
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::assistant::{OfflineAssistant, RewriteResult};

        fn start() -> NaiveDate {
            NaiveDate::from_ymd_opt(2025, 11, 5).unwrap()
        }

        fn seeded() -> CoachSession {
            let mut s = CoachSession::new(Profile::default(), start());
            s.initialize_plans(&OfflineAssistant);
            s
        }

        struct CannedPlan;

        impl PlanAssistant for CannedPlan {
            fn is_configured(&self) -> bool {
                true
            }
            fn generate_plan(&self, _: &Profile) -> Result<String> {
                Ok("**Jour 1 — Natation**\n- 1000 m".into())
            }
            fn generate_nutrition(&self, _: &Profile) -> Result<String> {
                Ok("   ".into())
            }
            fn rewrite_plan(&self, _: &str, _: &str, _: &Profile) -> Result<RewriteResult> {
                unreachable!()
            }
            fn suggest_substitution(&self, _: &str, _: &Profile, _: &str) -> Result<String> {
                unreachable!()
            }
        }

        #[test]
        fn offline_initialization_uses_fallbacks() {
            let mut s = seeded();
            assert_eq!(s.sessions().len(), 7);
            assert!(s.nutrition_text.contains("### Jour 7"));
            assert_eq!(s.calendar_events().len(), 7);
            assert!(!s.is_calendar_stale());
        }

        #[test]
        fn assistant_output_is_used_when_present() {
            let mut s = CoachSession::new(Profile::default(), start());
            assert_eq!(s.initialize_plans(&CannedPlan), PlanSource::Assistant);
            assert_eq!(s.session_for_day(1).unwrap().title, "Natation");
            // blank nutrition is treated as unavailable
            assert!(s.nutrition_text.contains("Plan nutritionnel"));
        }

        #[test]
        fn direct_edit_marks_calendar_stale_until_read() {
            let mut s = seeded();
            let before = s.plan_hash();
            s.set_plan_text("**Jour 1 — Repos**\n");
            assert_ne!(before, s.plan_hash());
            assert!(s.is_calendar_stale());
            let events = s.calendar_events();
            assert_eq!(events.len(), 1);
            assert_eq!(events[0].kind, EventKind::Rest);
            assert!(!s.is_calendar_stale());
        }

        #[test]
        fn schedule_changes_move_events() {
            let mut s = seeded();
            let next_day = NaiveDate::from_ymd_opt(2025, 11, 6).unwrap();
            s.set_start_date(next_day);
            assert_eq!(s.calendar_events()[0].start.date(), next_day);
            s.schedule.session_minutes = 30;
            assert!(s.is_calendar_stale());
        }

        #[test]
        fn edits_go_through_the_editor() {
            let mut s = seeded();
            assert!(s.add_exercise(2, "Corde à sauter 5 min"));
            assert!(s.session_for_day(2).unwrap().description.contains("- Corde à sauter 5 min"));
            assert!(!s.replace_term(2, "haltères", "kettlebell"));
            assert!(!s.remove_lines(9, "squats"));
            assert!(s.remove_lines(1, "squats"));
            assert!(!s.session_for_day(1).unwrap().description.contains("Squats"));
        }

        #[test]
        fn state_json_skips_the_calendar_cache() {
            let mut s = seeded();
            s.pending = Some(PendingChange {
                instruction: "remplace les squats".into(),
            });
            s.calendar_events();
            let json = serde_json::to_string(&s).unwrap();
            assert!(!json.contains("plan_hash"));
            let mut back: CoachSession = serde_json::from_str(&json).unwrap();
            assert_eq!(back.plan_text(), s.plan_text());
            assert_eq!(back.pending, s.pending);
            assert!(back.is_calendar_stale());
            assert_eq!(back.calendar_events(), s.calendar_events());
        }

        #[test]
        fn progress_helpers() {
            let mut s = seeded();
            let today = NaiveDate::from_ymd_opt(2025, 11, 10).unwrap();
            s.mark_completed(1, today.pred_opt().unwrap());
            s.mark_completed(2, today);
            s.mark_completed(2, today);
            assert_eq!(s.streak(today), 2);
            assert_eq!(s.next_workout(today).unwrap().day, 3);
        }
    }
}

pub mod commands {
    //! Chat command classification and dispatch.
    //!
    //! Dispatch model:
    //! - A pending confirmation is checked first: an affirmative applies the stored
    //!   instruction through a whole-plan rewrite, a negative drops it. Anything else
    //!   leaves it in place and is classified like a fresh instruction.
    //! - Classification walks `RULES` in order; the first rule whose predicate matches
    //!   handles the instruction. The last rule matches everything.
    //! - Handlers mutate the session directly. `handle_turn` runs them on a copy and
    //!   commits only when they return `Ok`.

    use crate::assistant::PlanAssistant;
    use crate::core::*;
    use crate::editor;
    use crate::parser::extract_date;
    use crate::session::{CoachSession, PlanSource};
    use regex::Regex;
    use serde::Serialize;
    use std::sync::LazyLock;
    use tracing::{debug, info, warn};

    /// Inserted in place of a term when removing its line failed.
    pub const GENERIC_SUBSTITUTE: &str = "exercice équivalent au choix";

    const PREPOSITION: &str = r"(?:(?:\b(?:au|du|le|la|pour|on|for|in|to|of|the)|\bà)\s+)?";

    static DAY_NUMBER: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(&format!(r"(?i){PREPOSITION}\b(?:jour|day)\s*(\d+)\b")).unwrap()
    });
    static DAY_ORDINAL: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(&format!(
            r"(?i){PREPOSITION}\b(premi[eè]re?|deuxi[eè]me|troisi[eè]me|quatri[eè]me|cinqui[eè]me|sixi[eè]me|septi[eè]me)\s+(?:jour|journ[ée]e|s[ée]ance)\b"
        ))
        .unwrap()
    });

    static AFFIRMATIVE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?i)\b(?:oui|yes|ok|okay|vas-y|vas y|go|applique[rz]?|apply|d'accord)\b")
            .unwrap()
    });
    static NEGATIVE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?i)\b(?:non|no|annule[rz]?|cancel)\b").unwrap());

    static REGENERATE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?i)\b(?:r[ée]g[ée]n[èeé]re[rz]?|regenerate)\b.*\bplan\b").unwrap()
    });
    static ADD_VERB: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?i)\b(?:r?ajoute[rsz]?|add)\b").unwrap()
    });
    static EXPLICIT_REPLACE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?i)\b(?:remplace[rz]?|replace)\s+(.+?)\s+(?:par|with|by)\s+(.+)")
            .unwrap()
    });
    static REMOVE_VERB: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?i)\b(?:remplace[rz]?|supprime[rz]?|retire[rz]?|enl[èe]ve[rz]?|enlever|remove|delete)\b")
            .unwrap()
    });
    static SUBSTITUTION: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?i)remplace|remplacement|exercices? [ée]quivalents?|substitut|alternative")
            .unwrap()
    });
    static SESSION_WORD: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?i)\b(?:entra[îi]ne(?:ment|ments|r)?|s[ée]ances?|workouts?|training|sessions?|sport)\b")
            .unwrap()
    });
    static AFTERNOON: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?i)\b(?:apr[èe]s[- ]midi|afternoon)\b").unwrap()
    });
    static MORNING: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?i)\b(?:matin|morning)\b").unwrap());
    static MIDDAY: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?i)\b(?:midi|noon|midday|lunch)\b").unwrap());
    static EVENING: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?i)\b(?:soir|soirée|nuit|evening|night)\b").unwrap());
    static NOTIFY_DISABLE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?i)\b(?:d[ée]sactive[rz]?|coupe[rz]?|stop|arr[êe]te[rz]?|disable|turn off)\b.*\b(?:notifications?|rappels?|reminders?)\b")
            .unwrap()
    });
    static NOTIFY_ENABLE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?i)\b(?:r?active[rz]?|r[ée]active[rz]?|enable|turn on)\b.*\b(?:notifications?|rappels?|reminders?)\b")
            .unwrap()
    });
    static NOTIFY_NOUN: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?i)\b(?:notifications?|rappels?|reminders?)\b").unwrap()
    });
    static REMINDER_DAY: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?i)\bj([1-7])\b").unwrap());
    static START_DATE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?i)\b(?:commence[rz]?|d[ée]but|d[ée]bute[rz]?|d[ée]marre[rz]?|start(?:s|ing)?)\b")
            .unwrap()
    });
    static CITY: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?i)\b(?:ville|city)\s*:\s*(.+)$").unwrap());

    /* ------------------------------- Outcome ------------------------------- */

    /// What a turn did, for the caller to render.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct DispatchOutcome {
        pub feedback: String,
        pub plan_changed: bool,
        pub calendar_changed: bool,
        pub is_command: bool,
    }

    impl DispatchOutcome {
        /// Handled, nothing changed.
        pub fn command(feedback: impl Into<String>) -> Self {
            Self {
                feedback: feedback.into(),
                plan_changed: false,
                calendar_changed: false,
                is_command: true,
            }
        }

        pub fn plan_updated(feedback: impl Into<String>) -> Self {
            Self {
                plan_changed: true,
                calendar_changed: true,
                ..Self::command(feedback)
            }
        }

        pub fn calendar_updated(feedback: impl Into<String>) -> Self {
            Self {
                calendar_changed: true,
                ..Self::command(feedback)
            }
        }

        /// Ordinary conversation; the caller answers it some other way.
        pub fn not_a_command(feedback: impl Into<String>) -> Self {
            Self {
                is_command: false,
                ..Self::command(feedback)
            }
        }
    }

    /* ------------------------------ Instruction ------------------------------ */

    /// A day mentioned in an instruction and where it was mentioned.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DayRef {
        pub day: u32,
        pub start: usize,
        pub end: usize,
    }

    #[derive(Debug, Clone)]
    pub struct Instruction<'a> {
        pub raw: &'a str,
        pub lower: String,
        pub day: Option<DayRef>,
    }

    impl<'a> Instruction<'a> {
        pub fn new(raw: &'a str) -> Self {
            let raw = raw.trim();
            Self {
                raw,
                lower: raw.to_lowercase(),
                day: day_reference(raw),
            }
        }

        /// The raw text minus the day reference.
        fn without_day(&self) -> String {
            match self.day {
                Some(d) => format!("{} {}", &self.raw[..d.start], &self.raw[d.end..]),
                None => self.raw.to_string(),
            }
        }

        /// What is left once the verb matched by `verb` and the day reference are cut out.
        fn payload(&self, verb: &Regex) -> String {
            let mut cuts: Vec<(usize, usize)> = Vec::new();
            if let Some(m) = verb.find(self.raw) {
                cuts.push((m.start(), m.end()));
            }
            if let Some(d) = self.day {
                cuts.push((d.start, d.end));
            }
            cuts.sort_unstable();

            let mut out = String::new();
            let mut pos = 0;
            for (start, end) in cuts {
                if start < pos {
                    continue;
                }
                out.push_str(&self.raw[pos..start]);
                out.push(' ');
                pos = end;
            }
            out.push_str(&self.raw[pos..]);
            clean_term(&out)
        }
    }

    /// First day reference in `text`: `jour 3` / `day 3`, or a French ordinal such as
    /// `troisième jour`, with a leading preposition included in the span.
    pub fn day_reference(text: &str) -> Option<DayRef> {
        let numeric = DAY_NUMBER.captures(text).and_then(|caps| {
            let whole = caps.get(0)?;
            Some(DayRef {
                day: caps[1].parse().ok()?,
                start: whole.start(),
                end: whole.end(),
            })
        });
        let ordinal = DAY_ORDINAL.captures(text).and_then(|caps| {
            let whole = caps.get(0)?;
            Some(DayRef {
                day: ordinal_value(&caps[1])?,
                start: whole.start(),
                end: whole.end(),
            })
        });
        match (numeric, ordinal) {
            (Some(a), Some(b)) => Some(if b.start < a.start { b } else { a }),
            (a, b) => a.or(b),
        }
    }

    fn ordinal_value(word: &str) -> Option<u32> {
        let lower = word.to_lowercase();
        let day = match lower.get(..3)? {
            "pre" => 1,
            "deu" => 2,
            "tro" => 3,
            "qua" => 4,
            "cin" => 5,
            "six" => 6,
            "sep" => 7,
            _ => return None,
        };
        Some(day)
    }

    /// Trim punctuation and leading articles off an exercise name.
    fn clean_term(s: &str) -> String {
        const ARTICLES: [&str; 16] = [
            "les ", "le ", "la ", "l'", "l’", "des ", "du ", "de ", "d'", "un ", "une ", "the ",
            "an ", "a ", "mes ", "my ",
        ];
        let trim = |s: &str| -> String {
            s.trim_matches(|c: char| c.is_whitespace() || ":,.;!?-–—\"«»".contains(c))
                .to_string()
        };
        let mut term = trim(s);
        'strip: loop {
            for article in ARTICLES {
                let matches = term
                    .get(..article.len())
                    .is_some_and(|head| head.eq_ignore_ascii_case(article));
                if matches {
                    term = trim(&term[article.len()..]);
                    continue 'strip;
                }
            }
            break;
        }
        term
    }

    fn time_of_day_in(text: &str) -> Option<TimeOfDay> {
        // "après-midi" contains "midi"
        if AFTERNOON.is_match(text) {
            Some(TimeOfDay::Afternoon)
        } else if MORNING.is_match(text) {
            Some(TimeOfDay::Morning)
        } else if MIDDAY.is_match(text) {
            Some(TimeOfDay::Midday)
        } else if EVENING.is_match(text) {
            Some(TimeOfDay::Evening)
        } else {
            None
        }
    }

    /* -------------------------------- Rules -------------------------------- */

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum CommandKind {
        Regenerate,
        AddExercise,
        ReplaceTerm,
        RemoveOrSubstitute,
        SuggestSubstitution,
        TimeOfDay,
        Notifications,
        StartDate,
        City,
        Freeform,
    }

    type Handler =
        fn(&Instruction<'_>, &mut CoachSession, &dyn PlanAssistant) -> Result<DispatchOutcome, CoachError>;

    pub struct CommandRule {
        pub kind: CommandKind,
        matches: fn(&Instruction<'_>) -> bool,
        apply: Handler,
    }

    /// Classification rules in priority order; first match wins.
    pub const RULES: &[CommandRule] = &[
        CommandRule {
            kind: CommandKind::Regenerate,
            matches: |i| REGENERATE.is_match(i.raw),
            apply: regenerate,
        },
        CommandRule {
            kind: CommandKind::AddExercise,
            matches: |i| {
                ADD_VERB.is_match(i.raw) && i.day.is_some() && !i.payload(&ADD_VERB).is_empty()
            },
            apply: add_exercise,
        },
        CommandRule {
            kind: CommandKind::ReplaceTerm,
            matches: |i| explicit_replacement(i).is_some(),
            apply: replace_term,
        },
        CommandRule {
            kind: CommandKind::RemoveOrSubstitute,
            matches: |i| {
                REMOVE_VERB.is_match(i.raw)
                    && i.day.is_some()
                    && !i.payload(&REMOVE_VERB).is_empty()
            },
            apply: remove_or_substitute,
        },
        CommandRule {
            kind: CommandKind::SuggestSubstitution,
            matches: |i| SUBSTITUTION.is_match(i.raw),
            apply: suggest_substitution,
        },
        CommandRule {
            kind: CommandKind::TimeOfDay,
            matches: |i| time_of_day_in(i.raw).is_some() && SESSION_WORD.is_match(i.raw),
            apply: set_time_of_day,
        },
        CommandRule {
            kind: CommandKind::Notifications,
            matches: |i| {
                NOTIFY_DISABLE.is_match(i.raw)
                    || NOTIFY_ENABLE.is_match(i.raw)
                    || (NOTIFY_NOUN.is_match(i.raw) && REMINDER_DAY.is_match(i.raw))
            },
            apply: set_notifications,
        },
        CommandRule {
            kind: CommandKind::StartDate,
            matches: |i| START_DATE.is_match(i.raw),
            apply: set_start_date,
        },
        CommandRule {
            kind: CommandKind::City,
            matches: |i| city_value(i).is_some(),
            apply: set_city,
        },
        CommandRule {
            kind: CommandKind::Freeform,
            matches: |_| true,
            apply: freeform_rewrite,
        },
    ];

    /// The rule that would handle `instruction` when nothing is pending.
    pub fn classify(instruction: &str) -> CommandKind {
        let instruction = Instruction::new(instruction);
        rule_for(&instruction).map_or(CommandKind::Freeform, |r| r.kind)
    }

    fn rule_for(instruction: &Instruction<'_>) -> Option<&'static CommandRule> {
        RULES.iter().find(|rule| (rule.matches)(instruction))
    }

    /* ------------------------------- Dispatch ------------------------------- */

    /// Run one instruction against `session`.
    ///
    /// On `Err` the session may be partially updated; use `handle_turn` to get
    /// all-or-nothing behaviour.
    pub fn dispatch(
        session: &mut CoachSession,
        instruction: &str,
        assistant: &dyn PlanAssistant,
    ) -> Result<DispatchOutcome, CoachError> {
        let instruction = Instruction::new(instruction);
        if instruction.raw.is_empty() {
            return Ok(DispatchOutcome::not_a_command(""));
        }

        if let Some(outcome) = resolve_pending(&instruction, session, assistant) {
            return Ok(outcome);
        }

        let Some(rule) = rule_for(&instruction) else {
            return Ok(DispatchOutcome::not_a_command(""));
        };
        debug!(kind = ?rule.kind, "instruction classified");
        (rule.apply)(&instruction, session, assistant)
    }

    /// Top-level turn handler: errors become feedback and leave `session` untouched.
    pub fn handle_turn(
        session: &mut CoachSession,
        instruction: &str,
        assistant: &dyn PlanAssistant,
    ) -> DispatchOutcome {
        let mut working = session.clone();
        match dispatch(&mut working, instruction, assistant) {
            Ok(outcome) => {
                *session = working;
                outcome
            }
            Err(err) => {
                warn!(%err, "instruction failed");
                DispatchOutcome::command(error_feedback(&err))
            }
        }
    }

    /// User-facing wording for a failed instruction.
    pub fn error_feedback(err: &CoachError) -> String {
        match err {
            CoachError::DayNotFound(day) => {
                format!("❓ Je n'ai pas trouvé le Jour {day} dans ton plan.")
            }
            CoachError::TermNotFound { term, day } => {
                format!("❓ Je n'ai pas trouvé « {term} » dans le Jour {day}.")
            }
            CoachError::InvalidDate(_) | CoachError::MissingDate => {
                "📅 Date invalide ou absente. Utilise le format AAAA-MM-JJ ou JJ/MM/AAAA.".into()
            }
            CoachError::UnknownCity(city) => format!("📍 Ville introuvable : {city}."),
            CoachError::External(reason) => {
                format!("⚠️ Je n'ai pas pu faire ça automatiquement. {reason}")
            }
            CoachError::MalformedOutput(reason) => {
                format!("⚠️ La réponse reçue n'était pas un plan valide ({reason}).")
            }
            other => format!("⚠️ {other}"),
        }
    }

    fn resolve_pending(
        instruction: &Instruction<'_>,
        session: &mut CoachSession,
        assistant: &dyn PlanAssistant,
    ) -> Option<DispatchOutcome> {
        session.pending.as_ref()?;

        if AFFIRMATIVE.is_match(&instruction.lower) {
            let pending = session.pending.take()?;
            info!(instruction = %pending.instruction, "applying pending change");
            let applied = assistant
                .rewrite_plan(&pending.instruction, session.plan_text(), &session.profile)
                .map_err(|e| CoachError::External(e.to_string()))
                .and_then(|result| result.accepted());
            return Some(match applied {
                Ok((plan, summary)) => {
                    session.replace_plan(plan);
                    DispatchOutcome::plan_updated(format!(
                        "✅ J'ai mis à jour ton plan avec les changements proposés.\n\n**Résumé** — {summary}"
                    ))
                }
                Err(err) => {
                    warn!(%err, "pending change could not be applied");
                    DispatchOutcome::command(format!(
                        "⚠️ Je n'ai pas réussi à appliquer la modification. {err}"
                    ))
                }
            });
        }

        if NEGATIVE.is_match(&instruction.lower) {
            session.pending = None;
            return Some(DispatchOutcome::command(
                "👍 D'accord, je ne modifie pas le plan.",
            ));
        }

        debug!("pending change kept, instruction is neither yes nor no");
        None
    }

    /* ------------------------------- Handlers ------------------------------- */

    fn regenerate(
        _: &Instruction<'_>,
        session: &mut CoachSession,
        assistant: &dyn PlanAssistant,
    ) -> Result<DispatchOutcome, CoachError> {
        let feedback = match session.regenerate_plan(assistant) {
            PlanSource::Assistant => "🔄 J'ai régénéré ton plan.",
            PlanSource::Fallback => "🔄 J'ai régénéré ton plan (modèle local).",
        };
        Ok(DispatchOutcome::plan_updated(feedback))
    }

    fn add_exercise(
        instruction: &Instruction<'_>,
        session: &mut CoachSession,
        _: &dyn PlanAssistant,
    ) -> Result<DispatchOutcome, CoachError> {
        let day = target_day(instruction)?;
        let line = instruction.payload(&ADD_VERB);
        if !session.add_exercise(day, &line) {
            return Err(CoachError::DayNotFound(day));
        }
        Ok(DispatchOutcome::plan_updated(format!(
            "➕ Ajouté au Jour {day} : {line}"
        )))
    }

    fn explicit_replacement(instruction: &Instruction<'_>) -> Option<(String, String)> {
        let text = instruction.without_day();
        let caps = EXPLICIT_REPLACE.captures(&text)?;
        let old = clean_term(&caps[1]);
        let new = clean_term(&caps[2]);
        (!old.is_empty() && !new.is_empty()).then_some((old, new))
    }

    fn replace_term(
        instruction: &Instruction<'_>,
        session: &mut CoachSession,
        _: &dyn PlanAssistant,
    ) -> Result<DispatchOutcome, CoachError> {
        let (old, new) = explicit_replacement(instruction)
            .ok_or_else(|| CoachError::TermNotFound {
                term: instruction.raw.to_string(),
                day: 1,
            })?;
        let day = instruction.day.map_or(1, |d| d.day);
        if !session.replace_term(day, &old, &new) {
            return Err(not_found(session, day, &old));
        }
        Ok(DispatchOutcome::plan_updated(format!(
            "🔁 Jour {day} : « {old} » remplacé par « {new} »."
        )))
    }

    fn remove_or_substitute(
        instruction: &Instruction<'_>,
        session: &mut CoachSession,
        _: &dyn PlanAssistant,
    ) -> Result<DispatchOutcome, CoachError> {
        let day = target_day(instruction)?;
        let target = instruction.payload(&REMOVE_VERB);
        if session.remove_lines(day, &target) {
            return Ok(DispatchOutcome::plan_updated(format!(
                "🗑️ Jour {day} : « {target} » retiré."
            )));
        }
        if session.replace_term(day, &target, GENERIC_SUBSTITUTE) {
            return Ok(DispatchOutcome::plan_updated(format!(
                "🔁 Jour {day} : « {target} » remplacé par un {GENERIC_SUBSTITUTE}."
            )));
        }
        Err(not_found(session, day, &target))
    }

    fn suggest_substitution(
        instruction: &Instruction<'_>,
        session: &mut CoachSession,
        assistant: &dyn PlanAssistant,
    ) -> Result<DispatchOutcome, CoachError> {
        if !assistant.is_configured() {
            return Ok(DispatchOutcome::command(
                "💡 Pour que je puisse proposer et appliquer un exercice de remplacement \
                 automatiquement, configure un assistant. Tu peux aussi écrire \
                 « remplace X par Y au jour N ».",
            ));
        }
        let suggestion = assistant
            .suggest_substitution(instruction.raw, &session.profile, session.plan_text())
            .map_err(|e| CoachError::External(e.to_string()))?;
        if suggestion.trim().is_empty() {
            return Err(CoachError::External("aucune suggestion reçue".into()));
        }
        session.pending = Some(PendingChange {
            instruction: instruction.raw.to_string(),
        });
        Ok(DispatchOutcome::command(format!(
            "{}\n\nVeux-tu que je l'applique au plan ? (oui / non)",
            suggestion.trim()
        )))
    }

    fn set_time_of_day(
        instruction: &Instruction<'_>,
        session: &mut CoachSession,
        _: &dyn PlanAssistant,
    ) -> Result<DispatchOutcome, CoachError> {
        let time_of_day = time_of_day_in(instruction.raw)
            .ok_or_else(|| CoachError::UnknownTimeOfDay(instruction.raw.to_string()))?;
        session.set_time_of_day(time_of_day);
        Ok(DispatchOutcome::calendar_updated(format!(
            "🕒 Séances planifiées : {}.",
            time_of_day.label()
        )))
    }

    fn set_notifications(
        instruction: &Instruction<'_>,
        session: &mut CoachSession,
        _: &dyn PlanAssistant,
    ) -> Result<DispatchOutcome, CoachError> {
        if NOTIFY_DISABLE.is_match(instruction.raw) {
            session.notifications.enabled = false;
            return Ok(DispatchOutcome::command("🔕 Rappels désactivés."));
        }
        if NOTIFY_ENABLE.is_match(instruction.raw) {
            session.notifications.enabled = true;
        }
        let days: std::collections::BTreeSet<u8> = REMINDER_DAY
            .captures_iter(instruction.raw)
            .filter_map(|caps| caps[1].parse().ok())
            .collect();
        if !days.is_empty() {
            session.notifications.reminder_days = days;
        }
        let listed: Vec<String> = session
            .notifications
            .reminder_days
            .iter()
            .map(|d| format!("J{d}"))
            .collect();
        let state = if session.notifications.enabled {
            "🔔 Rappels activés"
        } else {
            "🔕 Rappels désactivés"
        };
        Ok(DispatchOutcome::command(format!(
            "{state} ({}).",
            listed.join(", ")
        )))
    }

    fn set_start_date(
        instruction: &Instruction<'_>,
        session: &mut CoachSession,
        _: &dyn PlanAssistant,
    ) -> Result<DispatchOutcome, CoachError> {
        let date = extract_date(instruction.raw)?;
        session.set_start_date(date);
        Ok(DispatchOutcome::calendar_updated(format!(
            "📅 Début du plan fixé au {}.",
            date.format("%d/%m/%Y")
        )))
    }

    fn city_value(instruction: &Instruction<'_>) -> Option<String> {
        let caps = CITY.captures(instruction.raw)?;
        let city = caps[1]
            .trim()
            .trim_end_matches(|c: char| ".!?".contains(c))
            .trim()
            .to_string();
        (!city.is_empty()).then_some(city)
    }

    fn set_city(
        instruction: &Instruction<'_>,
        session: &mut CoachSession,
        _: &dyn PlanAssistant,
    ) -> Result<DispatchOutcome, CoachError> {
        let city = city_value(instruction)
            .ok_or_else(|| CoachError::UnknownCity(instruction.raw.to_string()))?;
        session.city = city.clone();
        session.profile.city = city.clone();
        Ok(DispatchOutcome::calendar_updated(format!(
            "📍 Ville mise à jour : {city}."
        )))
    }

    fn freeform_rewrite(
        instruction: &Instruction<'_>,
        session: &mut CoachSession,
        assistant: &dyn PlanAssistant,
    ) -> Result<DispatchOutcome, CoachError> {
        if !assistant.is_configured() {
            return Ok(DispatchOutcome::not_a_command(
                "💡 Je n'ai pas reconnu de commande. Essaie « ajoute … au jour N », \
                 « remplace X par Y », « régénère le plan » ou configure un assistant \
                 pour adapter le plan librement.",
            ));
        }
        let (plan, summary) = assistant
            .rewrite_plan(instruction.raw, session.plan_text(), &session.profile)
            .map_err(|e| CoachError::External(e.to_string()))?
            .accepted()?;
        session.replace_plan(plan);
        Ok(DispatchOutcome::plan_updated(format!(
            "🧠 J'ai adapté le plan automatiquement.\n\n**Résumé** — {summary}"
        )))
    }

    fn target_day(instruction: &Instruction<'_>) -> Result<u32, CoachError> {
        instruction
            .day
            .map(|d| d.day)
            .ok_or(CoachError::DayNotFound(0))
    }

    fn not_found(session: &CoachSession, day: u32, term: &str) -> CoachError {
        if editor::locate_day(session.plan_text(), day).is_none() {
            CoachError::DayNotFound(day)
        } else {
            CoachError::TermNotFound {
                term: term.to_string(),
                day,
            }
        }
    }

}
