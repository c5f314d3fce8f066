//! crates/talk_diary_core/src/diary.rs
//!
//! Indexes normalized reports by the date they summarize, for the diary
//! calendar and the per-day report view.

use chrono::NaiveDate;
use std::collections::BTreeMap;

use crate::report::{normalize_report, DailyReport, ReportRecord};

const DATE_FORMAT: &str = "%Y-%m-%d";

/// Reports of one profile keyed by target date.
#[derive(Debug, Default, Clone)]
pub struct DiaryIndex {
    reports: BTreeMap<String, DailyReport>,
}

impl DiaryIndex {
    /// Builds the index from raw backend rows. Rows that do not normalize are
    /// skipped. When two rows share a target date, the later row wins.
    pub fn from_records<'a, I>(records: I) -> Self
    where
        I: IntoIterator<Item = &'a ReportRecord>,
    {
        records
            .into_iter()
            .filter_map(normalize_report)
            .collect()
    }

    pub fn insert(&mut self, report: DailyReport) -> Option<DailyReport> {
        self.reports.insert(report.report_date.clone(), report)
    }

    pub fn report_for(&self, date: &str) -> Option<&DailyReport> {
        self.reports.get(date)
    }

    /// Dominant emotion of the report for `date`, if any.
    pub fn emotion_for(&self, date: &str) -> Option<&str> {
        self.report_for(date)?
            .content
            .daily_summary
            .emotion_icon
            .as_deref()
    }

    /// Dominant emotions of every day in `from..=to` that has one.
    pub fn emotions_between(&self, from: NaiveDate, to: NaiveDate) -> Vec<(NaiveDate, &str)> {
        self.dated()
            .filter(|(date, _)| *date >= from && *date <= to)
            .filter_map(|(date, report)| {
                report
                    .content
                    .daily_summary
                    .emotion_icon
                    .as_deref()
                    .map(|emotion| (date, emotion))
            })
            .collect()
    }

    /// Reports whose target date falls in `from..=to`, oldest first.
    pub fn reports_between(&self, from: NaiveDate, to: NaiveDate) -> Vec<&DailyReport> {
        self.dated()
            .filter(|(date, _)| *date >= from && *date <= to)
            .map(|(_, report)| report)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.reports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reports.is_empty()
    }

    /// All reports ordered by target date.
    pub fn into_reports(self) -> Vec<DailyReport> {
        self.reports.into_values().collect()
    }

    // Keys that are not calendar dates are reachable through `report_for` only.
    fn dated(&self) -> impl Iterator<Item = (NaiveDate, &DailyReport)> {
        self.reports.iter().filter_map(|(key, report)| {
            NaiveDate::parse_from_str(key, DATE_FORMAT)
                .ok()
                .map(|date| (date, report))
        })
    }
}

impl FromIterator<DailyReport> for DiaryIndex {
    fn from_iter<T: IntoIterator<Item = DailyReport>>(iter: T) -> Self {
        let mut index = Self::default();
        for report in iter {
            index.insert(report);
        }
        index
    }
}
