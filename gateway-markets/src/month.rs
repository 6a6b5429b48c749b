//! Futures month-code table and active-month scheduling.

use chrono::{Datelike, NaiveDate, Utc};

/// Maps a futures month-code letter to its calendar month (1-12).
pub fn month_code_to_month(code: char) -> Option<u32> {
    match code {
        'F' => Some(1),
        'G' => Some(2),
        'H' => Some(3),
        'J' => Some(4),
        'K' => Some(5),
        'M' => Some(6),
        'N' => Some(7),
        'Q' => Some(8),
        'U' => Some(9),
        'V' => Some(10),
        'X' => Some(11),
        'Z' => Some(12),
        _ => None,
    }
}

/// Inverse of [`month_code_to_month`].
pub fn month_to_month_code(month: u32) -> Option<char> {
    match month {
        1 => Some('F'),
        2 => Some('G'),
        3 => Some('H'),
        4 => Some('J'),
        5 => Some('K'),
        6 => Some('M'),
        7 => Some('N'),
        8 => Some('Q'),
        9 => Some('U'),
        10 => Some('V'),
        11 => Some('X'),
        12 => Some('Z'),
        _ => None,
    }
}

/// A product's delivery-month cycle, e.g. the quarterly `H/M/U/Z` schedule
/// shared by most index and rate futures.
#[derive(Debug, Clone)]
pub struct MonthSchedule(Vec<u32>);

impl MonthSchedule {
    pub fn quarterly() -> Self {
        Self(vec![3, 6, 9, 12])
    }

    pub fn monthly() -> Self {
        Self((1..=12).collect())
    }

    pub fn from_months(months: impl IntoIterator<Item = u32>) -> Self {
        let mut months: Vec<u32> = months.into_iter().collect();
        months.sort_unstable();
        months.dedup();
        Self(months)
    }

    /// Picks the earliest scheduled month at or after `current_month` in
    /// `current_year`, else the first scheduled month of the next year.
    pub fn active_month(&self, current_year: i32, current_month: u32) -> (i32, u32) {
        match self.0.iter().find(|&&m| m >= current_month) {
            Some(&m) => (current_year, m),
            None => (current_year + 1, self.0[0]),
        }
    }

    pub fn active_month_now(&self) -> (i32, u32) {
        let now = Utc::now();
        self.active_month(now.year(), now.month())
    }
}

/// The expiry convention used to decide whether an encoded contract month
/// has already passed: the 20th of the coded month.
pub fn encoded_expiry_date(year_full: i32, month: u32) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(year_full, month, 20)
}

/// Two-digit year as carried in a contract id's `MMYY` suffix, expanded
/// against a pivot (years `00..=68` => 2000s, `69..=99` => 1900s, matching
/// common futures-contract-id conventions).
pub fn expand_two_digit_year(yy: u32) -> i32 {
    if yy <= 68 {
        2000 + yy as i32
    } else {
        1900 + yy as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn month_code_round_trips() {
        for month in 1..=12u32 {
            let code = month_to_month_code(month).unwrap();
            assert_eq!(month_code_to_month(code), Some(month));
        }
    }

    #[test]
    fn quarterly_schedule_picks_next_month_in_year() {
        let schedule = MonthSchedule::quarterly();
        assert_eq!(schedule.active_month(2025, 4), (2025, 6));
        assert_eq!(schedule.active_month(2025, 6), (2025, 6));
    }

    #[test]
    fn quarterly_schedule_rolls_into_next_year() {
        let schedule = MonthSchedule::quarterly();
        assert_eq!(schedule.active_month(2025, 12), (2025, 12));
        assert_eq!(schedule.active_month(2025, 13), (2026, 3));
    }

    #[test]
    fn two_digit_year_pivot() {
        assert_eq!(expand_two_digit_year(25), 2025);
        assert_eq!(expand_two_digit_year(68), 2068);
        assert_eq!(expand_two_digit_year(69), 1969);
    }
}
