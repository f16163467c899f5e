//! Signed ISO-8601-like duration parsing for feed delays.
//!
//! The feed encodes delays as `[-]P[nY][nM][nD]T[nH][nM][n[.n]S]`. The
//! calendar part is tolerated but ignored; only the clock part contributes.
//! The pattern may appear anywhere in the input and the leftmost match wins.

use std::sync::LazyLock;

use regex::{Captures, Regex};

static DELAY_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(-?)P(?:\d+Y)?(?:\d+M)?(?:\d+D)?T(\d+H)?(\d+M)?(\d+(?:\.\d+)?S)?")
        .expect("delay pattern is valid")
});

pub struct DurationParser;

impl DurationParser {
    /// Converts a delay string into signed minutes. Input that does not
    /// contain the expected pattern yields `0.0`.
    pub fn parse_minutes(input: &str) -> f64 {
        let Some(captures) = DELAY_REGEX.captures(input) else {
            return 0.0;
        };

        let hours = Self::component(&captures, 2, 'H');
        let minutes = Self::component(&captures, 3, 'M');
        let seconds = Self::component(&captures, 4, 'S');
        let total = hours * 60.0 + minutes + seconds / 60.0;

        if &captures[1] == "-" { -total } else { total }
    }

    /// Numeric value of an optional `<n><designator>` group, 0 when absent.
    fn component(captures: &Captures<'_>, group: usize, designator: char) -> f64 {
        captures
            .get(group)
            .and_then(|m| m.as_str().trim_end_matches(designator).parse::<f64>().ok())
            .unwrap_or(0.0)
    }
}
