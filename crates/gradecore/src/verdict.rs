//! Verdict type and its total severity order.
//!
//! The source this was distilled from derives verdict ordering from
//! dunder-comparison overrides on the enum itself; that makes the order
//! implicit in declaration order and invisible at call sites. Here the
//! order lives in one place, [`severity`], and every aggregation MUST go
//! through it or [`max_by_severity`] rather than comparing variants
//! directly — there is deliberately no `Ord` impl on `Verdict`.

use serde::{Deserialize, Serialize};

/// Outcome of one testcase execution, or (for `Fn`) of a whole submission
/// decided before compilation ever started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Verdict {
    Ac,
    Wa,
    Tle,
    Mle,
    Re,
    Ce,
    Ole,
    Ie,
    /// Submission-level only: required files were missing at PreCheck.
    /// Never produced by testcase classification — see severity-aggregation
    /// open question.
    Fn_,
}

impl Verdict {
    /// Three/two-letter wire code, matching the database CHECK constraint
    /// and the wire contract in the external-interfaces section.
    pub fn code(&self) -> &'static str {
        match self {
            Verdict::Ac => "AC",
            Verdict::Wa => "WA",
            Verdict::Tle => "TLE",
            Verdict::Mle => "MLE",
            Verdict::Re => "RE",
            Verdict::Ce => "CE",
            Verdict::Ole => "OLE",
            Verdict::Ie => "IE",
            Verdict::Fn_ => "FN",
        }
    }

    /// Parse a wire code back into a `Verdict`.
    pub fn from_code(s: &str) -> Option<Self> {
        match s {
            "AC" => Some(Verdict::Ac),
            "WA" => Some(Verdict::Wa),
            "TLE" => Some(Verdict::Tle),
            "MLE" => Some(Verdict::Mle),
            "RE" => Some(Verdict::Re),
            "CE" => Some(Verdict::Ce),
            "OLE" => Some(Verdict::Ole),
            "IE" => Some(Verdict::Ie),
            "FN" => Some(Verdict::Fn_),
            _ => None,
        }
    }

    pub fn is_ac(&self) -> bool {
        matches!(self, Verdict::Ac)
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// The total order used for aggregation: `AC(0) < WA(1) < TLE(2) < MLE(3)
/// < RE(4) < CE(5) < OLE(6) < IE(7) < FN(8)`.
pub fn severity(v: Verdict) -> u8 {
    match v {
        Verdict::Ac => 0,
        Verdict::Wa => 1,
        Verdict::Tle => 2,
        Verdict::Mle => 3,
        Verdict::Re => 4,
        Verdict::Ce => 5,
        Verdict::Ole => 6,
        Verdict::Ie => 7,
        Verdict::Fn_ => 8,
    }
}

/// Fold a set of verdicts down to the single most severe one, seeded at
/// `AC` per the Finalize step (an empty testcase set is `AC`).
pub fn max_by_severity(verdicts: impl IntoIterator<Item = Verdict>) -> Verdict {
    verdicts
        .into_iter()
        .fold(Verdict::Ac, |acc, v| {
            if severity(v) > severity(acc) {
                v
            } else {
                acc
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_is_strictly_increasing_in_declaration_order() {
        let order = [
            Verdict::Ac,
            Verdict::Wa,
            Verdict::Tle,
            Verdict::Mle,
            Verdict::Re,
            Verdict::Ce,
            Verdict::Ole,
            Verdict::Ie,
            Verdict::Fn_,
        ];
        for w in order.windows(2) {
            assert!(severity(w[0]) < severity(w[1]), "{:?} < {:?}", w[0], w[1]);
        }
    }

    #[test]
    fn max_by_severity_picks_the_worst() {
        let got = max_by_severity([Verdict::Ac, Verdict::Wa, Verdict::Tle, Verdict::Ac]);
        assert_eq!(got, Verdict::Tle);
    }

    #[test]
    fn max_by_severity_of_empty_is_ac() {
        assert_eq!(max_by_severity(std::iter::empty()), Verdict::Ac);
    }

    #[test]
    fn fn_outranks_everything_including_ie() {
        assert_eq!(
            max_by_severity([Verdict::Ie, Verdict::Fn_, Verdict::Ac]),
            Verdict::Fn_
        );
    }

    #[test]
    fn code_roundtrips_through_from_code() {
        for v in [
            Verdict::Ac,
            Verdict::Wa,
            Verdict::Tle,
            Verdict::Mle,
            Verdict::Re,
            Verdict::Ce,
            Verdict::Ole,
            Verdict::Ie,
            Verdict::Fn_,
        ] {
            assert_eq!(Verdict::from_code(v.code()), Some(v));
        }
    }
}
