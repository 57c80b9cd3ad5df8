//! Compose classification and compose-id decomposition. Both are pure
//! string work: resolving which page a classified compose lives on is the
//! resolver's job.

use crate::error::{TcmsError, TcmsResult};

/// The two flavors of compose a validation event can cover.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComposeClass {
    /// A calendar-date compose: a plain `YYYYMMDD` date or a Pungi-style
    /// nightly identifier (`20160308.n.0`) embedding one.
    Nightly,
    /// A candidate compose within a milestone: `TC1`, `RC3.1`, or a Pungi
    /// milestone compose like `1.2`.
    Milestone,
}

/// Decide whether a compose value names a nightly or a milestone
/// candidate. Anything else is `InvalidCompose`.
pub fn classify_compose(compose: &str) -> TcmsResult<ComposeClass> {
    if is_date(compose) || is_nightly_id(compose) {
        return Ok(ComposeClass::Nightly);
    }
    if is_candidate(compose) || is_numeric_pair(compose) {
        return Ok(ComposeClass::Milestone);
    }
    Err(TcmsError::InvalidCompose(format!(
        "compose must be a candidate identifier (TC1, RC3, 1.2...), a date \
         in YYYYMMDD format, or a nightly identifier (20160308.n.0), not \
         {compose:?}"
    )))
}

/// Decompose a fully-qualified nightly compose id
/// (`Fedora-33-20200513.n.0`, `Fedora-Modular-Rawhide-20171123.n.1`) into
/// its `(dist, release, milestone, compose)` event identity.
///
/// The version segment picks the milestone: a numeric version is a
/// Branched nightly, `Rawhide` is a Rawhide one. Rawhide composes carry no
/// release number, so `release` comes back empty and the resolver fills it
/// from the current event. Production ids (`Fedora-33-20200513.0`) are
/// rejected: their milestone is not derivable from the id alone.
pub fn parse_compose_id(cid: &str) -> TcmsResult<(String, String, String, String)> {
    let invalid = || {
        TcmsError::InvalidCompose(format!(
            "cannot derive an event from compose id {cid:?}; only nightly \
             compose ids (Shortname-Version-YYYYMMDD.t.R) are supported"
        ))
    };
    let (prefix, compose) = cid.rsplit_once('-').ok_or_else(invalid)?;
    if !is_nightly_id(compose) {
        return Err(invalid());
    }
    let (dist, version) = prefix.rsplit_once('-').ok_or_else(invalid)?;
    if dist.is_empty() || version.is_empty() {
        return Err(invalid());
    }
    let (release, milestone) = if version.eq_ignore_ascii_case("rawhide") {
        (String::new(), "Rawhide".to_string())
    } else if version.chars().all(|ch| ch.is_ascii_digit()) {
        (version.to_string(), "Branched".to_string())
    } else {
        return Err(invalid());
    };
    Ok((dist.to_string(), release, milestone, compose.to_string()))
}

/// An 8-digit `YYYYMMDD` string naming a real calendar date.
fn is_date(value: &str) -> bool {
    if value.len() != 8 || !value.chars().all(|ch| ch.is_ascii_digit()) {
        return false;
    }
    let year: i32 = value[..4].parse().unwrap_or(0);
    let month: u32 = value[4..6].parse().unwrap_or(0);
    let day: u32 = value[6..8].parse().unwrap_or(0);
    (1..=12).contains(&month) && day >= 1 && day <= days_in_month(year, month)
}

/// A Pungi nightly identifier: date, compose type, respin (`20160308.n.0`).
fn is_nightly_id(value: &str) -> bool {
    let mut parts = value.split('.');
    let (Some(date), Some(typ), Some(respin), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return false;
    };
    is_date(date)
        && !typ.is_empty()
        && typ.chars().all(|ch| ch.is_ascii_alphabetic())
        && !respin.is_empty()
        && respin.chars().all(|ch| ch.is_ascii_digit())
}

/// A TC/RC candidate name: TC1, RC10, RC23.6.
fn is_candidate(value: &str) -> bool {
    let rest = value
        .strip_prefix(['T', 'R', 't', 'r'])
        .and_then(|rest| rest.strip_prefix(['C', 'c']));
    let Some(rest) = rest else {
        return false;
    };
    let (whole, fraction) = match rest.split_once('.') {
        Some((whole, fraction)) => (whole, fraction),
        None => (rest, ""),
    };
    !whole.is_empty()
        && whole.chars().all(|ch| ch.is_ascii_digit())
        && fraction.chars().all(|ch| ch.is_ascii_digit())
}

/// A Pungi milestone compose: 1.1, 1.2 ... 10.10 ...
fn is_numeric_pair(value: &str) -> bool {
    match value.split_once('.') {
        Some((major, minor)) => {
            !major.is_empty()
                && !minor.is_empty()
                && major.chars().all(|ch| ch.is_ascii_digit())
                && minor.chars().all(|ch| ch.is_ascii_digit())
        }
        None => false,
    }
}

fn days_in_month(year: i32, month: u32) -> u32 {
    match month {
        1 | 3 | 5 | 7 | 8 | 10 | 12 => 31,
        4 | 6 | 9 | 11 => 30,
        2 if (year % 4 == 0 && year % 100 != 0) || year % 400 == 0 => 29,
        2 => 28,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dates_and_nightly_ids_classify_as_nightly() {
        assert_eq!(classify_compose("20160222").unwrap(), ComposeClass::Nightly);
        assert_eq!(classify_compose("20160308.n.0").unwrap(), ComposeClass::Nightly);
        assert_eq!(classify_compose("20160310.test.2").unwrap(), ComposeClass::Nightly);
    }

    #[test]
    fn candidates_classify_as_milestone() {
        assert_eq!(classify_compose("TC1").unwrap(), ComposeClass::Milestone);
        assert_eq!(classify_compose("RC10").unwrap(), ComposeClass::Milestone);
        assert_eq!(classify_compose("rc23.6").unwrap(), ComposeClass::Milestone);
        assert_eq!(classify_compose("1.2").unwrap(), ComposeClass::Milestone);
        assert_eq!(classify_compose("10.10").unwrap(), ComposeClass::Milestone);
    }

    #[test]
    fn garbage_compose_values_are_invalid() {
        for bad in ["", "Beta", "20161322", "2016030", "RC", "1.2.3.4", "1.", "TCx"] {
            let err = classify_compose(bad).expect_err(bad);
            assert!(matches!(err, TcmsError::InvalidCompose(_)), "{bad}");
        }
    }

    #[test]
    fn nightly_ids_with_invalid_dates_are_rejected() {
        assert!(classify_compose("20161322.n.0").is_err());
        assert!(classify_compose("20160229.n.0").is_ok());
        assert!(classify_compose("20150229.n.0").is_err());
    }

    #[test]
    fn branched_compose_ids_decompose() {
        assert_eq!(
            parse_compose_id("Fedora-27-20171108.n.1").unwrap(),
            (
                "Fedora".to_string(),
                "27".to_string(),
                "Branched".to_string(),
                "20171108.n.1".to_string()
            )
        );
        assert_eq!(
            parse_compose_id("Fedora-Modular-27-20171123.n.0").unwrap(),
            (
                "Fedora-Modular".to_string(),
                "27".to_string(),
                "Branched".to_string(),
                "20171123.n.0".to_string()
            )
        );
    }

    #[test]
    fn rawhide_compose_ids_leave_the_release_open() {
        assert_eq!(
            parse_compose_id("Fedora-Rawhide-20180605.n.0").unwrap(),
            (
                "Fedora".to_string(),
                String::new(),
                "Rawhide".to_string(),
                "20180605.n.0".to_string()
            )
        );
    }

    #[test]
    fn production_and_malformed_compose_ids_are_rejected() {
        for bad in [
            "Fedora-27-20171105.0",
            "Fedora-27-RC1",
            "Fedora-20171108.n.1",
            "-27-20171108.n.1",
            "Fedora-Beta-20171108.n.1",
            "",
        ] {
            let err = parse_compose_id(bad).expect_err(bad);
            assert!(matches!(err, TcmsError::InvalidCompose(_)), "{bad}");
        }
    }
}
