//! Version strings as the module protocol defines them.
//!
//! These are semantic versions with a mandatory leading `v`, where `v1` and
//! `v1.2` are accepted short forms, and where a synthetic "pseudo-version"
//! encodes an untagged commit as `vX.Y.Z-yyyymmddhhmmss-rev`.

use jiff::civil::DateTime;
use jiff::tz::TimeZone;
use jiff::Timestamp;

#[derive(Debug, Default)]
struct Parsed<'a> {
    major: &'a str,
    minor: &'a str,
    patch: &'a str,
    /// Includes the leading `-` when present.
    prerelease: &'a str,
    /// Includes the leading `+` when present.
    build: &'a str,
}

/// Parse a decimal with no leading zeros. Returns (digits, rest).
fn parse_int(v: &str) -> Option<(&str, &str)> {
    let end = v.bytes().take_while(|b| b.is_ascii_digit()).count();
    if end == 0 {
        return None;
    }
    let digits = &v[..end];
    if digits.len() > 1 && digits.starts_with('0') {
        return None;
    }
    Some((digits, &v[end..]))
}

fn ident_ok(ident: &str, allow_leading_zeros: bool) -> bool {
    if ident.is_empty() {
        return false;
    }
    if !ident
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'-')
    {
        return false;
    }
    if !allow_leading_zeros
        && ident.len() > 1
        && ident.starts_with('0')
        && ident.bytes().all(|b| b.is_ascii_digit())
    {
        return false;
    }
    true
}

/// Parse a dot-separated identifier list introduced by `intro`.
/// Returns the matched span including the introducer.
fn parse_idents(v: &str, intro: char, allow_leading_zeros: bool) -> Option<(&str, &str)> {
    let rest = v.strip_prefix(intro)?;
    let end = rest.find('+').unwrap_or(rest.len());
    let (list, tail) = rest.split_at(end);
    if !list.split('.').all(|id| ident_ok(id, allow_leading_zeros)) {
        return None;
    }
    Some((&v[..1 + list.len()], tail))
}

fn parse(v: &str) -> Option<Parsed<'_>> {
    let rest = v.strip_prefix('v')?;
    let (major, rest) = parse_int(rest)?;
    if rest.is_empty() {
        return Some(Parsed {
            major,
            minor: "0",
            patch: "0",
            ..Parsed::default()
        });
    }
    let rest = rest.strip_prefix('.')?;
    let (minor, rest) = parse_int(rest)?;
    if rest.is_empty() {
        return Some(Parsed {
            major,
            minor,
            patch: "0",
            ..Parsed::default()
        });
    }
    let rest = rest.strip_prefix('.')?;
    let (patch, mut rest) = parse_int(rest)?;
    let mut prerelease = "";
    let mut build = "";
    if rest.starts_with('-') {
        let (pre, tail) = parse_idents(rest, '-', false)?;
        prerelease = pre;
        rest = tail;
    }
    if rest.starts_with('+') {
        let (b, tail) = parse_idents(rest, '+', true)?;
        build = b;
        rest = tail;
    }
    if !rest.is_empty() {
        return None;
    }
    Some(Parsed {
        major,
        minor,
        patch,
        prerelease,
        build,
    })
}

/// Whether `v` is a valid version string.
pub fn is_valid(v: &str) -> bool {
    parse(v).is_some()
}

/// The canonical form of `v`: short forms completed, build metadata dropped.
/// `None` when `v` is not a valid version.
pub fn canonical(v: &str) -> Option<String> {
    let p = parse(v)?;
    Some(format!(
        "v{}.{}.{}{}",
        p.major, p.minor, p.patch, p.prerelease
    ))
}

/// The build-metadata suffix of `v`, `+` included; empty for none or invalid.
pub fn build_metadata(v: &str) -> &str {
    match parse(v) {
        Some(p) => p.build,
        None => "",
    }
}

/// The `(timestamp, revision)` halves of a pseudo-version's prerelease.
///
/// Accepted shapes, optionally with `+incompatible`:
/// `vX.0.0-<stamp>-<rev>` and `vX.Y.Z-(pre.)?0.<stamp>-<rev>` where
/// `<stamp>` is fourteen digits.
fn pseudo_parts(v: &str) -> Option<(&str, &str)> {
    let base = v.split('+').next().unwrap_or(v);
    let dash = base.find('-')?;
    let (triple, pre) = (&base[..dash], &base[dash + 1..]);
    let last = pre.rfind('-')?;
    let (head, rev) = (&pre[..last], &pre[last + 1..]);
    if rev.is_empty() || !rev.bytes().all(|b| b.is_ascii_alphanumeric()) {
        return None;
    }
    let stamp_ok = |s: &str| s.len() == 14 && s.bytes().all(|b| b.is_ascii_digit());
    if stamp_ok(head) {
        // vX.0.0-<stamp>-<rev>
        let mut nums = triple.strip_prefix('v')?.split('.');
        nums.next()?;
        if nums.next()? != "0" || nums.next()? != "0" || nums.next().is_some() {
            return None;
        }
        return Some((head, rev));
    }
    // vX.Y.Z-(pre.)?0.<stamp>-<rev>
    let dot = head.rfind('.')?;
    let (front, stamp) = (&head[..dot], &head[dot + 1..]);
    if !stamp_ok(stamp) {
        return None;
    }
    if front != "0" && !front.ends_with(".0") {
        return None;
    }
    Some((stamp, rev))
}

/// Whether `v` is a pseudo-version.
pub fn is_pseudo(v: &str) -> bool {
    v.matches('-').count() >= 2 && is_valid(v) && pseudo_parts(v).is_some()
}

/// The revision encoded in a pseudo-version.
pub fn pseudo_rev(v: &str) -> Option<&str> {
    pseudo_parts(v).map(|(_, rev)| rev)
}

/// The UTC commit time encoded in a pseudo-version.
pub fn pseudo_timestamp(v: &str) -> Option<Timestamp> {
    let (stamp, _) = pseudo_parts(v)?;
    let civil = DateTime::strptime("%Y%m%d%H%M%S", stamp).ok()?;
    let zoned = civil.to_zoned(TimeZone::UTC).ok()?;
    Some(zoned.timestamp())
}
