//! Pure implementations of the browser-standard PAC predicates.
//!
//! The JavaScript glue in [`crate::resolver`] forwards to these functions so
//! the range and matching semantics can be tested without an engine.

use std::net::Ipv4Addr;

use time::{Month, OffsetDateTime, Weekday};

/// `isPlainHostName(host)`: true when the hostname contains no dots.
pub(crate) fn is_plain_host_name(host: &str) -> bool {
  !host.contains('.')
}

/// `dnsDomainIs(host, domain)`: true when host ends with domain.
pub(crate) fn dns_domain_is(host: &str, domain: &str) -> bool {
  host.len() >= domain.len() && host.to_ascii_lowercase().ends_with(&domain.to_ascii_lowercase())
}

/// `localHostOrDomainIs(host, hostdom)`: exact match, or the plain hostname
/// matches the hostname part of hostdom.
pub(crate) fn local_host_or_domain_is(host: &str, hostdom: &str) -> bool {
  if host.eq_ignore_ascii_case(hostdom) {
    return true;
  }
  if host.contains('.') {
    return false;
  }
  match hostdom.split_once('.') {
    Some((name, _)) => host.eq_ignore_ascii_case(name),
    None => false,
  }
}

/// `dnsDomainLevels(host)`: number of dots in the hostname.
pub(crate) fn dns_domain_levels(host: &str) -> i32 {
  host.bytes().filter(|&b| b == b'.').count() as i32
}

/// `isInNet(addr, pattern, mask)`: masked IPv4 comparison. `addr` must
/// already be a dotted quad; hostname resolution happens in the caller.
pub(crate) fn is_in_net(addr: &str, pattern: &str, mask: &str) -> bool {
  let (Ok(addr), Ok(pattern), Ok(mask)) = (
    addr.parse::<Ipv4Addr>(),
    pattern.parse::<Ipv4Addr>(),
    mask.parse::<Ipv4Addr>(),
  ) else {
    return false;
  };
  let addr = u32::from(addr);
  let pattern = u32::from(pattern);
  let mask = u32::from(mask);
  addr & mask == pattern & mask
}

/// `shExpMatch(str, shexp)`: shell glob match where `*` matches any run and
/// `?` a single character.
pub(crate) fn sh_exp_match(s: &str, exp: &str) -> bool {
  glob_match(exp.as_bytes(), s.as_bytes())
}

fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
  // Iterative matcher with single-star backtracking.
  let (mut p, mut t) = (0, 0);
  let (mut star, mut star_t) = (None, 0);
  while t < text.len() {
    if p < pattern.len() && (pattern[p] == b'?' || pattern[p] == text[t]) {
      p += 1;
      t += 1;
    } else if p < pattern.len() && pattern[p] == b'*' {
      star = Some(p);
      star_t = t;
      p += 1;
    } else if let Some(sp) = star {
      p = sp + 1;
      star_t += 1;
      t = star_t;
    } else {
      return false;
    }
  }
  while p < pattern.len() && pattern[p] == b'*' {
    p += 1;
  }
  p == pattern.len()
}

/// Clock passed to the range predicates, split out for tests.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PacClock {
  pub local: OffsetDateTime,
  pub utc: OffsetDateTime,
}

impl PacClock {
  pub(crate) fn now() -> Self {
    let utc = OffsetDateTime::now_utc();
    PacClock {
      local: OffsetDateTime::now_local().unwrap_or(utc),
      utc,
    }
  }

  fn pick(&self, gmt: bool) -> OffsetDateTime {
    if gmt {
      self.utc
    } else {
      self.local
    }
  }
}

fn parse_weekday(s: &str) -> Option<Weekday> {
  match s {
    "SUN" => Some(Weekday::Sunday),
    "MON" => Some(Weekday::Monday),
    "TUE" => Some(Weekday::Tuesday),
    "WED" => Some(Weekday::Wednesday),
    "THU" => Some(Weekday::Thursday),
    "FRI" => Some(Weekday::Friday),
    "SAT" => Some(Weekday::Saturday),
    _ => None,
  }
}

fn parse_month(s: &str) -> Option<Month> {
  match s {
    "JAN" => Some(Month::January),
    "FEB" => Some(Month::February),
    "MAR" => Some(Month::March),
    "APR" => Some(Month::April),
    "MAY" => Some(Month::May),
    "JUN" => Some(Month::June),
    "JUL" => Some(Month::July),
    "AUG" => Some(Month::August),
    "SEP" => Some(Month::September),
    "OCT" => Some(Month::October),
    "NOV" => Some(Month::November),
    "DEC" => Some(Month::December),
    _ => None,
  }
}

/// Strips a trailing `"GMT"` argument, returning whether it was present.
fn split_gmt<'a>(args: &'a [String]) -> (&'a [String], bool) {
  match args.last() {
    Some(last) if last == "GMT" => (&args[..args.len() - 1], true),
    _ => (args, false),
  }
}

/// `weekdayRange(wd1 [, wd2] [, "GMT"])`. Ranges wrap across the weekend,
/// so `weekdayRange("FRI", "MON")` covers FRI, SAT, SUN and MON.
pub(crate) fn weekday_range(args: &[String], clock: PacClock) -> bool {
  let (args, gmt) = split_gmt(args);
  let today = clock.pick(gmt).weekday().number_days_from_sunday();
  match args {
    [wd] => parse_weekday(wd).is_some_and(|w| w.number_days_from_sunday() == today),
    [wd1, wd2] => {
      let (Some(a), Some(b)) = (parse_weekday(wd1), parse_weekday(wd2)) else {
        return false;
      };
      let (a, b) = (a.number_days_from_sunday(), b.number_days_from_sunday());
      if a <= b {
        (a..=b).contains(&today)
      } else {
        today >= a || today <= b
      }
    }
    _ => false,
  }
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
struct DatePattern {
  day: Option<u8>,
  month: Option<Month>,
  year: Option<i32>,
}

fn classify_date_arg(arg: &str, into: &mut DatePattern) -> bool {
  if let Some(m) = parse_month(arg) {
    into.month = Some(m);
    return true;
  }
  if let Ok(n) = arg.parse::<i32>() {
    if (1..=31).contains(&n) && into.day.is_none() {
      into.day = Some(n as u8);
    } else {
      into.year = Some(n);
    }
    return true;
  }
  false
}

fn date_ordinal(p: DatePattern, now: OffsetDateTime) -> i64 {
  // Missing fields inherit the current date so partially specified
  // patterns compare on the fields they carry.
  let year = p.year.unwrap_or(now.year()) as i64;
  let month = p.month.unwrap_or(now.month()) as u8 as i64;
  let day = p.day.unwrap_or(now.day()) as i64;
  (year * 12 + month) * 31 + day
}

/// `dateRange(...)`: one to six date arguments plus an optional `"GMT"`.
/// Single values match on their field; pairs form inclusive ranges.
pub(crate) fn date_range(args: &[String], clock: PacClock) -> bool {
  let (args, gmt) = split_gmt(args);
  let now = clock.pick(gmt);
  if args.is_empty() {
    return false;
  }

  if args.len() == 1 {
    let mut p = DatePattern::default();
    if !classify_date_arg(&args[0], &mut p) {
      return false;
    }
    return p.day.map_or(true, |d| d == now.day())
      && p.month.map_or(true, |m| m == now.month())
      && p.year.map_or(true, |y| y == now.year());
  }

  // Even argument counts split into a start and an end pattern.
  if args.len() % 2 != 0 {
    return false;
  }
  let (lo_args, hi_args) = args.split_at(args.len() / 2);
  let (mut lo, mut hi) = (DatePattern::default(), DatePattern::default());
  for a in lo_args {
    if !classify_date_arg(a, &mut lo) {
      return false;
    }
  }
  for a in hi_args {
    if !classify_date_arg(a, &mut hi) {
      return false;
    }
  }

  let today = date_ordinal(DatePattern::default(), now);
  let start = date_ordinal(lo, now);
  let end = date_ordinal(hi, now);
  if start <= end {
    (start..=end).contains(&today)
  } else {
    // Wrapping range, e.g. dateRange("NOV", "FEB").
    today >= start || today <= end
  }
}

/// `timeRange(...)`: hour, hour pair, hour:minute pairs or
/// hour:minute:second pairs, plus an optional `"GMT"`.
pub(crate) fn time_range(args: &[String], clock: PacClock) -> bool {
  let (args, gmt) = split_gmt(args);
  let now = clock.pick(gmt);
  let now_secs =
    now.hour() as i64 * 3600 + now.minute() as i64 * 60 + now.second() as i64;

  let nums: Vec<i64> = match args.iter().map(|a| a.parse::<i64>()).collect() {
    Ok(v) => v,
    Err(_) => return false,
  };

  let (start, end) = match nums.as_slice() {
    [h] => {
      if !(0..24).contains(h) {
        return false;
      }
      return now.hour() as i64 == *h;
    }
    [h1, h2] => (h1 * 3600, h2 * 3600 + 3599),
    [h1, m1, h2, m2] => (h1 * 3600 + m1 * 60, h2 * 3600 + m2 * 60 + 59),
    [h1, m1, s1, h2, m2, s2] => (h1 * 3600 + m1 * 60 + s1, h2 * 3600 + m2 * 60 + s2),
    _ => return false,
  };

  if start <= end {
    (start..=end).contains(&now_secs)
  } else {
    now_secs >= start || now_secs <= end
  }
}
