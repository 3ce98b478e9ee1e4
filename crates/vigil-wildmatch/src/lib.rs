//! A glob-style string matcher for the query engine.
//!
//! This is deliberately not a general-purpose glob library: the query terms
//! that use it need behavior toggles that off-the-shelf matchers don't
//! expose. `PERIOD` makes leading dots unmatched by wildcards (so `*.c`
//! skips dotfiles unless the caller opted in), `NOESCAPE` turns backslash
//! into an ordinary character, `PATHNAME` stops wildcards at `/` and enables
//! `**`, and `CASEFOLD` compares ASCII case-insensitively.
//!
//! Supported syntax: `?`, `*`, `**` (under `PATHNAME`), `[...]` classes with
//! ranges and `!`/`^` negation, and backslash escapes.

use bitflags::bitflags;

bitflags! {
    pub struct WildFlags: u8 {
        /// ASCII case-insensitive comparison.
        const CASEFOLD = 1 << 0;
        /// A leading `.` in the subject (at string start, or after `/` when
        /// `PATHNAME` is set) can only be matched by a literal `.`.
        const PERIOD = 1 << 1;
        /// Backslash is an ordinary character rather than an escape.
        const NOESCAPE = 1 << 2;
        /// `*`, `?` and classes never match `/`; `**` crosses separators.
        const PATHNAME = 1 << 3;
    }
}

pub fn wildmatch(pattern: &str, subject: &str, flags: WildFlags) -> bool {
    domatch(pattern.as_bytes(), subject.as_bytes(), flags, true)
}

/// `leading` is true when the next subject byte is in "leading dot"
/// position for the `PERIOD` rule.
fn domatch(mut p: &[u8], mut s: &[u8], flags: WildFlags, mut leading: bool) -> bool {
    loop {
        let Some(&pc) = p.first() else {
            return s.is_empty();
        };
        match pc {
            b'*' => {
                let mut stars = 1;
                while p.get(stars) == Some(&b'*') {
                    stars += 1;
                }
                let doublestar = stars > 1 && flags.contains(WildFlags::PATHNAME);
                let rest = &p[stars..];

                // `**` may match zero components, so `a/**/b` accepts `a/b`.
                if doublestar
                    && rest.first() == Some(&b'/')
                    && domatch(&rest[1..], s, flags, leading)
                {
                    return true;
                }

                let mut i = 0;
                loop {
                    let lead_here = if i == 0 {
                        leading
                    } else {
                        flags.contains(WildFlags::PATHNAME) && s[i - 1] == b'/'
                    };
                    if domatch(rest, &s[i..], flags, lead_here) {
                        return true;
                    }
                    if i >= s.len() {
                        return false;
                    }
                    let c = s[i];
                    if c == b'.' && lead_here && flags.contains(WildFlags::PERIOD) {
                        return false;
                    }
                    if c == b'/' && flags.contains(WildFlags::PATHNAME) && !doublestar {
                        return false;
                    }
                    i += 1;
                }
            }
            b'?' => {
                let Some(&c) = s.first() else { return false };
                if c == b'/' && flags.contains(WildFlags::PATHNAME) {
                    return false;
                }
                if c == b'.' && leading && flags.contains(WildFlags::PERIOD) {
                    return false;
                }
                p = &p[1..];
                s = &s[1..];
                leading = false;
            }
            b'[' => {
                let Some(&c) = s.first() else { return false };
                if c == b'/' && flags.contains(WildFlags::PATHNAME) {
                    return false;
                }
                if c == b'.' && leading && flags.contains(WildFlags::PERIOD) {
                    return false;
                }
                match match_class(&p[1..], c, flags) {
                    Some((matched, consumed)) => {
                        if !matched {
                            return false;
                        }
                        p = &p[1 + consumed..];
                    }
                    // Unterminated class is a literal '['.
                    None => {
                        if !bytes_eq(b'[', c, flags) {
                            return false;
                        }
                        p = &p[1..];
                    }
                }
                s = &s[1..];
                leading = false;
            }
            _ => {
                let mut lit = pc;
                let mut advance = 1;
                if pc == b'\\' && !flags.contains(WildFlags::NOESCAPE) {
                    if let Some(&next) = p.get(1) {
                        lit = next;
                        advance = 2;
                    }
                }
                let Some(&c) = s.first() else { return false };
                if !bytes_eq(lit, c, flags) {
                    return false;
                }
                leading = c == b'/' && flags.contains(WildFlags::PATHNAME);
                p = &p[advance..];
                s = &s[1..];
            }
        }
    }
}

fn bytes_eq(a: u8, b: u8, flags: WildFlags) -> bool {
    if flags.contains(WildFlags::CASEFOLD) {
        a.to_ascii_lowercase() == b.to_ascii_lowercase()
    } else {
        a == b
    }
}

fn in_range(lo: u8, hi: u8, c: u8, flags: WildFlags) -> bool {
    if lo <= c && c <= hi {
        return true;
    }
    if flags.contains(WildFlags::CASEFOLD) {
        let lower = c.to_ascii_lowercase();
        let upper = c.to_ascii_uppercase();
        (lo <= lower && lower <= hi) || (lo <= upper && upper <= hi)
    } else {
        false
    }
}

/// Match `c` against the class body that starts just after `[`. Returns the
/// match result and the number of pattern bytes consumed (including the
/// closing `]`), or `None` for an unterminated class.
fn match_class(p: &[u8], c: u8, flags: WildFlags) -> Option<(bool, usize)> {
    let mut i = 0;
    let mut negated = false;
    if matches!(p.first(), Some(b'!') | Some(b'^')) {
        negated = true;
        i = 1;
    }
    let mut matched = false;
    let mut first = true;
    loop {
        let mut lo = *p.get(i)?;
        if lo == b']' && !first {
            i += 1;
            break;
        }
        first = false;
        if lo == b'\\' && !flags.contains(WildFlags::NOESCAPE) {
            i += 1;
            lo = *p.get(i)?;
        }
        if p.get(i + 1) == Some(&b'-') && p.get(i + 2).is_some_and(|&b| b != b']') {
            let mut hi = *p.get(i + 2)?;
            let mut hi_len = 1;
            if hi == b'\\' && !flags.contains(WildFlags::NOESCAPE) {
                hi = *p.get(i + 3)?;
                hi_len = 2;
            }
            if in_range(lo, hi, c, flags) {
                matched = true;
            }
            i += 2 + hi_len;
        } else {
            if bytes_eq(lo, c, flags) {
                matched = true;
            }
            i += 1;
        }
    }
    Some((matched != negated, i))
}
