/// Redis-style glob matching over raw bytes, used by KEYS, SCAN and pattern
/// subscriptions. Supports `*` (any sequence), `?` (any single byte),
/// `[abc]`, `[^abc]`, `[a-z]`, and `\` escapes.
pub fn glob_match(pattern: &str, subject: &str) -> bool {
    matches(pattern.as_bytes(), subject.as_bytes())
}

fn matches(pat: &[u8], sub: &[u8]) -> bool {
    match pat.first() {
        None => sub.is_empty(),
        Some(b'*') => {
            // Greedy collapse of consecutive stars, then try every split.
            let rest = &pat[1..];
            (0..=sub.len()).any(|i| matches(rest, &sub[i..]))
        }
        Some(b'?') => !sub.is_empty() && matches(&pat[1..], &sub[1..]),
        Some(b'[') => match bracket(&pat[1..]) {
            Some((class, rest)) => match sub.first() {
                Some(&c) => class.contains(c) && matches(rest, &sub[1..]),
                None => false,
            },
            // Unterminated class: treat '[' as a literal byte.
            None => literal(b'[', pat, sub),
        },
        Some(b'\\') if pat.len() > 1 => literal(pat[1], &pat[1..], sub),
        Some(&c) => literal(c, pat, sub),
    }
}

fn literal(c: u8, pat: &[u8], sub: &[u8]) -> bool {
    sub.first() == Some(&c) && matches(&pat[1..], &sub[1..])
}

struct CharClass<'a> {
    body: &'a [u8],
    negated: bool,
}

impl CharClass<'_> {
    fn contains(&self, c: u8) -> bool {
        let mut i = 0;
        let mut hit = false;
        while i < self.body.len() {
            if i + 2 < self.body.len() && self.body[i + 1] == b'-' {
                if self.body[i] <= c && c <= self.body[i + 2] {
                    hit = true;
                }
                i += 3;
            } else {
                if self.body[i] == c {
                    hit = true;
                }
                i += 1;
            }
        }
        hit != self.negated
    }
}

/// Parse a bracket expression body (after the opening `[`). Returns the
/// class and the remaining pattern past the closing `]`, or None if the
/// class is unterminated.
fn bracket(pat: &[u8]) -> Option<(CharClass<'_>, &[u8])> {
    let (negated, body_start) = match pat.first() {
        Some(b'^') => (true, 1),
        _ => (false, 0),
    };
    let close = pat[body_start..].iter().position(|&c| c == b']')? + body_start;
    Some((
        CharClass {
            body: &pat[body_start..close],
            negated,
        },
        &pat[close + 1..],
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match() {
        assert!(glob_match("hello", "hello"));
        assert!(!glob_match("hello", "world"));
        assert!(glob_match("", ""));
        assert!(!glob_match("", "x"));
    }

    #[test]
    fn star() {
        assert!(glob_match("*", ""));
        assert!(glob_match("*", "anything"));
        assert!(glob_match("h*o", "ho"));
        assert!(glob_match("h*o", "hello"));
        assert!(!glob_match("h*o", "help"));
        assert!(glob_match("**llo", "hello"));
    }

    #[test]
    fn question_mark() {
        assert!(glob_match("h?llo", "hello"));
        assert!(glob_match("h?llo", "hallo"));
        assert!(!glob_match("h?llo", "hllo"));
    }

    #[test]
    fn classes() {
        assert!(glob_match("h[ae]llo", "hello"));
        assert!(glob_match("h[ae]llo", "hallo"));
        assert!(!glob_match("h[ae]llo", "hillo"));
        assert!(glob_match("h[a-e]llo", "hello"));
        assert!(!glob_match("h[a-d]llo", "hello"));
        assert!(!glob_match("h[^e]llo", "hello"));
        assert!(glob_match("h[^e]llo", "hallo"));
    }

    #[test]
    fn escapes() {
        assert!(glob_match(r"h\*llo", "h*llo"));
        assert!(!glob_match(r"h\*llo", "hello"));
        assert!(glob_match(r"h\[llo", "h[llo"));
    }

    #[test]
    fn key_patterns() {
        assert!(glob_match("user:*:name", "user:123:name"));
        assert!(glob_match("user:*:name", "user::name"));
        assert!(!glob_match("user:*:name", "user:123:age"));
        assert!(glob_match("news.*", "news.tech"));
    }
}
