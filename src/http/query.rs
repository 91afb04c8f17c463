//! Parses the subscription query grammar from a raw query string. All
//! parameters are optional and AND-combined; see the endpoint's
//! combination rules for how overlapping bounds are reconciled.

/// A schema was requested but in an unrecognized target language.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownSchemaLanguage(pub String);

/// A query parameter failed to parse (e.g. `n=abc`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedQuery(pub String);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionQuery {
    pub since_us: Option<i64>,
    pub recent_us: Option<i64>,
    pub index_floor: Option<u64>,
    pub tail: Option<u64>,
    pub n: Option<u64>,
    pub period_us: Option<i64>,
    pub nowait: bool,
    pub stop_after_bytes: Option<u64>,
    pub sizeonly: bool,
    /// `Some(None)` is bare `schema`; `Some(Some(lang))` is `schema=<lang>`.
    pub schema: Option<Option<String>>,
    pub entries_only: bool,
    pub array: bool,
    pub terminate: Option<String>,
}

impl SubscriptionQuery {
    pub fn parse(raw: &str) -> Result<Self, MalformedQuery> {
        let mut query = SubscriptionQuery::default();
        if raw.is_empty() {
            return Ok(query);
        }
        for pair in raw.split('&') {
            if pair.is_empty() {
                continue;
            }
            let (key, value) = match pair.split_once('=') {
                Some((k, v)) => (decode(k), Some(decode(v))),
                None => (decode(pair), None),
            };
            match key.as_str() {
                "since" => query.since_us = Some(parse_i64(&key, &value)?),
                "recent" => query.recent_us = Some(parse_i64(&key, &value)?),
                "i" => query.index_floor = Some(parse_u64(&key, &value)?),
                "tail" => query.tail = Some(parse_u64(&key, &value)?),
                "n" => query.n = Some(parse_u64(&key, &value)?),
                "period" => query.period_us = Some(parse_i64(&key, &value)?),
                "nowait" => query.nowait = true,
                "stop_after_bytes" => query.stop_after_bytes = Some(parse_u64(&key, &value)?),
                "sizeonly" => query.sizeonly = true,
                "schema" => query.schema = Some(value),
                "entries_only" => query.entries_only = true,
                "array" => query.array = true,
                "terminate" => {
                    query.terminate =
                        Some(value.ok_or_else(|| MalformedQuery("terminate requires a value".into()))?)
                }
                _ => {}
            }
        }
        Ok(query)
    }

    /// Lower bound on `idxts.us`, combining `since` and `recent` (an
    /// explicit `since` wins if both are present).
    pub fn us_floor(&self, now_us: i64) -> Option<i64> {
        self.since_us.or_else(|| self.recent_us.map(|recent| now_us - recent))
    }

    /// Starting cursor, combining `tail` (relative to `size_at_start`)
    /// and `i` (an absolute floor); the tighter (higher) bound wins.
    pub fn start_cursor(&self, size_at_start: u64) -> u64 {
        let tail_start = self.tail.map(|k| size_at_start.saturating_sub(k)).unwrap_or(0);
        let i_floor = self.index_floor.unwrap_or(0);
        tail_start.max(i_floor)
    }
}

fn parse_i64(key: &str, value: &Option<String>) -> Result<i64, MalformedQuery> {
    value
        .as_deref()
        .ok_or_else(|| MalformedQuery(format!("{key} requires a value")))?
        .parse()
        .map_err(|_| MalformedQuery(format!("{key} must be an integer")))
}

fn parse_u64(key: &str, value: &Option<String>) -> Result<u64, MalformedQuery> {
    value
        .as_deref()
        .ok_or_else(|| MalformedQuery(format!("{key} requires a value")))?
        .parse()
        .map_err(|_| MalformedQuery(format!("{key} must be a non-negative integer")))
}

fn decode(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
                match hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                    Some(byte) => {
                        out.push(byte);
                        i += 3;
                    }
                    None => {
                        out.push(bytes[i]);
                        i += 1;
                    }
                }
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_combination_of_flags_and_values() {
        let q = SubscriptionQuery::parse("n=2&recent=399&array&entries_only").unwrap();
        assert_eq!(q.n, Some(2));
        assert_eq!(q.recent_us, Some(399));
        assert!(q.array);
        assert!(q.entries_only);
    }

    #[test]
    fn since_wins_over_recent_when_both_set() {
        let q = SubscriptionQuery::parse("since=100&recent=50").unwrap();
        assert_eq!(q.us_floor(500), Some(100));
    }

    #[test]
    fn recent_is_computed_against_now() {
        let q = SubscriptionQuery::parse("recent=399").unwrap();
        assert_eq!(q.us_floor(500), Some(101));
    }

    #[test]
    fn tail_and_i_take_the_tighter_bound() {
        let q = SubscriptionQuery::parse("tail=3&i=8").unwrap();
        assert_eq!(q.start_cursor(10), 8);
        let q = SubscriptionQuery::parse("tail=3&i=1").unwrap();
        assert_eq!(q.start_cursor(10), 7);
    }

    #[test]
    fn malformed_integer_rejected() {
        assert!(SubscriptionQuery::parse("n=abc").is_err());
    }

    #[test]
    fn bare_schema_and_schema_with_language() {
        let q = SubscriptionQuery::parse("schema").unwrap();
        assert_eq!(q.schema, Some(None));
        let q = SubscriptionQuery::parse("schema=fsharp").unwrap();
        assert_eq!(q.schema, Some(Some("fsharp".into())));
    }
}
