//! MQTT topic names and filters
//!
//! Validation for the configured channel topics and the matcher used to
//! route inbound PUBLISH packets to subscriptions.

const MAX_TOPIC_LEN: usize = u16::MAX as usize;

fn check_common(s: &str, kind: &'static str) -> Result<(), &'static str> {
    match () {
        _ if s.is_empty() => Err(kind),
        _ if s.len() > MAX_TOPIC_LEN => Err("longer than 65535 bytes"),
        _ if s.contains('\0') => Err("contains NUL"),
        _ => Ok(()),
    }
}

/// Check a PUBLISH topic: non-empty, no NUL, no wildcards
pub fn validate_topic_name(topic: &str) -> Result<(), &'static str> {
    check_common(topic, "empty topic name")?;
    if topic.contains(['+', '#']) {
        return Err("wildcards are only allowed in filters");
    }
    Ok(())
}

/// Check a SUBSCRIBE filter.
///
/// `+` must occupy a whole level; `#` must occupy the last level.
pub fn validate_topic_filter(filter: &str) -> Result<(), &'static str> {
    check_common(filter, "empty topic filter")?;

    let mut levels = filter.split('/').peekable();
    while let Some(level) = levels.next() {
        let last = levels.peek().is_none();
        match level {
            "#" if !last => return Err("'#' must be the last level"),
            "#" | "+" => {}
            _ if level.contains(['#', '+']) => {
                return Err("wildcards must occupy a whole level")
            }
            _ => {}
        }
    }
    Ok(())
}

/// Whether `topic` is selected by `filter`.
///
/// `$`-prefixed topics are only matched by filters that name the prefix.
pub fn topic_matches_filter(topic: &str, filter: &str) -> bool {
    if topic.starts_with('$') && filter.starts_with(['+', '#']) {
        return false;
    }

    let mut topic_levels = topic.split('/');
    for wanted in filter.split('/') {
        match (wanted, topic_levels.next()) {
            ("#", _) => return true,
            ("+", Some(_)) => {}
            (w, Some(level)) if w == level => {}
            _ => return false,
        }
    }

    topic_levels.next().is_none()
}
