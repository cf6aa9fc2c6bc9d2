//! Channel name normalization and join priority.

use std::cmp::Ordering;
use std::collections::HashMap;

/// Normalize a channel name: trimmed, lowercase, with exactly the leading
/// `#` the input lacked. The empty string stays empty ("no channel").
///
/// Idempotent: `normalize_channel(&normalize_channel(x)) == normalize_channel(x)`.
pub fn normalize_channel(name: &str) -> String {
    let name = name.trim();
    if name.is_empty() {
        return String::new();
    }
    let lower = name.to_lowercase();
    if lower.starts_with('#') {
        lower
    } else {
        format!("#{lower}")
    }
}

/// Normalize a batch, dropping empties and duplicates while keeping the
/// first occurrence order.
pub fn normalize_all<I, S>(names: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out: Vec<String> = Vec::new();
    for name in names {
        let ch = normalize_channel(name.as_ref());
        if !ch.is_empty() && !out.contains(&ch) {
            out.push(ch);
        }
    }
    out
}

/// Join order: the bot's own channel, then configured priority channels in
/// their configured order, then everything else by name.
#[derive(Debug, Clone, Default)]
pub struct PriorityRanking {
    ranks: HashMap<String, usize>,
}

impl PriorityRanking {
    pub fn new(own_nick: &str, priority: &[String]) -> Self {
        let mut ranks = HashMap::new();
        let own = normalize_channel(own_nick);
        if !own.is_empty() {
            ranks.insert(own, 0);
        }
        for ch in priority {
            let ch = normalize_channel(ch);
            if ch.is_empty() {
                continue;
            }
            let next = ranks.len();
            ranks.entry(ch).or_insert(next);
        }
        Self { ranks }
    }

    pub fn rank(&self, channel: &str) -> Option<usize> {
        self.ranks.get(channel).copied()
    }

    pub fn compare(&self, a: &str, b: &str) -> Ordering {
        match (self.rank(a), self.rank(b)) {
            (Some(x), Some(y)) => x.cmp(&y).then_with(|| a.cmp(b)),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => a.cmp(b),
        }
    }

    /// Sort normalized channel names in join order.
    pub fn sort(&self, channels: &mut [String]) {
        channels.sort_by(|a, b| self.compare(a, b));
    }
}
