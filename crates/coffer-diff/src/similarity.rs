//! Copied/added byte counting between two blobs.
//!
//! Both files are cut into spans (ended by a newline or after 64 bytes,
//! whichever comes first) and each side's byte count is tallied per span
//! hash. A byte of the destination counts as "copied" when the source has
//! an unconsumed span with the same hash, otherwise as "literally added".
//! This is a containment measure, not an edit distance: reordering spans
//! does not reduce it.

const SPAN_MAX: usize = 64;

/// Count how much of `dst` is material from `src`.
///
/// Returns `(copied, added)` in bytes, or `None` once the added tally
/// exceeds `budget` (the caller has already decided such a pair cannot
/// reach its minimum score).
pub(crate) fn count_changes(src: &[u8], dst: &[u8], budget: u64) -> Option<(u64, u64)> {
    let mut spans = std::collections::HashMap::new();
    for (hash, len) in SpanIter::new(src) {
        *spans.entry(hash).or_insert(0u64) += len;
    }

    let mut copied = 0u64;
    let mut added = 0u64;
    for (hash, len) in SpanIter::new(dst) {
        match spans.get_mut(&hash) {
            Some(remaining) if *remaining > 0 => {
                let take = len.min(*remaining);
                *remaining -= take;
                copied += take;
                added += len - take;
            }
            _ => added += len,
        }
    }
    if added > budget {
        None
    } else {
        Some((copied, added))
    }
}

struct SpanIter<'a> {
    data: &'a [u8],
}

impl<'a> SpanIter<'a> {
    fn new(data: &'a [u8]) -> Self {
        SpanIter { data }
    }
}

impl Iterator for SpanIter<'_> {
    type Item = (u64, u64);

    fn next(&mut self) -> Option<(u64, u64)> {
        if self.data.is_empty() {
            return None;
        }
        let limit = self.data.len().min(SPAN_MAX);
        let end = match self.data[..limit].iter().position(|&b| b == b'\n') {
            Some(nl) => nl + 1,
            None => limit,
        };
        let (span, rest) = self.data.split_at(end);
        self.data = rest;
        Some((fnv1a(span), span.len() as u64))
    }
}

/// FNV-1a. Only span equality matters, so any stable hash will do.
fn fnv1a(data: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for &b in data {
        hash ^= u64::from(b);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}
