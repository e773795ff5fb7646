//! Total, idempotent merge operations over timelines and entity lists.
//!
//! Timelines are kept sorted by `(created_at, id)`, so the order of a list
//! never depends on which page or push delivered an entry first.

use std::collections::HashSet;

use shared::domain::{MessageId, TimelineEntry};

fn sort_key<T: TimelineEntry>(entry: &T) -> (chrono::DateTime<chrono::Utc>, MessageId) {
    (entry.created_at(), entry.entry_id())
}

/// Merges an older page into `timeline`. Entries already present win over
/// the fetched copy.
pub fn merge_history<T: TimelineEntry>(timeline: &mut Vec<T>, page: Vec<T>) {
    let mut seen: HashSet<MessageId> = timeline.iter().map(|e| e.entry_id()).collect();
    let mut merged: Vec<T> = page
        .into_iter()
        .filter(|entry| seen.insert(entry.entry_id()))
        .collect();
    if merged.is_empty() {
        return;
    }
    merged.append(timeline);
    merged.sort_by_key(sort_key);
    *timeline = merged;
}

/// Re-applies the newest page: entries already present are replaced with
/// the fetched copy, new ones are merged in.
pub fn refresh_page<T: TimelineEntry>(timeline: &mut Vec<T>, page: Vec<T>) {
    let mut fresh = Vec::new();
    for entry in page {
        if !replace_entry(timeline, entry.clone()) {
            fresh.push(entry);
        }
    }
    merge_history(timeline, fresh);
}

/// Inserts a pushed entry at its timestamp position; a duplicate id is a
/// no-op.
pub fn insert_live<T: TimelineEntry>(timeline: &mut Vec<T>, entry: T) -> bool {
    if timeline.iter().any(|e| e.entry_id() == entry.entry_id()) {
        return false;
    }
    let key = sort_key(&entry);
    let at = timeline.partition_point(|existing| sort_key(existing) <= key);
    timeline.insert(at, entry);
    true
}

/// Replaces the entry with the same id; absent ids are ignored.
pub fn replace_entry<T: TimelineEntry>(timeline: &mut [T], entry: T) -> bool {
    match timeline
        .iter_mut()
        .find(|existing| existing.entry_id() == entry.entry_id())
    {
        Some(existing) => {
            *existing = entry;
            true
        }
        None => false,
    }
}

/// Flags the entry as deleted; returns `false` if absent or already flagged.
pub fn soft_delete<T: TimelineEntry>(timeline: &mut [T], id: MessageId) -> bool {
    match timeline.iter_mut().find(|entry| entry.entry_id() == id) {
        Some(entry) if !entry.is_deleted() => {
            entry.mark_deleted();
            true
        }
        _ => false,
    }
}

pub fn remove_entry<T: TimelineEntry>(timeline: &mut Vec<T>, id: MessageId) -> bool {
    let before = timeline.len();
    timeline.retain(|entry| entry.entry_id() != id);
    timeline.len() != before
}

/// Replace-or-append for servers, channels, members and conversations.
pub fn upsert_by<T, K: PartialEq>(items: &mut Vec<T>, item: T, key: impl Fn(&T) -> K) {
    let wanted = key(&item);
    match items.iter_mut().find(|existing| key(existing) == wanted) {
        Some(existing) => *existing = item,
        None => items.push(item),
    }
}
