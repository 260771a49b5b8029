use std::collections::HashSet;

use parley_storage::{MessageId, ScopeKey};

use crate::events::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageOrigin {
    /// Returned by a history fetch; takes part in the cursor chain.
    Fetched,
    /// Synthesized to hold a live message before any history loaded.
    Live,
}

/// A contiguous batch of messages, newest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    pub scope: ScopeKey,
    pub messages: Vec<Message>,
    pub next_cursor: Option<MessageId>,
    pub origin: PageOrigin,
}

impl Page {
    /// Builds a fetched page. The cursor is the last id only when the batch came back full.
    pub fn from_fetch(scope: ScopeKey, messages: Vec<Message>, batch_size: usize) -> Self {
        let next_cursor = if messages.len() == batch_size {
            messages.last().map(|message| message.id)
        } else {
            None
        };

        Self {
            scope,
            messages,
            next_cursor,
            origin: PageOrigin::Fetched,
        }
    }

    fn live(scope: ScopeKey, message: Message) -> Self {
        Self {
            scope,
            messages: vec![message],
            next_cursor: None,
            origin: PageOrigin::Live,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.next_cursor.is_none()
    }
}

/// Ordered pages for one scope. Index 0 holds the newest messages.
#[derive(Debug, Clone)]
pub struct PageSet {
    scope: ScopeKey,
    pages: Vec<Page>,
}

impl PageSet {
    pub fn new(scope: ScopeKey) -> Self {
        Self {
            scope,
            pages: Vec::new(),
        }
    }

    pub fn scope(&self) -> ScopeKey {
        self.scope
    }

    pub fn pages(&self) -> &[Page] {
        &self.pages
    }

    pub fn is_empty(&self) -> bool {
        self.pages.iter().all(|page| page.messages.is_empty())
    }

    pub fn contains(&self, message_id: MessageId) -> bool {
        self.position(message_id).is_some()
    }

    fn position(&self, message_id: MessageId) -> Option<(usize, usize)> {
        self.pages.iter().enumerate().find_map(|(page_index, page)| {
            page.messages
                .iter()
                .position(|message| message.id == message_id)
                .map(|message_index| (page_index, message_index))
        })
    }

    fn oldest_fetched(&self) -> Option<&Page> {
        self.pages
            .iter()
            .rev()
            .find(|page| page.origin == PageOrigin::Fetched)
    }

    /// True until a fetched page came back short. Live pages never end the history.
    pub fn has_more(&self) -> bool {
        self.oldest_fetched().is_none_or(|page| !page.is_terminal())
    }

    pub fn has_fetched(&self) -> bool {
        self.oldest_fetched().is_some()
    }

    /// Cursor for the next older page, `None` when history is exhausted or not started.
    pub fn next_cursor(&self) -> Option<MessageId> {
        self.oldest_fetched().and_then(|page| page.next_cursor)
    }

    /// Appends an older page. Messages already present are refreshed in place and dropped
    /// from the appended page so each id appears once. Returns the page as stored.
    pub fn append_fetched(&mut self, mut page: Page) -> Page {
        page.messages.retain(|incoming| {
            match self.position(incoming.id) {
                Some((page_index, message_index)) => {
                    self.pages[page_index].messages[message_index] = incoming.clone();
                    false
                }
                None => true,
            }
        });
        self.pages.push(page.clone());
        page
    }

    /// Inserts a live message at the newest position. Returns false for a known id.
    pub fn prepend_created(&mut self, message: Message) -> bool {
        if self.contains(message.id) {
            return false;
        }

        match self.pages.first_mut() {
            Some(first) => first.messages.insert(0, message),
            None => self.pages.push(Page::live(self.scope, message)),
        }
        true
    }

    /// Replaces a loaded message in place. Returns false when the id is not loaded.
    pub fn replace_updated(&mut self, message: Message) -> bool {
        match self.position(message.id) {
            Some((page_index, message_index)) => {
                self.pages[page_index].messages[message_index] = message;
                true
            }
            None => false,
        }
    }

    /// Folds a fresh newest-page fetch into the set. Known ids are overwritten in place.
    /// Unknown ids are inserted just before the next known id that follows them in the
    /// fetch, or after the last known one, so fetch order survives interleaved live inserts.
    /// Returns how many messages changed.
    pub fn merge_newest(&mut self, fresh: Page) -> usize {
        if !self.has_fetched() && self.pages.iter().all(|page| page.messages.is_empty()) {
            let count = fresh.messages.len();
            self.pages.clear();
            self.pages.push(fresh);
            return count;
        }

        let mut changed = 0;
        let mut unseen = Vec::new();
        let mut after_last_known = None;
        for incoming in fresh.messages {
            let Some((page_index, mut message_index)) = self.position(incoming.id) else {
                unseen.push(incoming);
                continue;
            };

            if !unseen.is_empty() {
                let count = unseen.len();
                self.pages[page_index]
                    .messages
                    .splice(message_index..message_index, unseen.drain(..));
                changed += count;
                message_index += count;
            }

            let slot = &mut self.pages[page_index].messages[message_index];
            if incoming.is_revision_of(slot) {
                *slot = incoming;
                changed += 1;
            }
            after_last_known = Some((page_index, message_index + 1));
        }

        if unseen.is_empty() {
            return changed;
        }

        changed += unseen.len();
        if let Some((page_index, message_index)) = after_last_known {
            self.pages[page_index]
                .messages
                .splice(message_index..message_index, unseen);
            return changed;
        }

        match self.pages.first_mut() {
            Some(first) => {
                unseen.append(&mut first.messages);
                first.messages = unseen;
            }
            None => self.pages.push(Page {
                scope: self.scope,
                messages: unseen,
                next_cursor: None,
                origin: PageOrigin::Live,
            }),
        }
        changed
    }

    /// All loaded messages newest first, each id once.
    pub fn flattened(&self) -> Vec<Message> {
        let mut seen = HashSet::new();
        self.pages
            .iter()
            .flat_map(|page| page.messages.iter())
            .filter(|message| seen.insert(message.id))
            .cloned()
            .collect()
    }

    pub fn message_count(&self) -> usize {
        self.pages.iter().map(|page| page.messages.len()).sum()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use parley_storage::{ConversationId, MemberId};

    use super::*;

    pub(crate) fn scope() -> ScopeKey {
        ScopeKey::Conversation(ConversationId::new_v7())
    }

    pub(crate) fn message(scope: ScopeKey, content: &str, created_at: u64) -> Message {
        Message {
            id: MessageId::new_v7(),
            scope,
            author_id: MemberId::new_v7(),
            content: content.to_string(),
            file_url: None,
            deleted: false,
            created_at_unix_millis: created_at,
            updated_at_unix_millis: created_at,
        }
    }

    fn batch(scope: ScopeKey, count: usize, newest_at: u64) -> Vec<Message> {
        (0..count)
            .map(|offset| {
                let at = newest_at - offset as u64;
                message(scope, &format!("m{at}"), at)
            })
            .collect()
    }

    #[test]
    fn cursor_is_set_only_for_full_batches() {
        let scope = scope();
        let full = Page::from_fetch(scope, batch(scope, 10, 100), 10);
        assert_eq!(full.next_cursor, full.messages.last().map(|m| m.id));

        let short = Page::from_fetch(scope, batch(scope, 3, 100), 10);
        assert!(short.is_terminal());

        let empty = Page::from_fetch(scope, Vec::new(), 10);
        assert!(empty.is_terminal());
    }

    #[test]
    fn has_more_follows_oldest_fetched_page() {
        let scope = scope();
        let mut set = PageSet::new(scope);
        assert!(set.has_more());

        set.prepend_created(message(scope, "live", 500));
        assert!(set.has_more());
        assert_eq!(set.next_cursor(), None);

        set.append_fetched(Page::from_fetch(scope, batch(scope, 10, 100), 10));
        assert!(set.has_more());
        set.append_fetched(Page::from_fetch(scope, batch(scope, 3, 90), 10));
        assert!(!set.has_more());
    }

    #[test]
    fn created_event_is_inserted_once() {
        let scope = scope();
        let mut set = PageSet::new(scope);
        set.append_fetched(Page::from_fetch(scope, batch(scope, 2, 10), 10));

        let live = message(scope, "A", 11);
        assert!(set.prepend_created(live.clone()));
        assert!(!set.prepend_created(live.clone()));

        let flat = set.flattened();
        assert_eq!(flat.len(), 3);
        assert_eq!(flat[0], live);
    }

    #[test]
    fn updated_event_replaces_in_place_or_is_discarded() {
        let scope = scope();
        let mut set = PageSet::new(scope);
        let loaded = batch(scope, 3, 10);
        set.append_fetched(Page::from_fetch(scope, loaded.clone(), 10));

        let mut edited = loaded[1].clone();
        edited.content = "edited".to_string();
        assert!(set.replace_updated(edited.clone()));
        assert_eq!(set.flattened()[1], edited);

        assert!(!set.replace_updated(message(scope, "ghost", 50)));
        assert_eq!(set.message_count(), 3);
    }

    #[test]
    fn append_drops_messages_already_loaded() {
        let scope = scope();
        let mut set = PageSet::new(scope);
        let live = message(scope, "early", 5);
        set.prepend_created(live.clone());

        let mut fetched = batch(scope, 2, 10);
        fetched.push(live.clone());
        let stored = set.append_fetched(Page::from_fetch(scope, fetched, 10));

        assert_eq!(stored.messages.len(), 2);
        assert_eq!(set.message_count(), 3);
    }

    #[test]
    fn merge_newest_overwrites_known_and_prepends_unknown() {
        let scope = scope();
        let mut set = PageSet::new(scope);
        let loaded = batch(scope, 3, 10);
        set.append_fetched(Page::from_fetch(scope, loaded.clone(), 10));

        let newer = batch(scope, 2, 20);
        let mut edited = loaded[0].clone();
        edited.content = "edited".to_string();
        let mut fresh = newer.clone();
        fresh.push(edited.clone());
        fresh.push(loaded[1].clone());

        assert_eq!(set.merge_newest(Page::from_fetch(scope, fresh, 10)), 3);

        let flat = set.flattened();
        assert_eq!(flat[0], newer[0]);
        assert_eq!(flat[1], newer[1]);
        assert_eq!(flat[2], edited);
        assert_eq!(flat.len(), 5);
    }

    #[test]
    fn refresh_racing_a_live_insert_keeps_newest_first_order() {
        let scope = scope();
        let mut set = PageSet::new(scope);
        let loaded = message(scope, "A", 10);
        set.append_fetched(Page::from_fetch(scope, vec![loaded.clone()], 10));

        let live = message(scope, "X", 30);
        set.prepend_created(live.clone());
        let missed = message(scope, "N", 20);
        let fresh = vec![live, missed, loaded];

        assert_eq!(set.merge_newest(Page::from_fetch(scope, fresh, 10)), 1);
        let timestamps: Vec<_> = set
            .flattened()
            .iter()
            .map(|message| message.created_at_unix_millis)
            .collect();
        assert_eq!(timestamps, [30, 20, 10]);
    }

    #[test]
    fn trailing_unseen_messages_follow_the_last_known_one() {
        let scope = scope();
        let mut set = PageSet::new(scope);
        let newest = message(scope, "B", 40);
        set.append_fetched(Page::from_fetch(scope, vec![newest.clone()], 10));

        let older = message(scope, "C", 35);
        let fresh = vec![newest.clone(), older.clone()];
        assert_eq!(set.merge_newest(Page::from_fetch(scope, fresh, 10)), 1);
        assert_eq!(set.flattened(), vec![newest, older]);
    }
}
