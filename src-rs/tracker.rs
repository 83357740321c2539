use std::collections::HashMap;
use std::rc::{Rc, Weak};

use crate::tree::ImageElement;

/// What an element displayed before it was overridden.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginalState {
    pub source: String,
    pub source_set: Option<String>,
}

impl OriginalState {
    pub fn capture<E: ImageElement>(element: &E) -> Self {
        Self {
            source: element.src(),
            source_set: element.srcset(),
        }
    }
}

struct Tracked<E> {
    element: Weak<E>,
    original: OriginalState,
    /// Payload we last wrote to the element.
    applied: Option<String>,
}

impl<E> Tracked<E> {
    fn is_for(&self, element: &Rc<E>) -> bool {
        self.element.strong_count() > 0 && std::ptr::eq(self.element.as_ptr(), Rc::as_ptr(element))
    }
}

/// Side table of pre-override state, keyed by element identity.
///
/// Holds only `Weak` references, so a tracked element is dropped as soon as the
/// host drops it. Records whose element is gone are ignored on lookup and
/// removed by [`ElementStateTracker::sweep`].
pub struct ElementStateTracker<E> {
    records: HashMap<usize, Tracked<E>>,
}

impl<E> Default for ElementStateTracker<E> {
    fn default() -> Self {
        Self {
            records: HashMap::new(),
        }
    }
}

fn identity<E>(element: &Rc<E>) -> usize {
    Rc::as_ptr(element) as *const () as usize
}

impl<E: ImageElement> ElementStateTracker<E> {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, element: &Rc<E>) -> Option<&Tracked<E>> {
        self.records
            .get(&identity(element))
            .filter(|tracked| tracked.is_for(element))
    }

    pub fn is_tracked(&self, element: &Rc<E>) -> bool {
        self.record(element).is_some()
    }

    pub fn original(&self, element: &Rc<E>) -> Option<&OriginalState> {
        self.record(element).map(|tracked| &tracked.original)
    }

    /// Records `state` unless the element already has a record.
    ///
    /// Returns whether a new record was created.
    pub fn remember(&mut self, element: &Rc<E>, state: OriginalState) -> bool {
        if self.is_tracked(element) {
            return false;
        }
        self.records.insert(
            identity(element),
            Tracked {
                element: Rc::downgrade(element),
                original: state,
                applied: None,
            },
        );
        true
    }

    pub fn mark_applied(&mut self, element: &Rc<E>, payload: &str) {
        if let Some(tracked) = self.records.get_mut(&identity(element)) {
            if tracked.is_for(element) && tracked.applied.as_deref() != Some(payload) {
                tracked.applied = Some(payload.to_string());
            }
        }
    }

    /// Source the host intends the element to show.
    ///
    /// While the element still displays the payload we applied, that is the
    /// remembered original; once the host repoints it, the new value wins.
    pub fn upstream_source(&self, element: &Rc<E>) -> String {
        let current = element.src();
        match self.record(element) {
            Some(tracked) if tracked.applied.as_deref() == Some(current.as_str()) => {
                tracked.original.source.clone()
            }
            _ => current,
        }
    }

    /// Writes the original state back and forgets the element. No-op when untracked.
    pub fn restore(&mut self, element: &Rc<E>) -> bool {
        let key = identity(element);
        match self.records.get(&key) {
            Some(tracked) if tracked.is_for(element) => {}
            _ => return false,
        }
        if let Some(tracked) = self.records.remove(&key) {
            write_back(&**element, &tracked.original);
        }
        true
    }

    /// Restores every live tracked element and clears the table.
    pub fn restore_all(&mut self) -> usize {
        let mut restored = 0;
        for (_, tracked) in self.records.drain() {
            if let Some(element) = tracked.element.upgrade() {
                write_back(&*element, &tracked.original);
                restored += 1;
            }
        }
        restored
    }

    /// Drops records whose element no longer exists.
    pub fn sweep(&mut self) -> usize {
        let before = self.records.len();
        self.records
            .retain(|_, tracked| tracked.element.strong_count() > 0);
        before - self.records.len()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

fn write_back<E: ImageElement>(element: &E, original: &OriginalState) {
    element.set_src(&original.source);
    element.set_srcset(original.source_set.as_deref().filter(|set| !set.is_empty()));
}
