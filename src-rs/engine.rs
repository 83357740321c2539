use std::rc::Rc;

use tracing::{debug, info, warn};

use crate::error::SettingsError;
use crate::matcher::{AvatarUrlMatcher, AVATAR_PATH_MARKER};
use crate::store::{OverrideStore, OverridesMap, SettingsStore};
use crate::tracker::{ElementStateTracker, OriginalState};
use crate::tree::{ElementTree, FrameScheduler, ImageElement, Mutation};

/// Outcome of reconciling one element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciled {
    /// No applicable override; the element shows its own source.
    Unmanaged,
    /// The element shows an override payload. `changed` is false when it already did.
    Overridden { changed: bool },
    /// The upstream avatar changed; the stale entry was deleted.
    Evicted,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub visited: usize,
    pub overridden: usize,
    pub changed: usize,
    pub evicted: usize,
    pub passes: usize,
}

/// Keeps displayed avatars in line with the stored overrides.
///
/// Owns all mutable runtime state: the running flag, the pending-scan flag and
/// the original-state table. The override store is shared so UI actions can
/// read and write it outside the engine.
pub struct Engine<T: ElementTree, S, F> {
    tree: T,
    scheduler: F,
    store: Rc<OverrideStore<S>>,
    matcher: AvatarUrlMatcher,
    tracker: ElementStateTracker<T::Element>,
    running: bool,
    scan_pending: bool,
}

impl<T, S, F> Engine<T, S, F>
where
    T: ElementTree,
    S: SettingsStore,
    F: FrameScheduler,
{
    pub fn new(tree: T, scheduler: F, store: Rc<OverrideStore<S>>, matcher: AvatarUrlMatcher) -> Self {
        Self {
            tree,
            scheduler,
            store,
            matcher,
            tracker: ElementStateTracker::new(),
            running: false,
            scan_pending: false,
        }
    }

    /// Loads the persisted overrides, starts accepting mutations and scans once.
    pub fn start(&mut self) -> ScanReport {
        if self.running {
            debug!("avatar override engine already running");
            return ScanReport::default();
        }
        let overrides = self.store.reload();
        self.running = true;
        info!(overrides = overrides.len(), "avatar override engine started");
        self.scan()
    }

    /// Stops observing and puts every overridden element back the way it was.
    pub fn stop(&mut self) -> usize {
        if !self.running {
            return 0;
        }
        self.running = false;
        self.scan_pending = false;
        let restored = self.tracker.restore_all();
        info!(restored, "avatar override engine stopped");
        restored
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn is_scan_pending(&self) -> bool {
        self.scan_pending
    }

    pub fn store(&self) -> Rc<OverrideStore<S>> {
        Rc::clone(&self.store)
    }

    pub fn overrides(&self) -> Rc<OverridesMap> {
        self.store.get()
    }

    /// Persists `next` and schedules a scan so it shows up without waiting for
    /// the next tree mutation.
    pub fn write_overrides(&mut self, next: OverridesMap) -> Result<(), SettingsError> {
        let result = self.store.set(next);
        self.queue_scan();
        result
    }

    /// Re-reads the persisted overrides after an external write.
    pub fn sync_from_store(&mut self) {
        self.store.reload();
        self.queue_scan();
    }

    /// Feeds tree mutation notifications in. Bursts collapse into one scan.
    pub fn notify(&mut self, mutations: &[Mutation]) {
        if mutations.iter().any(Mutation::is_relevant) {
            self.queue_scan();
        }
    }

    fn queue_scan(&mut self) {
        if !self.running || self.scan_pending {
            return;
        }
        self.scan_pending = true;
        self.scheduler.request_frame();
    }

    /// Called by the host when the requested frame arrives.
    pub fn run_frame(&mut self) -> Option<ScanReport> {
        if !self.scan_pending {
            return None;
        }
        self.scan_pending = false;
        Some(self.scan())
    }

    /// Re-evaluates every candidate element against the current overrides.
    pub fn scan(&mut self) -> ScanReport {
        let mut report = ScanReport::default();
        self.tracker.sweep();

        // An eviction can leave earlier elements of the same subject
        // overridden, so one more pass settles them.
        loop {
            report.passes += 1;
            let mut evicted = 0;
            for element in self.candidates() {
                report.visited += 1;
                match self.reconcile(&element) {
                    Reconciled::Overridden { changed } => {
                        report.overridden += 1;
                        if changed {
                            report.changed += 1;
                        }
                    }
                    Reconciled::Evicted => evicted += 1,
                    Reconciled::Unmanaged => {}
                }
            }
            report.evicted += evicted;
            if evicted == 0 || report.passes >= 2 {
                break;
            }
            report.overridden = 0;
            report.changed = 0;
        }

        debug!(
            visited = report.visited,
            overridden = report.overridden,
            changed = report.changed,
            evicted = report.evicted,
            passes = report.passes,
            "avatar scan finished"
        );
        report
    }

    /// Attached images that are overridden or reference an avatar path.
    ///
    /// Detached elements are left alone until they come back or `stop` runs;
    /// their remembered source may be long out of date.
    fn candidates(&self) -> Vec<Rc<T::Element>> {
        self.tree
            .images()
            .into_iter()
            .filter(|element| {
                self.tracker.is_tracked(element)
                    || self.tracker.upstream_source(element).contains(AVATAR_PATH_MARKER)
            })
            .collect()
    }

    /// Applies the override policy to one element.
    pub fn reconcile(&mut self, element: &Rc<T::Element>) -> Reconciled {
        let source = self.tracker.upstream_source(element);
        if !source.contains(AVATAR_PATH_MARKER) {
            self.tracker.restore(element);
            return Reconciled::Unmanaged;
        }

        let avatar = match self.matcher.parse(&source) {
            Some(avatar) => avatar,
            None => {
                self.tracker.restore(element);
                return Reconciled::Unmanaged;
            }
        };

        let overrides = self.store.get();
        let entry = match overrides.get(&avatar.subject_id) {
            Some(entry) => entry,
            None => {
                self.tracker.restore(element);
                return Reconciled::Unmanaged;
            }
        };

        if let Some(expected) = entry.pinned_hash() {
            if expected != avatar.hash {
                info!(
                    subject = %avatar.subject_id,
                    expected,
                    observed = %avatar.hash,
                    "avatar changed upstream, dropping override"
                );
                let mut next = (*overrides).clone();
                next.remove(&avatar.subject_id);
                if self.store.set(next).is_err() {
                    // Snapshot is replaced regardless; the store already logged it.
                    debug!(subject = %avatar.subject_id, "eviction kept in memory only");
                }
                self.tracker.restore(element);
                return Reconciled::Evicted;
            }
        }

        if self.tracker.remember(element, OriginalState::capture(&**element)) {
            debug!(subject = %avatar.subject_id, "overriding avatar element");
        }
        let changed = element.src() != entry.payload;
        if changed {
            element.set_src(&entry.payload);
            element.set_srcset(None);
        }
        self.tracker.mark_applied(element, &entry.payload);
        Reconciled::Overridden { changed }
    }
}

impl<T: ElementTree, S, F> Drop for Engine<T, S, F> {
    fn drop(&mut self) {
        if self.running {
            warn!("avatar override engine dropped while running, restoring elements");
            self.tracker.restore_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{parse_overrides, MemorySettingsStore, OverrideEntry};
    use crate::tree::{ManualScheduler, MemoryImage, MemoryTree};

    const PAYLOAD: &str = "data:image/jpeg;base64,QUJD";
    const OTHER_PAYLOAD: &str = "data:image/jpeg;base64,WFla";

    type TestEngine = Engine<Rc<MemoryTree>, Rc<MemorySettingsStore>, Rc<ManualScheduler>>;

    struct Harness {
        tree: Rc<MemoryTree>,
        scheduler: Rc<ManualScheduler>,
        settings: Rc<MemorySettingsStore>,
        engine: TestEngine,
    }

    fn harness(persisted: &str) -> Harness {
        let tree = MemoryTree::new();
        let scheduler = ManualScheduler::new();
        let settings = Rc::new(MemorySettingsStore::new(persisted));
        let store = Rc::new(OverrideStore::new(Rc::clone(&settings)));
        let matcher = AvatarUrlMatcher::with_hosts(&["cdn.example"]).unwrap();
        let engine = Engine::new(Rc::clone(&tree), Rc::clone(&scheduler), store, matcher);
        Harness {
            tree,
            scheduler,
            settings,
            engine,
        }
    }

    fn entries(pairs: &[(&str, Option<&str>, &str)]) -> OverridesMap {
        pairs
            .iter()
            .map(|(id, hash, payload)| {
                (
                    id.to_string(),
                    OverrideEntry::new(hash.map(ToString::to_string), *payload),
                )
            })
            .collect()
    }

    fn avatar_url(id: &str, hash: &str) -> String {
        format!("https://cdn.example/avatars/{id}/{hash}.png")
    }

    #[test]
    fn end_to_end_override_then_eviction() {
        let mut h = harness("");
        h.engine.start();
        assert!(h.engine.overrides().is_empty());

        h.engine
            .write_overrides(entries(&[("42", Some("abc"), PAYLOAD)]))
            .unwrap();

        let current = MemoryImage::new(avatar_url("42", "abc"));
        assert_eq!(
            h.engine.reconcile(&current),
            Reconciled::Overridden { changed: true }
        );
        assert_eq!(current.src(), PAYLOAD);

        let updated = MemoryImage::new(avatar_url("42", "zzz"));
        assert_eq!(h.engine.reconcile(&updated), Reconciled::Evicted);
        assert!(h.engine.overrides().is_empty());
        assert_eq!(updated.src(), avatar_url("42", "zzz"));
        assert!(parse_overrides(&h.settings.text()).is_empty());

        // The element still showing the payload goes back on the next pass.
        assert_eq!(h.engine.reconcile(&current), Reconciled::Unmanaged);
        assert_eq!(current.src(), avatar_url("42", "abc"));
    }

    #[test]
    fn hash_mismatch_evicts_only_that_subject() {
        let mut h = harness("{}");
        h.engine.start();
        h.engine
            .write_overrides(entries(&[
                ("42", Some("abc"), PAYLOAD),
                ("7", Some("keep"), OTHER_PAYLOAD),
            ]))
            .unwrap();

        let image = MemoryImage::with_srcset(avatar_url("42", "abc"), "x 1x");
        h.engine.reconcile(&image);
        assert_eq!(image.src(), PAYLOAD);

        image.set_src(&avatar_url("42", "def"));
        assert_eq!(h.engine.reconcile(&image), Reconciled::Evicted);

        let overrides = h.engine.overrides();
        assert!(!overrides.contains_key("42"));
        assert_eq!(overrides["7"].payload, OTHER_PAYLOAD);
        assert_eq!(image.src(), avatar_url("42", "abc"));
        assert_eq!(image.srcset().as_deref(), Some("x 1x"));
    }

    #[test]
    fn reconcile_is_idempotent() {
        let mut h = harness("{}");
        h.engine.start();
        h.engine
            .write_overrides(entries(&[("42", Some("abc"), PAYLOAD)]))
            .unwrap();
        let image = MemoryImage::new(avatar_url("42", "abc"));

        assert_eq!(
            h.engine.reconcile(&image),
            Reconciled::Overridden { changed: true }
        );
        let writes = image.writes();
        assert_eq!(
            h.engine.reconcile(&image),
            Reconciled::Overridden { changed: false }
        );
        assert_eq!(image.writes(), writes);
    }

    #[test]
    fn repointing_to_unmatched_source_restores_original() {
        let mut h = harness("{}");
        h.engine.start();
        h.engine
            .write_overrides(entries(&[("42", None, PAYLOAD)]))
            .unwrap();
        let image = MemoryImage::with_srcset(avatar_url("42", "abc"), "a 1x, b 2x");
        h.engine.reconcile(&image);
        assert_eq!(image.srcset(), None);

        image.set_src("https://cdn.example/emojis/1.png");
        assert_eq!(h.engine.reconcile(&image), Reconciled::Unmanaged);
        assert_eq!(image.src(), avatar_url("42", "abc"));
        assert_eq!(image.srcset().as_deref(), Some("a 1x, b 2x"));

        image.set_src("https://elsewhere.example/avatars/9/q.png");
        let writes = image.writes();
        assert_eq!(h.engine.reconcile(&image), Reconciled::Unmanaged);
        assert_eq!(image.writes(), writes, "restore on an untracked element is a no-op");
    }

    #[test]
    fn unknown_hash_never_evicts() {
        let mut h = harness("{}");
        h.engine.start();
        h.engine
            .write_overrides(entries(&[("42", None, PAYLOAD)]))
            .unwrap();
        for hash in ["abc", "def", "ghi"] {
            let image = MemoryImage::new(avatar_url("42", hash));
            assert!(matches!(
                h.engine.reconcile(&image),
                Reconciled::Overridden { .. }
            ));
        }
        assert!(h.engine.overrides().contains_key("42"));
    }

    #[test]
    fn new_payload_replaces_applied_one() {
        let mut h = harness("{}");
        h.engine.start();
        h.engine
            .write_overrides(entries(&[("42", Some("abc"), PAYLOAD)]))
            .unwrap();
        let image = MemoryImage::new(avatar_url("42", "abc"));
        h.engine.reconcile(&image);

        h.engine
            .write_overrides(entries(&[("42", Some("abc"), OTHER_PAYLOAD)]))
            .unwrap();
        assert_eq!(
            h.engine.reconcile(&image),
            Reconciled::Overridden { changed: true }
        );
        assert_eq!(image.src(), OTHER_PAYLOAD);

        h.engine.stop();
        assert_eq!(image.src(), avatar_url("42", "abc"));
    }

    #[test]
    fn mutation_bursts_coalesce_into_one_scan() {
        let persisted = serde_json::to_string(&entries(&[("42", Some("abc"), PAYLOAD)])).unwrap();
        let mut h = harness(&persisted);
        h.engine.start();
        assert_eq!(h.scheduler.requests(), 0);

        let image = MemoryImage::new(avatar_url("42", "abc"));
        let mutation = h.tree.insert(Rc::clone(&image));
        for _ in 0..50 {
            h.engine.notify(&[mutation.clone(), Mutation::attribute("src")]);
        }
        assert_eq!(h.scheduler.requests(), 1);
        assert!(h.engine.is_scan_pending());
        assert_eq!(image.src(), avatar_url("42", "abc"));

        let report = h.engine.run_frame().unwrap();
        assert_eq!(report.overridden, 1);
        assert_eq!(image.src(), PAYLOAD);
        assert!(h.engine.run_frame().is_none());

        h.engine.notify(&[Mutation::attribute("class")]);
        assert_eq!(h.scheduler.requests(), 1);
        h.engine.notify(&[Mutation::attribute("srcset")]);
        assert_eq!(h.scheduler.requests(), 2);
    }

    #[test]
    fn start_scans_and_stop_restores_everything() {
        let persisted = serde_json::to_string(&entries(&[
            ("42", Some("abc"), PAYLOAD),
            ("7", None, OTHER_PAYLOAD),
        ]))
        .unwrap();
        let mut h = harness(&persisted);
        let first = MemoryImage::with_srcset(avatar_url("42", "abc"), "s 2x");
        let second = MemoryImage::new(avatar_url("7", "whatever"));
        let plain = MemoryImage::new("https://cdn.example/attachments/1/file.png");
        for image in [&first, &second, &plain] {
            h.tree.insert(Rc::clone(image));
        }

        let report = h.engine.start();
        assert_eq!(report.overridden, 2);
        assert_eq!(first.src(), PAYLOAD);
        assert_eq!(second.src(), OTHER_PAYLOAD);
        assert_eq!(plain.writes(), 0);

        // A second scan changes nothing.
        let report = h.engine.scan();
        assert_eq!(report.overridden, 2);
        assert_eq!(report.changed, 0);

        assert_eq!(h.engine.stop(), 2);
        assert_eq!(first.src(), avatar_url("42", "abc"));
        assert_eq!(first.srcset().as_deref(), Some("s 2x"));
        assert_eq!(second.src(), avatar_url("7", "whatever"));
        assert!(!h.engine.is_running());

        h.engine.notify(&[Mutation::inserted(1)]);
        assert!(!h.engine.is_scan_pending());
    }

    #[test]
    fn eviction_restores_siblings_in_the_same_scan() {
        let persisted = serde_json::to_string(&entries(&[("42", Some("abc"), PAYLOAD)])).unwrap();
        let mut h = harness(&persisted);
        let stale = MemoryImage::new(avatar_url("42", "abc"));
        h.tree.insert(Rc::clone(&stale));
        h.engine.start();
        assert_eq!(stale.src(), PAYLOAD);

        let fresh = MemoryImage::new(avatar_url("42", "new"));
        let mutation = h.tree.insert(Rc::clone(&fresh));
        h.engine.notify(&[mutation]);
        let report = h.engine.run_frame().unwrap();

        assert_eq!(report.evicted, 1);
        assert_eq!(report.overridden, 0);
        assert_eq!(stale.src(), avatar_url("42", "abc"));
        assert_eq!(fresh.src(), avatar_url("42", "new"));
        assert!(h.engine.overrides().is_empty());
    }

    #[test]
    fn removed_elements_are_forgotten() {
        let persisted = serde_json::to_string(&entries(&[("42", None, PAYLOAD)])).unwrap();
        let mut h = harness(&persisted);
        let image = MemoryImage::new(avatar_url("42", "abc"));
        h.tree.insert(Rc::clone(&image));
        h.engine.start();

        let weak = Rc::downgrade(&image);
        let mutation = h.tree.remove(&image);
        drop(image);
        assert!(weak.upgrade().is_none());

        h.engine.notify(&[mutation]);
        let report = h.engine.run_frame().unwrap();
        assert_eq!(report.visited, 0);
        assert_eq!(h.engine.stop(), 0);
    }

    #[test]
    fn detached_element_does_not_evict_a_newer_override() {
        let persisted = serde_json::to_string(&entries(&[("42", Some("abc"), PAYLOAD)])).unwrap();
        let mut h = harness(&persisted);
        let image = MemoryImage::new(avatar_url("42", "abc"));
        h.tree.insert(Rc::clone(&image));
        h.engine.start();
        assert_eq!(image.src(), PAYLOAD);

        // The host still holds the element, but it is no longer in the tree.
        let mutation = h.tree.remove(&image);
        h.engine.notify(&[mutation]);
        h.engine
            .write_overrides(entries(&[("42", Some("new"), OTHER_PAYLOAD)]))
            .unwrap();
        let report = h.engine.run_frame().unwrap();

        assert_eq!(report.visited, 0);
        assert_eq!(report.evicted, 0);
        assert_eq!(h.engine.overrides()["42"].payload, OTHER_PAYLOAD);
        assert_eq!(
            parse_overrides(&h.settings.text())["42"].expected_hash.as_deref(),
            Some("new")
        );

        let fresh = MemoryImage::new(avatar_url("42", "new"));
        let mutation = h.tree.insert(Rc::clone(&fresh));
        h.engine.notify(&[mutation]);
        h.engine.run_frame();
        assert_eq!(fresh.src(), OTHER_PAYLOAD);

        // The detached element is still put back on teardown.
        assert_eq!(h.engine.stop(), 2);
        assert_eq!(image.src(), avatar_url("42", "abc"));
        assert_eq!(fresh.src(), avatar_url("42", "new"));
    }

    #[test]
    fn dropping_running_engine_restores_elements() {
        let persisted = serde_json::to_string(&entries(&[("42", Some("abc"), PAYLOAD)])).unwrap();
        let Harness {
            tree, mut engine, ..
        } = harness(&persisted);
        let image = MemoryImage::with_srcset(avatar_url("42", "abc"), "a 1x");
        tree.insert(Rc::clone(&image));
        engine.start();
        assert_eq!(image.src(), PAYLOAD);

        drop(engine);
        assert_eq!(image.src(), avatar_url("42", "abc"));
        assert_eq!(image.srcset().as_deref(), Some("a 1x"));
    }

    #[test]
    fn dropping_stopped_engine_leaves_elements_alone() {
        let persisted = serde_json::to_string(&entries(&[("42", Some("abc"), PAYLOAD)])).unwrap();
        let Harness {
            tree, mut engine, ..
        } = harness(&persisted);
        let image = MemoryImage::new(avatar_url("42", "abc"));
        tree.insert(Rc::clone(&image));
        engine.start();
        engine.stop();
        let writes = image.writes();

        drop(engine);
        assert_eq!(image.writes(), writes);
    }

    #[test]
    fn sync_from_store_picks_up_external_writes() {
        let mut h = harness("{}");
        let image = MemoryImage::new(avatar_url("42", "abc"));
        h.tree.insert(Rc::clone(&image));
        h.engine.start();
        assert_eq!(image.src(), avatar_url("42", "abc"));

        h.settings
            .save_overrides_text(
                &serde_json::to_string(&entries(&[("42", Some("abc"), PAYLOAD)])).unwrap(),
            )
            .unwrap();
        h.engine.sync_from_store();
        h.engine.run_frame();
        assert_eq!(image.src(), PAYLOAD);
    }
}
