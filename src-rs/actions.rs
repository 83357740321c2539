use std::rc::Rc;

use tracing::debug;

use crate::acquire::{acquire, AcquireOptions};
use crate::error::AcquireError;
use crate::host::{CurrentUser, FilePicker, Notifier, ToastKind};
use crate::store::{OverrideEntry, OverrideStore, SettingsStore};

pub const SAVED_MESSAGE: &str = "Avatar override saved (clientside).";
pub const REMOVED_MESSAGE: &str = "Avatar override removed.";

/// The account a menu was opened on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subject {
    pub id: String,
    /// Hash of the account's current real avatar, when the host knows it.
    pub avatar_hash: Option<String>,
}

impl Subject {
    pub fn new(id: impl Into<String>, avatar_hash: Option<String>) -> Self {
        Self {
            id: id.into(),
            avatar_hash,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MenuAction {
    Change,
    Reset,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MenuItem {
    pub id: &'static str,
    pub label: &'static str,
    pub action: MenuAction,
    pub disabled: bool,
    pub danger: bool,
}

/// User-facing "change"/"reset" commands for one subject's override.
pub struct OverrideActions<S, P, N, U> {
    store: Rc<OverrideStore<S>>,
    picker: P,
    notifier: N,
    users: U,
    options: AcquireOptions,
}

impl<S, P, N, U> OverrideActions<S, P, N, U>
where
    S: SettingsStore,
    P: FilePicker,
    N: Notifier,
    U: CurrentUser,
{
    pub fn new(
        store: Rc<OverrideStore<S>>,
        picker: P,
        notifier: N,
        users: U,
        options: AcquireOptions,
    ) -> Self {
        Self {
            store,
            picker,
            notifier,
            users,
            options,
        }
    }

    pub fn menu_items(&self, subject: &Subject) -> Vec<MenuItem> {
        let is_self = self.users.current_user_id().as_deref() == Some(subject.id.as_str());
        let mut items = vec![MenuItem {
            id: "avatar-override-change",
            label: "Change profile picture",
            action: MenuAction::Change,
            disabled: is_self,
            danger: false,
        }];
        if self.store.get().contains_key(&subject.id) {
            items.push(MenuItem {
                id: "avatar-override-reset",
                label: "Reset profile picture override",
                action: MenuAction::Reset,
                disabled: false,
                danger: true,
            });
        }
        items
    }

    pub fn run(&self, subject: &Subject, action: MenuAction) -> bool {
        match action {
            MenuAction::Change => self.change(subject),
            MenuAction::Reset => self.reset(subject),
        }
    }

    /// Picks, encodes and stores a replacement avatar. Returns whether one was saved.
    ///
    /// Failures end in a toast and leave the store untouched.
    pub fn change(&self, subject: &Subject) -> bool {
        match self.try_change(subject) {
            Ok(true) => {
                self.notifier.show(SAVED_MESSAGE, ToastKind::Success);
                true
            }
            Ok(false) => {
                debug!(subject = %subject.id, "avatar pick cancelled");
                false
            }
            Err(err) => {
                debug!(
                    subject = %subject.id,
                    kind = ?err.downcast_ref::<AcquireError>().map(AcquireError::kind),
                    error = %err,
                    "avatar override not saved"
                );
                self.notifier.show(&err.to_string(), ToastKind::Failure);
                false
            }
        }
    }

    fn try_change(&self, subject: &Subject) -> anyhow::Result<bool> {
        let file = match self.picker.pick_image()? {
            Some(file) => file,
            None => return Ok(false),
        };
        let encoded = acquire(&file, self.options)?;

        let mut next = (*self.store.get()).clone();
        next.insert(
            subject.id.clone(),
            OverrideEntry::new(subject.avatar_hash.clone(), encoded.data_url),
        );
        self.store.set(next)?;
        Ok(true)
    }

    /// Drops the subject's override. Returns whether one existed.
    pub fn reset(&self, subject: &Subject) -> bool {
        let mut next = (*self.store.get()).clone();
        if next.remove(&subject.id).is_none() {
            return false;
        }
        match self.store.set(next) {
            Ok(()) => {
                self.notifier.show(REMOVED_MESSAGE, ToastKind::Success);
                true
            }
            Err(err) => {
                self.notifier.show(&err.to_string(), ToastKind::Failure);
                false
            }
        }
    }

    pub fn store(&self) -> &Rc<OverrideStore<S>> {
        &self.store
    }
}
