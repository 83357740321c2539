//! Narrow capabilities the host UI provides to the override actions.

use std::cell::RefCell;
use std::path::PathBuf;

use tracing::{info, warn};

use crate::acquire::PickedFile;
use crate::error::AcquireError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToastKind {
    Success,
    Failure,
}

pub trait FilePicker {
    /// Shows an image-only file picker. `Ok(None)` means the user cancelled.
    fn pick_image(&self) -> Result<Option<PickedFile>, AcquireError>;
}

pub trait Notifier {
    fn show(&self, message: &str, kind: ToastKind);
}

pub trait CurrentUser {
    fn current_user_id(&self) -> Option<String>;
}

/// Picker that always "picks" a fixed path.
#[derive(Debug, Clone)]
pub struct PathPicker {
    path: Option<PathBuf>,
}

impl PathPicker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
        }
    }

    pub fn cancelled() -> Self {
        Self { path: None }
    }
}

impl FilePicker for PathPicker {
    fn pick_image(&self) -> Result<Option<PickedFile>, AcquireError> {
        match &self.path {
            Some(path) => PickedFile::from_path(path).map(Some),
            None => Ok(None),
        }
    }
}

/// Sends toasts to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn show(&self, message: &str, kind: ToastKind) {
        match kind {
            ToastKind::Success => info!(toast = message),
            ToastKind::Failure => warn!(toast = message),
        }
    }
}

/// Keeps every toast shown, newest last.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    shown: RefCell<Vec<(String, ToastKind)>>,
}

impl RecordingNotifier {
    pub fn shown(&self) -> Vec<(String, ToastKind)> {
        self.shown.borrow().clone()
    }

    pub fn last(&self) -> Option<(String, ToastKind)> {
        self.shown.borrow().last().cloned()
    }
}

impl Notifier for RecordingNotifier {
    fn show(&self, message: &str, kind: ToastKind) {
        self.shown.borrow_mut().push((message.to_string(), kind));
    }
}

impl<N: Notifier + ?Sized> Notifier for &N {
    fn show(&self, message: &str, kind: ToastKind) {
        (**self).show(message, kind)
    }
}

/// Current user known up front.
#[derive(Debug, Clone, Default)]
pub struct FixedUser(pub Option<String>);

impl CurrentUser for FixedUser {
    fn current_user_id(&self) -> Option<String> {
        self.0.clone()
    }
}
