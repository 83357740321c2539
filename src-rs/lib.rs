//! Client-side avatar overrides.
//!
//! A user can swap the displayed avatar of other accounts on their own client.
//! Overrides are persisted as JSON in a host settings field and are dropped as
//! soon as the avatar URL's content hash shows the real image has changed.

pub mod acquire;
pub mod actions;
pub mod config;
pub mod engine;
pub mod error;
pub mod host;
pub mod matcher;
pub mod store;
pub mod tracker;
pub mod tree;

pub use acquire::{acquire, AcquireOptions, EncodedImage, PickedFile};
pub use actions::{MenuAction, MenuItem, OverrideActions, Subject};
pub use engine::{Engine, Reconciled, ScanReport};
pub use error::{AcquireError, ErrorKind, SettingsError};
pub use matcher::{AvatarRef, AvatarUrlMatcher};
pub use store::{OverrideEntry, OverrideStore, OverridesMap, SettingsStore};
pub use tracker::{ElementStateTracker, OriginalState};
pub use tree::{ElementTree, FrameScheduler, ImageElement, Mutation};
