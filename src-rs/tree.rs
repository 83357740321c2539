//! Host-facing view of the rendered element tree.
//!
//! Everything here is single-threaded: elements are shared as `Rc` and mutate
//! through `&self`, the way the host's own UI objects behave.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

pub const WATCHED_ATTRIBUTES: &[&str] = &["src", "srcset"];

/// An image element whose displayed source can be swapped.
pub trait ImageElement {
    /// Current `src`, empty when unset.
    fn src(&self) -> String;
    fn srcset(&self) -> Option<String>;
    fn set_src(&self, src: &str);
    /// `None` removes the attribute.
    fn set_srcset(&self, srcset: Option<&str>);
}

pub trait ElementTree {
    type Element: ImageElement;

    /// Every image element currently attached to the tree.
    fn images(&self) -> Vec<Rc<Self::Element>>;
}

impl<T: ElementTree + ?Sized> ElementTree for Rc<T> {
    type Element = T::Element;

    fn images(&self) -> Vec<Rc<Self::Element>> {
        (**self).images()
    }
}

/// Asks the host to call [`crate::Engine::run_frame`] at the next rendering opportunity.
pub trait FrameScheduler {
    fn request_frame(&self);
}

impl<F: FrameScheduler + ?Sized> FrameScheduler for Rc<F> {
    fn request_frame(&self) {
        (**self).request_frame()
    }
}

/// One tree mutation notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    ChildList { added: usize, removed: usize },
    Attribute { name: String },
}

impl Mutation {
    pub fn attribute(name: impl Into<String>) -> Self {
        Mutation::Attribute { name: name.into() }
    }

    pub fn inserted(count: usize) -> Self {
        Mutation::ChildList {
            added: count,
            removed: 0,
        }
    }

    /// Whether this mutation can change which avatars are on screen.
    pub fn is_relevant(&self) -> bool {
        match self {
            Mutation::ChildList { added, removed } => *added > 0 || *removed > 0,
            Mutation::Attribute { name } => WATCHED_ATTRIBUTES.contains(&name.as_str()),
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryImage {
    src: RefCell<String>,
    srcset: RefCell<Option<String>>,
    writes: Cell<usize>,
}

impl MemoryImage {
    pub fn new(src: impl Into<String>) -> Rc<Self> {
        Rc::new(Self {
            src: RefCell::new(src.into()),
            ..Self::default()
        })
    }

    pub fn with_srcset(src: impl Into<String>, srcset: impl Into<String>) -> Rc<Self> {
        Rc::new(Self {
            src: RefCell::new(src.into()),
            srcset: RefCell::new(Some(srcset.into())),
            writes: Cell::new(0),
        })
    }

    /// Number of `set_src`/`set_srcset` calls made so far.
    pub fn writes(&self) -> usize {
        self.writes.get()
    }

    fn bump(&self) {
        self.writes.set(self.writes.get() + 1);
    }
}

impl ImageElement for MemoryImage {
    fn src(&self) -> String {
        self.src.borrow().clone()
    }

    fn srcset(&self) -> Option<String> {
        self.srcset.borrow().clone()
    }

    fn set_src(&self, src: &str) {
        *self.src.borrow_mut() = src.to_string();
        self.bump();
    }

    fn set_srcset(&self, srcset: Option<&str>) {
        *self.srcset.borrow_mut() = srcset.map(ToString::to_string);
        self.bump();
    }
}

#[derive(Debug, Default)]
pub struct MemoryTree {
    images: RefCell<Vec<Rc<MemoryImage>>>,
}

impl MemoryTree {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    pub fn insert(&self, image: Rc<MemoryImage>) -> Mutation {
        self.images.borrow_mut().push(image);
        Mutation::inserted(1)
    }

    /// Detaches `image`; the tree no longer keeps it alive.
    pub fn remove(&self, image: &Rc<MemoryImage>) -> Mutation {
        let mut images = self.images.borrow_mut();
        let before = images.len();
        images.retain(|candidate| !Rc::ptr_eq(candidate, image));
        Mutation::ChildList {
            added: 0,
            removed: before - images.len(),
        }
    }

    pub fn len(&self) -> usize {
        self.images.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.borrow().is_empty()
    }
}

impl ElementTree for MemoryTree {
    type Element = MemoryImage;

    fn images(&self) -> Vec<Rc<MemoryImage>> {
        self.images.borrow().clone()
    }
}

/// Records frame requests; the caller decides when frames fire.
#[derive(Debug, Default)]
pub struct ManualScheduler {
    requested: Cell<usize>,
}

impl ManualScheduler {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    pub fn requests(&self) -> usize {
        self.requested.get()
    }
}

impl FrameScheduler for ManualScheduler {
    fn request_frame(&self) {
        self.requested.set(self.requested.get() + 1);
    }
}
