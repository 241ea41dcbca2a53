use std::fmt;

use crate::event::Subscription;

/// A resource with an explicit release step.
pub trait Disposable: Send {
    fn dispose(&mut self);
}

impl Disposable for Subscription {
    fn dispose(&mut self) {
        Subscription::dispose(self);
    }
}

struct DisposeFn(Option<Box<dyn FnOnce() + Send>>);

impl Disposable for DisposeFn {
    fn dispose(&mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }
}

/// Releases its members in reverse order of acquisition, once.
///
/// Members pushed after the collection has been disposed are released
/// immediately.
#[derive(Default)]
pub struct DisposableCollection {
    items: Vec<Box<dyn Disposable>>,
    disposed: bool,
}

impl DisposableCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, item: impl Disposable + 'static) {
        let mut item: Box<dyn Disposable> = Box::new(item);
        if self.disposed {
            item.dispose();
        } else {
            self.items.push(item);
        }
    }

    pub fn push_fn(&mut self, f: impl FnOnce() + Send + 'static) {
        self.push(DisposeFn(Some(Box::new(f))));
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }
}

impl Disposable for DisposableCollection {
    fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        while let Some(mut item) = self.items.pop() {
            item.dispose();
        }
    }
}

impl Drop for DisposableCollection {
    fn drop(&mut self) {
        Disposable::dispose(self);
    }
}

impl fmt::Debug for DisposableCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DisposableCollection")
            .field("len", &self.items.len())
            .field("disposed", &self.disposed)
            .finish()
    }
}
