/// Staging area for children pending removal from a container.
///
/// Entries are collected while the container's children are enumerated and only acted upon
/// once enumeration has finished, so the collection being walked is never mutated mid-walk.
#[derive(Debug)]
pub struct UnplugList<T> {
    entries: Vec<T>,
}

impl<T> Default for UnplugList<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<T> UnplugList<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage(&mut self, entry: T) {
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Consumes the list, yielding entries in staging order.
    pub fn drain(self) -> impl Iterator<Item = T> {
        self.entries.into_iter()
    }
}
