use std::slice;

/// Compact one-or-many back-reference cell.
///
/// Pool entries typically have exactly one user, so the single case stores
/// the reference inline; a second insertion promotes the cell to an ordered
/// list and a removal back down to one demotes it again. The representation
/// is invisible through `len`/`contains`/`iter`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReferenceSet<T> {
    Empty,
    Single(T),
    Many(Vec<T>),
}

impl<T> Default for ReferenceSet<T> {
    fn default() -> Self {
        ReferenceSet::Empty
    }
}

impl<T: PartialEq> ReferenceSet<T> {
    pub fn new() -> Self {
        ReferenceSet::Empty
    }

    pub fn len(&self) -> usize {
        match self {
            ReferenceSet::Empty => 0,
            ReferenceSet::Single(_) => 1,
            ReferenceSet::Many(list) => list.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, ReferenceSet::Empty)
    }

    pub fn contains(&self, reference: &T) -> bool {
        match self {
            ReferenceSet::Empty => false,
            ReferenceSet::Single(existing) => existing == reference,
            ReferenceSet::Many(list) => list.contains(reference),
        }
    }

    /// Insertion preserves order and ignores duplicates.
    pub fn add(&mut self, reference: T) {
        if self.contains(&reference) {
            return;
        }
        let current = std::mem::replace(self, ReferenceSet::Empty);
        *self = match current {
            ReferenceSet::Empty => ReferenceSet::Single(reference),
            ReferenceSet::Single(existing) => ReferenceSet::Many(vec![existing, reference]),
            ReferenceSet::Many(mut list) => {
                list.push(reference);
                ReferenceSet::Many(list)
            }
        };
    }

    pub fn remove(&mut self, reference: &T) -> bool {
        let current = std::mem::replace(self, ReferenceSet::Empty);
        match current {
            ReferenceSet::Empty => false,
            ReferenceSet::Single(existing) => {
                if &existing == reference {
                    true
                } else {
                    *self = ReferenceSet::Single(existing);
                    false
                }
            }
            ReferenceSet::Many(mut list) => {
                let removed = if let Some(pos) = list.iter().position(|item| item == reference) {
                    list.remove(pos);
                    true
                } else {
                    false
                };
                *self = match (list.len(), list.pop()) {
                    (1, Some(only)) => ReferenceSet::Single(only),
                    (_, Some(item)) => {
                        list.push(item);
                        ReferenceSet::Many(list)
                    }
                    (_, None) => ReferenceSet::Empty,
                };
                removed
            }
        }
    }

    pub fn iter(&self) -> slice::Iter<'_, T> {
        match self {
            ReferenceSet::Empty => [].iter(),
            ReferenceSet::Single(existing) => slice::from_ref(existing).iter(),
            ReferenceSet::Many(list) => list.iter(),
        }
    }

    pub fn clear(&mut self) {
        *self = ReferenceSet::Empty;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn promotes_and_demotes() {
        let mut set: ReferenceSet<u32> = ReferenceSet::new();
        assert!(set.is_empty());

        set.add(7);
        assert!(matches!(set, ReferenceSet::Single(7)));
        assert_eq!(set.len(), 1);

        set.add(9);
        assert!(matches!(set, ReferenceSet::Many(_)));
        assert_eq!(set.iter().copied().collect::<Vec<_>>(), vec![7, 9]);

        assert!(set.remove(&7));
        assert!(matches!(set, ReferenceSet::Single(9)));

        assert!(set.remove(&9));
        assert!(set.is_empty());
    }

    #[test]
    fn duplicate_add_is_ignored() {
        let mut set = ReferenceSet::new();
        set.add(3u32);
        set.add(3u32);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn uniform_behaviour_across_representations() {
        let mut set = ReferenceSet::new();
        for i in 0..4u32 {
            set.add(i);
        }
        assert_eq!(set.len(), 4);
        assert!(set.contains(&2));
        assert!(!set.remove(&10));
        assert_eq!(set.len(), 4);
    }
}
