//! Bounded identifier enums and typed sets over them.
//!
//! Every identifier universe in the pipe (signals, nodes, types, paths,
//! features, ...) is a small fieldless enum whose discriminants are dense
//! array indices. [`IdSet`] stores a subset of such a universe in a single
//! `u64`, so membership, union and difference are branch-free and the
//! element type is carried in the signature.

use std::fmt;
use std::iter::FromIterator;
use std::marker::PhantomData;

/// A fieldless enum with at most 64 dense variants.
pub trait BoundedId: Copy + Eq + fmt::Debug + 'static {
    const COUNT: usize;

    /// Every variant in discriminant order.
    fn all() -> &'static [Self];

    fn index(self) -> usize;

    fn name(self) -> &'static str;

    fn from_index(index: usize) -> Option<Self> {
        Self::all().get(index).copied()
    }
}

/// Declare a bounded identifier enum.
///
/// Each variant carries the display name used in logs.
#[macro_export]
macro_rules! bounded_id {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident => $label:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(u8)]
        $vis enum $name {
            $( $(#[$vmeta])* $variant ),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$( $name::$variant ),+];
            pub const COUNT: usize = Self::ALL.len();

            #[inline]
            pub const fn index(self) -> usize {
                self as usize
            }

            pub const fn name(self) -> &'static str {
                match self {
                    $( $name::$variant => $label ),+
                }
            }
        }

        const _: () = assert!($name::COUNT <= 64, "bounded id universe exceeds 64");

        impl $crate::id::BoundedId for $name {
            const COUNT: usize = $name::COUNT;

            fn all() -> &'static [Self] {
                $name::ALL
            }

            #[inline]
            fn index(self) -> usize {
                self as usize
            }

            fn name(self) -> &'static str {
                $name::name(self)
            }
        }

        impl ::std::fmt::Debug for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                f.write_str(self.name())
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                f.write_str(self.name())
            }
        }
    };
}

/// A set of bounded identifiers packed into one word.
pub struct IdSet<T> {
    bits: u64,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for IdSet<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for IdSet<T> {}

impl<T> PartialEq for IdSet<T> {
    fn eq(&self, other: &Self) -> bool {
        self.bits == other.bits
    }
}

impl<T> Eq for IdSet<T> {}

impl<T> std::hash::Hash for IdSet<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.bits.hash(state);
    }
}

impl<T> Default for IdSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> IdSet<T> {
    pub const fn new() -> Self {
        Self {
            bits: 0,
            _marker: PhantomData,
        }
    }

    #[inline]
    pub const fn bits(&self) -> u64 {
        self.bits
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.bits == 0
    }

    #[inline]
    pub const fn len(&self) -> usize {
        self.bits.count_ones() as usize
    }

    pub fn clear(&mut self) {
        self.bits = 0;
    }

    pub const fn union(self, other: Self) -> Self {
        Self {
            bits: self.bits | other.bits,
            _marker: PhantomData,
        }
    }

    pub const fn intersection(self, other: Self) -> Self {
        Self {
            bits: self.bits & other.bits,
            _marker: PhantomData,
        }
    }

    pub const fn difference(self, other: Self) -> Self {
        Self {
            bits: self.bits & !other.bits,
            _marker: PhantomData,
        }
    }

    pub const fn is_subset(&self, other: &Self) -> bool {
        self.bits & !other.bits == 0
    }
}

impl<T: BoundedId> IdSet<T> {
    /// Set containing every variant of `T`.
    pub fn full() -> Self {
        let bits = if T::COUNT == 64 {
            u64::MAX
        } else {
            (1u64 << T::COUNT) - 1
        };
        Self {
            bits,
            _marker: PhantomData,
        }
    }

    pub fn single(id: T) -> Self {
        let mut set = Self::new();
        set.insert(id);
        set
    }

    #[inline]
    fn mask(id: T) -> u64 {
        1u64 << id.index()
    }

    /// Insert `id`, returning true if it was not already present.
    pub fn insert(&mut self, id: T) -> bool {
        let was_absent = self.bits & Self::mask(id) == 0;
        self.bits |= Self::mask(id);
        was_absent
    }

    /// Remove `id`, returning true if it was present.
    pub fn remove(&mut self, id: T) -> bool {
        let was_present = self.bits & Self::mask(id) != 0;
        self.bits &= !Self::mask(id);
        was_present
    }

    #[inline]
    pub fn contains(&self, id: T) -> bool {
        self.bits & Self::mask(id) != 0
    }

    /// Lowest-index member.
    pub fn first(&self) -> Option<T> {
        if self.bits == 0 {
            None
        } else {
            T::from_index(self.bits.trailing_zeros() as usize)
        }
    }

    pub fn iter(&self) -> Iter<T> {
        Iter {
            bits: self.bits,
            _marker: PhantomData,
        }
    }
}

/// Iterator over the members of an [`IdSet`] in index order.
pub struct Iter<T> {
    bits: u64,
    _marker: PhantomData<fn() -> T>,
}

impl<T: BoundedId> Iterator for Iter<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        while self.bits != 0 {
            let index = self.bits.trailing_zeros() as usize;
            self.bits &= self.bits - 1;
            if let Some(id) = T::from_index(index) {
                return Some(id);
            }
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.bits.count_ones() as usize;
        (0, Some(n))
    }
}

impl<T: BoundedId> IntoIterator for IdSet<T> {
    type Item = T;
    type IntoIter = Iter<T>;

    fn into_iter(self) -> Iter<T> {
        self.iter()
    }
}

impl<T: BoundedId> IntoIterator for &IdSet<T> {
    type Item = T;
    type IntoIter = Iter<T>;

    fn into_iter(self) -> Iter<T> {
        self.iter()
    }
}

impl<T: BoundedId> FromIterator<T> for IdSet<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut set = Self::new();
        set.extend(iter);
        set
    }
}

impl<T: BoundedId> Extend<T> for IdSet<T> {
    fn extend<I: IntoIterator<Item = T>>(&mut self, iter: I) {
        for id in iter {
            self.insert(id);
        }
    }
}

impl<T: BoundedId> fmt::Debug for IdSet<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    crate::bounded_id! {
        enum Color {
            Red => "red",
            Green => "green",
            Blue => "blue",
        }
    }

    #[test]
    fn test_bounded_id_catalogue() {
        assert_eq!(Color::COUNT, 3);
        assert_eq!(Color::Blue.index(), 2);
        assert_eq!(Color::Green.name(), "green");
        assert_eq!(<Color as BoundedId>::from_index(1), Some(Color::Green));
        assert_eq!(<Color as BoundedId>::from_index(3), None);
        assert_eq!(format!("{}", Color::Red), "red");
    }

    #[test]
    fn test_insert_remove() {
        let mut set = IdSet::<Color>::new();
        assert!(set.is_empty());
        assert!(set.insert(Color::Blue));
        assert!(!set.insert(Color::Blue));
        assert!(set.contains(Color::Blue));
        assert_eq!(set.len(), 1);
        assert!(set.remove(Color::Blue));
        assert!(!set.remove(Color::Blue));
        assert!(set.is_empty());
    }

    #[test]
    fn test_full_and_iter_order() {
        let full = IdSet::<Color>::full();
        assert_eq!(full.len(), 3);
        let items: Vec<_> = full.iter().collect();
        assert_eq!(items, vec![Color::Red, Color::Green, Color::Blue]);
        assert_eq!(full.first(), Some(Color::Red));
    }

    #[test]
    fn test_debug_lists_names() {
        let set: IdSet<Color> = [Color::Green, Color::Red].into_iter().collect();
        assert_eq!(format!("{:?}", set), "{red, green}");
    }

    fn color_strategy() -> impl Strategy<Value = Color> {
        (0usize..3).prop_map(|i| Color::ALL[i])
    }

    proptest! {
        #[test]
        fn prop_set_algebra(
            a in prop::collection::vec(color_strategy(), 0..6),
            b in prop::collection::vec(color_strategy(), 0..6),
        ) {
            let sa: IdSet<Color> = a.iter().copied().collect();
            let sb: IdSet<Color> = b.iter().copied().collect();

            for c in Color::ALL {
                prop_assert_eq!(sa.union(sb).contains(*c), sa.contains(*c) || sb.contains(*c));
                prop_assert_eq!(sa.intersection(sb).contains(*c), sa.contains(*c) && sb.contains(*c));
                prop_assert_eq!(sa.difference(sb).contains(*c), sa.contains(*c) && !sb.contains(*c));
            }
            prop_assert!(sa.intersection(sb).is_subset(&sa));
            prop_assert_eq!(sa.iter().count(), sa.len());
        }
    }
}
