use std::hash::Hash;
use std::ops::{Deref, DerefMut};

use fxhash::FxBuildHasher;
use serde::{Deserialize, Serialize};

/// Hash collections keyed by small ids and attribute names use the Fx hasher.
macro_rules! fx_collection {
    ($(#[$meta: meta])* $name: ident<K $(, $param: ident)*>, $inner: ty, $item: ty) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
        #[serde(transparent)]
        pub struct $name<K: Eq + Hash $(, $param)*>($inner);

        impl<K: Eq + Hash $(, $param)*> $name<K $(, $param)*> {
            #[inline]
            pub fn new() -> Self {
                Self::default()
            }

            #[inline]
            pub fn with_capacity(capacity: usize) -> Self {
                Self(<$inner>::with_capacity_and_hasher(capacity, FxBuildHasher::default()))
            }
        }

        impl<K: Eq + Hash $(, $param)*> Default for $name<K $(, $param)*> {
            #[inline]
            fn default() -> Self {
                Self(<$inner>::default())
            }
        }

        impl<K: Eq + Hash $(, $param)*> Deref for $name<K $(, $param)*> {
            type Target = $inner;

            #[inline]
            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }

        impl<K: Eq + Hash $(, $param)*> DerefMut for $name<K $(, $param)*> {
            #[inline]
            fn deref_mut(&mut self) -> &mut Self::Target {
                &mut self.0
            }
        }

        impl<K: Eq + Hash $(, $param)*> FromIterator<$item> for $name<K $(, $param)*> {
            fn from_iter<I: IntoIterator<Item = $item>>(iter: I) -> Self {
                Self(iter.into_iter().collect())
            }
        }

        impl<K: Eq + Hash $(, $param)*> IntoIterator for $name<K $(, $param)*> {
            type Item = $item;
            type IntoIter = <$inner as IntoIterator>::IntoIter;

            #[inline]
            fn into_iter(self) -> Self::IntoIter {
                self.0.into_iter()
            }
        }
    };
}

fx_collection!(
    /// Job ads, plugin tables and request registries.
    Map<K, V>,
    hashbrown::HashMap<K, V, FxBuildHasher>,
    (K, V)
);

impl<'a, K: Eq + Hash, V> IntoIterator for &'a Map<K, V> {
    type Item = (&'a K, &'a V);
    type IntoIter = hashbrown::hash_map::Iter<'a, K, V>;

    #[inline]
    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

fx_collection!(
    Set<K>,
    hashbrown::HashSet<K, FxBuildHasher>,
    K
);

impl<'a, K: Eq + Hash> IntoIterator for &'a Set<K> {
    type Item = &'a K;
    type IntoIter = hashbrown::hash_set::Iter<'a, K>;

    #[inline]
    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::{Map, Set};

    #[test]
    fn test_job_ad_serializes_as_plain_map() {
        let ad: Map<String, String> = [("ClusterId".to_string(), "12".to_string())]
            .into_iter()
            .collect();
        assert_eq!(reencode(&ad), vec![("ClusterId".to_string(), "12".to_string())]);

        let tokens: Set<u32> = [3, 3, 4].into_iter().collect();
        assert_eq!(tokens.len(), 2);
        assert!(tokens.contains(&4));
    }

    fn reencode(ad: &Map<String, String>) -> Vec<(String, String)> {
        let bytes = bincode::serialize(ad).unwrap();
        let plain: std::collections::BTreeMap<String, String> =
            bincode::deserialize(&bytes).unwrap();
        plain.into_iter().collect()
    }
}
