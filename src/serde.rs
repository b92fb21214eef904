use super::{Guard, HashMap, HashSet, LongHashMap};

use serde::de::{Deserialize, MapAccess, SeqAccess, Visitor};
use serde::ser::{Serialize, SerializeMap, SerializeSeq, Serializer};
use serde::Deserializer;

use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::marker::PhantomData;

/// Builds a [`HashMap`] from a serialized map.
pub struct HashMapVisitor<K: 'static + Eq + Hash, V: 'static, H: BuildHasher> {
    #[allow(clippy::type_complexity)]
    marker: PhantomData<fn() -> HashMap<K, V, H>>,
}

/// Builds a [`LongHashMap`] from a serialized map.
pub struct LongHashMapVisitor<V: 'static> {
    marker: PhantomData<fn() -> LongHashMap<V>>,
}

/// Builds a [`HashSet`] from a serialized sequence.
pub struct HashSetVisitor<K: 'static + Eq + Hash, H: BuildHasher> {
    marker: PhantomData<fn() -> HashSet<K, H>>,
}

impl<K, V, H> HashMapVisitor<K, V, H>
where
    K: 'static + Eq + Hash,
    V: 'static,
    H: BuildHasher,
{
    fn new() -> Self {
        HashMapVisitor {
            marker: PhantomData,
        }
    }
}

impl<'de, K, V, H> Visitor<'de> for HashMapVisitor<K, V, H>
where
    K: 'static + Deserialize<'de> + Eq + Hash,
    V: 'static + Deserialize<'de>,
    H: BuildHasher + Default,
{
    type Value = HashMap<K, V, H>;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a HashMap")
    }

    fn visit_map<M>(self, mut access: M) -> Result<Self::Value, M::Error>
    where
        M: MapAccess<'de>,
    {
        let map = HashMap::with_capacity_and_hasher(access.size_hint().unwrap_or(0), H::default());
        while let Some((key, value)) = access.next_entry()? {
            map.insert(key, value);
        }
        Ok(map)
    }
}

impl<'de, K, V, H> Deserialize<'de> for HashMap<K, V, H>
where
    K: 'static + Deserialize<'de> + Eq + Hash,
    V: 'static + Deserialize<'de>,
    H: BuildHasher + Default,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_map(HashMapVisitor::<K, V, H>::new())
    }
}

impl<K, V, H> Serialize for HashMap<K, V, H>
where
    K: 'static + Serialize + Eq + Hash,
    V: 'static + Serialize,
    H: BuildHasher,
{
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        // The length announced up front must match the entries written.
        let guard = Guard::new();
        let entries = self.iter(&guard).collect::<Vec<_>>();
        let mut map = serializer.serialize_map(Some(entries.len()))?;
        for (k, v) in entries {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<'de, V> Visitor<'de> for LongHashMapVisitor<V>
where
    V: 'static + Deserialize<'de>,
{
    type Value = LongHashMap<V>;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a LongHashMap")
    }

    fn visit_map<M>(self, mut access: M) -> Result<Self::Value, M::Error>
    where
        M: MapAccess<'de>,
    {
        let map = LongHashMap::with_capacity(access.size_hint().unwrap_or(0));
        while let Some((key, value)) = access.next_entry()? {
            map.insert(key, value);
        }
        Ok(map)
    }
}

impl<'de, V> Deserialize<'de> for LongHashMap<V>
where
    V: 'static + Deserialize<'de>,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_map(LongHashMapVisitor {
            marker: PhantomData,
        })
    }
}

impl<V> Serialize for LongHashMap<V>
where
    V: 'static + Serialize,
{
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let guard = Guard::new();
        let entries = self.iter(&guard).collect::<Vec<_>>();
        let mut map = serializer.serialize_map(Some(entries.len()))?;
        for (k, v) in entries {
            map.serialize_entry(&k, v)?;
        }
        map.end()
    }
}

impl<'de, K, H> Visitor<'de> for HashSetVisitor<K, H>
where
    K: 'static + Deserialize<'de> + Eq + Hash,
    H: BuildHasher + Default,
{
    type Value = HashSet<K, H>;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a HashSet")
    }

    fn visit_seq<A>(self, mut access: A) -> Result<Self::Value, A::Error>
    where
        A: SeqAccess<'de>,
    {
        let set = HashSet::with_capacity_and_hasher(access.size_hint().unwrap_or(0), H::default());
        while let Some(key) = access.next_element()? {
            set.insert(key);
        }
        Ok(set)
    }
}

impl<'de, K, H> Deserialize<'de> for HashSet<K, H>
where
    K: 'static + Deserialize<'de> + Eq + Hash,
    H: BuildHasher + Default,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_seq(HashSetVisitor::<K, H> {
            marker: PhantomData,
        })
    }
}

impl<K, H> Serialize for HashSet<K, H>
where
    K: 'static + Serialize + Eq + Hash,
    H: BuildHasher,
{
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let guard = Guard::new();
        let keys = self.iter(&guard).collect::<Vec<_>>();
        let mut seq = serializer.serialize_seq(Some(keys.len()))?;
        for k in keys {
            seq.serialize_element(k)?;
        }
        seq.end()
    }
}
