use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use std::fmt::{self, Formatter};
use std::marker::PhantomData;

use crate::{Guard, Hashable, HashMap, HashMapRef};

impl<K, V, G> Serialize for HashMapRef<'_, K, V, G>
where
    K: Serialize + Hashable,
    V: Serialize + Send + Sync + 'static,
    G: Guard,
{
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_map(self)
    }
}

impl<K, V> Serialize for HashMap<K, V>
where
    K: Serialize + Hashable,
    V: Serialize + Send + Sync + 'static,
{
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.pin().serialize(serializer)
    }
}

impl<'de, K, V> Deserialize<'de> for HashMap<K, V>
where
    K: Deserialize<'de> + Hashable,
    V: Deserialize<'de> + Send + Sync + 'static,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_map(MapVisitor {
            _marker: PhantomData,
        })
    }
}

struct MapVisitor<K, V> {
    _marker: PhantomData<HashMap<K, V>>,
}

impl<'de, K, V> Visitor<'de> for MapVisitor<K, V>
where
    K: Deserialize<'de> + Hashable,
    V: Deserialize<'de> + Send + Sync + 'static,
{
    type Value = HashMap<K, V>;

    fn expecting(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "a map")
    }

    fn visit_map<M>(self, mut access: M) -> Result<Self::Value, M::Error>
    where
        M: MapAccess<'de>,
    {
        let values = match access.size_hint() {
            Some(size) => HashMap::with_capacity(size),
            None => HashMap::new(),
        };

        {
            let values = values.pin();
            while let Some((key, value)) = access.next_entry()? {
                values.insert(key, value);
            }
        }

        Ok(values)
    }
}

#[cfg(test)]
mod test {
    use crate::HashMap;

    #[test]
    fn round_trip() {
        let map: HashMap<u64, u64> = HashMap::new();
        let guard = map.guard();

        map.insert(0, 4, &guard);
        map.insert(1, 3, &guard);
        map.insert(2, 2, &guard);
        map.insert(3, 1, &guard);
        map.insert(4, 0, &guard);

        let serialized = serde_json::to_string(&map).unwrap();
        let deserialized = serde_json::from_str(&serialized).unwrap();

        assert_eq!(map, deserialized);
    }
}
