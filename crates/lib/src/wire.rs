//! Serde helpers shared by the wire types.

use serde::{Deserialize, Deserializer};

/// Read an explicit JSON `null` as the type's default, the same as a missing field.
pub(crate) fn null_default<'de, D, T>(d: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Option::<T>::deserialize(d).map(Option::unwrap_or_default)
}
