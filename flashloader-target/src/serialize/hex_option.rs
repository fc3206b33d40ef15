use super::serialize_u_int::SerializeUnsignedInt;
use serde::{Serialize, Serializer};

pub fn serialize<T, S>(value: &Option<T>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
    T: Serialize + std::fmt::LowerHex + SerializeUnsignedInt,
{
    match value {
        Some(val) if serializer.is_human_readable() => {
            serializer.serialize_some(format!("{val:#x}").as_str())
        }
        Some(val) => serializer.serialize_some(val),
        None => serializer.serialize_none(),
    }
}
