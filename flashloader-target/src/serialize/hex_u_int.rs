use super::serialize_u_int::SerializeUnsignedInt;
use serde::Serializer;

/// Writes addresses and sizes as `0x...` strings in YAML, and as plain integers otherwise.
pub(crate) fn serialize<T, S>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
    T: std::fmt::LowerHex + SerializeUnsignedInt,
{
    if serializer.is_human_readable() {
        serializer.serialize_str(&format!("{value:#x}"))
    } else {
        value.serialize_int(serializer)
    }
}
