mod base64_words;
mod hex_option;
mod hex_range;
mod hex_u_int;
mod serialize_u_int;

pub(crate) use base64_words::{deserialize as words_from_base64, serialize as words_to_base64};
pub(crate) use hex_option::serialize as hex_option;
pub(crate) use hex_range::serialize as hex_range;
pub(crate) use hex_u_int::serialize as hex_u_int;
